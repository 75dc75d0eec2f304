//! Pipeline orchestration.
//!
//! Drives discovered sources through detection, staging, windowing and
//! loading, and folds every per-source outcome into a [`RunSummary`].

use crate::color::ColorClassifier;
use crate::config::ArgusConfig;
use crate::detector::{DetectionError, Detector};
use crate::loader::{LoadExecutor, LoadReport};
use crate::record::{DetectionRecord, FrameContext, RecordBuilder, SourceKind};
use crate::source::{discover, FrameSource, SampledFrame, SourceFile};
use crate::staging::{StagingReader, StagingWriter};
use crate::statement::TableName;
use crate::warehouse::{connect_backoff, connect_with_retry, PgWarehouse, StoreError};
use crate::window::{Assignment, Window, WindowAssembler, WindowError};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Missing pipeline dependency: {0}")]
    MissingDependency(&'static str),

    #[error(transparent)]
    Window(#[from] WindowError),
}

/// What a run does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Detect and write staging only
    Detect,
    /// Load an existing staging file
    Load,
    /// Detect, stage and load
    Full,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunMode::Detect => "detect",
            RunMode::Load => "load",
            RunMode::Full => "full",
        })
    }
}

/// Run phase, reported in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Discovering,
    Detecting,
    Windowing,
    Chunking,
    Loading,
    Reporting,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunPhase::Idle => "idle",
            RunPhase::Discovering => "discovering",
            RunPhase::Detecting => "detecting",
            RunPhase::Windowing => "windowing",
            RunPhase::Chunking => "chunking",
            RunPhase::Loading => "loading",
            RunPhase::Reporting => "reporting",
        })
    }
}

/// Outcome of processing one source
#[derive(Debug, Clone, Default)]
pub struct SourceSummary {
    pub source_id: String,
    pub frames_processed: u64,
    pub frames_failed: u64,
    pub records_produced: u64,
    pub windows_flushed: u64,
    pub load: LoadReport,
    /// Why the source was skipped, if it was
    pub error: Option<String>,
    pub staging_failed: bool,
}

/// Totals for a whole run. Always produced, even on fatal errors.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub mode: RunMode,
    pub sources_discovered: usize,
    pub sources_processed: usize,
    pub sources_skipped: usize,
    pub frames_processed: u64,
    pub frames_failed: u64,
    pub records_produced: u64,
    pub windows_flushed: u64,
    pub load: LoadReport,
    pub wall_time: Duration,
    pub sources: Vec<SourceSummary>,
    pub cancelled: bool,
    pub fatal: Option<String>,
}

impl RunSummary {
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode,
            sources_discovered: 0,
            sources_processed: 0,
            sources_skipped: 0,
            frames_processed: 0,
            frames_failed: 0,
            records_produced: 0,
            windows_flushed: 0,
            load: LoadReport::default(),
            wall_time: Duration::ZERO,
            sources: Vec::new(),
            cancelled: false,
            fatal: None,
        }
    }

    fn add_source(&mut self, source: SourceSummary) {
        if source.error.is_some() {
            self.sources_skipped += 1;
        } else {
            self.sources_processed += 1;
        }
        self.frames_processed += source.frames_processed;
        self.frames_failed += source.frames_failed;
        self.records_produced += source.records_produced;
        self.windows_flushed += source.windows_flushed;
        self.load.merge(&source.load);
        self.sources.push(source);
    }

    /// Summary of a run that could not start because the warehouse was
    /// never reached.
    pub fn store_unavailable(mode: RunMode, error: &StoreError) -> Self {
        let mut summary = Self::new(mode);
        match error {
            StoreError::Cancelled => {
                summary.cancelled = true;
                summary.set_fatal("cancelled while connecting to the warehouse");
            }
            e => summary.set_fatal(format!("warehouse unavailable: {}", e)),
        }
        summary
    }

    /// Mark the run fatal, keeping the first reason.
    pub fn set_fatal(&mut self, reason: impl Into<String>) {
        if self.fatal.is_none() {
            self.fatal = Some(reason.into());
        }
    }

    /// Whether the run should exit non-zero.
    ///
    /// A run fails when it hit a fatal error or when every attempted row
    /// failed. With `strict`, any failed row fails the run.
    pub fn is_failure(&self, strict: bool) -> bool {
        if self.fatal.is_some() {
            return true;
        }
        if self.load.rows_attempted > 0 && self.load.rows_failed == self.load.rows_attempted {
            return true;
        }
        strict && self.load.rows_failed > 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run summary ({})", self.mode)?;
        writeln!(
            f,
            "  sources:  {} discovered, {} processed, {} skipped",
            self.sources_discovered, self.sources_processed, self.sources_skipped
        )?;
        writeln!(
            f,
            "  frames:   {} processed, {} failed",
            self.frames_processed, self.frames_failed
        )?;
        writeln!(f, "  records:  {} produced", self.records_produced)?;
        writeln!(f, "  windows:  {} flushed", self.windows_flushed)?;
        writeln!(
            f,
            "  rows:     {} attempted, {} committed, {} failed, {} skipped",
            self.load.rows_attempted,
            self.load.rows_committed,
            self.load.rows_failed,
            self.load.rows_skipped
        )?;
        writeln!(
            f,
            "  chunks:   {} total, {} failed",
            self.load.chunks_total, self.load.chunks_failed
        )?;
        writeln!(f, "  time:     {:.2}s", self.wall_time.as_secs_f64())?;

        for source in &self.sources {
            match &source.error {
                Some(e) => writeln!(f, "    {}: skipped ({})", source.source_id, e)?,
                None => writeln!(
                    f,
                    "    {}: {} frames, {} records, {} windows, {}/{} rows committed",
                    source.source_id,
                    source.frames_processed,
                    source.records_produced,
                    source.windows_flushed,
                    source.load.rows_committed,
                    source.load.rows_attempted
                )?,
            }
        }

        if self.cancelled {
            writeln!(f, "  cancelled before completion")?;
        }
        if let Some(fatal) = &self.fatal {
            writeln!(f, "  FATAL: {}", fatal)?;
        }
        Ok(())
    }
}

/// Where and how sources are found and grouped.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub image_dir: PathBuf,
    pub video_dir: PathBuf,
    pub image_extensions: Vec<String>,
    pub video_extensions: Vec<String>,
    pub window_duration_secs: f64,
    pub source_concurrency: usize,
    pub min_confidence: f64,
}

impl PipelineSettings {
    pub fn from_config(config: &ArgusConfig) -> Self {
        Self {
            image_dir: config.sources.image_dir.clone(),
            video_dir: config.sources.video_dir.clone(),
            image_extensions: config.sources.image_extensions.clone(),
            video_extensions: config.sources.video_extensions.clone(),
            window_duration_secs: config.windowing.duration_secs,
            source_concurrency: config.sources.source_concurrency,
            min_confidence: config.detector.min_confidence,
        }
    }
}

/// Destination of produced records
enum LoadTarget {
    /// Staging only
    Disabled,
    Ready(LoadExecutor),
    /// Loading was requested but the store could not be reached
    Unavailable(String),
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    settings: PipelineSettings,
    detector: Option<Arc<dyn Detector>>,
    colors: Option<Arc<dyn ColorClassifier>>,
    frames: Option<Arc<dyn FrameSource>>,
    staging: Option<Arc<StagingWriter>>,
    target: LoadTarget,
}

impl PipelineBuilder {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            settings,
            detector: None,
            colors: None,
            frames: None,
            staging: None,
            target: LoadTarget::Disabled,
        }
    }

    pub fn detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn colors(mut self, colors: Arc<dyn ColorClassifier>) -> Self {
        self.colors = Some(colors);
        self
    }

    pub fn frame_source(mut self, frames: Arc<dyn FrameSource>) -> Self {
        self.frames = Some(frames);
        self
    }

    pub fn staging(mut self, staging: Arc<StagingWriter>) -> Self {
        self.staging = Some(staging);
        self
    }

    /// Load produced records through `loader`.
    pub fn loader(mut self, loader: LoadExecutor) -> Self {
        self.target = LoadTarget::Ready(loader);
        self
    }

    /// Loading was requested but connecting failed. Detection still runs
    /// and the run is reported fatal.
    pub fn loader_unavailable(mut self, error: &StoreError) -> Self {
        self.target = LoadTarget::Unavailable(error.to_string());
        self
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        // Fail early on a bad duration rather than once per source
        WindowAssembler::new("", self.settings.window_duration_secs)?;

        let colors = self
            .colors
            .ok_or(PipelineError::MissingDependency("color classifier"))?;

        Ok(Pipeline {
            detector: self
                .detector
                .ok_or(PipelineError::MissingDependency("detector"))?,
            records: RecordBuilder::new(colors, self.settings.min_confidence),
            frames: self
                .frames
                .ok_or(PipelineError::MissingDependency("frame source"))?,
            staging: self
                .staging
                .ok_or(PipelineError::MissingDependency("staging writer"))?,
            target: self.target,
            settings: self.settings,
            phase: Mutex::new(RunPhase::Idle),
        })
    }
}

/// Detection-to-warehouse pipeline for one run.
pub struct Pipeline {
    detector: Arc<dyn Detector>,
    records: RecordBuilder,
    frames: Arc<dyn FrameSource>,
    staging: Arc<StagingWriter>,
    target: LoadTarget,
    settings: PipelineSettings,
    phase: Mutex<RunPhase>,
}

impl Pipeline {
    pub fn builder(settings: PipelineSettings) -> PipelineBuilder {
        PipelineBuilder::new(settings)
    }

    pub fn mode(&self) -> RunMode {
        match self.target {
            LoadTarget::Disabled => RunMode::Detect,
            _ => RunMode::Full,
        }
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.lock()
    }

    fn enter(&self, phase: RunPhase) {
        let mut current = self.phase.lock();
        if *current != phase {
            debug!(from = %*current, to = %phase, "Run phase");
            *current = phase;
        }
    }

    fn loader(&self) -> Option<&LoadExecutor> {
        match &self.target {
            LoadTarget::Ready(loader) => Some(loader),
            _ => None,
        }
    }

    /// Process every discovered source.
    #[instrument(skip_all, fields(mode = %self.mode()))]
    pub async fn run(&self, cancel: &CancellationToken) -> RunSummary {
        let started = Instant::now();
        let mut summary = RunSummary::new(self.mode());

        if let LoadTarget::Unavailable(reason) = &self.target {
            error!(error = %reason, "Warehouse unavailable, records will only be staged");
            summary.set_fatal(format!("warehouse unavailable: {}", reason));
        }

        // Discovery
        self.enter(RunPhase::Discovering);
        let images = self
            .discover_dir(&self.settings.image_dir, SourceKind::Image, &self.settings.image_extensions)
            .await;
        let videos = self
            .discover_dir(&self.settings.video_dir, SourceKind::Video, &self.settings.video_extensions)
            .await;
        summary.sources_discovered = images.len() + videos.len();

        info!(
            images = images.len(),
            videos = videos.len(),
            "Sources discovered"
        );

        // Still images form one batch
        if !images.is_empty() {
            let (sources, report) = self.process_images(&images, cancel).await;
            for source in sources {
                summary.add_source(source);
            }
            // Chunks span images, so they are only counted for the batch
            summary.load.chunks_total += report.chunks_total;
            summary.load.chunks_failed += report.chunks_failed;
        }

        // Videos stream window by window
        let concurrency = self.settings.source_concurrency.max(1);
        let mut video_summaries: Vec<(usize, SourceSummary)> = stream::iter(videos.iter().enumerate())
            .map(|(i, source)| async move { (i, self.process_video(source, cancel).await) })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        video_summaries.sort_by_key(|(i, _)| *i);
        for (_, source) in video_summaries {
            summary.add_source(source);
        }

        // Report
        self.enter(RunPhase::Reporting);
        if summary.sources.iter().any(|s| s.staging_failed) {
            summary.set_fatal(format!(
                "failed to write staging file {}",
                self.staging.path().display()
            ));
        }
        summary.cancelled = cancel.is_cancelled();
        summary.wall_time = started.elapsed();

        info!(
            sources = summary.sources_discovered,
            records = summary.records_produced,
            windows = summary.windows_flushed,
            rows_committed = summary.load.rows_committed,
            rows_failed = summary.load.rows_failed,
            elapsed_ms = summary.wall_time.as_millis() as u64,
            "Run finished"
        );

        self.enter(RunPhase::Idle);
        summary
    }

    async fn discover_dir(&self, dir: &Path, kind: SourceKind, extensions: &[String]) -> Vec<SourceFile> {
        match discover(dir, kind, extensions).await {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "Skipping source directory");
                Vec::new()
            }
        }
    }

    /// Detect on one sampled frame and build its records.
    async fn detect_frame(
        &self,
        source: &SourceFile,
        sampled: &SampledFrame,
    ) -> Result<Vec<DetectionRecord>, DetectionError> {
        let ctx = match source.kind {
            SourceKind::Image => FrameContext::image(&source.source_id),
            SourceKind::Video => FrameContext::video(
                &source.source_id,
                sampled.frame_number,
                sampled.timestamp_sec,
            ),
        };

        let raw = self.detector.detect(&sampled.frame).await?;
        let records: Vec<DetectionRecord> = raw
            .iter()
            .filter_map(|d| self.records.build(&ctx, &sampled.frame, d))
            .collect();

        metrics::counter!("argus.records.produced").increment(records.len() as u64);
        Ok(records)
    }

    /// Append to staging. Returns false if the write failed.
    fn stage(&self, source_id: &str, records: &[DetectionRecord]) -> bool {
        match self.staging.append(records) {
            Ok(()) => true,
            Err(e) => {
                error!(source_id = %source_id, error = %e, "Failed to write staging rows");
                false
            }
        }
    }

    /// Detect and stage one frame. Returns `None` for a failed frame.
    async fn handle_frame(
        &self,
        source: &SourceFile,
        item: Result<SampledFrame, DetectionError>,
        summary: &mut SourceSummary,
    ) -> Option<Vec<DetectionRecord>> {
        let result = match item {
            Ok(sampled) => self.detect_frame(source, &sampled).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(records) => {
                summary.frames_processed += 1;
                summary.records_produced += records.len() as u64;
                if !self.stage(&source.source_id, &records) {
                    summary.staging_failed = true;
                }
                Some(records)
            }
            Err(e) => {
                summary.frames_failed += 1;
                metrics::counter!("argus.frames.failed").increment(1);
                warn!(source_id = %source.source_id, error = %e, "Frame failed");
                None
            }
        }
    }

    /// Detect every image, then load all records as one batch. Row counts
    /// are attributed to each image's summary; chunk counts stay in the
    /// returned report.
    #[instrument(skip_all, fields(count = images.len()))]
    async fn process_images(
        &self,
        images: &[SourceFile],
        cancel: &CancellationToken,
    ) -> (Vec<SourceSummary>, LoadReport) {
        self.enter(RunPhase::Detecting);

        let mut batch: Vec<DetectionRecord> = Vec::new();
        let mut summaries = Vec::with_capacity(images.len());

        for source in images {
            if cancel.is_cancelled() {
                break;
            }
            let mut summary = SourceSummary {
                source_id: source.source_id.clone(),
                ..Default::default()
            };

            match self.frames.open(source).await {
                Ok(mut frames) => {
                    while let Some(item) = frames.next().await {
                        if cancel.is_cancelled() {
                            break;
                        }
                        if let Some(records) = self.handle_frame(source, item, &mut summary).await {
                            batch.extend(records);
                        }
                    }
                }
                Err(e) => {
                    warn!(source_id = %source.source_id, error = %e, "Skipping source");
                    summary.error = Some(e.to_string());
                }
            }
            summaries.push(summary);
        }

        let mut report = LoadReport::default();
        if let Some(loader) = self.loader() {
            if !batch.is_empty() {
                self.enter(RunPhase::Loading);
                let index: HashMap<String, usize> = summaries
                    .iter()
                    .enumerate()
                    .map(|(i, s)| (s.source_id.clone(), i))
                    .collect();

                report = loader
                    .load_records_with(&batch, cancel, |chunk, outcome| {
                        for record in chunk.records {
                            if let Some(&i) = index.get(&record.source_id) {
                                let load = &mut summaries[i].load;
                                load.rows_attempted += 1;
                                if outcome.is_success() {
                                    load.rows_committed += 1;
                                } else {
                                    load.rows_failed += 1;
                                }
                            }
                        }
                    })
                    .await;

                for record in &batch[batch.len() - report.rows_skipped..] {
                    if let Some(&i) = index.get(&record.source_id) {
                        summaries[i].load.rows_skipped += 1;
                    }
                }

                info!(
                    records = batch.len(),
                    committed = report.rows_committed,
                    failed = report.rows_failed,
                    "Image batch loaded"
                );
            }
        }

        (summaries, report)
    }

    #[instrument(skip_all, fields(source_id = %source.source_id))]
    async fn process_video(&self, source: &SourceFile, cancel: &CancellationToken) -> SourceSummary {
        let mut summary = SourceSummary {
            source_id: source.source_id.clone(),
            ..Default::default()
        };

        let mut assembler =
            match WindowAssembler::new(&source.source_id, self.settings.window_duration_secs) {
                Ok(assembler) => assembler,
                Err(e) => {
                    summary.error = Some(e.to_string());
                    return summary;
                }
            };

        self.enter(RunPhase::Detecting);

        // Detection and loading interleave: closed windows queue here and
        // are flushed after each frame.
        let mut closed: Vec<Window> = Vec::new();
        let mut frames = match self.frames.open(source).await {
            Ok(frames) => frames,
            Err(e) => {
                warn!(error = %e, "Skipping source");
                summary.error = Some(e.to_string());
                return summary;
            }
        };

        while let Some(item) = frames.next().await {
            if cancel.is_cancelled() {
                info!("Cancelled, stopping source");
                break;
            }

            let Some(records) = self.handle_frame(source, item, &mut summary).await else {
                continue;
            };

            self.enter(RunPhase::Windowing);
            for record in records {
                if let Assignment::CloseAndOpenNext {
                    closed: Some(window),
                } = assembler.assign(record)
                {
                    closed.push(window);
                }
            }

            for window in closed.drain(..) {
                self.flush(window, cancel, &mut summary).await;
            }
        }
        drop(frames);

        if let Some(window) = assembler.finish() {
            self.flush(window, cancel, &mut summary).await;
        }

        info!(
            frames = summary.frames_processed,
            failed_frames = summary.frames_failed,
            windows = summary.windows_flushed,
            rows_committed = summary.load.rows_committed,
            "Source finished"
        );

        summary
    }

    async fn flush(&self, window: Window, cancel: &CancellationToken, summary: &mut SourceSummary) {
        summary.windows_flushed += 1;
        metrics::counter!("argus.windows.flushed").increment(1);

        let Some(loader) = self.loader() else {
            debug!(window = window.sequence, records = window.len(), "Window closed (staging only)");
            return;
        };

        self.enter(RunPhase::Chunking);
        self.enter(RunPhase::Loading);
        let report = loader.load_records(&window.records, cancel).await;

        info!(
            window = window.sequence,
            start = window.start,
            end = window.end,
            records = window.len(),
            committed = report.rows_committed,
            failed = report.rows_failed,
            "Window flushed"
        );

        summary.load.merge(&report);
    }
}

/// Load an existing staging file, one chunk per batch.
#[instrument(skip(loader, cancel), fields(path = %path.display()))]
pub async fn load_staging(
    loader: &LoadExecutor,
    path: &Path,
    cancel: &CancellationToken,
) -> RunSummary {
    let started = Instant::now();
    let mut summary = RunSummary::new(RunMode::Load);

    let mut reader = match StagingReader::open(path, loader.chunk_size().get()) {
        Ok(reader) => reader,
        Err(e) => {
            error!(error = %e, "Cannot read staging file");
            summary.set_fatal(e.to_string());
            summary.wall_time = started.elapsed();
            return summary;
        }
    };

    while let Some(batch) = reader.next_batch() {
        if cancel.is_cancelled() {
            // Everything not yet loaded, including rows still in the file
            let mut skipped = batch.records.len() + batch.malformed;
            while let Some(rest) = reader.next_batch() {
                skipped += rest.records.len() + rest.malformed;
            }
            summary.load.rows_skipped += skipped;
            summary.cancelled = true;
            info!(skipped_rows = skipped, "Staging load cancelled");
            break;
        }

        // Unparseable rows count as attempted and failed
        if batch.malformed > 0 {
            summary.load.rows_attempted += batch.malformed;
            summary.load.rows_failed += batch.malformed;
            metrics::counter!("argus.rows.failed").increment(batch.malformed as u64);
        }

        summary.records_produced += batch.records.len() as u64;
        let report = loader.load_records(&batch.records, cancel).await;
        summary.load.merge(&report);
    }

    summary.cancelled |= cancel.is_cancelled();
    summary.wall_time = started.elapsed();

    info!(
        committed = summary.load.rows_committed,
        failed = summary.load.rows_failed,
        "Staging load finished"
    );

    summary
}

/// Connect to the warehouse with retry and prepare the destination table.
pub async fn connect_loader(
    config: &ArgusConfig,
    cancel: &CancellationToken,
) -> Result<(LoadExecutor, Arc<PgWarehouse>), StoreError> {
    let table = TableName::parse(&config.loading.table)
        .map_err(|e| StoreError::Connect(e.to_string()))?;
    let chunk_size = NonZeroUsize::new(config.loading.chunk_size)
        .ok_or_else(|| StoreError::Connect("chunk size must be at least 1".to_string()))?;

    let database = &config.database;
    let store = connect_with_retry(connect_backoff(database), cancel, || {
        PgWarehouse::connect(database)
    })
    .await?;
    let store = Arc::new(store);

    let loader = LoadExecutor::new(store.clone(), table, chunk_size);
    if config.loading.create_table {
        loader.ensure_table().await?;
    }

    Ok((loader, store))
}
