//! Argus Pipeline - windowed batch loading of object detections
//!
//! Detections produced by an external vision model are grouped into
//! fixed-duration time windows and loaded into a warehouse table in chunks,
//! tolerating per-chunk failures.
//!
//! ```text
//!  images/ videos/ ──► FrameSource ──► Detector ──► RecordBuilder
//!                                                        │
//!                                                        ▼
//!                                               staging CSV (always)
//!                                                        │
//!                     ┌──────────── images ──────────────┤
//!                     ▼                                  ▼ videos
//!               single batch                      WindowAssembler
//!                     │                                  │ closed windows
//!                     └───────────► chunk() ◄────────────┘
//!                                      │
//!                                      ▼
//!                                LoadExecutor ──► Warehouse (Postgres)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use argus_pipeline::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ArgusConfig::load(None)?;
//!     let cancel = CancellationToken::new();
//!
//!     let pipeline = Pipeline::builder(PipelineSettings::from_config(&config))
//!         .detector(Arc::new(InferenceClient::new(
//!             &config.detector.endpoint,
//!             config.detector.request_timeout(),
//!             config.detector.jpeg_quality,
//!         )))
//!         .colors(Arc::new(PaletteClassifier::new()))
//!         .frame_source(Arc::new(MediaFrameSource::new("ffmpeg", "ffprobe", 30)))
//!         .staging(Arc::new(StagingWriter::create(&config.staging.path)?))
//!         .build()?;
//!
//!     let summary = pipeline.run(&cancel).await;
//!     println!("{}", summary);
//!     Ok(())
//! }
//! ```

pub mod chunker;
pub mod color;
pub mod config;
pub mod detector;
pub mod frame;
pub mod loader;
pub mod orchestrator;
pub mod record;
pub mod source;
pub mod staging;
pub mod statement;
pub mod warehouse;
pub mod window;

// Re-export main types
pub use chunker::{chunk, chunk_count, Chunk, Chunks};
pub use color::{ColorClassifier, NamedColor, PaletteClassifier};
pub use config::{ArgusConfig, ConfigValidationError, LogFormat};
pub use detector::{DetectionError, Detector, InferenceClient, RawDetection};
pub use frame::{Frame, FrameError, PixelRegion};
pub use loader::{LoadError, LoadExecutor, LoadOutcome, LoadReport, TableStats};
pub use orchestrator::{
    connect_loader, load_staging, Pipeline, PipelineBuilder, PipelineError, PipelineSettings,
    RunMode, RunPhase, RunSummary, SourceSummary,
};
pub use record::{DetectionRecord, FrameContext, PositionRegion, RecordBuilder, SourceKind};
pub use source::{
    discover, FrameSource, FrameStream, MediaFrameSource, SampledFrame, SourceError, SourceFile,
};
pub use staging::{StagingError, StagingReader, StagingReport, StagingWriter};
pub use statement::{quote_literal, SerializeError, SqlValue, Statement, TableName};
pub use warehouse::{connect_with_retry, PgWarehouse, StoreError, Warehouse};
pub use window::{Assignment, Window, WindowAssembler, WindowError};

#[cfg(any(test, feature = "test-utils"))]
pub use warehouse::MemoryWarehouse;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::color::{ColorClassifier, PaletteClassifier};
    pub use crate::config::ArgusConfig;
    pub use crate::detector::{Detector, InferenceClient};
    pub use crate::orchestrator::{Pipeline, PipelineSettings, RunMode, RunSummary};
    pub use crate::source::{FrameSource, MediaFrameSource};
    pub use crate::staging::StagingWriter;
    pub use crate::warehouse::Warehouse;
    pub use tokio_util::sync::CancellationToken;
}
