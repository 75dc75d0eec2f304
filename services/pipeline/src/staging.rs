//! CSV staging file.
//!
//! Every record is appended here before it is windowed or loaded, so a run
//! always leaves a re-loadable artifact behind. Columns follow the table
//! column order.

use crate::record::DetectionRecord;
use crate::statement::COLUMNS;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Confidence above which `inspect` lists a detection individually.
pub const HIGH_CONFIDENCE: f64 = 0.7;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("Staging I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Staging CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Unexpected staging header: expected {expected}, found {found}")]
    Header { expected: String, found: String },
}

fn header() -> Vec<&'static str> {
    COLUMNS.iter().map(|(name, _)| *name).collect()
}

/// Append-only staging writer, shared across source tasks.
pub struct StagingWriter {
    path: PathBuf,
    inner: Mutex<WriterState>,
}

struct WriterState {
    writer: csv::Writer<File>,
    rows: u64,
}

impl StagingWriter {
    /// Create (or truncate) the staging file and write the header row.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, StagingError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StagingError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let file = File::create(&path).map_err(|source| StagingError::Io {
            path: path.clone(),
            source,
        })?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer.write_record(header())?;
        writer.flush().map_err(|source| StagingError::Io {
            path: path.clone(),
            source,
        })?;

        info!(path = %path.display(), "Staging file created");

        Ok(Self {
            path,
            inner: Mutex::new(WriterState { writer, rows: 0 }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append records and flush.
    pub fn append(&self, records: &[DetectionRecord]) -> Result<(), StagingError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut state = self.inner.lock();
        for record in records {
            state.writer.serialize(record)?;
        }
        state.writer.flush().map_err(|source| StagingError::Io {
            path: self.path.clone(),
            source,
        })?;
        state.rows += records.len() as u64;

        Ok(())
    }

    /// Rows written so far, header excluded.
    pub fn rows_written(&self) -> u64 {
        self.inner.lock().rows
    }
}

/// One batch read from a staging file
#[derive(Debug, Default)]
pub struct StagingBatch {
    pub records: Vec<DetectionRecord>,
    /// Rows in this batch that could not be parsed
    pub malformed: usize,
}

impl StagingBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.malformed == 0
    }
}

/// Streams a staging file in fixed-size batches.
pub struct StagingReader {
    path: PathBuf,
    reader: csv::Reader<File>,
    headers: csv::StringRecord,
    batch_size: usize,
    exhausted: bool,
}

impl StagingReader {
    pub fn open(path: impl AsRef<Path>, batch_size: usize) -> Result<Self, StagingError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| StagingError::Io {
            path: path.clone(),
            source,
        })?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(file);

        let headers = reader.headers()?.clone();
        let expected = header();
        if headers.iter().ne(expected.iter().copied()) {
            return Err(StagingError::Header {
                expected: expected.join(","),
                found: headers.iter().collect::<Vec<_>>().join(","),
            });
        }

        Ok(Self {
            path,
            reader,
            headers,
            batch_size: batch_size.max(1),
            exhausted: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read up to `batch_size` rows. Returns `None` at end of file.
    ///
    /// Unparseable rows are counted in [`StagingBatch::malformed`] and
    /// count toward the batch size.
    pub fn next_batch(&mut self) -> Option<StagingBatch> {
        if self.exhausted {
            return None;
        }

        let mut batch = StagingBatch::default();
        let mut row = csv::StringRecord::new();

        while batch.records.len() + batch.malformed < self.batch_size {
            match self.reader.read_record(&mut row) {
                Ok(true) => match row.deserialize::<DetectionRecord>(Some(&self.headers)) {
                    Ok(record) => batch.records.push(record),
                    Err(e) => {
                        warn!(
                            line = row.position().map(|p| p.line()).unwrap_or(0),
                            error = %e,
                            "Malformed staging row"
                        );
                        batch.malformed += 1;
                    }
                },
                Ok(false) => {
                    self.exhausted = true;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Unreadable staging row");
                    batch.malformed += 1;
                    // I/O errors do not advance the reader
                    if let csv::ErrorKind::Io(_) = e.kind() {
                        self.exhausted = true;
                        break;
                    }
                }
            }
        }

        if batch.is_empty() {
            None
        } else {
            debug!(
                records = batch.records.len(),
                malformed = batch.malformed,
                "Read staging batch"
            );
            Some(batch)
        }
    }
}

/// Summary of a staging file, produced by the `inspect` command.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StagingReport {
    pub total: usize,
    pub malformed: usize,
    pub sources: usize,
    pub by_class: Vec<(String, usize)>,
    pub by_color: Vec<(String, usize)>,
    pub by_source: Vec<(String, usize)>,
    /// `(source_id, class_name, confidence)` above [`HIGH_CONFIDENCE`]
    pub high_confidence: Vec<(String, String, f64)>,
}

impl StagingReport {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, StagingError> {
        let mut reader = StagingReader::open(path, 1024)?;
        let mut builder = ReportBuilder::default();

        while let Some(batch) = reader.next_batch() {
            builder.malformed += batch.malformed;
            for record in &batch.records {
                builder.add(record);
            }
        }

        Ok(builder.finish())
    }

    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a DetectionRecord>) -> Self {
        let mut builder = ReportBuilder::default();
        for record in records {
            builder.add(record);
        }
        builder.finish()
    }
}

#[derive(Default)]
struct ReportBuilder {
    total: usize,
    malformed: usize,
    sources: HashSet<String>,
    by_class: BTreeMap<String, usize>,
    by_color: BTreeMap<String, usize>,
    by_source: BTreeMap<String, usize>,
    high_confidence: Vec<(String, String, f64)>,
}

impl ReportBuilder {
    fn add(&mut self, record: &DetectionRecord) {
        self.total += 1;
        self.sources.insert(record.source_id.clone());
        *self.by_class.entry(record.class_name.clone()).or_default() += 1;
        *self
            .by_color
            .entry(record.dominant_color_name.clone())
            .or_default() += 1;
        *self.by_source.entry(record.source_id.clone()).or_default() += 1;

        if record.confidence > HIGH_CONFIDENCE {
            self.high_confidence.push((
                record.source_id.clone(),
                record.class_name.clone(),
                record.confidence,
            ));
        }
    }

    fn finish(self) -> StagingReport {
        StagingReport {
            total: self.total,
            malformed: self.malformed,
            sources: self.sources.len(),
            by_class: by_count(self.by_class),
            by_color: by_count(self.by_color),
            by_source: by_count(self.by_source),
            high_confidence: self.high_confidence,
        }
    }
}

/// Most frequent first, ties by name
fn by_count(counts: BTreeMap<String, usize>) -> Vec<(String, usize)> {
    let mut counts: Vec<_> = counts.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    counts
}

impl fmt::Display for StagingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total detections: {}", self.total)?;
        writeln!(f, "Sources: {}", self.sources)?;
        if self.malformed > 0 {
            writeln!(f, "Malformed rows: {}", self.malformed)?;
        }

        writeln!(f, "\nDetections by class:")?;
        for (name, count) in &self.by_class {
            writeln!(f, "  {:<20} {}", name, count)?;
        }

        writeln!(f, "\nDominant colors:")?;
        for (name, count) in &self.by_color {
            writeln!(f, "  {:<20} {}", name, count)?;
        }

        writeln!(f, "\nDetections by source:")?;
        for (name, count) in &self.by_source {
            writeln!(f, "  {:<40} {}", name, count)?;
        }

        writeln!(
            f,
            "\nHigh-confidence detections (> {:.0}%):",
            HIGH_CONFIDENCE * 100.0
        )?;
        if self.high_confidence.is_empty() {
            writeln!(f, "  none")?;
        }
        for (source, class, confidence) in &self.high_confidence {
            writeln!(f, "  {}: {} ({:.1}%)", source, class, confidence * 100.0)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::sample_record;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_write_then_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/staging.csv");

        let records: Vec<_> = (0..5).map(|i| sample_record("clip.mp4", i as f64)).collect();
        let writer = StagingWriter::create(&path).unwrap();
        writer.append(&records[..2]).unwrap();
        writer.append(&records[2..]).unwrap();
        assert_eq!(writer.rows_written(), 5);

        let mut reader = StagingReader::open(&path, 3).unwrap();
        let first = reader.next_batch().unwrap();
        let second = reader.next_batch().unwrap();
        assert!(reader.next_batch().is_none());

        assert_eq!(first.records.len(), 3);
        assert_eq!(second.records.len(), 2);
        assert_eq!(first.records[0], records[0]);
        assert_eq!(second.records[1], records[4]);
    }

    #[test]
    fn test_header_only_file_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("staging.csv");
        StagingWriter::create(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("source_type,source_id,frame_number,"));
        assert!(contents.trim_end().ends_with("ingestion_date,detection_id"));

        let mut reader = StagingReader::open(&path, 10).unwrap();
        assert!(reader.next_batch().is_none());
    }

    #[test]
    fn test_quotes_and_commas_survive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("staging.csv");

        let mut record = sample_record("it's, \"quoted\".jpg", 0.0);
        record.class_name = "o'clock".to_string();

        let writer = StagingWriter::create(&path).unwrap();
        writer.append(std::slice::from_ref(&record)).unwrap();

        let mut reader = StagingReader::open(&path, 10).unwrap();
        let batch = reader.next_batch().unwrap();
        assert_eq!(batch.records, vec![record]);
    }

    #[test]
    fn test_malformed_rows_are_counted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("staging.csv");

        let writer = StagingWriter::create(&path).unwrap();
        writer.append(&[sample_record("a.mp4", 1.0)]).unwrap();
        drop(writer);

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "video,a.mp4,not-a-number").unwrap();
        drop(file);

        let mut reader = StagingReader::open(&path, 10).unwrap();
        let batch = reader.next_batch().unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.malformed, 1);
        assert!(reader.next_batch().is_none());
    }

    #[test]
    fn test_wrong_header_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("other.csv");
        std::fs::write(&path, "a,b,c\n1,2,3\n").unwrap();

        assert!(matches!(
            StagingReader::open(&path, 10),
            Err(StagingError::Header { .. })
        ));
    }

    #[test]
    fn test_report() {
        let mut records: Vec<_> = (0..4).map(|i| sample_record("a.mp4", i as f64)).collect();
        records[1].class_name = "car".to_string();
        records[2].source_id = "b.jpg".to_string();
        records[3].confidence = 0.6;

        let report = StagingReport::from_records(&records);

        assert_eq!(report.total, 4);
        assert_eq!(report.sources, 2);
        assert_eq!(
            report.by_class,
            vec![("person".to_string(), 3), ("car".to_string(), 1)]
        );
        assert_eq!(report.by_color, vec![("red".to_string(), 4)]);
        assert_eq!(report.high_confidence.len(), 3);
        assert!(report.to_string().contains("High-confidence detections (> 70%)"));
    }
}
