//! Tumbling time windows over a per-source record stream.
//!
//! Windows are half-open `[start, end)` intervals of a fixed duration, starting
//! at `t = 0` for every source. The assembler holds exactly one open window;
//! a record past its end closes it and opens the next one, skipping any empty
//! windows in between.

use crate::record::DetectionRecord;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum WindowError {
    #[error("Window duration must be finite and greater than zero, got {0}")]
    InvalidDuration(f64),
}

/// A closed (or still open) time window of records from one source.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub source_id: String,
    pub sequence: u64,
    pub start: f64,
    pub end: f64,
    pub records: Vec<DetectionRecord>,
}

impl Window {
    fn open(source_id: &str, sequence: u64, start: f64, duration: f64) -> Self {
        Self {
            source_id: source_id.to_string(),
            sequence,
            start,
            end: start + duration,
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether `timestamp` falls inside `[start, end)`.
    pub fn contains(&self, timestamp: f64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }
}

/// Result of assigning one record
#[derive(Debug)]
pub enum Assignment {
    /// Record joined the current window.
    SameWindow,
    /// The current window ended before the record. `closed` is the last
    /// non-empty window left behind, if any.
    CloseAndOpenNext { closed: Option<Window> },
}

/// Buffers records of one source into consecutive windows.
#[derive(Debug)]
pub struct WindowAssembler {
    duration: f64,
    current: Window,
}

impl WindowAssembler {
    pub fn new(source_id: &str, duration_secs: f64) -> Result<Self, WindowError> {
        if !duration_secs.is_finite() || duration_secs <= 0.0 {
            return Err(WindowError::InvalidDuration(duration_secs));
        }

        Ok(Self {
            duration: duration_secs,
            current: Window::open(source_id, 1, 0.0, duration_secs),
        })
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// The window currently being filled.
    pub fn current(&self) -> &Window {
        &self.current
    }

    /// Place a record into its window.
    ///
    /// A record can only skip forward. Out-of-order records (earlier than the
    /// current window) are kept in the current window.
    pub fn assign(&mut self, record: DetectionRecord) -> Assignment {
        let timestamp = record.timestamp_sec;
        let mut closed = None;
        let mut advanced = false;

        while timestamp >= self.current.end {
            let next = Window::open(
                &self.current.source_id,
                self.current.sequence + 1,
                self.current.end,
                self.duration,
            );
            let previous = std::mem::replace(&mut self.current, next);
            advanced = true;

            if !previous.is_empty() {
                debug!(
                    source_id = %previous.source_id,
                    window = previous.sequence,
                    records = previous.len(),
                    "Window closed"
                );
                closed = Some(previous);
            }
        }

        if timestamp < self.current.start {
            warn!(
                source_id = %self.current.source_id,
                window = self.current.sequence,
                timestamp = timestamp,
                window_start = self.current.start,
                "Out-of-order record, appending to current window"
            );
        }

        self.current.records.push(record);

        if advanced {
            Assignment::CloseAndOpenNext { closed }
        } else {
            Assignment::SameWindow
        }
    }

    /// End of stream. Returns the open window if it holds any records.
    pub fn finish(self) -> Option<Window> {
        if self.current.is_empty() {
            None
        } else {
            Some(self.current)
        }
    }
}
