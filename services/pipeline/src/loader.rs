//! Chunked loading of detection records into the warehouse.
//!
//! The executor issues exactly one statement per chunk. A failed chunk is
//! recorded and loading moves on; nothing is retried at this level.

use crate::chunker::{chunk, chunk_count, Chunk};
use crate::record::DetectionRecord;
use crate::statement::{self, SerializeError, TableName};
use crate::warehouse::{StoreError, Warehouse};
use std::num::NonZeroUsize;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const PREVIEW_CHARS: usize = 200;

/// Why a chunk failed
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Malformed record: {0}")]
    Malformed(#[from] SerializeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of loading a single chunk.
#[derive(Debug)]
pub struct LoadOutcome {
    pub sequence: usize,
    pub attempted: usize,
    pub committed: usize,
    pub error: Option<LoadError>,
}

impl LoadOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn failed(&self) -> usize {
        self.attempted - self.committed
    }
}

/// Totals for one window or batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub chunks_total: usize,
    pub chunks_failed: usize,
    pub rows_attempted: usize,
    pub rows_committed: usize,
    pub rows_failed: usize,
    /// Rows never attempted because loading was cancelled
    pub rows_skipped: usize,
}

impl LoadReport {
    pub fn record(&mut self, outcome: &LoadOutcome) {
        self.chunks_total += 1;
        self.rows_attempted += outcome.attempted;
        self.rows_committed += outcome.committed;
        self.rows_failed += outcome.failed();
        if !outcome.is_success() {
            self.chunks_failed += 1;
        }
    }

    pub fn merge(&mut self, other: &LoadReport) {
        self.chunks_total += other.chunks_total;
        self.chunks_failed += other.chunks_failed;
        self.rows_attempted += other.rows_attempted;
        self.rows_committed += other.rows_committed;
        self.rows_failed += other.rows_failed;
        self.rows_skipped += other.rows_skipped;
    }
}

/// Table contents summary for the `stats` command
#[derive(Debug, Clone, PartialEq)]
pub struct TableStats {
    pub total_rows: i64,
    pub top_classes: Vec<(String, i64)>,
}

/// Turns chunks into inserts against a warehouse.
#[derive(Clone)]
pub struct LoadExecutor {
    store: Arc<dyn Warehouse>,
    table: TableName,
    chunk_size: NonZeroUsize,
}

impl LoadExecutor {
    pub fn new(store: Arc<dyn Warehouse>, table: TableName, chunk_size: NonZeroUsize) -> Self {
        Self {
            store,
            table,
            chunk_size,
        }
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn chunk_size(&self) -> NonZeroUsize {
        self.chunk_size
    }

    /// Create the destination table if it does not exist.
    pub async fn ensure_table(&self) -> Result<(), StoreError> {
        self.store
            .execute(&statement::create_table(&self.table))
            .await?;
        info!(table = %self.table, "Destination table ready");
        Ok(())
    }

    /// Load one chunk with a single statement.
    #[instrument(skip(self, chunk), fields(chunk = chunk.sequence, rows = chunk.len()))]
    pub async fn load(&self, chunk: &Chunk<'_>) -> LoadOutcome {
        let attempted = chunk.len();

        let stmt = match statement::insert_rows(&self.table, chunk.records) {
            Ok(stmt) => stmt,
            Err(e) => {
                warn!(error = %e, "Chunk contains a malformed record, skipping store call");
                metrics::counter!("argus.chunks.failed").increment(1);
                metrics::counter!("argus.rows.failed").increment(attempted as u64);
                return LoadOutcome {
                    sequence: chunk.sequence,
                    attempted,
                    committed: 0,
                    error: Some(e.into()),
                };
            }
        };

        debug!(sql = %stmt.preview(PREVIEW_CHARS), "Executing chunk insert");

        match self.store.execute(&stmt).await {
            Ok(_) => {
                metrics::counter!("argus.rows.committed").increment(attempted as u64);
                LoadOutcome {
                    sequence: chunk.sequence,
                    attempted,
                    committed: attempted,
                    error: None,
                }
            }
            Err(e) => {
                warn!(error = %e, "Chunk insert failed");
                metrics::counter!("argus.chunks.failed").increment(1);
                metrics::counter!("argus.rows.failed").increment(attempted as u64);
                LoadOutcome {
                    sequence: chunk.sequence,
                    attempted,
                    committed: 0,
                    error: Some(e.into()),
                }
            }
        }
    }

    /// Load a window or batch chunk by chunk.
    ///
    /// Cancellation is checked between chunks. Chunks not yet started when
    /// it fires are counted as skipped; they are always a suffix of `records`.
    pub async fn load_records(
        &self,
        records: &[DetectionRecord],
        cancel: &CancellationToken,
    ) -> LoadReport {
        self.load_records_with(records, cancel, |_, _| {}).await
    }

    /// Like [`load_records`](Self::load_records), calling `on_chunk` with
    /// every chunk and its outcome.
    pub async fn load_records_with<F>(
        &self,
        records: &[DetectionRecord],
        cancel: &CancellationToken,
        mut on_chunk: F,
    ) -> LoadReport
    where
        F: FnMut(&Chunk<'_>, &LoadOutcome),
    {
        let mut report = LoadReport::default();
        let total_chunks = chunk_count(records.len(), self.chunk_size);

        for chunk in chunk(records, self.chunk_size) {
            if cancel.is_cancelled() {
                let done = (chunk.sequence - 1) * self.chunk_size.get();
                report.rows_skipped = records.len() - done;
                info!(
                    skipped_rows = report.rows_skipped,
                    skipped_chunks = total_chunks - (chunk.sequence - 1),
                    "Loading cancelled"
                );
                break;
            }

            let outcome = self.load(&chunk).await;
            on_chunk(&chunk, &outcome);
            report.record(&outcome);
        }

        report
    }

    /// Row count and the ten most frequent classes.
    pub async fn stats(&self) -> Result<TableStats, StoreError> {
        let total_rows = self
            .store
            .query(&statement::count_rows(&self.table))
            .await?
            .first()
            .and_then(|row| row.first())
            .and_then(|v| v.as_i64())
            .unwrap_or(0);

        let top_classes = self
            .store
            .query(&statement::top_classes(&self.table, 10))
            .await?
            .into_iter()
            .filter_map(|row| {
                let name = row.first()?.as_str()?.to_string();
                let count = row.get(1)?.as_i64()?;
                Some((name, count))
            })
            .collect();

        Ok(TableStats {
            total_rows,
            top_classes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::sample_record;
    use crate::statement::{SqlValue, Statement};
    use crate::warehouse::MemoryWarehouse;
    use async_trait::async_trait;
    use metrics::{
        Counter, CounterFn, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit,
    };
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio_test::assert_ok;

    /// Cancels the run while the first statement is in flight.
    struct CancelOnExecute {
        inner: MemoryWarehouse,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl Warehouse for CancelOnExecute {
        async fn execute(&self, statement: &Statement) -> Result<u64, StoreError> {
            self.cancel.cancel();
            self.inner.execute(statement).await
        }

        async fn query(&self, statement: &Statement) -> Result<Vec<Vec<SqlValue>>, StoreError> {
            self.inner.query(statement).await
        }
    }

    fn records(n: usize) -> Vec<DetectionRecord> {
        (0..n).map(|i| sample_record("clip.mp4", i as f64)).collect()
    }

    fn executor(store: Arc<MemoryWarehouse>, chunk_size: usize) -> LoadExecutor {
        LoadExecutor::new(
            store,
            TableName::parse("yolo_objects").unwrap(),
            NonZeroUsize::new(chunk_size).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_failed_chunk_does_not_stop_later_chunks() {
        let store = Arc::new(MemoryWarehouse::new().fail_execute_call(2));
        let loader = executor(store.clone(), 100);

        let report = loader
            .load_records(&records(250), &CancellationToken::new())
            .await;

        assert_eq!(report.chunks_total, 3);
        assert_eq!(report.chunks_failed, 1);
        assert_eq!(report.rows_attempted, 250);
        assert_eq!(report.rows_committed, 150);
        assert_eq!(report.rows_failed, 100);
        assert_eq!(report.rows_failed + report.rows_committed, report.rows_attempted);
        assert_eq!(store.execute_calls(), 3);
        assert_eq!(store.row_count(), 150);
    }

    #[tokio::test]
    async fn test_one_statement_per_chunk() {
        let store = Arc::new(MemoryWarehouse::new());
        let loader = executor(store.clone(), 4);

        let report = loader
            .load_records(&records(10), &CancellationToken::new())
            .await;

        assert_eq!(report.rows_committed, 10);
        assert_eq!(store.execute_calls(), 3);
        assert!(store
            .statements()
            .iter()
            .all(|s| s.sql.starts_with("INSERT INTO yolo_objects")));
    }

    #[tokio::test]
    async fn test_malformed_record_fails_chunk_without_store_call() {
        let store = Arc::new(MemoryWarehouse::new());
        let loader = executor(store.clone(), 2);

        let mut batch = records(4);
        batch[1].confidence = f64::NAN;

        let report = loader.load_records(&batch, &CancellationToken::new()).await;

        assert_eq!(report.chunks_failed, 1);
        assert_eq!(report.rows_failed, 2);
        assert_eq!(report.rows_committed, 2);
        assert_eq!(store.execute_calls(), 1);
    }

    /// Collects counter totals by name.
    #[derive(Default)]
    struct CountingRecorder {
        counters: parking_lot::Mutex<HashMap<String, Arc<AtomicU64>>>,
    }

    struct CounterHandle(Arc<AtomicU64>);

    impl CounterFn for CounterHandle {
        fn increment(&self, value: u64) {
            self.0.fetch_add(value, Ordering::Relaxed);
        }

        fn absolute(&self, value: u64) {
            self.0.store(value, Ordering::Relaxed);
        }
    }

    impl CountingRecorder {
        fn count(&self, name: &str) -> u64 {
            self.counters
                .lock()
                .get(name)
                .map_or(0, |c| c.load(Ordering::Relaxed))
        }
    }

    impl Recorder for CountingRecorder {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
            let total = self
                .counters
                .lock()
                .entry(key.name().to_string())
                .or_default()
                .clone();
            Counter::from_arc(Arc::new(CounterHandle(total)))
        }

        fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge {
            Gauge::noop()
        }

        fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }

    #[test]
    fn test_malformed_chunk_is_counted_in_metrics() {
        let recorder = CountingRecorder::default();
        let loader = executor(Arc::new(MemoryWarehouse::new()), 2);

        let mut batch = records(4);
        batch[1].confidence = f64::NAN;

        let report = metrics::with_local_recorder(&recorder, || {
            tokio_test::block_on(loader.load_records(&batch, &CancellationToken::new()))
        });

        assert_eq!(report.rows_failed, 2);
        assert_eq!(recorder.count("argus.chunks.failed"), 1);
        assert_eq!(recorder.count("argus.rows.failed"), 2);
        assert_eq!(recorder.count("argus.rows.committed"), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_skips_everything() {
        let store = Arc::new(MemoryWarehouse::new());
        let loader = executor(store.clone(), 3);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = loader.load_records(&records(7), &cancel).await;

        assert_eq!(report.rows_attempted, 0);
        assert_eq!(report.rows_skipped, 7);
        assert_eq!(store.execute_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_chunk_finishes_it_and_skips_the_rest() {
        let cancel = CancellationToken::new();
        let store = Arc::new(CancelOnExecute {
            inner: MemoryWarehouse::new(),
            cancel: cancel.clone(),
        });
        let loader = LoadExecutor::new(
            store.clone(),
            TableName::parse("yolo_objects").unwrap(),
            NonZeroUsize::new(3).unwrap(),
        );

        let report = loader.load_records(&records(8), &cancel).await;

        assert_eq!(report.chunks_total, 1);
        assert_eq!(report.rows_attempted, 3);
        assert_eq!(report.rows_committed, 3);
        assert_eq!(report.rows_skipped, 5);
        assert_eq!(store.inner.execute_calls(), 1);
        assert_eq!(store.inner.row_count(), 3);
    }

    #[tokio::test]
    async fn test_chunk_callback_sees_every_outcome() {
        let store = Arc::new(MemoryWarehouse::new().fail_execute_call(2));
        let loader = executor(store, 2);

        let mut seen = Vec::new();
        let report = loader
            .load_records_with(&records(5), &CancellationToken::new(), |chunk, outcome| {
                seen.push((chunk.sequence, chunk.len(), outcome.is_success()));
            })
            .await;

        assert_eq!(seen, vec![(1, 2, true), (2, 2, false), (3, 1, true)]);
        assert_eq!(report.rows_committed, 3);
    }

    #[tokio::test]
    async fn test_load_outcome_for_single_chunk() {
        let store = Arc::new(MemoryWarehouse::new().fail_all());
        let loader = executor(store, 10);
        let batch = records(3);
        let chunk = Chunk {
            sequence: 1,
            records: &batch,
        };

        let outcome = loader.load(&chunk).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.attempted, 3);
        assert_eq!(outcome.committed, 0);
        assert!(matches!(outcome.error, Some(LoadError::Store(StoreError::Execute(_)))));
    }

    #[tokio::test]
    async fn test_quote_survives_to_store() {
        let store = Arc::new(MemoryWarehouse::new());
        let loader = executor(store.clone(), 10);

        let mut record = sample_record("o'neil's clip.mp4", 1.0);
        record.class_name = "hot 'dog'".to_string();
        loader
            .load_records(&[record], &CancellationToken::new())
            .await;

        let rows = store.rows();
        assert_eq!(rows[0][1], SqlValue::Text("o'neil's clip.mp4".into()));
        assert_eq!(rows[0][4], SqlValue::Text("hot 'dog'".into()));
    }

    #[tokio::test]
    async fn test_ensure_table_and_stats() {
        let store = Arc::new(MemoryWarehouse::new());
        let loader = executor(store.clone(), 10);

        assert_ok!(loader.ensure_table().await);

        let mut batch = records(3);
        batch[2].class_name = "car".to_string();
        loader.load_records(&batch, &CancellationToken::new()).await;

        let stats = loader.stats().await.unwrap();
        assert_eq!(stats.total_rows, 3);
        assert_eq!(
            stats.top_classes,
            vec![("person".to_string(), 2), ("car".to_string(), 1)]
        );
        assert!(store.statements()[0]
            .sql
            .starts_with("CREATE TABLE IF NOT EXISTS yolo_objects"));
    }
}
