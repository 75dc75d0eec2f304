//! Warehouse client abstraction and its Postgres adapter.

use crate::config::DatabaseConfig;
use crate::statement::{SqlValue, Statement};
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::query::Query;
use sqlx::{Column, Row, TypeInfo};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Errors returned by a warehouse.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to connect to warehouse: {0}")]
    Connect(String),

    #[error("Failed to execute statement: {0}")]
    Execute(String),

    #[error("Failed to run query: {0}")]
    Query(String),

    #[error("Cancelled while connecting to warehouse")]
    Cancelled,
}

/// A SQL store that accepts data-modification statements and queries.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Execute a statement, returning the number of rows affected.
    async fn execute(&self, statement: &Statement) -> Result<u64, StoreError>;

    /// Run a query and return every row.
    async fn query(&self, statement: &Statement) -> Result<Vec<Vec<SqlValue>>, StoreError>;
}

/// Postgres warehouse over a connection pool
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    /// Open a pool. Fails if the first connection cannot be established.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .map_err(|e| StoreError::Connect(e.to_string()))?;

        info!(
            max_connections = config.max_connections,
            "Connected to PostgreSQL warehouse"
        );

        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
        debug!("Warehouse pool closed");
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [SqlValue],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::Float(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.as_str()),
        };
    }
    query
}

fn decode_row(row: &PgRow) -> Result<Vec<SqlValue>, sqlx::Error> {
    let mut values = Vec::with_capacity(row.columns().len());

    for (i, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "INT2" => row.try_get::<Option<i16>, _>(i)?.map(|v| SqlValue::Int(v as i64)),
            "INT4" => row.try_get::<Option<i32>, _>(i)?.map(|v| SqlValue::Int(v as i64)),
            "INT8" => row.try_get::<Option<i64>, _>(i)?.map(SqlValue::Int),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(i)?
                .map(|v| SqlValue::Float(v as f64)),
            "FLOAT8" => row.try_get::<Option<f64>, _>(i)?.map(SqlValue::Float),
            _ => row.try_get::<Option<String>, _>(i)?.map(SqlValue::Text),
        };
        values.push(value.unwrap_or(SqlValue::Null));
    }

    Ok(values)
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn execute(&self, statement: &Statement) -> Result<u64, StoreError> {
        let result = bind_params(sqlx::query(&statement.sql), &statement.params)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Execute(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn query(&self, statement: &Statement) -> Result<Vec<Vec<SqlValue>>, StoreError> {
        let rows = bind_params(sqlx::query(&statement.sql), &statement.params)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        rows.iter()
            .map(decode_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Query(e.to_string()))
    }
}

/// Backoff policy for the initial warehouse connection.
pub fn connect_backoff(config: &DatabaseConfig) -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(config.connect_retry_initial_ms),
        max_elapsed_time: Some(Duration::from_secs(config.connect_retry_max_elapsed_secs)),
        ..Default::default()
    }
}

/// Retry `connect` with exponential backoff until it succeeds, the policy
/// gives up, or `cancel` fires. The last error is returned on give-up.
#[instrument(skip_all)]
pub async fn connect_with_retry<T, F, Fut>(
    mut backoff: ExponentialBackoff,
    cancel: &CancellationToken,
    mut connect: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        attempts += 1;
        match connect().await {
            Ok(store) => {
                if attempts > 1 {
                    info!(attempts = attempts, "Warehouse connection established after retry");
                }
                return Ok(store);
            }
            Err(e) => match backoff.next_backoff() {
                Some(delay) => {
                    warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Warehouse connection failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(StoreError::Cancelled),
                    }
                }
                None => {
                    warn!(attempts = attempts, error = %e, "Giving up on warehouse connection");
                    return Err(e);
                }
            },
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryWarehouse;

#[cfg(any(test, feature = "test-utils"))]
mod memory {
    use super::*;
    use crate::statement::COLUMN_COUNT;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashSet};

    #[derive(Default)]
    struct State {
        rows: Vec<Vec<SqlValue>>,
        statements: Vec<Statement>,
        execute_calls: usize,
        fail_calls: HashSet<usize>,
        fail_all: bool,
    }

    /// In-memory warehouse with scripted failures.
    ///
    /// Understands the statements this crate issues: multi-row inserts,
    /// `CREATE TABLE`, row counts and per-class counts.
    #[derive(Default)]
    pub struct MemoryWarehouse {
        state: Mutex<State>,
    }

    impl MemoryWarehouse {
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail the `n`-th call to `execute` (1-based).
        pub fn fail_execute_call(self, n: usize) -> Self {
            self.state.lock().fail_calls.insert(n);
            self
        }

        /// Fail every call to `execute`.
        pub fn fail_all(self) -> Self {
            self.state.lock().fail_all = true;
            self
        }

        pub fn rows(&self) -> Vec<Vec<SqlValue>> {
            self.state.lock().rows.clone()
        }

        pub fn row_count(&self) -> usize {
            self.state.lock().rows.len()
        }

        pub fn statements(&self) -> Vec<Statement> {
            self.state.lock().statements.clone()
        }

        pub fn execute_calls(&self) -> usize {
            self.state.lock().execute_calls
        }
    }

    #[async_trait]
    impl Warehouse for MemoryWarehouse {
        async fn execute(&self, statement: &Statement) -> Result<u64, StoreError> {
            let mut state = self.state.lock();
            state.execute_calls += 1;
            state.statements.push(statement.clone());

            let call = state.execute_calls;
            if state.fail_all || state.fail_calls.contains(&call) {
                return Err(StoreError::Execute(format!("scripted failure on call {}", call)));
            }

            if statement.sql.starts_with("INSERT INTO") {
                let rows: Vec<Vec<SqlValue>> = statement
                    .params
                    .chunks(COLUMN_COUNT)
                    .map(|row| row.to_vec())
                    .collect();
                let affected = rows.len() as u64;
                state.rows.extend(rows);
                Ok(affected)
            } else {
                Ok(0)
            }
        }

        async fn query(&self, statement: &Statement) -> Result<Vec<Vec<SqlValue>>, StoreError> {
            let state = self.state.lock();

            if statement.sql.starts_with("SELECT COUNT(*)") {
                return Ok(vec![vec![SqlValue::Int(state.rows.len() as i64)]]);
            }

            if statement.sql.starts_with("SELECT class_name, COUNT(*)") {
                let limit = statement
                    .params
                    .first()
                    .and_then(SqlValue::as_i64)
                    .unwrap_or(i64::MAX)
                    .max(0) as usize;

                let mut counts: BTreeMap<String, i64> = BTreeMap::new();
                for row in &state.rows {
                    if let Some(name) = row.get(4).and_then(SqlValue::as_str) {
                        *counts.entry(name.to_string()).or_default() += 1;
                    }
                }

                let mut counts: Vec<(String, i64)> = counts.into_iter().collect();
                counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

                return Ok(counts
                    .into_iter()
                    .take(limit)
                    .map(|(name, n)| vec![SqlValue::Text(name), SqlValue::Int(n)])
                    .collect());
            }

            Err(StoreError::Query(format!(
                "unsupported query: {}",
                statement.preview(60)
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn fast_backoff(max_elapsed_ms: u64) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            max_elapsed_time: Some(Duration::from_millis(max_elapsed_ms)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_connect_with_retry_succeeds_after_failures() {
        let attempts = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result = connect_with_retry(fast_backoff(5_000), &cancel, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(StoreError::Connect("refused".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_connect_with_retry_gives_up() {
        let cancel = CancellationToken::new();
        let result: Result<(), _> = connect_with_retry(fast_backoff(20), &cancel, || async {
            Err(StoreError::Connect("refused".into()))
        })
        .await;

        assert!(matches!(result, Err(StoreError::Connect(_))));
    }

    #[tokio::test]
    async fn test_connect_with_retry_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> =
            connect_with_retry(fast_backoff(1_000), &cancel, || async { Ok(()) }).await;

        assert!(matches!(result, Err(StoreError::Cancelled)));
    }

    #[tokio::test]
    async fn test_memory_warehouse_scripted_failure() {
        let store = MemoryWarehouse::new().fail_execute_call(2);
        let stmt = Statement::new("CREATE TABLE IF NOT EXISTS t (a TEXT)");

        assert_ok!(store.execute(&stmt).await);
        assert_err!(store.execute(&stmt).await);
        assert_ok!(store.execute(&stmt).await);
        assert_eq!(store.execute_calls(), 3);
    }
}
