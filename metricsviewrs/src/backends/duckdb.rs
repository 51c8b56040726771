//! DuckDB backend implementation.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use duckdb::types::{TimeUnit, ToSqlOutput, Value as DuckValue, ValueRef};
use duckdb::InterruptHandle;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::config::DuckDbConfig;
use crate::dialect::{Dialect, DialectKind};
use crate::error::{MetricsError, Result};
use crate::executor::{duck_value_to_json, type_name, ColumnMeta, QueryResult};
use crate::query_builder::{temp_table_name, PivotSpec};
use crate::sql_ast::SqlArg;

use super::{OlapConnection, Statement};

impl duckdb::ToSql for SqlArg {
    fn to_sql(&self) -> duckdb::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlArg::Null => ToSqlOutput::Owned(DuckValue::Null),
            SqlArg::Bool(b) => ToSqlOutput::Owned(DuckValue::Boolean(*b)),
            SqlArg::Int(i) => ToSqlOutput::Owned(DuckValue::BigInt(*i)),
            SqlArg::Float(f) => ToSqlOutput::Owned(DuckValue::Double(*f)),
            SqlArg::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlArg::Timestamp(t) => ToSqlOutput::Owned(DuckValue::Timestamp(
                TimeUnit::Microsecond,
                t.timestamp_micros(),
            )),
        })
    }
}

/// Runs one statement on `conn` and collects its rows.
pub(crate) fn query_rows(
    conn: &duckdb::Connection,
    sql: &str,
    args: &[SqlArg],
) -> Result<QueryResult> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows_iter = stmt.query(duckdb::params_from_iter(args.iter()))?;
    let stmt_ref = rows_iter
        .as_ref()
        .ok_or_else(|| MetricsError::Execution("statement missing".to_string()))?;
    let mut columns = Vec::new();
    for idx in 0..stmt_ref.column_count() {
        let name = stmt_ref
            .column_name(idx)
            .map_err(|e| MetricsError::Execution(e.to_string()))?;
        columns.push(ColumnMeta::new(
            name.to_string(),
            type_name(&stmt_ref.column_type(idx)),
        ));
    }
    let mut rows = Vec::new();
    while let Some(row) = rows_iter.next()? {
        let mut map = serde_json::Map::new();
        for (idx, column) in columns.iter().enumerate() {
            let value = duck_value_to_json(row.get_ref(idx)?.to_owned());
            map.insert(column.name.clone(), value);
        }
        rows.push(map);
    }
    Ok(QueryResult { columns, rows })
}

/// Cancellation shared between a blocking statement and the task awaiting it.
///
/// The waiter cancels on timeout and interrupts whatever the armed connection
/// is running. The worker disarms before giving its connection back, so an
/// interrupt never lands on a statement that picked the connection up later.
pub(crate) struct Cancellation {
    cancelled: AtomicBool,
    interrupt: StdMutex<Option<Arc<InterruptHandle>>>,
}

impl Cancellation {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            interrupt: StdMutex::new(None),
        })
    }

    /// Lets a timeout interrupt statements running on `conn`.
    pub(crate) fn arm(&self, conn: &duckdb::Connection) {
        *self.slot() = Some(conn.interrupt_handle());
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(MetricsError::Execution("statement cancelled".to_string()));
        }
        Ok(())
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(handle) = self.slot().take() {
            handle.interrupt();
        }
    }

    /// Disarms; false when the waiter already gave up on the work.
    pub(crate) fn finish(&self) -> bool {
        self.slot().take();
        !self.cancelled.load(Ordering::SeqCst)
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<InterruptHandle>>> {
        self.interrupt.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn timed_out(limit: Duration) -> MetricsError {
    tracing::warn!(ms = limit.as_millis(), "duckdb statement timed out");
    MetricsError::Timeout {
        ms: limit.as_millis(),
    }
}

/// Awaits `task` for what is left of `timeout` after `waited`.
pub(crate) async fn with_deadline<T>(
    timeout: Option<Duration>,
    waited: Duration,
    cancellation: Arc<Cancellation>,
    task: tokio::task::JoinHandle<Result<T>>,
) -> Result<T> {
    let joined = match timeout {
        None => task.await,
        Some(limit) => match tokio::time::timeout(limit.saturating_sub(waited), task).await {
            Ok(joined) => joined,
            Err(_) => {
                cancellation.cancel();
                return Err(timed_out(limit));
            }
        },
    };
    joined.map_err(|e| MetricsError::Execution(format!("task join error: {e}")))?
}

/// Pins the session to UTC so `TIMESTAMPTZ` casts do not follow the host zone.
///
/// Builds without ICU have no `TimeZone` setting and are UTC already.
pub(crate) fn pin_utc(conn: &duckdb::Connection) {
    if let Err(e) = conn.execute_batch("SET TimeZone = 'UTC'") {
        tracing::debug!(error = %e, "session time zone left at engine default");
    }
}

/// DuckDB connection pool implementing [`OlapConnection`].
#[derive(Clone)]
pub struct DuckDbConnection {
    database_path: PathBuf,
    max_concurrency: usize,
    limiter: Arc<Semaphore>,
    pool: Arc<Mutex<Vec<duckdb::Connection>>>,
}

impl DuckDbConnection {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self::from_config(path, &DuckDbConfig::default())
    }

    /// Pool sized from the data source's `[duckdb]` settings.
    pub fn from_config<P: AsRef<Path>>(path: P, config: &DuckDbConfig) -> Self {
        let path = path.as_ref().to_path_buf();
        let max_concurrency = config.max_concurrency.max(1);
        tracing::info!(path = %path.display(), max_concurrency, "creating DuckDB connection");
        Self {
            database_path: path,
            max_concurrency,
            limiter: Arc::new(Semaphore::new(max_concurrency)),
            pool: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Configure maximum concurrent executions; callers can tune based on hardware.
    pub fn with_max_concurrency(mut self, max_in_flight: usize) -> Self {
        tracing::debug!(max_concurrency = max_in_flight, "configuring DuckDB concurrency");
        self.max_concurrency = max_in_flight.max(1);
        self.limiter = Arc::new(Semaphore::new(self.max_concurrency));
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit> {
        if self.limiter.available_permits() == 0 {
            tracing::debug!("all DuckDB slots in use, waiting for permit");
        }
        self.limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| MetricsError::Execution(format!("limiter closed: {e}")))
    }

    async fn checkout_connection(&self) -> Result<duckdb::Connection> {
        let mut guard = self.pool.lock().await;
        if let Some(conn) = guard.pop() {
            let pool_size = guard.len();
            drop(guard);
            tracing::trace!(pool_remaining = pool_size, "reusing pooled DuckDB connection");
            return Ok(conn);
        }
        drop(guard);
        tracing::debug!(path = %self.database_path.display(), "opening new DuckDB connection");
        let conn = duckdb::Connection::open(self.database_path.clone())
            .map_err(|e| MetricsError::Execution(format!("open duckdb: {e}")))?;
        pin_utc(&conn);
        Ok(conn)
    }

    /// Runs `work` on one pooled connection in a blocking task.
    ///
    /// Waiting for a slot counts against `timeout`. The slot and the
    /// connection stay with the task until it ends, so a timed-out statement
    /// keeps its slot while it unwinds. On timeout the running statement is
    /// interrupted and the connection is discarded instead of pooled; `work`
    /// must check the cancellation before starting further statements.
    async fn run_blocking<T, F>(&self, timeout: Option<Duration>, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&duckdb::Connection, &Cancellation) -> Result<T> + Send + 'static,
    {
        let started = Instant::now();
        let permit = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.acquire_slot())
                .await
                .map_err(|_| timed_out(limit))??,
            None => self.acquire_slot().await?,
        };
        let conn = self.checkout_connection().await?;
        let pool = self.pool.clone();
        let cancellation = Cancellation::new();
        let worker = cancellation.clone();
        let task = tokio::task::spawn_blocking(move || {
            worker.arm(&conn);
            let result = worker.check().and_then(|()| work(&conn, &worker));
            if worker.finish() {
                pool.blocking_lock().push(conn);
            } else {
                tracing::debug!("discarding DuckDB connection after timeout");
            }
            drop(permit);
            result
        });
        with_deadline(timeout, started.elapsed(), cancellation, task).await
    }
}

#[async_trait]
impl OlapConnection for DuckDbConnection {
    fn dialect(&self) -> &'static dyn Dialect {
        DialectKind::DuckDb.dialect()
    }

    async fn execute(&self, statement: &Statement) -> Result<QueryResult> {
        let sql = statement.sql.clone();
        let args = statement.args.clone();
        let priority = statement.priority;
        self.run_blocking(statement.timeout, move |conn, _| {
            let start = Instant::now();
            let result = query_rows(conn, &sql, &args)?;
            tracing::debug!(
                rows = result.rows.len(),
                columns = result.columns.len(),
                priority,
                ms = start.elapsed().as_millis(),
                "duckdb execute"
            );
            Ok(result)
        })
        .await
    }

    /// Materializes the underlying rows into a per-call temporary table,
    /// checks the cell budget, pivots, and drops the table on every path.
    async fn execute_native_pivot(
        &self,
        underlying: &Statement,
        spec: &PivotSpec,
    ) -> Result<QueryResult> {
        let underlying = underlying.clone();
        let timeout = underlying.timeout;
        let spec = spec.clone();
        let table = temp_table_name();
        self.run_blocking(timeout, move |conn, cancellation| {
            let dialect = DialectKind::DuckDb.dialect();
            let quoted = dialect.quote_ident(&table);
            let start = Instant::now();
            let outcome = (|| -> Result<QueryResult> {
                conn.execute(
                    &format!("CREATE TEMPORARY TABLE {quoted} AS {}", underlying.sql),
                    duckdb::params_from_iter(underlying.args.iter()),
                )?;
                cancellation.check()?;
                let count: i64 =
                    conn.query_row(&format!("SELECT COUNT(*) FROM {quoted}"), [], |row| {
                        row.get(0)
                    })?;
                spec.check_cells(u64::try_from(count).unwrap_or(0))?;
                cancellation.check()?;
                let result = query_rows(conn, &spec.pivot_sql(dialect, &table), &[])?;
                spec.check_limit(result.rows.len() as u64)?;
                Ok(result)
            })();
            if let Err(e) = conn.execute_batch(&format!("DROP TABLE IF EXISTS {quoted}")) {
                tracing::warn!(table = table.as_str(), error = %e, "failed to drop pivot table");
            }
            tracing::debug!(
                table = table.as_str(),
                ok = outcome.is_ok(),
                ms = start.elapsed().as_millis(),
                "duckdb native pivot"
            );
            outcome
        })
        .await
    }
}
