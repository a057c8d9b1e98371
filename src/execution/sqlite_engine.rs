//! SQLite Execution Engine
//!
//! Embedded backend. The connection runs with `query_only` enabled so a write
//! that slips past validation still fails inside SQLite.

use crate::error::{AgentError, Result};
use crate::execution::engine::{EngineCapabilities, ExecutionContext, ExecutionEngine};
use crate::execution::profile::QueryProfile;
use crate::execution::result::{float_value, QueryResult};
use crate::metadata::{ColumnInfo, SchemaInfo};
use crate::sql::dialect::SqlDialect;
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, InterruptHandle, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct SqliteEngine {
    capabilities: EngineCapabilities,
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
    path: Option<PathBuf>,
}

impl SqliteEngine {
    /// Open a database file, or an in-memory database when `path` is `None`.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let conn = match path {
            Some(p) => {
                info!("Opening SQLite database at {}", p.display());
                Connection::open(p)?
            }
            None => {
                info!("Opening in-memory SQLite database");
                Connection::open_in_memory()?
            }
        };
        conn.pragma_update(None, "query_only", true)?;
        let interrupt = Arc::new(conn.get_interrupt_handle());

        Ok(Self {
            capabilities: EngineCapabilities::sqlite(),
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
            path: path.map(Path::to_path_buf),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(None)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run a DDL/DML script (fixtures, demo data). Lifts `query_only` for the
    /// duration of the batch only.
    pub fn seed(&self, script: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.pragma_update(None, "query_only", false)?;
        let outcome = conn.execute_batch(script);
        conn.pragma_update(None, "query_only", true)?;
        outcome?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AgentError::Database("SQLite connection lock poisoned".to_string()))
    }

    /// Run `task` on the connection in the blocking pool. A call that times
    /// out (or is dropped) while still waiting for the connection never runs;
    /// one that is already running is interrupted.
    async fn run_blocking<T, F>(&self, timeout: Duration, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let phase = Arc::new(Mutex::new(CallPhase::Queued));
        let worker_phase = Arc::clone(&phase);
        let handle = tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| AgentError::Database("SQLite connection lock poisoned".to_string()))?;
            if !advance(&worker_phase, CallPhase::Queued, CallPhase::Running) {
                debug!("SQLite call abandoned before it started, skipping");
                return Err(AgentError::Database(
                    "query abandoned before it started".to_string(),
                ));
            }
            let outcome = task(&*guard);
            advance(&worker_phase, CallPhase::Running, CallPhase::Finished);
            outcome
        });

        let mut pending = PendingCall {
            phase,
            interrupt: Arc::clone(&self.interrupt),
            armed: true,
        };
        match tokio::time::timeout(timeout, handle).await {
            Ok(joined) => {
                pending.armed = false;
                joined.map_err(|e| AgentError::Database(format!("SQLite worker failed: {}", e)))?
            }
            Err(_) => {
                warn!("SQLite query exceeded {}ms", timeout.as_millis());
                drop(pending);
                Err(AgentError::Database(format!(
                    "query timed out after {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallPhase {
    Queued,
    Running,
    Finished,
    Abandoned,
}

/// Move `phase` from `from` to `to`; false when it was elsewhere.
fn advance(phase: &Mutex<CallPhase>, from: CallPhase, to: CallPhase) -> bool {
    match phase.lock() {
        Ok(mut current) if *current == from => {
            *current = to;
            true
        }
        _ => false,
    }
}

/// Caller side of one blocking call. Dropped while armed (timeout or
/// cancellation) it abandons a queued call or interrupts a running one. The
/// phase lock is held across the interrupt, so the worker cannot finish and
/// hand the connection to another call in between.
struct PendingCall {
    phase: Arc<Mutex<CallPhase>>,
    interrupt: Arc<InterruptHandle>,
    armed: bool,
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(mut phase) = self.phase.lock() else {
            warn!("SQLite call state poisoned, not interrupting");
            return;
        };
        match *phase {
            CallPhase::Queued => {
                debug!("Abandoning queued SQLite call");
                *phase = CallPhase::Abandoned;
            }
            CallPhase::Running => {
                warn!("Interrupting running SQLite query");
                self.interrupt.interrupt();
            }
            CallPhase::Finished | CallPhase::Abandoned => {}
        }
    }
}

fn value_ref_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => float_value(f),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<blob {} bytes>", bytes.len())),
    }
}

fn run_query(conn: &Connection, sql: &str, row_limit: Option<usize>) -> Result<QueryResult> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let width = columns.len();

    let mut rows = Vec::new();
    let mut truncated = false;
    let mut cursor = stmt.query([])?;
    while let Some(row) = cursor.next()? {
        if let Some(limit) = row_limit {
            if rows.len() >= limit {
                truncated = true;
                break;
            }
        }
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            values.push(value_ref_to_json(row.get_ref(idx)?));
        }
        rows.push(values);
    }

    let mut result = QueryResult::new(columns, rows, "sqlite");
    result.truncated = truncated;
    Ok(result)
}

#[async_trait]
impl ExecutionEngine for SqliteEngine {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn capabilities(&self) -> &EngineCapabilities {
        &self.capabilities
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    fn validate(&self, profile: &QueryProfile) -> Result<()> {
        if !profile.is_read_only {
            return Err(AgentError::Database(
                "SQLite engine only runs single read-only queries".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute(&self, sql: &str, ctx: &ExecutionContext) -> Result<QueryResult> {
        let start_time = Instant::now();
        debug!("Executing query with SQLite: {}", sql);

        let sql = sql.trim().trim_end_matches(';').to_string();
        let row_limit = ctx.row_limit;
        let mut result = self
            .run_blocking(Duration::from_millis(ctx.timeout_ms), move |conn| {
                run_query(conn, &sql, row_limit)
            })
            .await?;

        result.execution_time_ms = start_time.elapsed().as_millis() as u64;
        Ok(result)
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.run_blocking(Duration::from_secs(10), |conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master \
                 WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
                 ORDER BY name",
            )?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn describe_table(&self, table: &str) -> Result<Option<SchemaInfo>> {
        let table = table.to_string();
        self.run_blocking(Duration::from_secs(10), move |conn| {
            let actual: Option<String> = conn
                .query_row(
                    "SELECT name FROM sqlite_master \
                     WHERE type IN ('table', 'view') AND lower(name) = lower(?1)",
                    params![table],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(actual) = actual else {
                return Ok(None);
            };

            let mut stmt =
                conn.prepare("SELECT name, type, \"notnull\" FROM pragma_table_info(?1)")?;
            let columns = stmt
                .query_map(params![actual], |row| {
                    Ok(ColumnInfo {
                        name: row.get(0)?,
                        data_type: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        nullable: row.get::<_, i64>(2)? == 0,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(Some(SchemaInfo::new(actual, columns)))
        })
        .await
    }

    async fn health_check(&self) -> Result<bool> {
        let ok = self
            .run_blocking(Duration::from_secs(5), |conn| {
                Ok(conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))? == 1)
            })
            .await;
        Ok(ok.unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> SqliteEngine {
        let engine = SqliteEngine::in_memory().unwrap();
        engine
            .seed(
                "CREATE TABLE products (upc TEXT NOT NULL, product_name TEXT, price REAL);
                 INSERT INTO products VALUES ('0020282000000', 'Sparkling Water', 2.49);
                 INSERT INTO products VALUES ('0030000000001', 'Oat Cereal', 3.99);",
            )
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn test_execute_select() {
        let engine = engine();
        let result = engine
            .execute("SELECT upc, price FROM products ORDER BY upc", &ExecutionContext::default())
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["upc", "price"]);
        assert_eq!(result.row_count, 2);
        assert_eq!(result.rows[0][1], serde_json::json!(2.49));
    }

    #[tokio::test]
    async fn test_row_limit_marks_truncated() {
        let engine = engine();
        let result = engine
            .execute("SELECT * FROM products", &ExecutionContext::with_row_limit(1))
            .await
            .unwrap();
        assert_eq!(result.row_count, 1);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn test_writes_refused_by_connection() {
        let engine = engine();
        let err = engine
            .execute("DELETE FROM products", &ExecutionContext::default())
            .await;
        assert!(err.is_err());
        let count = engine
            .execute("SELECT COUNT(*) AS n FROM products", &ExecutionContext::default())
            .await
            .unwrap();
        assert_eq!(count.rows[0][0], serde_json::json!(2));
    }

    #[tokio::test]
    async fn test_describe_and_list() {
        let engine = engine();
        assert_eq!(engine.list_tables().await.unwrap(), vec!["products".to_string()]);
        let schema = engine.describe_table("PRODUCTS").await.unwrap().unwrap();
        assert_eq!(schema.table_name, "products");
        assert_eq!(schema.column_names(), vec!["upc", "product_name", "price"]);
        assert!(!schema.columns[0].nullable);
        assert!(engine.describe_table("missing").await.unwrap().is_none());
    }

    /// Counts to `n` through a recursive CTE; slow enough to hold the connection.
    fn slow_count(n: u64) -> String {
        format!(
            "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < {}) \
             SELECT COUNT(*) AS n FROM c",
            n
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queued_timeout_leaves_running_query_alone() {
        let engine = Arc::new(engine());
        let slow = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .execute(&slow_count(3_000_000), &ExecutionContext::default())
                    .await
            })
        };
        // let the slow query take the connection
        tokio::time::sleep(Duration::from_millis(100)).await;

        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let queued = engine
            .run_blocking(Duration::from_millis(10), move |_| {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(queued.is_err());

        let slow = slow.await.unwrap().unwrap();
        assert_eq!(slow.rows[0][0], serde_json::json!(3_000_000));

        // the abandoned call gets the connection at some point and must skip
        assert!(engine.health_check().await.unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_timeout_interrupts_own_query() {
        let engine = engine();
        let started = Instant::now();
        let err = engine
            .execute(&slow_count(50_000_000), &ExecutionContext { timeout_ms: 50, row_limit: None })
            .await;
        assert!(err.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));

        let result = engine
            .execute("SELECT COUNT(*) AS n FROM products", &ExecutionContext::default())
            .await
            .unwrap();
        assert_eq!(result.rows[0][0], serde_json::json!(2));
    }
}
