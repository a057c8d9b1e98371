//! Query Executor
//!
//! Safety recheck, cache lookup, backend routing, row cap, timeout and
//! cancellation around a single statement.

use crate::error::{AgentError, Result};
use crate::execution::cache::{CacheStats, ResultCache};
use crate::execution::engine::ExecutionContext;
use crate::execution::profile::QueryProfile;
use crate::execution::result::QueryResult;
use crate::execution::router::ExecutionRouter;
use crate::sql::dialect::SqlDialect;
use crate::sql::validator::check_safety;
use lazy_static::lazy_static;
use regex::Regex;
use sqlparser::ast::{Expr, Statement, Value};
use sqlparser::parser::Parser;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

lazy_static! {
    static ref TRAILING_LIMIT: Regex = Regex::new(r"(?i)\bLIMIT\s+(\d+)(\s+OFFSET\s+\d+)?\s*;?\s*$").unwrap();
}

/// Per-call execution options.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Backend name, default backend when `None`
    pub backend: Option<String>,
    /// Row cap, never above the configured maximum
    pub row_limit: Option<usize>,
    pub use_cache: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            backend: None,
            row_limit: None,
            use_cache: true,
        }
    }
}

pub struct QueryExecutor {
    router: Arc<ExecutionRouter>,
    cache: Arc<ResultCache>,
    max_rows: usize,
    timeout: Duration,
}

impl QueryExecutor {
    pub fn new(router: Arc<ExecutionRouter>, cache: Arc<ResultCache>, max_rows: usize, timeout: Duration) -> Self {
        Self {
            router,
            cache,
            max_rows,
            timeout,
        }
    }

    pub fn router(&self) -> &Arc<ExecutionRouter> {
        &self.router
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) -> usize {
        let removed = self.cache.clear();
        info!("Cleared {} cached results", removed);
        removed
    }

    /// Dialect of the backend a request will run on.
    pub fn dialect_for(&self, backend: Option<&str>) -> Result<SqlDialect> {
        Ok(self.router.engine_for(backend)?.dialect())
    }

    pub async fn execute(
        &self,
        sql: &str,
        options: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<QueryResult> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let dialect = self.dialect_for(options.backend.as_deref())?;
        if let Err(e) = check_safety(sql, dialect) {
            return Err(AgentError::SqlValidationRejected {
                sql: sql.to_string(),
                reason: e.to_string(),
            });
        }
        let profile = QueryProfile::from_sql(sql, dialect);
        if !profile.is_read_only {
            return Err(AgentError::SqlValidationRejected {
                sql: sql.to_string(),
                reason: "not a single read-only query".to_string(),
            });
        }

        let engine = self
            .router
            .select(options.backend.as_deref(), &profile)
            .map_err(|e| AgentError::QueryExecutionFailed {
                sql: sql.to_string(),
                detail: e.to_string(),
            })?;

        let row_cap = options
            .row_limit
            .map(|l| l.min(self.max_rows))
            .unwrap_or(self.max_rows)
            .max(1);
        let scope = format!("{}#{}", engine.name(), row_cap);

        if options.use_cache {
            if let Some(mut cached) = self.cache.get(&scope, sql) {
                debug!("Cache hit on {}", engine.name());
                cached.execution_time_ms = 0;
                return Ok(cached);
            }
        }

        let ctx = ExecutionContext::new(self.timeout.as_millis() as u64, row_cap);
        let start_time = Instant::now();
        // engines enforce the timeout themselves; the outer bound is a backstop
        let outer = self.timeout + Duration::from_secs(1);

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            outcome = tokio::time::timeout(outer, engine.execute(sql, &ctx)) => outcome,
        };

        let mut result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!("Execution on {} failed: {}", engine.name(), e);
                return Err(AgentError::QueryExecutionFailed {
                    sql: sql.to_string(),
                    detail: e.to_string(),
                });
            }
            Err(_) => {
                warn!("Execution on {} timed out", engine.name());
                return Err(AgentError::QueryExecutionFailed {
                    sql: sql.to_string(),
                    detail: format!("query timed out after {}ms", self.timeout.as_millis()),
                });
            }
        };

        result.truncate(row_cap);
        if result.truncated {
            warn!("Result truncated to {} rows", row_cap);
            result
                .warnings
                .push(format!("Result truncated to {} rows", row_cap));
        }
        result.execution_time_ms = start_time.elapsed().as_millis() as u64;
        result.cache_hit = false;

        if options.use_cache {
            self.cache.put(&scope, sql, &result);
        }

        info!(
            "Executed on {} in {}ms, {} rows",
            engine.name(),
            result.execution_time_ms,
            result.row_count
        );
        Ok(result)
    }
}

/// Make sure the top-level query returns at most `cap` rows: lower an
/// existing trailing LIMIT or append one.
pub fn with_row_cap(sql: &str, dialect: SqlDialect, cap: usize) -> String {
    let trimmed = sql.trim().trim_end_matches(';').trim_end();
    let parser_dialect = dialect.parser_dialect();
    let top_level_limit = match Parser::parse_sql(parser_dialect.as_ref(), trimmed) {
        Ok(statements) => match statements.first() {
            Some(Statement::Query(query)) => match &query.limit {
                Some(Expr::Value(Value::Number(n, _))) => Some(n.parse::<usize>().ok()),
                Some(_) => Some(None),
                None => None,
            },
            _ => return trimmed.to_string(),
        },
        Err(_) => return trimmed.to_string(),
    };

    match top_level_limit {
        None => format!("{} LIMIT {}", trimmed, cap),
        Some(Some(n)) if n > cap => match TRAILING_LIMIT.captures(trimmed) {
            Some(caps) => {
                let offset = caps.get(2).map(|m| m.as_str()).unwrap_or("");
                let start = caps.get(0).map(|m| m.start()).unwrap_or(trimmed.len());
                format!("{}LIMIT {}{}", &trimmed[..start], cap, offset)
            }
            None => trimmed.to_string(),
        },
        _ => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::engine::ExecutionEngine;
    use crate::execution::sqlite_engine::SqliteEngine;

    fn executor() -> QueryExecutor {
        let engine = SqliteEngine::in_memory().unwrap();
        engine
            .seed(
                "CREATE TABLE t (id INTEGER, v REAL);
                 INSERT INTO t VALUES (1, 1.5), (2, 2.5), (3, 3.5);",
            )
            .unwrap();
        let engines: Vec<Arc<dyn ExecutionEngine>> = vec![Arc::new(engine)];
        let router = ExecutionRouter::new(engines, "sqlite").unwrap();
        QueryExecutor::new(
            Arc::new(router),
            Arc::new(ResultCache::new(Duration::from_secs(60), 16)),
            2,
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_with_row_cap() {
        assert_eq!(with_row_cap("SELECT * FROM t;", SqlDialect::Sqlite, 10), "SELECT * FROM t LIMIT 10");
        assert_eq!(
            with_row_cap("SELECT * FROM t ORDER BY id LIMIT 500", SqlDialect::Sqlite, 100),
            "SELECT * FROM t ORDER BY id LIMIT 100"
        );
        assert_eq!(
            with_row_cap("SELECT * FROM t LIMIT 5", SqlDialect::Sqlite, 100),
            "SELECT * FROM t LIMIT 5"
        );
    }

    #[tokio::test]
    async fn test_cache_and_row_cap() {
        let executor = executor();
        let cancel = CancellationToken::new();
        let options = ExecuteOptions::default();

        let first = executor.execute("SELECT id, v FROM t ORDER BY id", &options, &cancel).await.unwrap();
        assert!(!first.cache_hit);
        assert_eq!(first.row_count, 2);
        assert!(first.truncated);

        let second = executor.execute("SELECT id, v FROM t  ORDER BY id;", &options, &cancel).await.unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.rows, first.rows);
        assert_eq!(executor.cache_stats().hits, 1);
    }

    #[tokio::test]
    async fn test_rejects_unsafe_sql_before_execution() {
        let executor = executor();
        let err = executor
            .execute("DROP TABLE t", &ExecuteOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::SqlValidationRejected { .. }));
    }

    #[tokio::test]
    async fn test_backend_error_carries_sql() {
        let executor = executor();
        let err = executor
            .execute("SELECT missing FROM t", &ExecuteOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            AgentError::QueryExecutionFailed { sql, .. } => assert_eq!(sql, "SELECT missing FROM t"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let executor = executor();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = executor
            .execute("SELECT 1", &ExecuteOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }
}
