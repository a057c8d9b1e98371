//! Polars Execution Engine
//!
//! Serves CSV and Parquet files from a data directory through polars' SQL
//! context. Each file is a table named after its lowercased file stem.

use crate::error::{AgentError, Result};
use crate::execution::engine::{EngineCapabilities, ExecutionContext, ExecutionEngine};
use crate::execution::profile::QueryProfile;
use crate::execution::result::QueryResult;
use crate::metadata::{ColumnInfo, SchemaInfo};
use crate::sql::dialect::SqlDialect;
use async_trait::async_trait;
use polars::prelude::*;
use polars::sql::SQLContext;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct PolarsEngine {
    capabilities: EngineCapabilities,
    data_dir: PathBuf,
}

impl PolarsEngine {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            capabilities: EngineCapabilities::polars(),
            data_dir,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// (table name, file path) for every CSV/Parquet file in the data dir.
    fn table_files(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut tables = Vec::new();
        for entry in std::fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            let is_data_file = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("csv") | Some("parquet")
            );
            if !is_data_file {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                tables.push((stem.to_lowercase(), path));
            }
        }
        tables.sort();
        Ok(tables)
    }

    fn find_table(&self, table: &str) -> Result<Option<PathBuf>> {
        let wanted = table.to_lowercase();
        Ok(self
            .table_files()?
            .into_iter()
            .find(|(name, _)| *name == wanted)
            .map(|(_, path)| path))
    }
}

fn scan(path: &Path) -> Result<LazyFrame> {
    let frame = match path.extension().and_then(|e| e.to_str()) {
        Some("parquet") => LazyFrame::scan_parquet(path, ScanArgsParquet::default())
            .map_err(|e| AgentError::Database(format!("Failed to load Parquet: {}", e)))?,
        _ => LazyCsvReader::new(path)
            .with_has_header(true)
            .finish()
            .map_err(|e| AgentError::Database(format!("Failed to load CSV: {}", e)))?,
    };
    Ok(frame)
}

#[async_trait]
impl ExecutionEngine for PolarsEngine {
    fn name(&self) -> &'static str {
        "polars"
    }

    fn capabilities(&self) -> &EngineCapabilities {
        &self.capabilities
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Polars
    }

    fn validate(&self, profile: &QueryProfile) -> Result<()> {
        if !profile.is_read_only {
            return Err(AgentError::Database(
                "Polars engine only runs single read-only queries".to_string(),
            ));
        }
        if profile.uses_ctes {
            return Err(AgentError::Database("Polars does not support CTEs".to_string()));
        }
        Ok(())
    }

    async fn execute(&self, sql: &str, ctx: &ExecutionContext) -> Result<QueryResult> {
        let start_time = Instant::now();
        info!("Executing query with Polars: {}", sql);

        let tables = self.table_files()?;
        let sql = sql.trim().trim_end_matches(';').to_string();
        let row_limit = ctx.row_limit;

        let task = tokio::task::spawn_blocking(move || -> Result<QueryResult> {
            let mut context = SQLContext::new();
            for (name, path) in &tables {
                context.register(name, scan(path)?);
            }
            let mut frame = context.execute(&sql)?;
            if let Some(limit) = row_limit {
                // one extra row tells us whether the result was cut
                frame = frame.limit((limit + 1) as IdxSize);
            }
            let df = frame.collect()?;
            QueryResult::from_dataframe(&df, "polars", row_limit)
        });

        let timeout = Duration::from_millis(ctx.timeout_ms);
        let mut result = match tokio::time::timeout(timeout, task).await {
            Ok(joined) => {
                joined.map_err(|e| AgentError::Database(format!("Polars worker failed: {}", e)))??
            }
            Err(_) => {
                warn!("Polars query exceeded {}ms", ctx.timeout_ms);
                return Err(AgentError::Database(format!(
                    "query timed out after {}ms",
                    ctx.timeout_ms
                )));
            }
        };

        result.execution_time_ms = start_time.elapsed().as_millis() as u64;
        Ok(result)
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        Ok(self.table_files()?.into_iter().map(|(name, _)| name).collect())
    }

    async fn describe_table(&self, table: &str) -> Result<Option<SchemaInfo>> {
        let Some(path) = self.find_table(table)? else {
            return Ok(None);
        };
        let name = table.to_lowercase();
        let schema = tokio::task::spawn_blocking(move || -> Result<SchemaInfo> {
            let df = scan(&path)?.limit(0).collect()?;
            let columns = df
                .schema()
                .iter_fields()
                .map(|field| ColumnInfo {
                    name: field.name().to_string(),
                    data_type: field.data_type().to_string(),
                    nullable: true,
                })
                .collect();
            Ok(SchemaInfo::new(name, columns))
        })
        .await
        .map_err(|e| AgentError::Database(format!("Polars worker failed: {}", e)))??;
        debug!("Described polars table {}", schema.table_name);
        Ok(Some(schema))
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.data_dir.is_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn data_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("Sales.csv")).unwrap();
        writeln!(file, "region,units").unwrap();
        writeln!(file, "north,10").unwrap();
        writeln!(file, "south,25").unwrap();
        writeln!(file, "east,7").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_lists_and_describes_files() {
        let dir = data_dir();
        let engine = PolarsEngine::new(dir.path().to_path_buf());
        assert_eq!(engine.list_tables().await.unwrap(), vec!["sales".to_string()]);
        let schema = engine.describe_table("sales").await.unwrap().unwrap();
        assert_eq!(schema.column_names(), vec!["region", "units"]);
        assert!(engine.describe_table("nothing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_executes_sql_with_limit() {
        let dir = data_dir();
        let engine = PolarsEngine::new(dir.path().to_path_buf());
        let result = engine
            .execute(
                "SELECT region, units FROM sales ORDER BY units DESC",
                &ExecutionContext::with_row_limit(2),
            )
            .await
            .unwrap();
        assert_eq!(result.row_count, 2);
        assert!(result.truncated);
        assert_eq!(result.rows[0][0], serde_json::json!("south"));
    }

    #[test]
    fn test_rejects_ctes() {
        let engine = PolarsEngine::new(PathBuf::from("."));
        let profile = QueryProfile::from_sql(
            "WITH t AS (SELECT 1 AS x) SELECT x FROM t",
            SqlDialect::Polars,
        );
        assert!(engine.validate(&profile).is_err());
    }
}
