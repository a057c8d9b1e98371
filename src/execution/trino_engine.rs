//! Trino Execution Engine
//!
//! Remote backend over the Trino REST protocol: POST the statement, then
//! follow `nextUri` until the query drains.

use crate::config::TrinoConfig;
use crate::error::{AgentError, Result};
use crate::execution::engine::{EngineCapabilities, ExecutionContext, ExecutionEngine};
use crate::execution::profile::QueryProfile;
use crate::execution::result::QueryResult;
use crate::metadata::{is_safe_identifier, ColumnInfo, SchemaInfo};
use crate::sql::dialect::SqlDialect;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub struct TrinoEngine {
    capabilities: EngineCapabilities,
    coordinator_url: String,
    catalog: String,
    schema: String,
    client: Client,
    user: String,
}

// Trino REST API: POST /v1/statement with SQL in body (plain text, not JSON)
// Headers: X-Trino-User, X-Trino-Catalog, X-Trino-Schema

#[derive(Debug, Deserialize)]
struct TrinoResponse {
    id: Option<String>,
    #[serde(rename = "nextUri")]
    next_uri: Option<String>,
    columns: Option<Vec<TrinoColumn>>,
    data: Option<Vec<Vec<serde_json::Value>>>,
    error: Option<TrinoError>,
}

#[derive(Debug, Deserialize)]
struct TrinoError {
    message: String,
    #[serde(rename = "errorCode")]
    error_code: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct TrinoColumn {
    name: String,
}

const MAX_POLLS: usize = 10_000;

impl TrinoEngine {
    pub fn new(config: &TrinoConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| AgentError::Config(format!("Failed to create Trino HTTP client: {}", e)))?;

        Ok(Self {
            capabilities: EngineCapabilities::trino(),
            coordinator_url: config.coordinator_url.trim_end_matches('/').to_string(),
            catalog: config.catalog.clone(),
            schema: config.schema.clone(),
            client,
            user: config.user.clone(),
        })
    }

    async fn submit_query(&self, sql: &str) -> Result<TrinoResponse> {
        let url = format!("{}/v1/statement", self.coordinator_url);

        let response = self
            .client
            .post(&url)
            .header("X-Trino-User", &self.user)
            .header("X-Trino-Catalog", &self.catalog)
            .header("X-Trino-Schema", &self.schema)
            .header("Content-Type", "text/plain")
            .body(sql.to_string())
            .send()
            .await
            .map_err(|e| AgentError::Database(format!("Failed to submit Trino query: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AgentError::Database(format!(
                "Trino query failed with status {}: {}",
                status, text
            )));
        }

        let body: TrinoResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Database(format!("Failed to parse Trino response: {}", e)))?;
        check_error(&body)?;
        Ok(body)
    }

    /// Fetch one page, retrying transient failures.
    async fn fetch_page(&self, next_uri: &str) -> Result<TrinoResponse> {
        let url = if next_uri.starts_with("http") {
            next_uri.to_string()
        } else {
            format!("{}{}", self.coordinator_url, next_uri)
        };

        let mut retries = 3;
        loop {
            let response = match self.client.get(&url).header("X-Trino-User", &self.user).send().await {
                Ok(r) => r,
                Err(e) if retries > 0 && e.is_timeout() => {
                    retries -= 1;
                    warn!("Trino fetch timeout, retrying... ({} retries left)", retries);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
                Err(e) => {
                    return Err(AgentError::Database(format!("Failed to fetch Trino results: {}", e)))
                }
            };

            let status = response.status();
            if status.is_server_error() && retries > 0 {
                retries -= 1;
                warn!("Trino server error {}, retrying... ({} retries left)", status, retries);
                tokio::time::sleep(Duration::from_millis(1000)).await;
                continue;
            }
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(AgentError::Database(format!(
                    "Trino fetch failed with status {}: {}",
                    status, text
                )));
            }

            let page: TrinoResponse = response
                .json()
                .await
                .map_err(|e| AgentError::Database(format!("Failed to parse Trino data: {}", e)))?;
            check_error(&page)?;
            return Ok(page);
        }
    }

    async fn run(&self, sql: &str, ctx: &ExecutionContext) -> Result<QueryResult> {
        let start_time = Instant::now();
        let first = self.submit_query(sql).await?;
        let query_id = first.id.clone().unwrap_or_default();

        let mut columns: Option<Vec<TrinoColumn>> = first.columns;
        let mut rows = first.data.unwrap_or_default();
        let mut next_uri = first.next_uri;
        let mut truncated = false;
        let mut poll_count = 0;

        while let Some(uri) = next_uri.take() {
            if start_time.elapsed().as_millis() as u64 > ctx.timeout_ms {
                return Err(AgentError::Database(format!(
                    "Trino query timeout after {}ms",
                    ctx.timeout_ms
                )));
            }
            poll_count += 1;
            if poll_count > MAX_POLLS {
                return Err(AgentError::Database(format!(
                    "Trino query exceeded max polls ({})",
                    MAX_POLLS
                )));
            }
            if let Some(limit) = ctx.row_limit {
                if rows.len() > limit {
                    truncated = true;
                    break;
                }
            }

            let page = self.fetch_page(&uri).await?;
            if columns.is_none() {
                columns = page.columns;
            }
            if let Some(data) = page.data {
                rows.extend(data);
            }
            next_uri = page.next_uri;

            // backoff between polls, 100ms steps up to 1s
            let delay_ms = (100 * poll_count.min(10)) as u64;
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        let columns: Vec<String> = columns
            .unwrap_or_default()
            .into_iter()
            .map(|c| c.name)
            .collect();
        let mut result = QueryResult::new(columns, rows, "trino");
        if let Some(limit) = ctx.row_limit {
            result.truncate(limit);
        }
        result.truncated |= truncated;
        result.execution_time_ms = start_time.elapsed().as_millis() as u64;
        result
            .engine_metadata
            .insert("query_id".to_string(), serde_json::Value::String(query_id));
        Ok(result)
    }
}

fn check_error(response: &TrinoResponse) -> Result<()> {
    match &response.error {
        Some(error) => Err(AgentError::Database(format!(
            "Trino error: {} (code: {:?})",
            error.message, error.error_code
        ))),
        None => Ok(()),
    }
}

#[async_trait]
impl ExecutionEngine for TrinoEngine {
    fn name(&self) -> &'static str {
        "trino"
    }

    fn capabilities(&self) -> &EngineCapabilities {
        &self.capabilities
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Trino
    }

    fn validate(&self, profile: &QueryProfile) -> Result<()> {
        if !profile.is_read_only {
            return Err(AgentError::Database(
                "Trino engine only runs single read-only queries".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute(&self, sql: &str, ctx: &ExecutionContext) -> Result<QueryResult> {
        info!("Executing query with Trino: {}", sql);
        self.run(sql.trim().trim_end_matches(';'), ctx).await
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT table_name FROM information_schema.tables WHERE table_schema = '{}' ORDER BY table_name",
            self.schema.replace('\'', "''")
        );
        let result = self.run(&sql, &ExecutionContext::default()).await?;
        Ok(result
            .rows
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect())
    }

    async fn describe_table(&self, table: &str) -> Result<Option<SchemaInfo>> {
        if !is_safe_identifier(table) {
            return Ok(None);
        }
        let sql = format!(
            "SELECT column_name, data_type, is_nullable FROM information_schema.columns \
             WHERE table_schema = '{}' AND table_name = '{}' ORDER BY ordinal_position",
            self.schema.replace('\'', "''"),
            table.to_lowercase()
        );
        let result = self.run(&sql, &ExecutionContext::default()).await?;
        if result.is_empty() {
            return Ok(None);
        }
        let columns = result
            .rows
            .iter()
            .map(|row| ColumnInfo {
                name: row.first().and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                data_type: row.get(1).and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                nullable: row.get(2).and_then(|v| v.as_str()) != Some("NO"),
            })
            .collect();
        Ok(Some(SchemaInfo::new(table.to_lowercase(), columns)))
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/v1/info", self.coordinator_url);
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => Ok(true),
            Ok(response) => {
                error!("Trino health check failed: status {}", response.status());
                Ok(false)
            }
            Err(e) => {
                error!("Trino health check failed: {}", e);
                Ok(false)
            }
        }
    }
}
