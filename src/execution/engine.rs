//! Execution Engine Trait - Core contract for all query backends
//!
//! Backends are pluggable; the router picks one per request from the
//! caller's preference and the query profile.

use crate::error::Result;
use crate::execution::profile::QueryProfile;
use crate::execution::result::QueryResult;
use crate::metadata::SchemaInfo;
use crate::sql::dialect::SqlDialect;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Execution context passed to engines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Timeout in milliseconds
    pub timeout_ms: u64,

    /// Maximum rows materialised into the result
    pub row_limit: Option<usize>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            row_limit: None,
        }
    }
}

impl ExecutionContext {
    pub fn new(timeout_ms: u64, row_limit: usize) -> Self {
        Self {
            timeout_ms,
            row_limit: Some(row_limit),
        }
    }

    pub fn with_row_limit(row_limit: usize) -> Self {
        Self {
            row_limit: Some(row_limit),
            ..Self::default()
        }
    }
}

/// Engine capabilities - what features a backend supports
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineCapabilities {
    /// Supports Common Table Expressions (WITH clauses)
    pub supports_ctes: bool,

    /// Supports window functions (ROW_NUMBER, RANK, etc.)
    pub supports_window_functions: bool,

    /// Supports queries spanning several catalogs
    pub supports_federated_sources: bool,

    /// Runs inside the agent process
    pub in_process: bool,
}

impl EngineCapabilities {
    pub fn sqlite() -> Self {
        Self {
            supports_ctes: true,
            supports_window_functions: true,
            supports_federated_sources: false,
            in_process: true,
        }
    }

    pub fn trino() -> Self {
        Self {
            supports_ctes: true,
            supports_window_functions: true,
            supports_federated_sources: true,
            in_process: false,
        }
    }

    /// Polars SQL has no CTE support
    pub fn polars() -> Self {
        Self {
            supports_ctes: false,
            supports_window_functions: true,
            supports_federated_sources: false,
            in_process: true,
        }
    }
}

/// Engine suggestion with the reasoning behind its score
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSuggestion {
    pub engine: String,
    pub can_handle: bool,
    pub score: i32,
    pub reasons: Vec<String>,
}

/// Execution engine trait - all backends implement this
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Engine name (e.g., "sqlite", "trino", "polars")
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> &EngineCapabilities;

    /// SQL dialect used for generation and validation
    fn dialect(&self) -> SqlDialect;

    /// Validate that this engine can execute the given query profile
    fn validate(&self, profile: &QueryProfile) -> Result<()>;

    /// Execute a read-only SQL query
    async fn execute(&self, sql: &str, ctx: &ExecutionContext) -> Result<QueryResult>;

    /// Table names visible to this engine
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Column metadata for one table, `None` when it does not exist
    async fn describe_table(&self, table: &str) -> Result<Option<SchemaInfo>>;

    /// Check if engine is available/healthy
    async fn health_check(&self) -> Result<bool>;
}
