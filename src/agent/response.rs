//! Request options and the externally visible `AgentResponse`

use crate::agent::fallback::FallbackTier;
use crate::agent::state::PipelineState;
use crate::analyzer::{Complexity, ExtractedEntity, Intent};
use crate::context::ContextSource;
use crate::error::{AgentError, ErrorKind};
use crate::execution::profile::QueryType;
use crate::sql::SqlSource;
use crate::synthesis::{ChartSpec, ColumnProfile, TableFormat};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Optional per-request overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestContext {
    /// Backend name; the configured default when unset
    pub backend: Option<String>,
    /// Tables the caller knows the question is about
    pub table_hints: Vec<String>,
    /// Row cap, never above the configured maximum
    pub max_rows: Option<usize>,
    pub table_format: TableFormat,
    pub use_cache: bool,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            backend: None,
            table_hints: Vec::new(),
            max_rows: None,
            table_format: TableFormat::Html,
            use_cache: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ResponseError {
    pub fn from_error(error: &AgentError) -> Self {
        Self {
            kind: error.kind(),
            message: error.user_message(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,
    pub ambiguous: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_type: Option<QueryType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql_source: Option<SqlSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_source: Option<ContextSource>,
    pub tables: Vec<String>,
    pub fallback_tiers: Vec<FallbackTier>,
    pub states: Vec<PipelineState>,
    pub entities: Vec<ExtractedEntity>,
    pub column_stats: Vec<ColumnProfile>,
    pub truncated: bool,
    pub warnings: Vec<String>,
}

impl ResponseMetadata {
    pub fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            timestamp: Utc::now(),
            intent: None,
            complexity: None,
            ambiguous: false,
            query_type: None,
            sql_source: None,
            backend: None,
            context_source: None,
            tables: Vec::new(),
            fallback_tiers: Vec::new(),
            states: Vec::new(),
            entities: Vec::new(),
            column_stats: Vec::new(),
            truncated: false,
            warnings: Vec::new(),
        }
    }
}

/// The complete answer to one question. Failed requests still carry the
/// elapsed time and any SQL that was attempted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub success: bool,
    pub question: String,
    pub sql_query: Option<String>,
    pub response: String,
    pub data_table: Option<String>,
    pub visualization: Option<ChartSpec>,
    pub key_insights: Vec<String>,
    /// Seconds
    pub execution_time: f64,
    pub row_count: usize,
    /// In [0, 1]
    pub confidence_score: f64,
    pub degraded: bool,
    pub cache_hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    pub metadata: ResponseMetadata,
}

impl AgentResponse {
    /// Minimal failed response; the message is the user-safe one.
    pub fn failure(question: &str, error: &AgentError, metadata: ResponseMetadata) -> Self {
        Self {
            success: false,
            question: question.to_string(),
            sql_query: error.attempted_sql().map(|s| s.to_string()),
            response: error.user_message(),
            data_table: None,
            visualization: None,
            key_insights: Vec::new(),
            execution_time: 0.0,
            row_count: 0,
            confidence_score: 0.0,
            degraded: !metadata.fallback_tiers.is_empty(),
            cache_hit: false,
            error: Some(ResponseError::from_error(error)),
            metadata,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Whether this response ended in the given error kind.
    pub fn failed_with(&self, kind: ErrorKind) -> bool {
        !self.success && self.error_kind() == Some(kind)
    }
}
