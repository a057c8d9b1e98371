use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the language-model collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("language model unavailable: {0}")]
    Unavailable(String),

    #[error("malformed language model response: {0}")]
    Malformed(String),

    #[error("language model call timed out after {0}ms")]
    Timeout(u64),

    #[error("language model rate limit exhausted")]
    RateLimited,
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Ambiguous question: {0}")]
    AnalysisAmbiguous(String),

    #[error("Context unavailable: {0}")]
    ContextUnavailable(String),

    #[error("SQL generation failed: {0}")]
    SqlGenerationFailed(String),

    #[error("SQL rejected by validation: {reason}")]
    SqlValidationRejected { sql: String, reason: String },

    #[error("Query execution failed: {detail}")]
    QueryExecutionFailed { sql: String, detail: String },

    #[error("Response synthesis degraded: {0}")]
    SynthesisDegraded(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Knowledge index error: {0}")]
    Knowledge(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

/// Stable tag for the error taxonomy, serialized into failed responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "AnalysisAmbiguous")]
    AnalysisAmbiguous,
    #[serde(rename = "ContextUnavailable")]
    ContextUnavailable,
    #[serde(rename = "SQLGenerationFailed")]
    SqlGenerationFailed,
    #[serde(rename = "SQLValidationRejected")]
    SqlValidationRejected,
    #[serde(rename = "QueryExecutionFailed")]
    QueryExecutionFailed,
    #[serde(rename = "SynthesisDegraded")]
    SynthesisDegraded,
    #[serde(rename = "Cancelled")]
    Cancelled,
    #[serde(rename = "Internal")]
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AnalysisAmbiguous => "AnalysisAmbiguous",
            ErrorKind::ContextUnavailable => "ContextUnavailable",
            ErrorKind::SqlGenerationFailed => "SQLGenerationFailed",
            ErrorKind::SqlValidationRejected => "SQLValidationRejected",
            ErrorKind::QueryExecutionFailed => "QueryExecutionFailed",
            ErrorKind::SynthesisDegraded => "SynthesisDegraded",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::AnalysisAmbiguous(_) => ErrorKind::AnalysisAmbiguous,
            AgentError::ContextUnavailable(_) => ErrorKind::ContextUnavailable,
            AgentError::SqlGenerationFailed(_) | AgentError::Llm(_) => {
                ErrorKind::SqlGenerationFailed
            }
            AgentError::SqlValidationRejected { .. } => ErrorKind::SqlValidationRejected,
            AgentError::QueryExecutionFailed { .. } => ErrorKind::QueryExecutionFailed,
            AgentError::SynthesisDegraded(_) => ErrorKind::SynthesisDegraded,
            AgentError::Cancelled => ErrorKind::Cancelled,
            AgentError::Knowledge(_)
            | AgentError::Database(_)
            | AgentError::Config(_)
            | AgentError::Io(_)
            | AgentError::Json(_)
            | AgentError::Polars(_) => ErrorKind::Internal,
        }
    }

    /// Message safe to return to callers. Internal detail (SQL text, schema
    /// names, backend errors) only goes to the logs.
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::AnalysisAmbiguous => {
                "The question could not be interpreted. Try rephrasing it.".to_string()
            }
            ErrorKind::ContextUnavailable => {
                "No schema information is available for the data this question refers to."
                    .to_string()
            }
            ErrorKind::SqlGenerationFailed => {
                "A valid query could not be generated for this question.".to_string()
            }
            ErrorKind::SqlValidationRejected => {
                "The request was refused: only read-only analytical queries are allowed."
                    .to_string()
            }
            ErrorKind::QueryExecutionFailed => {
                "The query could not be executed against the database.".to_string()
            }
            ErrorKind::SynthesisDegraded => {
                "The answer could only be summarised in reduced form.".to_string()
            }
            ErrorKind::Cancelled => "The request was cancelled.".to_string(),
            ErrorKind::Internal => "An internal error occurred.".to_string(),
        }
    }

    /// SQL attached to the failure, kept for debugging output.
    pub fn attempted_sql(&self) -> Option<&str> {
        match self {
            AgentError::SqlValidationRejected { sql, .. }
            | AgentError::QueryExecutionFailed { sql, .. } => {
                if sql.is_empty() {
                    None
                } else {
                    Some(sql.as_str())
                }
            }
            _ => None,
        }
    }
}

impl From<polars::error::PolarsError> for AgentError {
    fn from(err: polars::error::PolarsError) -> Self {
        AgentError::Polars(err.to_string())
    }
}

impl From<rusqlite::Error> for AgentError {
    fn from(err: rusqlite::Error) -> Self {
        AgentError::Database(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_hides_sql() {
        let err = AgentError::QueryExecutionFailed {
            sql: "SELECT secret_col FROM hidden_table".to_string(),
            detail: "no such column: secret_col".to_string(),
        };
        let msg = err.user_message();
        assert!(!msg.contains("secret_col"));
        assert!(!msg.contains("hidden_table"));
        assert_eq!(err.attempted_sql(), Some("SELECT secret_col FROM hidden_table"));
    }

    #[test]
    fn test_kind_serializes_with_taxonomy_name() {
        let err = AgentError::SqlValidationRejected {
            sql: String::new(),
            reason: "DROP".to_string(),
        };
        let json = serde_json::to_string(&err.kind()).unwrap();
        assert_eq!(json, "\"SQLValidationRejected\"");
        assert_eq!(err.attempted_sql(), None);
    }
}
