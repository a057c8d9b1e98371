//! Natural-language question answering over SQL backends.
//!
//! A question is analyzed, grounded in schema and example knowledge, turned
//! into validated read-only SQL, executed against one of several backends and
//! explained back in plain language. Every stage has a fallback so a missing
//! language model or knowledge index degrades the answer instead of failing it.

pub mod agent;
pub mod analyzer;
pub mod api;
pub mod config;
pub mod context;
pub mod demo;
pub mod error;
pub mod execution;
pub mod knowledge;
pub mod llm;
pub mod metadata;
pub mod observability;
pub mod sql;
pub mod synthesis;

pub use agent::{AgentBuilder, AgentOrchestrator, AgentResponse, HealthReport, HealthStatus, RequestContext};
pub use config::AgentConfig;
pub use error::{AgentError, ErrorKind, LlmError, Result};
