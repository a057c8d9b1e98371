//! Request counters and the query log, both created once per process and
//! injected into the orchestrator.

pub mod metrics;
pub mod query_log;

pub use metrics::{AgentStats, RequestOutcome, StatsSnapshot};
pub use query_log::{QueryLog, QueryLogEntry, DEFAULT_LOG_CAPACITY};
