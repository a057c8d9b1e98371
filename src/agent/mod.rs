//! Agent Orchestrator
//!
//! Drives a question through the pipeline state machine, applies the fallback
//! policy and the model rate limit, and produces the final `AgentResponse`.

pub mod builder;
pub mod fallback;
pub mod orchestrator;
pub mod rate_limit;
pub mod response;
pub mod state;

pub use builder::{engines_from_config, AgentBuilder};
pub use fallback::{output_tiers, select_fallback, FallbackDecision, FallbackTier, Stage};
pub use orchestrator::{AgentOrchestrator, ComponentHealth, HealthReport, HealthStatus, OrchestratorParts};
pub use rate_limit::{RateLimitResult, RateLimitedModel, RateLimiter};
pub use response::{AgentResponse, RequestContext, ResponseError, ResponseMetadata};
pub use state::{PipelineState, StateTracker};
