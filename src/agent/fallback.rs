//! Fallback policy
//!
//! Stages report typed failures; `select_fallback` is the single place that
//! decides whether a failure is retried on a lower tier or ends the request.
//! Fallbacks a stage takes internally (live schema, templates) come back as
//! flags on its output and are mapped to tiers by `output_tiers`.

use crate::error::AgentError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Stage {
    Context,
    Generation,
    Execution,
    Synthesis,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FallbackTier {
    /// Context came from live schema inspection instead of the knowledge index
    SchemaFallback,
    /// SQL came from the template generator instead of the model
    PatternGenerator,
    /// Execution retried with a tighter row cap
    SimplifiedQuery,
    /// Explanation came from templates instead of the model
    TemplateSynthesis,
    /// The model budget was exhausted
    RateLimited,
}

impl FallbackTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackTier::SchemaFallback => "schema_fallback",
            FallbackTier::PatternGenerator => "pattern_generator",
            FallbackTier::SimplifiedQuery => "simplified_query",
            FallbackTier::TemplateSynthesis => "template_synthesis",
            FallbackTier::RateLimited => "rate_limited",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackDecision {
    /// Run the stage again on the given tier
    Retry(FallbackTier),
    /// No fallback left; the request fails with this error
    Fail,
}

/// Decide what happens after `error` on the `attempt`-th try (0-based) of a
/// stage. Every stage gets at most one fallback retry.
pub fn select_fallback(stage: Stage, error: &AgentError, attempt: u32) -> FallbackDecision {
    if attempt > 0 {
        return FallbackDecision::Fail;
    }

    match (stage, error) {
        (_, AgentError::Cancelled) => FallbackDecision::Fail,
        (_, AgentError::SqlValidationRejected { .. }) => FallbackDecision::Fail,

        // the assembler and the generator already ran their own fallback
        (Stage::Context, _) | (Stage::Generation, _) => FallbackDecision::Fail,

        (Stage::Execution, AgentError::QueryExecutionFailed { .. })
        | (Stage::Execution, AgentError::Database(_))
        | (Stage::Execution, AgentError::Polars(_)) => {
            FallbackDecision::Retry(FallbackTier::SimplifiedQuery)
        }
        (Stage::Execution, _) => FallbackDecision::Fail,

        (Stage::Synthesis, AgentError::SynthesisDegraded(_))
        | (Stage::Synthesis, AgentError::Llm(_)) => {
            FallbackDecision::Retry(FallbackTier::TemplateSynthesis)
        }
        (Stage::Synthesis, _) => FallbackDecision::Fail,
    }
}

/// Tiers implied by stage outputs that fell back internally.
pub fn output_tiers(
    live_schema: bool,
    template_sql: bool,
    template_synthesis: bool,
    rate_limited: bool,
) -> Vec<FallbackTier> {
    let mut tiers = Vec::new();
    if live_schema {
        tiers.push(FallbackTier::SchemaFallback);
    }
    if template_sql {
        tiers.push(FallbackTier::PatternGenerator);
    }
    if template_synthesis {
        tiers.push(FallbackTier::TemplateSynthesis);
    }
    if rate_limited {
        tiers.push(FallbackTier::RateLimited);
    }
    tiers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution_error() -> AgentError {
        AgentError::QueryExecutionFailed {
            sql: "SELECT 1".to_string(),
            detail: "timeout".to_string(),
        }
    }

    #[test]
    fn test_execution_retries_once() {
        assert_eq!(
            select_fallback(Stage::Execution, &execution_error(), 0),
            FallbackDecision::Retry(FallbackTier::SimplifiedQuery)
        );
        assert_eq!(
            select_fallback(Stage::Execution, &execution_error(), 1),
            FallbackDecision::Fail
        );
    }

    #[test]
    fn test_rejection_and_cancellation_are_final() {
        let rejected = AgentError::SqlValidationRejected {
            sql: String::new(),
            reason: "DROP".to_string(),
        };
        for stage in [Stage::Context, Stage::Generation, Stage::Execution, Stage::Synthesis] {
            assert_eq!(select_fallback(stage, &rejected, 0), FallbackDecision::Fail);
            assert_eq!(select_fallback(stage, &AgentError::Cancelled, 0), FallbackDecision::Fail);
        }
    }

    #[test]
    fn test_stage_specific_tiers() {
        assert_eq!(
            select_fallback(Stage::Context, &AgentError::ContextUnavailable("none".into()), 0),
            FallbackDecision::Fail
        );
        assert_eq!(
            select_fallback(Stage::Generation, &AgentError::SqlGenerationFailed("x".into()), 0),
            FallbackDecision::Fail
        );
        assert_eq!(
            select_fallback(Stage::Synthesis, &AgentError::SynthesisDegraded("csv".into()), 0),
            FallbackDecision::Retry(FallbackTier::TemplateSynthesis)
        );
        assert_eq!(
            select_fallback(Stage::Execution, &AgentError::Config("bad".into()), 0),
            FallbackDecision::Fail
        );
    }

    #[test]
    fn test_output_tiers() {
        assert_eq!(
            output_tiers(true, true, false, true),
            vec![FallbackTier::SchemaFallback, FallbackTier::PatternGenerator, FallbackTier::RateLimited]
        );
        assert!(output_tiers(false, false, false, false).is_empty());
        assert_eq!(output_tiers(false, false, true, false), vec![FallbackTier::TemplateSynthesis]);
    }
}
