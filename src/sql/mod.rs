//! SQL Generator
//!
//! Model-backed generation with a deterministic template fallback. Both paths
//! go through the same `SqlValidator`.

pub mod dialect;
pub mod generator;
pub mod prompts;
pub mod templates;
pub mod validator;

pub use dialect::SqlDialect;
pub use generator::{is_write_command, GenerationTarget, SqlGenerator};
pub use templates::{TemplateGenerator, TemplateShape};
pub use validator::{check_safety, SqlValidator, ValidationError, ValidationReport};

use crate::execution::profile::QueryType;
use serde::{Deserialize, Serialize};

/// Confidence ceiling for template-generated SQL.
pub const TEMPLATE_CONFIDENCE_CAP: f64 = 0.6;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SqlSource {
    Model,
    Template,
}

/// A validated statement ready for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedSql {
    pub sql: String,
    pub query_type: QueryType,
    /// In [0, 1]
    pub confidence: f64,
    pub warnings: Vec<String>,
    pub source: SqlSource,
    pub tables: Vec<String>,
    /// Why the model path was not used, when it wasn't
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    /// The model budget was exhausted for this request
    #[serde(default)]
    pub rate_limited: bool,
}

impl GeneratedSql {
    pub fn is_fallback(&self) -> bool {
        self.source == SqlSource::Template
    }
}

/// Weighted confidence: model certainty, column resolution and whether an
/// example with the same intent was retrieved, less a penalty per warning.
pub fn confidence_score(
    certainty: Option<f64>,
    column_ratio: f64,
    example_match: bool,
    warnings: usize,
) -> f64 {
    let certainty = certainty.unwrap_or(0.5).clamp(0.0, 1.0);
    let example = if example_match { 1.0 } else { 0.0 };
    let score = 0.4 * certainty + 0.4 * column_ratio.clamp(0.0, 1.0) + 0.2 * example
        - 0.05 * warnings as f64;
    clamp_unit(score)
}

/// Template confidence, never above `TEMPLATE_CONFIDENCE_CAP`.
pub fn template_confidence(column_ratio: f64, example_match: bool, warnings: usize) -> f64 {
    let base = 0.4 + 0.15 * column_ratio.clamp(0.0, 1.0) + if example_match { 0.05 } else { 0.0 };
    clamp_unit(base - 0.05 * warnings as f64).min(TEMPLATE_CONFIDENCE_CAP)
}

pub(crate) fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_bounds() {
        for certainty in [None, Some(-3.0), Some(0.0), Some(0.7), Some(1.0), Some(9.0)] {
            for ratio in [0.0, 0.5, 1.0, 2.0] {
                for example in [false, true] {
                    for warnings in [0, 1, 5, 40] {
                        let score = confidence_score(certainty, ratio, example, warnings);
                        assert!((0.0..=1.0).contains(&score));
                        let template = template_confidence(ratio, example, warnings);
                        assert!((0.0..=TEMPLATE_CONFIDENCE_CAP).contains(&template));
                    }
                }
            }
        }
        assert!(confidence_score(Some(f64::NAN), 1.0, true, 0) <= 1.0);
    }

    #[test]
    fn test_confidence_weights() {
        assert!((confidence_score(Some(1.0), 1.0, true, 0) - 1.0).abs() < 1e-9);
        assert!((confidence_score(None, 1.0, false, 0) - 0.6).abs() < 1e-9);
        assert!((template_confidence(1.0, true, 0) - 0.6).abs() < 1e-9);
    }
}
