//! Response Synthesizer
//!
//! Explanation and key insights come from the language model when it is
//! reachable and from templates otherwise. The table rendering and the chart
//! never depend on the model.

pub mod chart;
pub mod stats;
pub mod table;

pub use chart::{ChartSpec, ChartType};
pub use stats::{ColumnKind, ColumnProfile, NumericStats};
pub use table::TableFormat;

use crate::analyzer::ProcessedQuestion;
use crate::config::SynthesisConfig;
use crate::error::{AgentError, LlmError, Result};
use crate::execution::result::QueryResult;
use crate::llm::{extract_json_object, LanguageModel};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use stats::{display_value, format_float, profile_columns};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Columns listed in a single-row explanation.
const MAX_EXPLAINED_COLUMNS: usize = 8;

const SYNTHESIS_SYSTEM_PROMPT: &str = "You are a data analyst. You explain query results \
to business users in plain language. Only state facts supported by the data shown.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedResponse {
    pub text: String,
    pub data_table: String,
    pub table_format: TableFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visualization: Option<ChartSpec>,
    pub key_insights: Vec<String>,
    pub column_stats: Vec<ColumnProfile>,
    /// Explanation came from templates
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    #[serde(default)]
    pub rate_limited: bool,
}

#[derive(Debug, Deserialize)]
struct ModelSummary {
    explanation: String,
    #[serde(default)]
    insights: Vec<String>,
}

pub struct ResponseSynthesizer {
    model: Arc<dyn LanguageModel>,
    sample_rows: usize,
    max_table_rows: usize,
    max_insights: usize,
}

impl ResponseSynthesizer {
    pub fn new(model: Arc<dyn LanguageModel>, config: &SynthesisConfig) -> Self {
        Self {
            model,
            sample_rows: config.sample_rows.max(1),
            max_table_rows: config.max_table_rows.max(1),
            max_insights: config.max_insights,
        }
    }

    pub async fn synthesize(
        &self,
        pq: &ProcessedQuestion,
        sql: &str,
        result: &QueryResult,
        format: TableFormat,
        use_model: bool,
        cancel: &CancellationToken,
    ) -> Result<GeneratedResponse> {
        let profiles = profile_columns(result);
        let data_table = table::render_table(result, format, self.max_table_rows)?;
        let visualization = chart::build_chart(result, &profiles, pq.raw.trim());
        if let Some(chart) = &visualization {
            debug!("Selected {} chart over {} / {}", chart.chart_type.as_str(), chart.x_field, chart.y_field);
        }

        let mut response = GeneratedResponse {
            text: String::new(),
            data_table,
            table_format: format,
            visualization,
            key_insights: Vec::new(),
            column_stats: profiles,
            degraded: false,
            fallback_reason: None,
            rate_limited: false,
        };

        let summary = if use_model {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let prompt = self.build_prompt(pq, sql, result, &response.column_stats);
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                outcome = self.model.complete(SYNTHESIS_SYSTEM_PROMPT, &prompt) => outcome,
            };
            match outcome.and_then(|text| parse_summary(&text)) {
                Ok(summary) => Some(summary),
                Err(e) => {
                    warn!("Synthesis falling back to templates: {}", e);
                    response.rate_limited = e == LlmError::RateLimited;
                    response.fallback_reason = Some(e.to_string());
                    None
                }
            }
        } else {
            response.fallback_reason = Some("language model disabled".to_string());
            None
        };

        match summary {
            Some(summary) => {
                response.text = summary.explanation.trim().to_string();
                response.key_insights = summary
                    .insights
                    .into_iter()
                    .map(|i| i.trim().to_string())
                    .filter(|i| !i.is_empty())
                    .take(self.max_insights)
                    .collect();
                if response.key_insights.is_empty() {
                    response.key_insights = template_insights(result, &response.column_stats, self.max_insights);
                }
            }
            None => {
                response.degraded = true;
                response.text = template_explanation(result, &response.column_stats);
                response.key_insights = template_insights(result, &response.column_stats, self.max_insights);
            }
        }

        info!(
            "Synthesized response ({} insights, chart: {}, degraded: {})",
            response.key_insights.len(),
            response.visualization.as_ref().map(|c| c.chart_type.as_str()).unwrap_or("none"),
            response.degraded
        );
        Ok(response)
    }

    fn build_prompt(&self, pq: &ProcessedQuestion, sql: &str, result: &QueryResult, profiles: &[ColumnProfile]) -> String {
        let sample: Vec<_> = result.to_records().into_iter().take(self.sample_rows).collect();
        let sample_json = serde_json::to_string_pretty(&sample).unwrap_or_default();
        let stats: Vec<String> = profiles
            .iter()
            .filter_map(|p| {
                p.numeric.as_ref().map(|n| {
                    format!(
                        "- {}: min {}, max {}, sum {}, mean {}",
                        p.name,
                        format_float(n.min),
                        format_float(n.max),
                        format_float(n.sum),
                        format_float(n.mean)
                    )
                })
            })
            .collect();

        format!(
            r#"QUESTION: {}

SQL:
{}

RESULT: {} rows, columns: {}{}

SAMPLE ROWS:
{}

NUMERIC COLUMNS:
{}

Explain what the result says about the question in 2-3 sentences, quoting the
relevant values exactly as shown. Then list up to {} short key insights.

OUTPUT FORMAT (JSON only, no markdown):
{{
  "explanation": "...",
  "insights": ["...", "..."]
}}"#,
            pq.raw.trim(),
            sql,
            result.row_count,
            result.columns.join(", "),
            if result.truncated { " (truncated)" } else { "" },
            sample_json,
            if stats.is_empty() { "(none)".to_string() } else { stats.join("\n") },
            self.max_insights.max(1)
        )
    }
}

fn parse_summary(text: &str) -> std::result::Result<ModelSummary, LlmError> {
    let value = extract_json_object(text)
        .ok_or_else(|| LlmError::Malformed("no JSON object in synthesis response".to_string()))?;
    let summary: ModelSummary = serde_json::from_value(value)
        .map_err(|e| LlmError::Malformed(format!("unexpected synthesis response: {}", e)))?;
    if summary.explanation.trim().is_empty() {
        return Err(LlmError::Malformed("empty explanation".to_string()));
    }
    Ok(summary)
}

/// Explanation built from counts and statistics alone.
pub fn template_explanation(result: &QueryResult, profiles: &[ColumnProfile]) -> String {
    if result.is_empty() {
        return "The query ran successfully but no rows matched.".to_string();
    }

    if result.row_count == 1 {
        let values: Vec<String> = result
            .columns
            .iter()
            .zip(result.rows[0].iter())
            .take(MAX_EXPLAINED_COLUMNS)
            .map(|(column, value)| format!("{} = {}", column, display_or_null(value)))
            .collect();
        return format!("Found 1 matching row: {}.", values.join(", "));
    }

    let mut text = format!(
        "The query returned {} rows across {} columns.",
        result.row_count,
        result.columns.len()
    );
    if let Some(first) = profiles.iter().find(|p| p.is_numeric()) {
        if let Some(stats) = &first.numeric {
            text.push_str(&format!(
                " {} ranges from {} to {} with a total of {}.",
                first.name,
                format_float(stats.min),
                format_float(stats.max),
                format_float(stats.sum)
            ));
        }
    }
    if result.truncated {
        text.push_str(" Only the first rows are shown.");
    }
    text
}

/// Insights drawn from the numeric columns: the row holding each maximum and
/// the column average.
pub fn template_insights(result: &QueryResult, profiles: &[ColumnProfile], limit: usize) -> Vec<String> {
    if result.row_count < 2 {
        return Vec::new();
    }
    let label_idx = profiles
        .iter()
        .position(|p| matches!(p.kind, ColumnKind::Categorical | ColumnKind::Temporal));

    let mut insights = Vec::new();
    for (idx, profile) in profiles.iter().enumerate() {
        let Some(stats) = &profile.numeric else {
            continue;
        };
        let top_label = label_idx.and_then(|label| {
            result
                .rows
                .iter()
                .find(|row| row.get(idx).and_then(|v| v.as_f64()) == Some(stats.max))
                .and_then(|row| row.get(label))
                .map(display_value)
        });
        match top_label {
            Some(label) if !label.is_empty() => insights.push(format!(
                "Highest {}: {} ({})",
                profile.name,
                format_float(stats.max),
                label
            )),
            _ => insights.push(format!("Highest {}: {}", profile.name, format_float(stats.max))),
        }
        insights.push(format!("Average {}: {}", profile.name, format_float(stats.mean)));
    }
    if result.truncated {
        insights.push(format!("Result limited to {} rows", result.row_count));
    }
    insights.truncate(limit);
    insights
}

fn display_or_null(value: &serde_json::Value) -> String {
    if value.is_null() {
        "null".to_string()
    } else {
        display_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::QuestionAnalyzer;
    use crate::llm::UnconfiguredModel;
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedModel(String);

    #[async_trait]
    impl LanguageModel for FixedModel {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn complete(&self, _system: &str, _prompt: &str) -> std::result::Result<String, LlmError> {
            Ok(self.0.clone())
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    fn synthesizer(model: Arc<dyn LanguageModel>) -> ResponseSynthesizer {
        ResponseSynthesizer::new(model, &SynthesisConfig::default())
    }

    fn price_row() -> QueryResult {
        QueryResult::new(
            vec!["upc".into(), "product_name".into(), "price".into()],
            vec![vec![json!("0020282000000"), json!("Cola 12oz"), json!(2.49)]],
            "sqlite",
        )
    }

    fn weekly() -> QueryResult {
        QueryResult::new(
            vec!["week".into(), "revenue".into()],
            vec![
                vec![json!("2024-01-01"), json!(100.0)],
                vec![json!("2024-01-08"), json!(150.5)],
                vec![json!("2024-01-15"), json!(120.0)],
            ],
            "sqlite",
        )
    }

    #[tokio::test]
    async fn test_template_fallback_mentions_values() {
        let pq = QuestionAnalyzer::new(vec![]).analyze("What is the current price for UPC 0020282000000?");
        let response = synthesizer(Arc::new(UnconfiguredModel))
            .synthesize(&pq, "SELECT 1", &price_row(), TableFormat::Html, true, &CancellationToken::new())
            .await
            .unwrap();
        assert!(response.degraded);
        assert!(response.text.contains("2.49"));
        assert!(response.text.contains("upc = 0020282000000"));
        assert!(response.data_table.contains("<td>2.49</td>"));
        assert!(response.visualization.is_none());
        assert!(response.fallback_reason.is_some());
    }

    #[tokio::test]
    async fn test_line_chart_without_model() {
        let pq = QuestionAnalyzer::new(vec![]).analyze("weekly revenue trend");
        let response = synthesizer(Arc::new(UnconfiguredModel))
            .synthesize(&pq, "SELECT 1", &weekly(), TableFormat::Text, false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.visualization.unwrap().chart_type, ChartType::Line);
        assert!(response.text.contains("3 rows"));
        assert!(response.text.contains("revenue ranges from 100 to 150.5 with a total of 370.5"));
        assert_eq!(response.key_insights[0], "Highest revenue: 150.5 (2024-01-08)");
    }

    #[tokio::test]
    async fn test_model_summary_used() {
        let model = FixedModel(
            "```json\n{\"explanation\": \"Revenue peaked in the second week.\", \"insights\": [\"Peak 150.5\", \" \"]}\n```"
                .to_string(),
        );
        let pq = QuestionAnalyzer::new(vec![]).analyze("weekly revenue trend");
        let response = synthesizer(Arc::new(model))
            .synthesize(&pq, "SELECT 1", &weekly(), TableFormat::Html, true, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!response.degraded);
        assert_eq!(response.text, "Revenue peaked in the second week.");
        assert_eq!(response.key_insights, vec!["Peak 150.5".to_string()]);
        assert_eq!(response.visualization.unwrap().chart_type, ChartType::Line);
    }

    #[tokio::test]
    async fn test_malformed_model_output_degrades() {
        let pq = QuestionAnalyzer::new(vec![]).analyze("weekly revenue trend");
        let response = synthesizer(Arc::new(FixedModel("Sure! Revenue went up.".to_string())))
            .synthesize(&pq, "SELECT 1", &weekly(), TableFormat::Html, true, &CancellationToken::new())
            .await
            .unwrap();
        assert!(response.degraded);
        assert!(response.text.starts_with("The query returned 3 rows"));
    }

    #[tokio::test]
    async fn test_cancelled_before_model_call() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let pq = QuestionAnalyzer::new(vec![]).analyze("weekly revenue trend");
        let outcome = synthesizer(Arc::new(FixedModel("{}".to_string())))
            .synthesize(&pq, "SELECT 1", &weekly(), TableFormat::Html, true, &cancel)
            .await;
        assert!(matches!(outcome, Err(AgentError::Cancelled)));
    }

    #[test]
    fn test_empty_result_explanation() {
        let result = QueryResult::new(vec!["a".into()], vec![], "sqlite");
        assert_eq!(
            template_explanation(&result, &[]),
            "The query ran successfully but no rows matched."
        );
    }
}
