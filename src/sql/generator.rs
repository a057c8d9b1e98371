//! SQL generation: model path with one corrective retry, template fallback.

use crate::analyzer::ProcessedQuestion;
use crate::context::QueryContext;
use crate::error::{AgentError, LlmError, Result};
use crate::execution::profile::QueryProfile;
use crate::llm::LanguageModel;
use crate::metadata::SchemaStore;
use crate::sql::dialect::SqlDialect;
use crate::sql::prompts::{build_sql_prompt, SQL_SYSTEM_PROMPT};
use crate::sql::templates::TemplateGenerator;
use crate::sql::validator::{
    contains_forbidden_word, SqlValidator, ValidatedSql, ValidationError, FORBIDDEN_KEYWORDS,
};
use crate::sql::{clamp_unit, confidence_score, template_confidence, GeneratedSql, SqlSource};
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

lazy_static! {
    static ref WRITE_COMMAND: Regex = Regex::new(
        r"(?i)\b(?:insert\s+into|update\s+\w+\s+set|delete\s+from|drop\s+(?:table|view|database|schema|index)|alter\s+table|truncate\s+table\s+\w+|(?:grant|revoke)\s+(?:all|select|insert|update|delete)|create\s+(?:table|view|index|database))\b"
    )
    .unwrap();
    static ref IMPERATIVE_WRITE: Regex = Regex::new(
        r"(?i)^\s*(?:please\s+)?(?:insert|update|delete|drop|alter|truncate|grant|revoke|create|merge|upsert)\b"
    )
    .unwrap();
    static ref CONFIDENCE_LINE: Regex =
        Regex::new(r"(?im)^\s*--\s*confidence\s*[:=]\s*([0-9]*\.?[0-9]+)\s*$").unwrap();
}

/// Model attempts before falling back to templates.
const MODEL_ATTEMPTS: usize = 2;

/// The question itself asks to modify data or schema.
pub fn is_write_command(question: &str) -> bool {
    WRITE_COMMAND.is_match(question)
        || (IMPERATIVE_WRITE.is_match(question) && contains_forbidden_word(question))
}

/// Extract the SQL statement and the self-reported certainty from model text.
pub fn parse_model_output(text: &str) -> Option<(String, Option<f64>)> {
    let body = fenced_block(text).unwrap_or(text);
    let certainty = CONFIDENCE_LINE
        .captures(body)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(clamp_unit);

    let lines: Vec<&str> = body
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect();
    // modifying statements are kept so validation can refuse them
    let start = lines.iter().position(|line| {
        let upper = line.trim_start().to_uppercase();
        let first = upper.split(|c: char| !c.is_ascii_alphabetic()).next().unwrap_or("");
        first == "SELECT" || first == "WITH" || FORBIDDEN_KEYWORDS.contains(&first)
    })?;
    let sql = lines[start..].join("\n");
    let sql = sql.trim().trim_end_matches(';').trim().to_string();
    if sql.is_empty() {
        None
    } else {
        Some((sql, certainty))
    }
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let end = body.find("```").unwrap_or(body.len());
    Some(&body[..end])
}

enum AttemptError {
    Llm(LlmError),
    Invalid { sql: String, error: ValidationError },
    Cancelled,
}

/// Backend a statement is generated for: its dialect and its live schema.
#[derive(Clone, Copy)]
pub struct GenerationTarget<'a> {
    pub dialect: SqlDialect,
    pub schemas: &'a dyn SchemaStore,
}

pub struct SqlGenerator {
    model: Arc<dyn LanguageModel>,
    templates: TemplateGenerator,
}

impl SqlGenerator {
    pub fn new(model: Arc<dyn LanguageModel>, default_limit: usize) -> Self {
        Self {
            model,
            templates: TemplateGenerator::new(default_limit),
        }
    }

    /// Produce a validated statement. `use_model = false` goes straight to
    /// the templates.
    pub async fn generate(
        &self,
        pq: &ProcessedQuestion,
        context: &QueryContext,
        target: GenerationTarget<'_>,
        use_model: bool,
        cancel: &CancellationToken,
    ) -> Result<GeneratedSql> {
        if is_write_command(&pq.raw) {
            warn!("Refusing data-modifying question");
            return Err(AgentError::SqlValidationRejected {
                sql: String::new(),
                reason: "question requests a data or schema modification".to_string(),
            });
        }

        let mut fallback_reason = "language model not used".to_string();
        let mut rate_limited = false;

        if use_model {
            let mut feedback: Option<String> = None;
            for attempt in 1..=MODEL_ATTEMPTS {
                if cancel.is_cancelled() {
                    return Err(AgentError::Cancelled);
                }
                match self.model_attempt(pq, context, target, feedback.as_deref(), cancel).await {
                    Ok(generated) => {
                        info!(
                            "Model SQL accepted on attempt {} (confidence {:.2})",
                            attempt, generated.confidence
                        );
                        return Ok(generated);
                    }
                    Err(AttemptError::Cancelled) => return Err(AgentError::Cancelled),
                    Err(AttemptError::Llm(LlmError::Malformed(detail))) => {
                        warn!("Model response unusable on attempt {}: {}", attempt, detail);
                        fallback_reason = format!("malformed model response: {}", detail);
                        feedback = Some("The previous response did not contain a SQL statement.".to_string());
                    }
                    Err(AttemptError::Llm(e)) => {
                        rate_limited = e == LlmError::RateLimited;
                        warn!("Language model unavailable for SQL generation: {}", e);
                        fallback_reason = e.to_string();
                        break;
                    }
                    Err(AttemptError::Invalid { sql, error }) if error.is_unsafe() => {
                        warn!("Model produced unsafe SQL: {}", error);
                        return Err(AgentError::SqlValidationRejected {
                            sql,
                            reason: error.to_string(),
                        });
                    }
                    Err(AttemptError::Invalid { sql, error }) => {
                        warn!("Model SQL rejected on attempt {}: {}", attempt, error);
                        fallback_reason = format!("model SQL rejected: {}", error);
                        feedback = Some(format!("SQL:\n{}\nwas rejected: {}", sql, error));
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        warn!("Falling back to template SQL generation ({})", fallback_reason);
        match self.template_attempt(pq, context, target.dialect) {
            Ok(mut generated) => {
                generated.fallback_reason = Some(fallback_reason);
                generated.rate_limited = rate_limited;
                Ok(generated)
            }
            Err(detail) => Err(AgentError::SqlGenerationFailed(format!(
                "{}; template: {}",
                fallback_reason, detail
            ))),
        }
    }

    async fn model_attempt(
        &self,
        pq: &ProcessedQuestion,
        context: &QueryContext,
        target: GenerationTarget<'_>,
        feedback: Option<&str>,
        cancel: &CancellationToken,
    ) -> std::result::Result<GeneratedSql, AttemptError> {
        let prompt = build_sql_prompt(pq, context, target.dialect, feedback);
        debug!("SQL prompt:\n{}", prompt);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
            response = self.model.complete(SQL_SYSTEM_PROMPT, &prompt) => response,
        };
        let text = response.map_err(AttemptError::Llm)?;

        let Some((sql, certainty)) = parse_model_output(&text) else {
            return Err(AttemptError::Llm(LlmError::Malformed(
                "no SQL statement in response".to_string(),
            )));
        };
        debug!("Model SQL: {}", sql);

        let validator = SqlValidator::new(target.dialect);
        let (validated, used_live) = self
            .validate_with_live(&validator, &sql, context, target.schemas)
            .await
            .map_err(|error| AttemptError::Invalid {
                sql: sql.clone(),
                error,
            })?;

        let mut warnings = validated.warnings.clone();
        if used_live {
            warnings.push("names resolved against live schema".to_string());
        }
        let confidence = confidence_score(
            certainty,
            validated.column_ratio(),
            context.has_example_for(pq.intent),
            warnings.len(),
        );
        Ok(GeneratedSql {
            query_type: validated.profile.query_type(),
            tables: validated.profile.tables.clone(),
            sql: validated.sql,
            confidence,
            warnings,
            source: SqlSource::Model,
            fallback_reason: None,
            rate_limited: false,
        })
    }

    /// Validate against the context; names missing there may still resolve
    /// against the live schema.
    async fn validate_with_live(
        &self,
        validator: &SqlValidator,
        sql: &str,
        context: &QueryContext,
        live: &dyn SchemaStore,
    ) -> std::result::Result<(ValidatedSql, bool), ValidationError> {
        match validator.validate(sql, &context.schemas) {
            Ok(validated) => Ok((validated, false)),
            Err(error) if error.is_unresolved() => {
                let profile = QueryProfile::from_sql(sql, validator.dialect());
                let mut schemas = context.schemas.clone();
                for table in &profile.tables {
                    match live.inspect(table).await {
                        Ok(Some(live)) => {
                            schemas.retain(|s| !s.table_name.eq_ignore_ascii_case(&live.table_name));
                            schemas.push(live);
                        }
                        Ok(None) => {}
                        Err(e) => debug!("Live inspection of {} failed: {}", table, e),
                    }
                }
                validator.validate(sql, &schemas).map(|validated| (validated, true))
            }
            Err(error) => Err(error),
        }
    }

    fn template_attempt(
        &self,
        pq: &ProcessedQuestion,
        context: &QueryContext,
        dialect: SqlDialect,
    ) -> std::result::Result<GeneratedSql, String> {
        let template = self
            .templates
            .generate(pq, context, dialect)
            .ok_or_else(|| "no template fits the available schema".to_string())?;
        let validated = SqlValidator::new(dialect)
            .validate(&template.sql, &context.schemas)
            .map_err(|e| e.to_string())?;

        let warnings = validated.warnings.clone();
        let confidence = template_confidence(
            validated.column_ratio(),
            context.has_example_for(pq.intent),
            warnings.len(),
        );
        info!(
            "Template {:?} SQL on {} (confidence {:.2})",
            template.shape, template.table, confidence
        );
        Ok(GeneratedSql {
            query_type: validated.profile.query_type(),
            tables: validated.profile.tables.clone(),
            sql: validated.sql,
            confidence,
            warnings,
            source: SqlSource::Template,
            fallback_reason: None,
            rate_limited: false,
        })
    }
}
