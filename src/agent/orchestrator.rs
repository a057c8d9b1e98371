//! Agent Orchestrator
//!
//! Runs one question through analysis, context assembly, SQL generation,
//! execution and synthesis. This is the only place stage failures are caught;
//! each is either retried on a fallback tier chosen by `select_fallback` or
//! turned into a failed `AgentResponse`.

use crate::agent::fallback::{output_tiers, select_fallback, FallbackDecision, FallbackTier, Stage};
use crate::agent::rate_limit::RateLimiter;
use crate::agent::response::{AgentResponse, RequestContext, ResponseMetadata};
use crate::agent::state::{PipelineState, StateTracker};
use crate::analyzer::{ProcessedQuestion, QuestionAnalyzer};
use crate::context::ContextAssembler;
use crate::error::{AgentError, Result};
use crate::execution::executor::{with_row_cap, ExecuteOptions, QueryExecutor};
use crate::execution::result::QueryResult;
use crate::knowledge::KnowledgeIndex;
use crate::llm::LanguageModel;
use crate::metadata::{SchemaCatalog, SchemaInfo, SchemaStore};
use crate::observability::{AgentStats, QueryLog, QueryLogEntry, RequestOutcome, StatsSnapshot};
use crate::sql::{is_write_command, GeneratedSql, GenerationTarget, SqlGenerator, SqlValidator, ValidationReport};
use crate::synthesis::{GeneratedResponse, ResponseSynthesizer, TableFormat};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Bound on each component check in `health`.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ComponentHealth {
    fn new(status: HealthStatus, detail: Option<String>) -> Self {
        Self { status, detail }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst of the component statuses
    pub overall_status: HealthStatus,
    pub language_model: ComponentHealth,
    pub knowledge_index: ComponentHealth,
    pub database: ComponentHealth,
}

/// Everything a successful run produces.
struct Answer {
    sql: GeneratedSql,
    result: QueryResult,
    synthesized: GeneratedResponse,
}

/// Request-scoped record that survives a failure.
struct RequestTrace {
    tracker: StateTracker,
    metadata: ResponseMetadata,
    /// Last SQL handed to the executor
    sql: Option<String>,
    cache_hit: Option<bool>,
}

impl RequestTrace {
    fn degrade(&mut self, tier: FallbackTier) {
        if !self.tracker.tiers().contains(&tier) {
            warn!("Degraded to {}", tier.as_str());
        }
        self.tracker.degrade(tier);
    }

    fn advance(&mut self, state: PipelineState) {
        if !self.tracker.advance(state) {
            warn!(
                "Ignoring out-of-order transition {} -> {}",
                self.tracker.current().as_str(),
                state.as_str()
            );
        }
    }
}

pub struct AgentOrchestrator {
    schemas: Arc<SchemaCatalog>,
    knowledge: Arc<dyn KnowledgeIndex>,
    model: Arc<dyn LanguageModel>,
    assembler: ContextAssembler,
    generator: SqlGenerator,
    executor: QueryExecutor,
    synthesizer: ResponseSynthesizer,
    limiter: Arc<RateLimiter>,
    stats: Arc<AgentStats>,
    query_log: Arc<QueryLog>,
    retry_row_cap: usize,
}

/// Collaborators the orchestrator is assembled from; see `AgentBuilder`.
pub struct OrchestratorParts {
    pub schemas: Arc<SchemaCatalog>,
    pub knowledge: Arc<dyn KnowledgeIndex>,
    pub model: Arc<dyn LanguageModel>,
    pub assembler: ContextAssembler,
    pub generator: SqlGenerator,
    pub executor: QueryExecutor,
    pub synthesizer: ResponseSynthesizer,
    pub limiter: Arc<RateLimiter>,
    pub stats: Arc<AgentStats>,
    pub query_log: Arc<QueryLog>,
    pub retry_row_cap: usize,
}

impl AgentOrchestrator {
    pub fn from_parts(parts: OrchestratorParts) -> Self {
        Self {
            schemas: parts.schemas,
            knowledge: parts.knowledge,
            model: parts.model,
            assembler: parts.assembler,
            generator: parts.generator,
            executor: parts.executor,
            synthesizer: parts.synthesizer,
            limiter: parts.limiter,
            stats: parts.stats,
            query_log: parts.query_log,
            retry_row_cap: parts.retry_row_cap.max(1),
        }
    }

    pub fn backends(&self) -> Vec<String> {
        self.executor.router().available_engines()
    }

    pub async fn process_question(&self, question: &str, context: RequestContext) -> AgentResponse {
        self.process_question_with_cancel(question, context, CancellationToken::new())
            .await
    }

    /// Answer one question. Never fails: errors become a response with
    /// `success = false`.
    pub async fn process_question_with_cancel(
        &self,
        question: &str,
        context: RequestContext,
        cancel: CancellationToken,
    ) -> AgentResponse {
        let request_id = Uuid::new_v4();
        let span = info_span!("request", %request_id);
        async move {
            let started = Instant::now();
            info!("Processing question: {}", question.trim());

            let mut trace = RequestTrace {
                tracker: StateTracker::new(),
                metadata: ResponseMetadata::new(request_id),
                sql: None,
                cache_hit: None,
            };
            let outcome = self.run(question, &context, &cancel, &mut trace).await;
            let elapsed = started.elapsed();
            if outcome.is_err() {
                trace.tracker.fail();
            }

            let RequestTrace {
                tracker,
                mut metadata,
                sql: attempted_sql,
                cache_hit,
            } = trace;
            metadata.fallback_tiers = tracker.tiers().to_vec();
            metadata.states = tracker.trace().to_vec();

            let mut response = match outcome {
                Ok(answer) => success_response(question, answer, metadata, tracker.is_degraded()),
                Err(e) => {
                    match &e {
                        AgentError::Cancelled => info!("Request cancelled"),
                        other => error!("Request failed ({}): {}", other.kind().as_str(), other),
                    }
                    let mut response = AgentResponse::failure(question, &e, metadata);
                    if response.sql_query.is_none() {
                        response.sql_query = attempted_sql;
                    }
                    response
                }
            };
            response.execution_time = elapsed.as_secs_f64();

            self.record(&response, elapsed, cache_hit);
            info!(
                "Finished in {:.3}s (success: {}, degraded: {})",
                response.execution_time, response.success, response.degraded
            );
            response
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        question: &str,
        request: &RequestContext,
        cancel: &CancellationToken,
        trace: &mut RequestTrace,
    ) -> Result<Answer> {
        let store = self.schemas.store(request.backend.as_deref())?;

        // analysis
        let pq = self.analyze(question, request, store.as_ref()).await;
        trace.metadata.intent = Some(pq.intent);
        trace.metadata.complexity = Some(pq.complexity);
        trace.metadata.ambiguous = pq.ambiguous;
        trace.metadata.entities = pq.entities.clone();
        if pq.ambiguous {
            warn!("Ambiguous question, continuing with a generic intent");
            trace
                .metadata
                .warnings
                .push("question is ambiguous; answered as a generic request".to_string());
        }
        trace.advance(PipelineState::Analyzed);

        if is_write_command(&pq.raw) {
            return Err(AgentError::SqlValidationRejected {
                sql: String::new(),
                reason: "question requests a data or schema modification".to_string(),
            });
        }

        // context
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        // the assembler falls back to live schema itself; what it returns is final
        let context = self.assembler.assemble(&pq, store.as_ref()).await?;
        trace.metadata.context_source = Some(context.source);
        trace.metadata.warnings.extend(context.warnings.iter().cloned());
        for tier in output_tiers(context.used_schema_fallback(), false, false, false) {
            trace.degrade(tier);
        }
        trace.advance(PipelineState::ContextBuilt);

        // generation
        let dialect = self.executor.dialect_for(request.backend.as_deref())?;
        let model_budget = self.model_budget_left();
        if !model_budget {
            trace.degrade(FallbackTier::RateLimited);
        }
        let generated = self
            .generator
            .generate(
                &pq,
                &context,
                GenerationTarget {
                    dialect,
                    schemas: store.as_ref(),
                },
                model_budget,
                cancel,
            )
            .await?;
        trace.sql = Some(generated.sql.clone());
        trace.metadata.query_type = Some(generated.query_type);
        trace.metadata.sql_source = Some(generated.source);
        trace.metadata.tables = generated.tables.clone();
        trace.metadata.warnings.extend(generated.warnings.iter().cloned());
        for tier in output_tiers(false, generated.is_fallback(), false, generated.rate_limited) {
            trace.degrade(tier);
        }
        trace.advance(PipelineState::SqlGenerated);

        // execution
        let mut options = ExecuteOptions {
            backend: request.backend.clone(),
            row_limit: request.max_rows,
            use_cache: request.use_cache,
        };
        let mut sql = generated.sql.clone();
        let mut attempt = 0;
        let result = loop {
            match self.executor.execute(&sql, &options, cancel).await {
                Ok(result) => break result,
                Err(e) => match select_fallback(Stage::Execution, &e, attempt) {
                    FallbackDecision::Retry(tier) => {
                        warn!("Execution failed, retrying with a simplified query: {}", e);
                        trace.degrade(tier);
                        sql = with_row_cap(&sql, dialect, self.retry_row_cap);
                        options.row_limit = Some(
                            options
                                .row_limit
                                .map(|l| l.min(self.retry_row_cap))
                                .unwrap_or(self.retry_row_cap),
                        );
                        trace.sql = Some(sql.clone());
                        attempt += 1;
                    }
                    FallbackDecision::Fail => return Err(e),
                },
            }
        };
        trace.cache_hit = Some(result.cache_hit);
        trace.metadata.backend = Some(result.backend.clone());
        trace.metadata.truncated = result.truncated;
        trace.metadata.warnings.extend(result.warnings.iter().cloned());
        trace.advance(PipelineState::Executed);

        // synthesis
        let model_budget = self.model_budget_left();
        if !model_budget {
            trace.degrade(FallbackTier::RateLimited);
        }
        let mut attempt = 0;
        let mut format = request.table_format;
        let mut use_model = model_budget;
        let synthesized = loop {
            match self
                .synthesizer
                .synthesize(&pq, &sql, &result, format, use_model, cancel)
                .await
            {
                Ok(synthesized) => break synthesized,
                Err(e) => match select_fallback(Stage::Synthesis, &e, attempt) {
                    FallbackDecision::Retry(tier) => {
                        warn!("Synthesis failed, retrying with templates: {}", e);
                        trace.degrade(tier);
                        format = TableFormat::Text;
                        use_model = false;
                        attempt += 1;
                    }
                    FallbackDecision::Fail => return Err(e),
                },
            }
        };
        for tier in output_tiers(false, false, synthesized.degraded, synthesized.rate_limited) {
            trace.degrade(tier);
        }
        trace.advance(PipelineState::Synthesized);
        trace.advance(PipelineState::Done);

        Ok(Answer {
            sql: GeneratedSql { sql, ..generated },
            result,
            synthesized,
        })
    }

    async fn analyze(&self, question: &str, request: &RequestContext, store: &dyn SchemaStore) -> ProcessedQuestion {
        let known_tables = match store.list_tables().await {
            Ok(tables) => tables,
            Err(e) => {
                warn!("Table list unavailable for analysis: {}", e);
                Vec::new()
            }
        };
        QuestionAnalyzer::new(known_tables).analyze_with_hints(question, &request.table_hints)
    }

    fn model_budget_left(&self) -> bool {
        match self.limiter.remaining() {
            Some(0) => {
                warn!("Language model budget exhausted, routing to fallbacks");
                false
            }
            _ => true,
        }
    }

    fn record(&self, response: &AgentResponse, elapsed: Duration, cache_hit: Option<bool>) {
        let tiers: Vec<&'static str> = response
            .metadata
            .fallback_tiers
            .iter()
            .map(|t| t.as_str())
            .collect();
        self.stats.record(&RequestOutcome {
            success: response.success,
            degraded: response.degraded,
            cache_hit,
            elapsed,
            fallback_tiers: &tiers,
            error: response.error_kind(),
        });
        self.query_log.record(QueryLogEntry {
            request_id: response.metadata.request_id,
            timestamp: response.metadata.timestamp,
            question: response.question.clone(),
            sql: response.sql_query.clone(),
            success: response.success,
            error_kind: response.error_kind(),
            row_count: response.row_count,
            execution_time: response.execution_time,
            degraded: response.degraded,
            cache_hit: response.cache_hit,
            fallback_tiers: tiers.iter().map(|t| t.to_string()).collect(),
            backend: response.metadata.backend.clone(),
        });
    }

    /// Per-component health; the overall status is the worst component.
    pub async fn health(&self) -> HealthReport {
        let language_model = match tokio::time::timeout(HEALTH_TIMEOUT, self.model.health_check()).await {
            Ok(true) if self.limiter.remaining() == Some(0) => {
                ComponentHealth::new(HealthStatus::Degraded, Some("rate limit budget exhausted".to_string()))
            }
            Ok(true) => ComponentHealth::new(HealthStatus::Healthy, Some(self.model.name().to_string())),
            Ok(false) => ComponentHealth::new(HealthStatus::Unavailable, Some(self.model.name().to_string())),
            Err(_) => ComponentHealth::new(HealthStatus::Unavailable, Some("health check timed out".to_string())),
        };

        let knowledge_index = match tokio::time::timeout(HEALTH_TIMEOUT, self.knowledge.health_check()).await {
            Ok(Ok(true)) => ComponentHealth::new(
                HealthStatus::Healthy,
                Some(format!("{} documents", self.knowledge.document_count())),
            ),
            Ok(Ok(false)) => ComponentHealth::new(
                HealthStatus::Degraded,
                Some("index is empty, using live schema".to_string()),
            ),
            Ok(Err(e)) => ComponentHealth::new(HealthStatus::Unavailable, Some(e.to_string())),
            Err(_) => ComponentHealth::new(HealthStatus::Unavailable, Some("health check timed out".to_string())),
        };

        let router = self.executor.router();
        let default_name = router.default_engine().name();
        let mut default_ok = false;
        let mut down = Vec::new();
        for engine in router.engines() {
            let ok = matches!(
                tokio::time::timeout(HEALTH_TIMEOUT, engine.health_check()).await,
                Ok(Ok(true))
            );
            if engine.name() == default_name {
                default_ok = ok;
            }
            if !ok {
                down.push(engine.name());
            }
        }
        let database = match (default_ok, down.is_empty()) {
            (true, true) => ComponentHealth::new(HealthStatus::Healthy, Some(router.available_engines().join(", "))),
            (true, false) => ComponentHealth::new(
                HealthStatus::Degraded,
                Some(format!("unreachable: {}", down.join(", "))),
            ),
            (false, _) => ComponentHealth::new(
                HealthStatus::Unavailable,
                Some(format!("default backend {} unreachable", default_name)),
            ),
        };

        let overall_status = language_model
            .status
            .max(knowledge_index.status)
            .max(database.status);
        HealthReport {
            overall_status,
            language_model,
            knowledge_index,
            database,
        }
    }

    /// Live schema of one table on `backend` (default backend when `None`).
    pub async fn schema(&self, table: &str, backend: Option<&str>) -> Result<Option<SchemaInfo>> {
        self.schemas.store(backend)?.inspect(table).await
    }

    /// Live schema of every table on `backend`.
    pub async fn schemas(&self, backend: Option<&str>) -> Result<Vec<SchemaInfo>> {
        self.schemas.store(backend)?.inspect_all().await
    }

    /// Check a statement with the same rules generated SQL goes through,
    /// without executing it.
    pub async fn validate_sql(&self, sql: &str, backend: Option<&str>) -> Result<ValidationReport> {
        let dialect = self.executor.dialect_for(backend)?;
        let schemas = match self.schemas.store(backend)?.inspect_all().await {
            Ok(schemas) => schemas,
            Err(e) => {
                warn!("Live schema unavailable for validation: {}", e);
                Vec::new()
            }
        };
        Ok(SqlValidator::new(dialect).report(sql, &schemas))
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.executor.cache_stats())
    }

    pub fn history(&self, limit: usize) -> Vec<QueryLogEntry> {
        self.query_log.recent(limit)
    }

    pub fn clear_cache(&self) -> usize {
        self.executor.clear_cache()
    }
}

fn success_response(
    question: &str,
    answer: Answer,
    metadata: ResponseMetadata,
    degraded: bool,
) -> AgentResponse {
    let Answer {
        sql,
        result,
        synthesized,
    } = answer;
    let mut metadata = metadata;
    metadata.column_stats = synthesized.column_stats;

    AgentResponse {
        success: true,
        question: question.to_string(),
        sql_query: Some(sql.sql),
        response: synthesized.text,
        data_table: Some(synthesized.data_table),
        visualization: synthesized.visualization,
        key_insights: synthesized.key_insights,
        execution_time: 0.0,
        row_count: result.row_count,
        confidence_score: sql.confidence,
        degraded,
        cache_hit: result.cache_hit,
        error: None,
        metadata,
    }
}
