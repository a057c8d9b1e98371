//! Wires an `AgentOrchestrator` from configuration. Every collaborator can be
//! replaced before `build`, which is how tests inject scripted models and
//! seeded backends.

use crate::agent::orchestrator::{AgentOrchestrator, OrchestratorParts};
use crate::agent::rate_limit::{RateLimitedModel, RateLimiter};
use crate::config::{AgentConfig, BackendsConfig};
use crate::context::ContextAssembler;
use crate::error::Result;
use crate::execution::polars_engine::PolarsEngine;
use crate::execution::trino_engine::TrinoEngine;
use crate::execution::{ExecutionEngine, ExecutionRouter, QueryExecutor, ResultCache, SqliteEngine};
use crate::knowledge::{embedder_from_config, Embedder, InMemoryKnowledgeIndex, KnowledgeIndex};
use crate::llm::{model_from_config, LanguageModel};
use crate::metadata::{EngineSchemaStore, SchemaCatalog};
use crate::observability::{AgentStats, QueryLog, DEFAULT_LOG_CAPACITY};
use crate::sql::SqlGenerator;
use crate::synthesis::ResponseSynthesizer;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// LIMIT applied by template-generated row queries.
const TEMPLATE_ROW_LIMIT: usize = 100;

pub struct AgentBuilder {
    config: AgentConfig,
    model: Option<Arc<dyn LanguageModel>>,
    embedder: Option<Arc<dyn Embedder>>,
    knowledge: Option<Arc<dyn KnowledgeIndex>>,
    engines: Vec<Arc<dyn ExecutionEngine>>,
    query_log: Option<Arc<QueryLog>>,
}

impl AgentBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            model: None,
            embedder: None,
            knowledge: None,
            engines: Vec::new(),
            query_log: None,
        }
    }

    pub fn with_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_knowledge_index(mut self, index: Arc<dyn KnowledgeIndex>) -> Self {
        self.knowledge = Some(index);
        self
    }

    /// Use this engine instead of the ones in `config.backends`. May be called
    /// several times.
    pub fn with_engine(mut self, engine: Arc<dyn ExecutionEngine>) -> Self {
        self.engines.push(engine);
        self
    }

    pub fn with_query_log(mut self, log: Arc<QueryLog>) -> Self {
        self.query_log = Some(log);
        self
    }

    pub async fn build(self) -> Result<AgentOrchestrator> {
        let config = self.config;
        config.validate()?;

        let base_model = match self.model {
            Some(model) => model,
            None => model_from_config(&config.llm)?,
        };
        let limiter = Arc::new(RateLimiter::new(config.llm.requests_per_minute));
        let model: Arc<dyn LanguageModel> = Arc::new(RateLimitedModel::new(base_model, Arc::clone(&limiter)));

        let embedder = match self.embedder {
            Some(embedder) => embedder,
            None => embedder_from_config(
                &config.embedding,
                config.llm.api_key.as_deref(),
                &config.llm.base_url,
                config.llm.timeout(),
            )?,
        };

        let engines = if self.engines.is_empty() {
            engines_from_config(&config.backends)?
        } else {
            self.engines
        };
        let router = ExecutionRouter::new(engines, config.execution.default_backend.clone())?;
        info!("Execution backends: {:?}", router.available_engines());

        let descriptions = match &config.schema_descriptions_path {
            Some(path) => EngineSchemaStore::load_descriptions(path)?,
            None => HashMap::new(),
        };
        let schemas = Arc::new(SchemaCatalog::from_engines(
            router.engines(),
            router.default_engine().name(),
            config.retrieval.sample_rows,
            &descriptions,
        )?);

        let knowledge: Arc<dyn KnowledgeIndex> = match (self.knowledge, &config.knowledge_path) {
            (Some(index), _) => index,
            (None, Some(path)) => Arc::new(
                InMemoryKnowledgeIndex::load(path, embedder.as_ref())
                    .await?
                    .with_min_similarity(config.retrieval.min_similarity),
            ),
            (None, None) => {
                info!("No knowledge snapshot configured, context will come from live schema");
                Arc::new(InMemoryKnowledgeIndex::empty(embedder.dimension()))
            }
        };

        let cache = Arc::new(ResultCache::new(
            config.execution.cache_ttl(),
            config.execution.cache_capacity,
        ));
        let executor = QueryExecutor::new(
            Arc::new(router),
            cache,
            config.execution.max_rows,
            config.execution.timeout(),
        );

        let query_log = match (self.query_log, &config.query_log_path) {
            (Some(log), _) => log,
            (None, Some(path)) => Arc::new(QueryLog::with_file(DEFAULT_LOG_CAPACITY, path)?),
            (None, None) => Arc::new(QueryLog::in_memory(DEFAULT_LOG_CAPACITY)),
        };

        Ok(AgentOrchestrator::from_parts(OrchestratorParts {
            assembler: ContextAssembler::new(
                Arc::clone(&knowledge),
                embedder,
                config.retrieval.top_k,
                config.retrieval.token_budget,
            ),
            generator: SqlGenerator::new(
                Arc::clone(&model),
                TEMPLATE_ROW_LIMIT.min(config.execution.max_rows),
            ),
            synthesizer: ResponseSynthesizer::new(Arc::clone(&model), &config.synthesis),
            schemas,
            knowledge,
            model,
            executor,
            limiter,
            stats: Arc::new(AgentStats::new()),
            query_log,
            retry_row_cap: config.execution.retry_row_cap,
        }))
    }
}

/// SQLite is always present; polars and Trino when configured.
pub fn engines_from_config(backends: &BackendsConfig) -> Result<Vec<Arc<dyn ExecutionEngine>>> {
    let mut engines: Vec<Arc<dyn ExecutionEngine>> =
        vec![Arc::new(SqliteEngine::open(backends.sqlite_path.as_deref())?)];
    if let Some(dir) = &backends.data_dir {
        engines.push(Arc::new(PolarsEngine::new(dir.clone())));
    }
    if let Some(trino) = &backends.trino {
        engines.push(Arc::new(TrinoEngine::new(trino)?));
    }
    Ok(engines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_from_defaults() {
        let orchestrator = AgentBuilder::new(AgentConfig::default()).build().await.unwrap();
        assert_eq!(orchestrator.backends(), vec!["sqlite".to_string()]);
        assert_eq!(orchestrator.stats().total_queries, 0);
    }

    #[tokio::test]
    async fn test_unknown_default_backend_is_rejected() {
        let mut config = AgentConfig::default();
        config.execution.default_backend = "trino".to_string();
        assert!(AgentBuilder::new(config).build().await.is_err());
    }
}
