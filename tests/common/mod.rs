#![allow(dead_code)]

use async_trait::async_trait;
use nlq_agent::agent::{AgentBuilder, AgentOrchestrator};
use nlq_agent::config::AgentConfig;
use nlq_agent::demo;
use nlq_agent::error::LlmError;
use nlq_agent::execution::{ExecutionEngine, SqliteEngine};
use nlq_agent::knowledge::{Embedder, HashingEmbedder, InMemoryKnowledgeIndex, KnowledgeIndex, Snapshot};
use nlq_agent::llm::LanguageModel;
use nlq_agent::metadata::EngineSchemaStore;
use nlq_agent::sql::prompts::SQL_SYSTEM_PROMPT;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const UPC_QUESTION: &str = "What is the current price for UPC code '0020282000000'?";
pub const UPC_SQL: &str = "SELECT upc, product_name, price FROM products WHERE upc = '0020282000000'";

/// Answers SQL prompts with fixed SQL and synthesis prompts with a fixed
/// summary (or an outage when none is set).
pub struct ScriptedModel {
    sql: String,
    summary: Option<String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(sql: &str, summary: Option<&str>) -> Self {
        Self {
            sql: sql.to_string(),
            summary: summary.map(|s| s.to_string()),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, system: &str, _prompt: &str) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if system == SQL_SYSTEM_PROMPT {
            return Ok(format!("```sql\n-- confidence: 0.9\n{}\n```", self.sql));
        }
        match &self.summary {
            Some(summary) => Ok(summary.clone()),
            None => Err(LlmError::Unavailable("synthesis offline".to_string())),
        }
    }

    async fn health_check(&self) -> bool {
        true
    }
}

pub fn seeded_engine() -> Arc<SqliteEngine> {
    let engine = SqliteEngine::in_memory().unwrap();
    engine.seed(&demo::demo_script()).unwrap();
    Arc::new(engine)
}

pub async fn demo_index(engine: Arc<dyn ExecutionEngine>, embedder: &dyn Embedder) -> Arc<dyn KnowledgeIndex> {
    let store = EngineSchemaStore::new(engine, 0).with_descriptions(demo::demo_descriptions());
    let documents = demo::demo_documents(&store).await.unwrap();
    let snapshot = Snapshot::build(embedder, documents).await.unwrap();
    Arc::new(InMemoryKnowledgeIndex::new(snapshot))
}

/// Orchestrator over the seeded demo database and knowledge index.
pub async fn demo_agent(model: Arc<dyn LanguageModel>, config: AgentConfig) -> AgentOrchestrator {
    agent_with_engine(model, config, seeded_engine()).await
}

pub async fn agent_with_engine(
    model: Arc<dyn LanguageModel>,
    config: AgentConfig,
    engine: Arc<dyn ExecutionEngine>,
) -> AgentOrchestrator {
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(config.embedding.dimension));
    let index = demo_index(Arc::clone(&engine), embedder.as_ref()).await;
    AgentBuilder::new(config)
        .with_model(model)
        .with_embedder(embedder)
        .with_knowledge_index(index)
        .with_engine(engine)
        .build()
        .await
        .unwrap()
}

pub fn upc_summary() -> &'static str {
    r#"{"explanation": "Cola 12oz (UPC 0020282000000) currently sells for 2.49.", "insights": ["Price is 2.49"]}"#
}
