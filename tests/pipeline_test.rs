mod common;

use async_trait::async_trait;
use common::*;
use nlq_agent::agent::{FallbackTier, PipelineState, RequestContext};
use nlq_agent::config::AgentConfig;
use nlq_agent::error::{AgentError, ErrorKind, Result};
use nlq_agent::agent::AgentBuilder;
use nlq_agent::execution::polars_engine::PolarsEngine;
use nlq_agent::execution::{
    EngineCapabilities, ExecutionContext, ExecutionEngine, QueryProfile, QueryResult, SqliteEngine,
};
use nlq_agent::knowledge::{Embedder, HashingEmbedder};
use nlq_agent::llm::UnconfiguredModel;
use nlq_agent::metadata::SchemaInfo;
use nlq_agent::sql::{SqlDialect, SqlSource};
use nlq_agent::synthesis::{ChartType, TableFormat};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// SQLite engine that fails the first `failures` executions of statements
/// containing `pattern`. Schema sampling queries pass through.
struct FlakyEngine {
    inner: Arc<SqliteEngine>,
    pattern: &'static str,
    failures: AtomicUsize,
}

impl FlakyEngine {
    fn new(pattern: &'static str, failures: usize) -> Self {
        Self {
            inner: seeded_engine(),
            pattern,
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl ExecutionEngine for FlakyEngine {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn capabilities(&self) -> &EngineCapabilities {
        self.inner.capabilities()
    }

    fn dialect(&self) -> SqlDialect {
        self.inner.dialect()
    }

    fn validate(&self, profile: &QueryProfile) -> Result<()> {
        self.inner.validate(profile)
    }

    async fn execute(&self, sql: &str, ctx: &ExecutionContext) -> Result<QueryResult> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 && sql.contains(self.pattern) {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(AgentError::Database("database is locked".to_string()));
        }
        self.inner.execute(sql, ctx).await
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.inner.list_tables().await
    }

    async fn describe_table(&self, table: &str) -> Result<Option<SchemaInfo>> {
        self.inner.describe_table(table).await
    }

    async fn health_check(&self) -> Result<bool> {
        self.inner.health_check().await
    }
}

fn text_context() -> RequestContext {
    RequestContext {
        table_format: TableFormat::Text,
        ..RequestContext::default()
    }
}

#[tokio::test]
async fn test_upc_price_end_to_end() {
    let model = Arc::new(ScriptedModel::new(UPC_SQL, Some(upc_summary())));
    let agent = demo_agent(model, AgentConfig::default()).await;

    let response = agent.process_question(UPC_QUESTION, text_context()).await;

    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.row_count, 1);
    assert!(response.response.contains("2.49"));
    assert!(response.data_table.as_deref().unwrap().contains("2.49"));
    assert!(!response.degraded, "{:?}", response.metadata.fallback_tiers);
    assert_eq!(response.metadata.sql_source, Some(SqlSource::Model));
    assert!(response.confidence_score > 0.6 && response.confidence_score <= 1.0);
    assert_eq!(response.metadata.states.last(), Some(&PipelineState::Done));
    assert!(response
        .metadata
        .entities
        .iter()
        .any(|e| e.value == "0020282000000"));
}

#[tokio::test]
async fn test_unavailable_model_degrades_to_templates() {
    let agent = demo_agent(Arc::new(UnconfiguredModel), AgentConfig::default()).await;

    let response = agent.process_question(UPC_QUESTION, text_context()).await;

    assert!(response.success, "{:?}", response.error);
    assert!(response.degraded);
    assert!(response.confidence_score <= 0.6);
    assert_eq!(response.row_count, 1);
    assert!(response.response.contains("2.49"));
    let tiers = &response.metadata.fallback_tiers;
    assert!(tiers.contains(&FallbackTier::PatternGenerator));
    assert!(tiers.contains(&FallbackTier::TemplateSynthesis));
}

#[tokio::test]
async fn test_write_question_is_rejected_before_generation() {
    let model = Arc::new(ScriptedModel::new(UPC_SQL, Some(upc_summary())));
    let agent = demo_agent(model.clone(), AgentConfig::default()).await;

    let response = agent.process_question("DROP TABLE products", RequestContext::default()).await;

    assert!(response.failed_with(ErrorKind::SqlValidationRejected));
    assert!(response.sql_query.is_none());
    assert_eq!(model.calls(), 0);
    assert_eq!(response.metadata.states.last(), Some(&PipelineState::Failed));

    // the table is still there
    let after = agent.process_question(UPC_QUESTION, text_context()).await;
    assert_eq!(after.row_count, 1);
}

#[tokio::test]
async fn test_unsafe_model_sql_is_rejected() {
    let model = Arc::new(ScriptedModel::new("DELETE FROM products", Some(upc_summary())));
    let agent = demo_agent(model, AgentConfig::default()).await;

    let response = agent.process_question(UPC_QUESTION, RequestContext::default()).await;

    assert!(response.failed_with(ErrorKind::SqlValidationRejected));
    assert_eq!(response.row_count, 0);
    assert!(response.data_table.is_none());
}

#[tokio::test]
async fn test_repeated_question_hits_cache() {
    let model = Arc::new(ScriptedModel::new(UPC_SQL, Some(upc_summary())));
    let agent = demo_agent(model, AgentConfig::default()).await;

    let first = agent.process_question(UPC_QUESTION, text_context()).await;
    let second = agent.process_question(UPC_QUESTION, text_context()).await;

    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    assert_eq!(first.row_count, second.row_count);
    assert_eq!(first.data_table, second.data_table);
    assert_eq!(first.sql_query, second.sql_query);

    let stats = agent.stats();
    assert_eq!(stats.total_queries, 2);
    assert_eq!(stats.cache_hits, 1);

    let bypass = agent
        .process_question(
            UPC_QUESTION,
            RequestContext {
                use_cache: false,
                ..text_context()
            },
        )
        .await;
    assert!(!bypass.cache_hit);
    assert_eq!(agent.clear_cache(), 1);
}

#[tokio::test]
async fn test_daily_revenue_gets_line_chart() {
    let model = Arc::new(ScriptedModel::new(
        "SELECT sale_date, SUM(revenue) AS revenue FROM store_sales GROUP BY sale_date ORDER BY sale_date",
        Some(r#"{"explanation": "Revenue peaked on 2024-03-04.", "insights": []}"#),
    ));
    let agent = demo_agent(model, AgentConfig::default()).await;

    let response = agent
        .process_question("Show daily revenue over time", RequestContext::default())
        .await;

    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.row_count, 4);
    let chart = response.visualization.expect("chart");
    assert_eq!(chart.chart_type, ChartType::Line);
    assert_eq!(chart.x_field, "sale_date");
    assert_eq!(chart.y_field, "revenue");
    assert_eq!(chart.data.len(), 4);
    assert!(response.data_table.unwrap().starts_with("<table"));
}

#[tokio::test]
async fn test_execution_failure_retries_with_row_cap() {
    let model = Arc::new(ScriptedModel::new(
        "SELECT store, SUM(revenue) AS total_revenue FROM store_sales GROUP BY store",
        Some(r#"{"explanation": "Downtown leads revenue.", "insights": []}"#),
    ));
    let engine = Arc::new(FlakyEngine::new("SUM(revenue)", 1));
    let agent = agent_with_engine(model, AgentConfig::default(), engine).await;

    let response = agent.process_question("Total revenue by store", RequestContext::default()).await;

    assert!(response.success, "{:?}", response.error);
    assert!(response.degraded);
    assert!(response
        .metadata
        .fallback_tiers
        .contains(&FallbackTier::SimplifiedQuery));
    assert!(response.sql_query.unwrap().contains("LIMIT 100"));
    assert_eq!(response.row_count, 3);
}

#[tokio::test]
async fn test_execution_failure_after_retry_is_reported() {
    let model = Arc::new(ScriptedModel::new(UPC_SQL, Some(upc_summary())));
    let engine = Arc::new(FlakyEngine::new("WHERE upc", 2));
    let agent = agent_with_engine(model, AgentConfig::default(), engine).await;

    let response = agent.process_question(UPC_QUESTION, RequestContext::default()).await;

    assert!(response.failed_with(ErrorKind::QueryExecutionFailed));
    assert!(response.sql_query.is_some());
    assert!(!response.response.contains("locked"));
    assert!(response.execution_time > 0.0);

    let history = agent.history(10);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].error_kind, Some(ErrorKind::QueryExecutionFailed));
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let model = Arc::new(ScriptedModel::new(UPC_SQL, Some(upc_summary())));
    let agent = demo_agent(model.clone(), AgentConfig::default()).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let response = agent
        .process_question_with_cancel(UPC_QUESTION, RequestContext::default(), cancel)
        .await;

    assert!(response.failed_with(ErrorKind::Cancelled));
    assert_eq!(model.calls(), 0);
    assert_eq!(agent.stats().cancelled_queries, 1);
}

#[tokio::test]
async fn test_cancel_interrupts_slow_model() {
    let model = Arc::new(ScriptedModel::new(UPC_SQL, Some(upc_summary())).with_delay(Duration::from_secs(10)));
    let agent = demo_agent(model, AgentConfig::default()).await;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let response = agent
        .process_question_with_cancel(UPC_QUESTION, RequestContext::default(), cancel)
        .await;

    assert!(response.failed_with(ErrorKind::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_rate_limit_routes_to_fallbacks() {
    let mut config = AgentConfig::default();
    config.llm.requests_per_minute = 1;
    let model = Arc::new(ScriptedModel::new(UPC_SQL, Some(upc_summary())));
    let agent = demo_agent(model.clone(), config).await;

    let first = agent.process_question(UPC_QUESTION, text_context()).await;
    assert!(first.success);
    assert_eq!(first.metadata.sql_source, Some(SqlSource::Model));
    assert!(first.metadata.fallback_tiers.contains(&FallbackTier::RateLimited));

    let second = agent.process_question(UPC_QUESTION, text_context()).await;
    assert!(second.success, "{:?}", second.error);
    assert!(second.degraded);
    assert_eq!(second.metadata.sql_source, Some(SqlSource::Template));
    assert!(second.metadata.fallback_tiers.contains(&FallbackTier::RateLimited));
    assert!(second.response.contains("2.49"));

    // only the first generation reached the model
    assert_eq!(model.calls(), 1);
}

#[tokio::test]
async fn test_validate_sql_refuses_modifying_statements() {
    let agent = demo_agent(Arc::new(UnconfiguredModel), AgentConfig::default()).await;
    for sql in [
        "SELECT * FROM products; DROP TABLE products",
        "DELETE FROM products",
        "WITH x AS (SELECT 1) INSERT INTO products SELECT * FROM x",
        "UPDATE products SET price = 0",
        "ALTER TABLE products ADD COLUMN x INT",
    ] {
        let report = agent.validate_sql(sql, None).await.unwrap();
        assert!(!report.valid, "{}", sql);
    }
}

/// Table names, column names and row counts of every table in the engine.
async fn fingerprint(engine: &SqliteEngine) -> Vec<(String, Vec<String>, i64)> {
    let mut tables = Vec::new();
    for table in engine.list_tables().await.unwrap() {
        let columns = engine
            .describe_table(&table)
            .await
            .unwrap()
            .map(|info| info.columns.into_iter().map(|c| c.name).collect())
            .unwrap_or_default();
        let counted = engine
            .execute(&format!("SELECT COUNT(*) FROM \"{}\"", table), &ExecutionContext::default())
            .await
            .unwrap();
        let rows = counted.rows[0][0].as_i64().unwrap();
        tables.push((table, columns, rows));
    }
    tables
}

mod injection {
    use super::*;
    use proptest::prelude::*;

    fn arb_modifying_statement() -> impl Strategy<Value = &'static str> {
        prop::sample::select(vec![
            "DROP TABLE products",
            "DELETE FROM store_sales",
            "UPDATE products SET price = 0",
            "INSERT INTO products (upc) VALUES ('1')",
            "ALTER TABLE products ADD COLUMN x INT",
            "CREATE TABLE stolen AS SELECT * FROM products",
            "DROP VIEW IF EXISTS products",
            "REPLACE INTO products (upc) VALUES ('1')",
        ])
    }

    fn arb_separator() -> impl Strategy<Value = &'static str> {
        prop::sample::select(vec![" ", "\t", "\n", " /* ; */ ", "/**/", " --x\n"])
    }

    /// Random keyword casing, with comments or whitespace between words.
    fn arb_disguised() -> impl Strategy<Value = String> {
        arb_modifying_statement().prop_flat_map(|statement| {
            let words: Vec<&'static str> = statement.split(' ').collect();
            (
                Just(words.clone()),
                prop::collection::vec(arb_separator(), words.len()),
                prop::collection::vec(any::<bool>(), statement.len()),
            )
                .prop_map(|(words, separators, upper)| {
                    let mut flips = upper.into_iter();
                    let mut out = String::new();
                    for (word, sep) in words.iter().zip(separators) {
                        for c in word.chars() {
                            match flips.next() {
                                Some(true) => out.push(c.to_ascii_uppercase()),
                                _ => out.push(c.to_ascii_lowercase()),
                            }
                        }
                        out.push_str(sep);
                    }
                    out
                })
        })
    }

    fn arb_question() -> impl Strategy<Value = String> {
        (arb_disguised(), 0..3usize).prop_map(|(payload, shape)| match shape {
            0 => format!("price of 'x'); {}; --", payload),
            1 => format!("list prices by category; {}", payload),
            _ => format!("average price by category /* ; {} */", payload),
        })
    }

    fn arb_model_sql() -> impl Strategy<Value = String> {
        (arb_disguised(), any::<bool>()).prop_map(|(payload, leading)| {
            if leading {
                format!("{}; SELECT * FROM products", payload)
            } else {
                format!("SELECT * FROM products; {}", payload)
            }
        })
    }

    /// Runs `question` against a fresh demo database and returns whether the
    /// stored tables changed.
    fn database_changed(model: Arc<dyn nlq_agent::llm::LanguageModel>, question: &str) -> (bool, Option<ErrorKind>) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let engine = seeded_engine();
            let before = fingerprint(&engine).await;
            let agent = agent_with_engine(model, AgentConfig::default(), engine.clone()).await;
            let response = agent.process_question(question, RequestContext::default()).await;
            let after = fingerprint(&engine).await;
            (before != after, response.error_kind())
        })
    }

    fn acceptable(kind: Option<ErrorKind>) -> bool {
        matches!(
            kind,
            None | Some(ErrorKind::SqlValidationRejected)
                | Some(ErrorKind::SqlGenerationFailed)
                | Some(ErrorKind::ContextUnavailable)
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn disguised_questions_leave_tables_untouched(question in arb_question()) {
            let (changed, kind) = database_changed(Arc::new(UnconfiguredModel), &question);
            prop_assert!(!changed, "{}", question);
            prop_assert!(acceptable(kind), "{} -> {:?}", question, kind);
        }

        #[test]
        fn disguised_model_sql_leaves_tables_untouched(sql in arb_model_sql()) {
            let model = Arc::new(ScriptedModel::new(&sql, None));
            let (changed, kind) = database_changed(model, "average price by category");
            prop_assert!(!changed, "{}", sql);
            prop_assert!(acceptable(kind), "{} -> {:?}", sql, kind);
        }
    }
}

#[tokio::test]
async fn test_question_about_polars_only_table() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("weekly_units.csv"),
        "week_start,units\n2024-01-01,10\n2024-01-01,5\n2024-01-08,7\n",
    )
    .unwrap();

    let sqlite: Arc<dyn ExecutionEngine> = seeded_engine();
    let polars: Arc<dyn ExecutionEngine> = Arc::new(PolarsEngine::new(dir.path().to_path_buf()));
    let config = AgentConfig::default();
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(config.embedding.dimension));
    let index = demo_index(Arc::clone(&sqlite), embedder.as_ref()).await;
    let agent = AgentBuilder::new(config)
        .with_model(Arc::new(ScriptedModel::new(
            "SELECT week_start, SUM(units) AS total_units FROM weekly_units GROUP BY week_start",
            None,
        )))
        .with_embedder(embedder)
        .with_knowledge_index(index)
        .with_engine(sqlite)
        .with_engine(polars)
        .build()
        .await
        .unwrap();

    let context = RequestContext {
        backend: Some("polars".to_string()),
        table_hints: vec!["weekly_units".to_string()],
        ..text_context()
    };
    let response = agent.process_question("total units by week", context).await;
    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.row_count, 2);
    assert_eq!(response.metadata.tables, vec!["weekly_units".to_string()]);
    assert!(response.metadata.warnings.iter().all(|w| !w.contains("products")));

    // the default backend still sees only its own tables
    assert!(agent.schema("weekly_units", None).await.unwrap().is_none());
    assert!(agent.schema("weekly_units", Some("polars")).await.unwrap().is_some());
    assert!(agent.schema("products", Some("polars")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_health_and_validation() {
    let agent = demo_agent(Arc::new(UnconfiguredModel), AgentConfig::default()).await;

    let health = agent.health().await;
    assert_eq!(health.database.status, nlq_agent::HealthStatus::Healthy);
    assert_eq!(health.knowledge_index.status, nlq_agent::HealthStatus::Healthy);
    assert_eq!(health.language_model.status, nlq_agent::HealthStatus::Unavailable);
    assert_eq!(health.overall_status, nlq_agent::HealthStatus::Unavailable);

    let report = agent
        .validate_sql("SELECT product_name, price FROM products", None)
        .await
        .unwrap();
    assert!(report.valid);

    let missing = agent.validate_sql("SELECT nope FROM products", None).await.unwrap();
    assert!(!missing.valid);

    let unknown = agent.validate_sql("SELECT 1", Some("oracle")).await;
    assert!(matches!(unknown, Err(AgentError::Config(_))));
}
