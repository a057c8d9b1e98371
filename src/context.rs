//! Context Assembler
//!
//! Merges knowledge-index hits with live schema inspection into one bounded
//! `QueryContext`. Live inspection is ground truth: index schemas whose
//! columns disagree with the live table are replaced and logged as stale.

use crate::analyzer::{Intent, ProcessedQuestion};
use crate::error::{AgentError, Result};
use crate::knowledge::{BusinessRule, Embedder, Fragment, KnowledgeIndex, Partition, QueryExample};
use crate::metadata::{estimate_tokens, SchemaInfo, SchemaSource, SchemaStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContextSource {
    KnowledgeIndex,
    LiveSchema,
    Mixed,
}

impl ContextSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextSource::KnowledgeIndex => "knowledge_index",
            ContextSource::LiveSchema => "live_schema",
            ContextSource::Mixed => "mixed",
        }
    }
}

/// Schema, example and rule fragments grounding one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryContext {
    pub schemas: Vec<SchemaInfo>,
    pub examples: Vec<QueryExample>,
    pub rules: Vec<BusinessRule>,
    pub token_budget: usize,
    pub tokens_used: usize,
    pub source: ContextSource,
    pub warnings: Vec<String>,
}

impl QueryContext {
    pub fn table_names(&self) -> Vec<&str> {
        self.schemas.iter().map(|s| s.table_name.as_str()).collect()
    }

    pub fn schema_for(&self, table: &str) -> Option<&SchemaInfo> {
        self.schemas
            .iter()
            .find(|s| s.table_name.eq_ignore_ascii_case(table))
    }

    /// True when a retrieved example carries the given intent tag.
    pub fn has_example_for(&self, intent: Intent) -> bool {
        self.examples
            .iter()
            .filter_map(|e| e.intent.as_deref())
            .any(|tag| Intent::parse(tag) == Some(intent))
    }

    /// Whether the context degraded to live inspection, for the fallback trail.
    pub fn used_schema_fallback(&self) -> bool {
        self.source != ContextSource::KnowledgeIndex
    }
}

pub struct ContextAssembler {
    index: Arc<dyn KnowledgeIndex>,
    embedder: Arc<dyn Embedder>,
    top_k: usize,
    token_budget: usize,
}

enum Retrieved {
    Schema(SchemaInfo),
    Example(QueryExample),
    Rule(BusinessRule),
}

impl ContextAssembler {
    pub fn new(
        index: Arc<dyn KnowledgeIndex>,
        embedder: Arc<dyn Embedder>,
        top_k: usize,
        token_budget: usize,
    ) -> Self {
        Self {
            index,
            embedder,
            top_k: top_k.max(1),
            token_budget,
        }
    }

    /// Build the context for `pq`, checking every schema against `schemas`,
    /// the live store of the backend the query will run on.
    pub async fn assemble(&self, pq: &ProcessedQuestion, schemas: &dyn SchemaStore) -> Result<QueryContext> {
        let mut context = QueryContext {
            schemas: Vec::new(),
            examples: Vec::new(),
            rules: Vec::new(),
            token_budget: self.token_budget,
            tokens_used: 0,
            source: ContextSource::KnowledgeIndex,
            warnings: Vec::new(),
        };

        let fragments = match self.search_index(pq).await {
            Ok(fragments) => fragments,
            Err(e) => {
                warn!("Knowledge index unavailable, falling back to live schema: {}", e);
                context.warnings.push("knowledge index unavailable".to_string());
                Vec::new()
            }
        };

        for (retrieved, tokens) in fragments {
            if context.tokens_used + tokens > self.token_budget {
                debug!("Skipping fragment of {} tokens, budget exhausted", tokens);
                continue;
            }
            context.tokens_used += tokens;
            match retrieved {
                Retrieved::Schema(schema) => context.schemas.push(schema),
                Retrieved::Example(example) => context.examples.push(example),
                Retrieved::Rule(rule) => context.rules.push(rule),
            }
        }

        if !context.schemas.is_empty() {
            self.reconcile(schemas, &mut context).await;
        }
        let mut live_added = false;
        if context.schemas.is_empty() {
            self.fill_from_live(pq, schemas, &mut context).await?;
            live_added = !context.schemas.is_empty();
        }

        // tables the question names explicitly must be present
        for table in &pq.table_hints {
            if context.schema_for(table).is_some() {
                continue;
            }
            match schemas.inspect(table).await {
                Ok(Some(schema)) => {
                    context.tokens_used += schema.estimated_tokens();
                    context.schemas.push(schema);
                    live_added = true;
                }
                Ok(None) => {
                    return Err(AgentError::ContextUnavailable(format!(
                        "no schema found for table {}",
                        table
                    )))
                }
                Err(e) => {
                    return Err(AgentError::ContextUnavailable(format!(
                        "schema for table {} could not be inspected: {}",
                        table, e
                    )))
                }
            }
        }

        if context.schemas.is_empty() {
            return Err(AgentError::ContextUnavailable(
                "no table schemas available".to_string(),
            ));
        }

        let from_index = context
            .schemas
            .iter()
            .any(|s| s.source == SchemaSource::KnowledgeIndex)
            || !context.examples.is_empty()
            || !context.rules.is_empty();
        context.source = match (from_index, live_added) {
            (true, true) => ContextSource::Mixed,
            (false, _) => ContextSource::LiveSchema,
            (true, false) => ContextSource::KnowledgeIndex,
        };

        info!(
            "Context built from {}: {} schemas, {} examples, {} rules, ~{} tokens",
            context.source.as_str(),
            context.schemas.len(),
            context.examples.len(),
            context.rules.len(),
            context.tokens_used
        );
        Ok(context)
    }

    /// Search all partitions and merge hits by descending score.
    async fn search_index(&self, pq: &ProcessedQuestion) -> Result<Vec<(Retrieved, usize)>> {
        if pq.normalized.is_empty() {
            return Ok(Vec::new());
        }
        let vector = self.embedder.embed(&pq.normalized).await?;

        let mut hits: Vec<Fragment> = Vec::new();
        for partition in Partition::ALL {
            hits.extend(self.index.search(&vector, partition, self.top_k).await?);
        }
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let mut merged = Vec::with_capacity(hits.len());
        for hit in hits {
            let retrieved = match hit.partition {
                Partition::Schemas => hit.as_schema().map(Retrieved::Schema),
                Partition::Examples => hit.as_example().map(Retrieved::Example),
                Partition::Rules => hit.as_rule().map(Retrieved::Rule),
            };
            match retrieved {
                Some(retrieved) => {
                    let tokens = match &retrieved {
                        Retrieved::Schema(schema) => schema.estimated_tokens(),
                        Retrieved::Example(example) => {
                            estimate_tokens(&example.question) + estimate_tokens(&example.sql)
                        }
                        Retrieved::Rule(rule) => estimate_tokens(&rule.description) + 4,
                    };
                    merged.push((retrieved, tokens));
                }
                None => warn!("Dropping malformed {} fragment {}", hit.partition.as_str(), hit.id),
            }
        }
        Ok(merged)
    }

    /// Live inspection of hinted tables, or of every table without hints.
    async fn fill_from_live(
        &self,
        pq: &ProcessedQuestion,
        schemas: &dyn SchemaStore,
        context: &mut QueryContext,
    ) -> Result<()> {
        let tables = if pq.table_hints.is_empty() {
            schemas
                .list_tables()
                .await
                .map_err(|e| AgentError::ContextUnavailable(format!("schema store unavailable: {}", e)))?
        } else {
            pq.table_hints.clone()
        };
        warn!("No indexed schemas, inspecting {} tables live", tables.len());

        for table in tables {
            let schema = match schemas.inspect(&table).await {
                Ok(Some(schema)) => schema,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Live inspection of {} failed: {}", table, e);
                    continue;
                }
            };
            let tokens = schema.estimated_tokens();
            let hinted = pq.table_hints.iter().any(|h| h.eq_ignore_ascii_case(&table));
            if !hinted && !context.schemas.is_empty() && context.tokens_used + tokens > self.token_budget {
                debug!("Live schema {} skipped, budget exhausted", table);
                continue;
            }
            context.tokens_used += tokens;
            context.schemas.push(schema);
        }
        Ok(())
    }

    /// Replace index schemas that disagree with the live table.
    async fn reconcile(&self, schemas: &dyn SchemaStore, context: &mut QueryContext) {
        let mut reconciled = Vec::with_capacity(context.schemas.len());
        let mut stale = 0;
        let mut missing = 0;
        for schema in context.schemas.drain(..) {
            match schemas.inspect(&schema.table_name).await {
                Ok(Some(mut live)) => {
                    if !schema.same_columns(&live) {
                        warn!(
                            "Knowledge index schema for {} is stale, using live columns",
                            schema.table_name
                        );
                        stale += 1;
                        if live.description.is_none() {
                            live.description = schema.description.clone();
                        }
                        reconciled.push(live);
                    } else {
                        let mut kept = schema;
                        // live types and samples are authoritative
                        kept.columns = live.columns;
                        kept.sample_rows = live.sample_rows;
                        reconciled.push(kept);
                    }
                }
                Ok(None) => {
                    warn!(
                        "Knowledge index lists {} but the table no longer exists",
                        schema.table_name
                    );
                    missing += 1;
                }
                Err(e) => {
                    warn!("Could not verify {} against live schema: {}", schema.table_name, e);
                    reconciled.push(schema);
                }
            }
        }
        context.schemas = reconciled;
        if stale > 0 {
            context
                .warnings
                .push(format!("{} indexed table schemas were stale; live columns used", stale));
        }
        if missing > 0 {
            context
                .warnings
                .push(format!("{} indexed tables are not available on this backend", missing));
        }
    }
}
