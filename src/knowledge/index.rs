//! Knowledge Index
//!
//! Three partitions searched by embedding similarity. Readers take a cheap
//! clone of the current snapshot `Arc`; re-ingestion builds a new snapshot and
//! swaps it in whole.

use crate::error::{AgentError, Result};
use crate::knowledge::embedder::Embedder;
use crate::knowledge::vector_store::{Document, InMemoryVectorStore};
use crate::knowledge::{BusinessRule, QueryExample};
use crate::metadata::{SchemaInfo, SchemaSource};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    Schemas,
    Examples,
    Rules,
}

impl Partition {
    pub const ALL: [Partition; 3] = [Partition::Schemas, Partition::Examples, Partition::Rules];

    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::Schemas => "schemas",
            Partition::Examples => "examples",
            Partition::Rules => "rules",
        }
    }
}

/// A ranked search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    pub id: String,
    pub partition: Partition,
    pub text: String,
    pub payload: serde_json::Value,
    pub score: f32,
}

impl Fragment {
    pub fn as_schema(&self) -> Option<SchemaInfo> {
        let mut schema: SchemaInfo = serde_json::from_value(self.payload.clone()).ok()?;
        schema.source = SchemaSource::KnowledgeIndex;
        Some(schema)
    }

    pub fn as_example(&self) -> Option<QueryExample> {
        serde_json::from_value(self.payload.clone()).ok()
    }

    pub fn as_rule(&self) -> Option<BusinessRule> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}

/// Similarity-searchable knowledge store.
#[async_trait]
pub trait KnowledgeIndex: Send + Sync {
    async fn search(&self, vector: &[f32], partition: Partition, k: usize) -> Result<Vec<Fragment>>;

    fn document_count(&self) -> usize;

    async fn health_check(&self) -> Result<bool>;
}

/// Ingestion document. `embedding` is computed at load time when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub id: String,
    pub partition: Partition,
    pub text: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

impl KnowledgeDocument {
    pub fn schema(schema: &SchemaInfo) -> Result<Self> {
        let mut text = format!(
            "Table {} with columns {}",
            schema.table_name,
            schema.column_names().join(", ")
        );
        if let Some(ref description) = schema.description {
            text.push_str(". ");
            text.push_str(description);
        }
        let mut stored = schema.clone();
        stored.sample_rows.clear();
        Ok(Self {
            id: format!("schema:{}", schema.table_name.to_lowercase()),
            partition: Partition::Schemas,
            text,
            payload: serde_json::to_value(&stored)?,
            embedding: None,
        })
    }

    pub fn example(example: &QueryExample) -> Result<Self> {
        Ok(Self {
            id: format!("example:{}", example.question.to_lowercase()),
            partition: Partition::Examples,
            text: example.question.clone(),
            payload: serde_json::to_value(example)?,
            embedding: None,
        })
    }

    pub fn rule(rule: &BusinessRule) -> Result<Self> {
        Ok(Self {
            id: format!("rule:{}", rule.name.to_lowercase()),
            partition: Partition::Rules,
            text: format!("{}: {}", rule.name, rule.description),
            payload: serde_json::to_value(rule)?,
            embedding: None,
        })
    }
}

/// Immutable view of the whole index.
#[derive(Debug, Clone)]
pub struct Snapshot {
    partitions: HashMap<Partition, InMemoryVectorStore>,
    dimension: usize,
}

impl Snapshot {
    pub fn empty(dimension: usize) -> Self {
        let partitions = Partition::ALL
            .iter()
            .map(|p| (*p, InMemoryVectorStore::new(dimension)))
            .collect();
        Self {
            partitions,
            dimension,
        }
    }

    /// Embed (where needed) and index the documents.
    pub async fn build(embedder: &dyn Embedder, documents: Vec<KnowledgeDocument>) -> Result<Self> {
        let mut snapshot = Self::empty(embedder.dimension());
        for doc in documents {
            let embedding = match doc.embedding {
                Some(embedding) => embedding,
                None => embedder.embed(&doc.text).await?,
            };
            if let Some(store) = snapshot.partitions.get_mut(&doc.partition) {
                store.add_document(Document {
                    id: doc.id,
                    text: doc.text,
                    payload: doc.payload,
                    embedding,
                })?;
            }
        }
        Ok(snapshot)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.partitions.values().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn partition_len(&self, partition: Partition) -> usize {
        self.partitions.get(&partition).map(|s| s.len()).unwrap_or(0)
    }
}

pub struct InMemoryKnowledgeIndex {
    snapshot: RwLock<Arc<Snapshot>>,
    min_similarity: f32,
}

impl InMemoryKnowledgeIndex {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            min_similarity: 0.0,
        }
    }

    pub fn empty(dimension: usize) -> Self {
        Self::new(Snapshot::empty(dimension))
    }

    pub fn with_min_similarity(mut self, min_similarity: f32) -> Self {
        self.min_similarity = min_similarity;
        self
    }

    /// Read documents from a JSON array file and build a snapshot.
    pub async fn load(path: impl AsRef<Path>, embedder: &dyn Embedder) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Knowledge(format!("Failed to read knowledge file {}: {}", path.display(), e))
        })?;
        let documents: Vec<KnowledgeDocument> = serde_json::from_str(&content)?;
        let count = documents.len();
        let snapshot = Snapshot::build(embedder, documents).await?;
        info!("Loaded {} knowledge documents from {}", count, path.display());
        Ok(Self::new(snapshot))
    }

    pub fn current(&self) -> Result<Arc<Snapshot>> {
        self.snapshot
            .read()
            .map(|guard| Arc::clone(&*guard))
            .map_err(|_| AgentError::Knowledge("Knowledge index lock poisoned".to_string()))
    }

    /// Replace the whole index; in-flight searches keep the old snapshot.
    pub fn swap(&self, snapshot: Snapshot) -> Result<()> {
        let mut guard = self
            .snapshot
            .write()
            .map_err(|_| AgentError::Knowledge("Knowledge index lock poisoned".to_string()))?;
        info!("Swapping knowledge snapshot ({} documents)", snapshot.len());
        *guard = Arc::new(snapshot);
        Ok(())
    }
}

#[async_trait]
impl KnowledgeIndex for InMemoryKnowledgeIndex {
    async fn search(&self, vector: &[f32], partition: Partition, k: usize) -> Result<Vec<Fragment>> {
        let snapshot = self.current()?;
        let Some(store) = snapshot.partitions.get(&partition) else {
            return Ok(Vec::new());
        };
        let hits = store.search(vector, k, self.min_similarity)?;
        Ok(hits
            .into_iter()
            .map(|hit| Fragment {
                id: hit.document.id,
                partition,
                text: hit.document.text,
                payload: hit.document.payload,
                score: hit.score,
            })
            .collect())
    }

    fn document_count(&self) -> usize {
        match self.current() {
            Ok(snapshot) => snapshot.len(),
            Err(e) => {
                warn!("{}", e);
                0
            }
        }
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.current()?.len() > 0)
    }
}
