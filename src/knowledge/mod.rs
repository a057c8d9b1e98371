//! Knowledge Index: schema descriptions, prior question/SQL examples and
//! business rules, searchable by embedding similarity.

pub mod embedder;
pub mod index;
pub mod vector_store;

pub use embedder::{embedder_from_config, Embedder, Embedding, HashingEmbedder, OpenAiEmbedder};
pub use index::{Fragment, InMemoryKnowledgeIndex, KnowledgeDocument, KnowledgeIndex, Partition, Snapshot};

use serde::{Deserialize, Serialize};

/// A previously successful question and its SQL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryExample {
    pub question: String,
    pub sql: String,
    /// Intent tag (`pricing`, `sales`, ...)
    #[serde(default)]
    pub intent: Option<String>,
}

/// Business rule text attached to generation prompts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusinessRule {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub tables: Vec<String>,
}
