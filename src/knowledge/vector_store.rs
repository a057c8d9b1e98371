//! Vector store for one knowledge partition: linear cosine search.

use crate::error::{AgentError, Result};
use crate::knowledge::embedder::Embedding;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    pub payload: serde_json::Value,
    pub embedding: Embedding,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub document: Document,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct InMemoryVectorStore {
    documents: Vec<Document>,
    dimension: usize,
}

impl InMemoryVectorStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            documents: Vec::new(),
            dimension,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn add_document(&mut self, document: Document) -> Result<()> {
        if document.embedding.len() != self.dimension {
            return Err(AgentError::Knowledge(format!(
                "Embedding dimension {} for {} doesn't match store dimension {}",
                document.embedding.len(),
                document.id,
                self.dimension
            )));
        }
        // re-adding an id replaces the earlier document
        self.documents.retain(|d| d.id != document.id);
        self.documents.push(document);
        Ok(())
    }

    /// Top `top_k` documents by cosine similarity, highest first.
    pub fn search(&self, query: &[f32], top_k: usize, min_score: f32) -> Result<Vec<SearchResult>> {
        if self.documents.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.dimension {
            return Err(AgentError::Knowledge(format!(
                "Query embedding dimension {} doesn't match store dimension {}",
                query.len(),
                self.dimension
            )));
        }

        let mut results: Vec<SearchResult> = self
            .documents
            .iter()
            .map(|doc| SearchResult {
                score: cosine_similarity(query, &doc.embedding),
                document: doc.clone(),
            })
            .filter(|r| r.score > min_score)
            .collect();

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(top_k);
        Ok(results)
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Cosine similarity, 0.0 when either vector is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, embedding: Vec<f32>) -> Document {
        Document {
            id: id.to_string(),
            text: id.to_string(),
            payload: serde_json::Value::Null,
            embedding,
        }
    }

    #[test]
    fn test_search_orders_by_similarity() {
        let mut store = InMemoryVectorStore::new(2);
        store.add_document(doc("x", vec![1.0, 0.0])).unwrap();
        store.add_document(doc("y", vec![0.0, 1.0])).unwrap();
        store.add_document(doc("xy", vec![1.0, 1.0])).unwrap();

        let results = store.search(&[1.0, 0.1], 2, 0.0).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].document.id, "x");
        assert_eq!(results[1].document.id, "xy");
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut store = InMemoryVectorStore::new(3);
        assert!(store.add_document(doc("bad", vec![1.0])).is_err());
        store.add_document(doc("ok", vec![1.0, 0.0, 0.0])).unwrap();
        assert!(store.search(&[1.0], 1, 0.0).is_err());
    }

    #[test]
    fn test_replace_by_id() {
        let mut store = InMemoryVectorStore::new(2);
        store.add_document(doc("a", vec![1.0, 0.0])).unwrap();
        store.add_document(doc("a", vec![0.0, 1.0])).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.documents()[0].embedding, vec![0.0, 1.0]);
    }
}
