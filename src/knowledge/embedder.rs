//! Embedders
//!
//! `OpenAiEmbedder` calls the `/embeddings` endpoint. `HashingEmbedder` is a
//! deterministic feature-hashing embedder for offline use.

use crate::config::EmbeddingConfig;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Vector embedding (simple f32 vector)
pub type Embedding = Vec<f32>;

#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &'static str;

    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Embedding>;
}

/// Embedding client using the OpenAI API
pub struct OpenAiEmbedder {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    dimension: usize,
}

impl OpenAiEmbedder {
    pub fn new(api_key: String, base_url: String, model: String, dimension: usize, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Config(format!("Failed to create embedding client: {}", e)))?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            dimension,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "dimensions": self.dimension,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Knowledge(format!("Embedding API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AgentError::Knowledge(format!(
                "Embedding API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AgentError::Knowledge(format!("Failed to parse embedding response: {}", e)))?;

        let embedding: Embedding = response_json
            .get("data")
            .and_then(|d| d.as_array())
            .and_then(|arr| arr.first())
            .and_then(|first| first.get("embedding"))
            .and_then(|e| e.as_array())
            .ok_or_else(|| AgentError::Knowledge("No embedding vector in response".to_string()))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();

        if embedding.len() != self.dimension {
            return Err(AgentError::Knowledge(format!(
                "Embedding dimension {} does not match configured {}",
                embedding.len(),
                self.dimension
            )));
        }
        Ok(embedding)
    }
}

/// Bag-of-words plus character trigrams, hashed into a fixed-size vector and
/// L2-normalised.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
        }
    }

    fn add(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let hash = fnv1a(feature.as_bytes());
        let idx = (hash % self.dimension as u64) as usize;
        let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        vector[idx] += sign * weight;
    }

    pub fn embed_sync(&self, text: &str) -> Embedding {
        let mut vector = vec![0.0f32; self.dimension];
        let lowered = text.to_lowercase();
        for word in lowered
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| !w.is_empty())
        {
            // crude plural folding so "prices" meets "price"
            let stem = if word.len() > 3 { word.trim_end_matches('s') } else { word };
            self.add(&mut vector, stem, 1.0);
            // snake_case identifiers also count by their parts
            if stem.contains('_') {
                for part in stem.split('_').filter(|p| !p.is_empty()) {
                    self.add(&mut vector, part, 0.5);
                }
            }
            let chars: Vec<char> = stem.chars().collect();
            if chars.len() > 3 {
                for window in chars.windows(3) {
                    let gram: String = window.iter().collect();
                    self.add(&mut vector, &format!("#{}", gram), 0.25);
                }
            }
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn name(&self) -> &'static str {
        "hashing"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        Ok(self.embed_sync(text))
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Embedder for the configured provider. OpenAI needs an API key; without one
/// the hashing embedder is used.
pub fn embedder_from_config(
    config: &EmbeddingConfig,
    api_key: Option<&str>,
    base_url: &str,
    timeout: Duration,
) -> Result<std::sync::Arc<dyn Embedder>> {
    match (config.provider.as_str(), api_key) {
        ("openai", Some(key)) if !key.trim().is_empty() => Ok(std::sync::Arc::new(OpenAiEmbedder::new(
            key.to_string(),
            base_url.to_string(),
            config.model.clone(),
            config.dimension,
            timeout,
        )?)),
        ("openai", _) => {
            tracing::warn!("OpenAI embeddings requested without an API key, using hashing embedder");
            Ok(std::sync::Arc::new(HashingEmbedder::new(config.dimension)))
        }
        ("hashing", _) => Ok(std::sync::Arc::new(HashingEmbedder::new(config.dimension))),
        (other, _) => Err(AgentError::Config(format!("Unknown embedding provider: {}", other))),
    }
}
