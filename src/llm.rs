//! Language model collaborator
//!
//! Prompt in, text out. Errors distinguish an unreachable model from one that
//! answered with something unusable.

use crate::config::LlmConfig;
use crate::error::{AgentError, LlmError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    /// Chat completion with one system and one user message.
    async fn complete(&self, system: &str, prompt: &str) -> std::result::Result<String, LlmError>;

    async fn health_check(&self) -> bool;
}

/// OpenAI-compatible chat completions client
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    timeout: Duration,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AgentError::Config(format!("Failed to create LLM client: {}", e)))?;
        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            timeout: config.timeout(),
        })
    }

    async fn send(&self, system: &str, prompt: &str) -> std::result::Result<String, LlmError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt}
            ],
            "temperature": self.temperature,
            "max_tokens": 1000
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Unavailable(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimited);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Unavailable(format!("LLM API error ({}): {}", status, text)));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Malformed(format!("Failed to parse LLM response: {}", e)))?;

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| LlmError::Malformed("No content in LLM response".to_string()))?;

        Ok(content.to_string())
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, prompt: &str) -> std::result::Result<String, LlmError> {
        debug!("LLM prompt ({} chars) to {}", prompt.len(), self.model);
        match tokio::time::timeout(self.timeout, self.send(system, prompt)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("LLM call exceeded {}ms", self.timeout.as_millis());
                Err(LlmError::Timeout(self.timeout.as_millis() as u64))
            }
        }
    }

    async fn health_check(&self) -> bool {
        let request = self
            .client
            .get(format!("{}/models", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send();
        match tokio::time::timeout(Duration::from_secs(5), request).await {
            Ok(Ok(response)) => response.status().is_success(),
            _ => false,
        }
    }
}

/// Stand-in used when no API key is configured: every call is unavailable.
pub struct UnconfiguredModel;

#[async_trait]
impl LanguageModel for UnconfiguredModel {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn complete(&self, _system: &str, _prompt: &str) -> std::result::Result<String, LlmError> {
        Err(LlmError::Unavailable("no language model configured".to_string()))
    }

    async fn health_check(&self) -> bool {
        false
    }
}

pub fn model_from_config(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>> {
    match config.api_key.as_deref() {
        Some(key) if config.is_configured() => Ok(Arc::new(OpenAiClient::new(config, key.to_string())?)),
        _ => {
            warn!("OPENAI_API_KEY not set, language model paths will use fallbacks");
            Ok(Arc::new(UnconfiguredModel))
        }
    }
}

/// Remove a surrounding markdown code fence, if any.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // drop the language tag line
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().trim_end_matches("```").trim()
}

/// First balanced `{...}` object in the text.
pub fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    let body = strip_code_fences(text);
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&body[start..=end]).ok()
}
