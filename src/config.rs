//! Agent configuration
//!
//! Defaults, then an optional JSON file, then environment variables (a `.env`
//! file is honoured through `dotenv`).

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub execution: ExecutionConfig,
    pub synthesis: SynthesisConfig,
    pub backends: BackendsConfig,
    pub server: ServerConfig,
    /// Pre-built knowledge snapshot (JSON documents)
    pub knowledge_path: Option<PathBuf>,
    /// Table descriptions merged into live schema inspection
    pub schema_descriptions_path: Option<PathBuf>,
    /// JSON-lines query log
    pub query_log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    /// Calls allowed per minute before routing straight to fallbacks (0 = unlimited)
    pub requests_per_minute: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// "openai" or "hashing"
    pub provider: String,
    pub model: String,
    pub dimension: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Approximate token budget for retrieved fragments
    pub token_budget: usize,
    pub min_similarity: f32,
    /// Sample rows attached to live schema inspection
    pub sample_rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub default_backend: String,
    pub max_rows: usize,
    /// Row cap for the simplified retry after an execution failure
    pub retry_row_cap: usize,
    pub timeout_secs: u64,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub sample_rows: usize,
    pub max_table_rows: usize,
    pub max_insights: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    /// SQLite database file; in-memory when unset
    pub sqlite_path: Option<PathBuf>,
    /// Directory of CSV / Parquet files served by the polars engine
    pub data_dir: Option<PathBuf>,
    pub trino: Option<TrinoConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrinoConfig {
    pub coordinator_url: String,
    pub catalog: String,
    pub schema: String,
    pub user: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            execution: ExecutionConfig::default(),
            synthesis: SynthesisConfig::default(),
            backends: BackendsConfig::default(),
            server: ServerConfig::default(),
            knowledge_path: None,
            schema_descriptions_path: None,
            query_log_path: None,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 30,
            requests_per_minute: 60,
            temperature: 0.0,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hashing".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimension: 256,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            token_budget: 1500,
            min_similarity: 0.0,
            sample_rows: 3,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_backend: "sqlite".to_string(),
            max_rows: 1000,
            retry_row_cap: 100,
            timeout_secs: 30,
            cache_ttl_secs: 3600,
            cache_capacity: 512,
        }
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            sample_rows: 10,
            max_table_rows: 50,
            max_insights: 5,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.as_deref().map(|k| !k.trim().is_empty()).unwrap_or(false)
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl AgentConfig {
    /// Load from a JSON file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config: AgentConfig = serde_json::from_str(&content).map_err(|e| {
            AgentError::Config(format!("Failed to parse config {}: {}", path.display(), e))
        })?;
        info!("Loaded configuration from {}", path.display());
        config.with_env_overrides()
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Result<Self> {
        dotenv::dotenv().ok();

        if let Some(key) = env("OPENAI_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(url) = env("OPENAI_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(model) = env("OPENAI_MODEL") {
            self.llm.model = model;
        }
        if let Some(rpm) = env("NLQ_LLM_RPM") {
            self.llm.requests_per_minute = parse_env("NLQ_LLM_RPM", &rpm)?;
        }
        if let Some(model) = env("EMBEDDING_MODEL") {
            self.embedding.model = model;
            self.embedding.provider = "openai".to_string();
        }
        if let Some(path) = env("NLQ_SQLITE_PATH") {
            self.backends.sqlite_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = env("NLQ_DATA_DIR") {
            self.backends.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(backend) = env("NLQ_DEFAULT_BACKEND") {
            self.execution.default_backend = backend;
        }
        if let Some(path) = env("NLQ_KNOWLEDGE_PATH") {
            self.knowledge_path = Some(PathBuf::from(path));
        }
        if let Some(bind) = env("NLQ_BIND") {
            self.server.bind = bind;
        }
        if let Some(ttl) = env("NLQ_CACHE_TTL_SECS") {
            self.execution.cache_ttl_secs = parse_env("NLQ_CACHE_TTL_SECS", &ttl)?;
        }
        if let Some(rows) = env("NLQ_MAX_ROWS") {
            self.execution.max_rows = parse_env("NLQ_MAX_ROWS", &rows)?;
        }
        if let Some(url) = env("TRINO_COORDINATOR_URL") {
            self.backends.trino = Some(TrinoConfig {
                coordinator_url: url,
                catalog: env("TRINO_CATALOG").unwrap_or_else(|| "memory".to_string()),
                schema: env("TRINO_SCHEMA").unwrap_or_else(|| "default".to_string()),
                user: env("TRINO_USER").unwrap_or_else(|| "admin".to_string()),
            });
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retrieval.top_k == 0 {
            return Err(AgentError::Config("retrieval.top_k must be positive".to_string()));
        }
        if self.execution.max_rows == 0 {
            return Err(AgentError::Config("execution.max_rows must be positive".to_string()));
        }
        if self.execution.retry_row_cap == 0 || self.execution.retry_row_cap > self.execution.max_rows {
            return Err(AgentError::Config(format!(
                "execution.retry_row_cap must be in 1..={}",
                self.execution.max_rows
            )));
        }
        if self.embedding.dimension == 0 {
            return Err(AgentError::Config("embedding.dimension must be positive".to_string()));
        }
        Ok(())
    }
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| AgentError::Config(format!("Invalid value for {}: {}", name, value)))
}
