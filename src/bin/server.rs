//! HTTP API server configured from the environment (`.env` is read first).

use anyhow::{Context, Result};
use nlq_agent::agent::AgentBuilder;
use nlq_agent::config::AgentConfig;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("nlq_agent=info,tower_http=info")),
        )
        .init();

    let config = match std::env::var("NLQ_CONFIG") {
        Ok(path) => AgentConfig::load(&path)?,
        Err(_) => AgentConfig::from_env()?,
    };
    let bind = config.server.bind.clone();

    let orchestrator = AgentBuilder::new(config)
        .build()
        .await
        .context("Failed to initialise the agent")?;
    info!("Backends: {}", orchestrator.backends().join(", "));

    nlq_agent::api::serve(Arc::new(orchestrator), &bind).await?;
    Ok(())
}
