//! Execution Router - Selects the backend for each query
//!
//! An explicit backend on the request wins. Otherwise the configured default
//! is used when it can handle the query, and the best scored engine when not.

use crate::error::{AgentError, Result};
use crate::execution::engine::{EngineSuggestion, ExecutionEngine};
use crate::execution::profile::QueryProfile;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ExecutionRouter {
    engines: Vec<Arc<dyn ExecutionEngine>>,
    default_engine: String,
}

impl ExecutionRouter {
    pub fn new(engines: Vec<Arc<dyn ExecutionEngine>>, default_engine: impl Into<String>) -> Result<Self> {
        let default_engine = default_engine.into();
        if engines.is_empty() {
            return Err(AgentError::Config("At least one execution backend is required".to_string()));
        }
        if !engines.iter().any(|e| e.name() == default_engine) {
            return Err(AgentError::Config(format!(
                "Default backend '{}' is not configured. Available: {:?}",
                default_engine,
                engines.iter().map(|e| e.name()).collect::<Vec<_>>()
            )));
        }
        Ok(Self {
            engines,
            default_engine,
        })
    }

    pub fn available_engines(&self) -> Vec<String> {
        self.engines.iter().map(|e| e.name().to_string()).collect()
    }

    pub fn engines(&self) -> &[Arc<dyn ExecutionEngine>] {
        &self.engines
    }

    pub fn find_engine(&self, name: &str) -> Option<&Arc<dyn ExecutionEngine>> {
        self.engines.iter().find(|e| e.name().eq_ignore_ascii_case(name))
    }

    pub fn default_engine(&self) -> &Arc<dyn ExecutionEngine> {
        self.find_engine(&self.default_engine)
            .unwrap_or(&self.engines[0])
    }

    /// Engine a request should be generated for, before any SQL exists.
    pub fn engine_for(&self, preferred: Option<&str>) -> Result<&Arc<dyn ExecutionEngine>> {
        match preferred {
            Some(name) => self.find_engine(name).ok_or_else(|| {
                AgentError::Config(format!(
                    "Unknown backend '{}'. Available: {:?}",
                    name,
                    self.available_engines()
                ))
            }),
            None => Ok(self.default_engine()),
        }
    }

    /// Score every engine against the profile, best first.
    pub fn suggest_engine(&self, profile: &QueryProfile) -> Vec<EngineSuggestion> {
        let mut suggestions: Vec<EngineSuggestion> = self
            .engines
            .iter()
            .map(|engine| {
                let capabilities = engine.capabilities();
                let can_handle = engine.validate(profile).is_ok();
                let mut reasons = Vec::new();
                let mut score = 0;

                if engine.name() == self.default_engine {
                    reasons.push("Configured default".to_string());
                    score += 20;
                }
                if profile.uses_ctes {
                    if capabilities.supports_ctes {
                        reasons.push("Supports CTEs".to_string());
                        score += 15;
                    } else {
                        reasons.push("Does not support CTEs".to_string());
                        score -= 30;
                    }
                }
                if profile.uses_window_functions {
                    if capabilities.supports_window_functions {
                        reasons.push("Supports window functions".to_string());
                        score += 15;
                    } else {
                        reasons.push("Does not support window functions".to_string());
                        score -= 30;
                    }
                }
                if capabilities.in_process {
                    reasons.push("Runs in process".to_string());
                    score += 10;
                }
                if profile.complexity_score > 50 && capabilities.supports_federated_sources {
                    reasons.push("Good for complex queries".to_string());
                    score += 10;
                }
                if !can_handle {
                    score -= 100;
                }

                EngineSuggestion {
                    engine: engine.name().to_string(),
                    can_handle,
                    score,
                    reasons,
                }
            })
            .collect();

        suggestions.sort_by(|a, b| b.score.cmp(&a.score));
        suggestions
    }

    /// Pick the engine that will run `profile`.
    pub fn select(&self, preferred: Option<&str>, profile: &QueryProfile) -> Result<Arc<dyn ExecutionEngine>> {
        if let Some(name) = preferred {
            let engine = self.engine_for(Some(name))?;
            engine.validate(profile)?;
            info!("Using requested backend: {}", engine.name());
            return Ok(Arc::clone(engine));
        }

        let default = self.default_engine();
        if default.validate(profile).is_ok() {
            return Ok(Arc::clone(default));
        }

        let suggestions = self.suggest_engine(profile);
        debug!("Engine suggestions: {:?}", suggestions);
        let best = suggestions
            .iter()
            .find(|s| s.can_handle)
            .and_then(|s| self.find_engine(&s.engine))
            .ok_or_else(|| {
                AgentError::Database("No configured backend can run this query".to_string())
            })?;
        info!("Default backend cannot run query, routed to {}", best.name());
        Ok(Arc::clone(best))
    }
}
