//! Per-minute budget on language-model calls
//!
//! When the budget is exhausted calls fail immediately with
//! `LlmError::RateLimited` so the pipeline moves to its fallback path instead
//! of queueing.

use crate::error::LlmError;
use crate::llm::LanguageModel;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed,
    Exceeded { retry_after_seconds: u64 },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed)
    }
}

/// Sliding one-minute window over call timestamps.
pub struct RateLimiter {
    max_per_minute: u32,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// `max_per_minute == 0` disables the limit.
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_minute,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    pub fn max_per_minute(&self) -> u32 {
        self.max_per_minute
    }

    /// Take one call from the budget if any is left.
    pub fn try_acquire(&self) -> RateLimitResult {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&self, now: Instant) -> RateLimitResult {
        if self.max_per_minute == 0 {
            return RateLimitResult::Allowed;
        }
        let Ok(mut calls) = self.calls.lock() else {
            warn!("Rate limiter lock poisoned, allowing call");
            return RateLimitResult::Allowed;
        };

        while let Some(&oldest) = calls.front() {
            if now.saturating_duration_since(oldest) >= WINDOW {
                calls.pop_front();
            } else {
                break;
            }
        }

        if calls.len() >= self.max_per_minute as usize {
            let retry_after = calls
                .front()
                .map(|&oldest| WINDOW.saturating_sub(now.saturating_duration_since(oldest)))
                .unwrap_or(WINDOW);
            debug!("Language model budget exhausted, retry after {:?}", retry_after);
            return RateLimitResult::Exceeded {
                retry_after_seconds: retry_after.as_secs().max(1),
            };
        }

        calls.push_back(now);
        RateLimitResult::Allowed
    }

    /// Calls left in the current window.
    pub fn remaining(&self) -> Option<u32> {
        if self.max_per_minute == 0 {
            return None;
        }
        let now = Instant::now();
        let used = self
            .calls
            .lock()
            .map(|calls| {
                calls
                    .iter()
                    .filter(|&&t| now.saturating_duration_since(t) < WINDOW)
                    .count()
            })
            .unwrap_or(0);
        Some(self.max_per_minute.saturating_sub(used as u32))
    }
}

/// A language model that spends from a shared `RateLimiter` on every call.
pub struct RateLimitedModel {
    inner: Arc<dyn LanguageModel>,
    limiter: Arc<RateLimiter>,
}

impl RateLimitedModel {
    pub fn new(inner: Arc<dyn LanguageModel>, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl LanguageModel for RateLimitedModel {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        match self.limiter.try_acquire() {
            RateLimitResult::Allowed => self.inner.complete(system, prompt).await,
            RateLimitResult::Exceeded { retry_after_seconds } => {
                warn!(
                    "Language model budget of {}/min exhausted, retry after {}s",
                    self.limiter.max_per_minute(),
                    retry_after_seconds
                );
                Err(LlmError::RateLimited)
            }
        }
    }

    async fn health_check(&self) -> bool {
        self.inner.health_check().await
    }
}
