//! Cumulative request counters
//!
//! One `AgentStats` is created with the orchestrator and shared by every
//! request. Counters are lock-free; the per-tier and per-error tallies live in
//! concurrent maps.

use crate::error::ErrorKind;
use crate::execution::cache::CacheStats;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsSnapshot {
    pub total_queries: u64,
    pub successful_queries: u64,
    pub failed_queries: u64,
    pub degraded_responses: u64,
    pub cancelled_queries: u64,
    /// Fraction in [0, 1]
    pub success_rate: f64,
    pub cache_hits: u64,
    /// Fraction in [0, 1] of executed queries served from the cache
    pub cache_hit_rate: f64,
    /// Seconds
    pub average_execution_time: f64,
    pub fallback_tier_usage: BTreeMap<String, u64>,
    pub error_counts: BTreeMap<String, u64>,
    pub cache: CacheStats,
}

/// Outcome of one request, as recorded in the counters.
#[derive(Debug, Clone)]
pub struct RequestOutcome<'a> {
    pub success: bool,
    pub degraded: bool,
    /// Result came from the cache; `None` when nothing was executed
    pub cache_hit: Option<bool>,
    pub elapsed: Duration,
    pub fallback_tiers: &'a [&'static str],
    pub error: Option<ErrorKind>,
}

#[derive(Default)]
pub struct AgentStats {
    total_queries: AtomicU64,
    successful_queries: AtomicU64,
    failed_queries: AtomicU64,
    degraded_responses: AtomicU64,
    cancelled_queries: AtomicU64,
    executed_queries: AtomicU64,
    cache_hits: AtomicU64,
    /// Microseconds
    total_time: AtomicU64,
    fallback_tiers: DashMap<&'static str, u64>,
    errors: DashMap<&'static str, u64>,
}

impl AgentStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: &RequestOutcome<'_>) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        self.total_time
            .fetch_add(outcome.elapsed.as_micros() as u64, Ordering::Relaxed);

        if outcome.success {
            self.successful_queries.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_queries.fetch_add(1, Ordering::Relaxed);
        }
        if outcome.degraded {
            self.degraded_responses.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(hit) = outcome.cache_hit {
            self.executed_queries.fetch_add(1, Ordering::Relaxed);
            if hit {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
            }
        }
        for tier in outcome.fallback_tiers {
            *self.fallback_tiers.entry(*tier).or_insert(0) += 1;
        }
        if let Some(kind) = outcome.error {
            if kind == ErrorKind::Cancelled {
                self.cancelled_queries.fetch_add(1, Ordering::Relaxed);
            }
            *self.errors.entry(kind.as_str()).or_insert(0) += 1;
        }
    }

    pub fn snapshot(&self, cache: CacheStats) -> StatsSnapshot {
        // counters are read one by one while requests keep recording, so
        // rates are taken over counters that move together and clamped
        let successful = self.successful_queries.load(Ordering::Relaxed);
        let failed = self.failed_queries.load(Ordering::Relaxed);
        let total = self.total_queries.load(Ordering::Relaxed).max(successful + failed);
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let executed = self.executed_queries.load(Ordering::Relaxed);
        let total_time_us = self.total_time.load(Ordering::Relaxed);

        let ratio = |num: u64, den: u64| {
            if den > 0 {
                (num as f64 / den as f64).min(1.0)
            } else {
                0.0
            }
        };

        StatsSnapshot {
            total_queries: total,
            successful_queries: successful,
            failed_queries: failed,
            degraded_responses: self.degraded_responses.load(Ordering::Relaxed),
            cancelled_queries: self.cancelled_queries.load(Ordering::Relaxed),
            success_rate: ratio(successful, successful + failed),
            cache_hits,
            cache_hit_rate: ratio(cache_hits, executed),
            average_execution_time: ratio(total_time_us, total) / 1_000_000.0,
            fallback_tier_usage: self
                .fallback_tiers
                .iter()
                .map(|e| (e.key().to_string(), *e.value()))
                .collect(),
            error_counts: self
                .errors
                .iter()
                .map(|e| (e.key().to_string(), *e.value()))
                .collect(),
            cache,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_cache() -> CacheStats {
        CacheStats { entries: 0, hits: 0, misses: 0 }
    }

    #[test]
    fn test_empty_snapshot_has_zero_rates() {
        let snapshot = AgentStats::new().snapshot(empty_cache());
        assert_eq!(snapshot.total_queries, 0);
        assert_eq!(snapshot.success_rate, 0.0);
        assert_eq!(snapshot.cache_hit_rate, 0.0);
        assert_eq!(snapshot.average_execution_time, 0.0);
    }

    #[test]
    fn test_record_outcomes() {
        let stats = AgentStats::new();
        stats.record(&RequestOutcome {
            success: true,
            degraded: true,
            cache_hit: Some(false),
            elapsed: Duration::from_millis(300),
            fallback_tiers: &["pattern_generator", "template_synthesis"],
            error: None,
        });
        stats.record(&RequestOutcome {
            success: true,
            degraded: false,
            cache_hit: Some(true),
            elapsed: Duration::from_millis(100),
            fallback_tiers: &[],
            error: None,
        });
        stats.record(&RequestOutcome {
            success: false,
            degraded: false,
            cache_hit: None,
            elapsed: Duration::from_millis(200),
            fallback_tiers: &[],
            error: Some(ErrorKind::SqlValidationRejected),
        });

        let snapshot = stats.snapshot(empty_cache());
        assert_eq!(snapshot.total_queries, 3);
        assert_eq!(snapshot.failed_queries, 1);
        assert!((snapshot.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((snapshot.cache_hit_rate - 0.5).abs() < 1e-9);
        assert!((snapshot.average_execution_time - 0.2).abs() < 1e-9);
        assert_eq!(snapshot.fallback_tier_usage["pattern_generator"], 1);
        assert_eq!(snapshot.error_counts["SQLValidationRejected"], 1);
        assert_eq!(snapshot.degraded_responses, 1);
    }

    #[test]
    fn test_snapshots_stay_consistent_under_concurrent_records() {
        let stats = AgentStats::new();
        std::thread::scope(|scope| {
            for worker in 0..4 {
                let stats = &stats;
                scope.spawn(move || {
                    for i in 0..2_000 {
                        stats.record(&RequestOutcome {
                            success: (i + worker) % 3 != 0,
                            degraded: false,
                            cache_hit: Some(i % 2 == 0),
                            elapsed: Duration::from_micros(50),
                            fallback_tiers: &[],
                            error: None,
                        });
                    }
                });
            }
            for _ in 0..500 {
                let snapshot = stats.snapshot(empty_cache());
                assert!(snapshot.successful_queries + snapshot.failed_queries <= snapshot.total_queries);
                assert!((0.0..=1.0).contains(&snapshot.success_rate));
                assert!((0.0..=1.0).contains(&snapshot.cache_hit_rate));
            }
        });

        let snapshot = stats.snapshot(empty_cache());
        assert_eq!(snapshot.total_queries, 8_000);
        assert_eq!(snapshot.successful_queries + snapshot.failed_queries, 8_000);
        assert!((snapshot.cache_hit_rate - 0.5).abs() < 1e-9);
    }
}
