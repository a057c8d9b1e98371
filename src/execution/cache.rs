//! Result cache keyed by backend and normalized SQL text.

use crate::execution::result::QueryResult;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

struct CacheEntry {
    result: QueryResult,
    inserted_at: Instant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct ResultCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn key(backend: &str, sql: &str) -> String {
        format!("{}::{}", backend, normalize_sql(sql))
    }

    /// Fresh cached result, flagged as a cache hit.
    pub fn get(&self, backend: &str, sql: &str) -> Option<QueryResult> {
        let key = Self::key(backend, sql);
        let cached = self.entries.get(&key).map(|entry| {
            if entry.inserted_at.elapsed() <= self.ttl {
                Some(entry.result.clone())
            } else {
                None
            }
        });

        match cached {
            Some(Some(mut result)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                result.cache_hit = true;
                Some(result)
            }
            Some(None) => {
                debug!("Cache entry expired for {}", key);
                self.entries.remove(&key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, backend: &str, sql: &str, result: &QueryResult) {
        let key = Self::key(backend, sql);
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict();
        }
        let mut stored = result.clone();
        stored.cache_hit = false;
        self.entries.insert(
            key,
            CacheEntry {
                result: stored,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop expired entries, then the oldest one if still full.
    fn evict(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.inserted_at.elapsed() <= ttl);
        if self.entries.len() < self.capacity {
            return;
        }
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.inserted_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }

    /// Remove everything, returning how many entries were dropped.
    pub fn clear(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Collapse whitespace outside quoted literals and drop a trailing `;`.
pub fn normalize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;

    for c in sql.trim().trim_end_matches(';').trim_end().chars() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c.is_whitespace() => pending_space = true,
            None => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                if c == '\'' || c == '"' {
                    quote = Some(c);
                }
                out.push(c);
            }
        }
    }
    out
}
