//! Query log: recent requests in memory, optionally appended to a JSON-lines
//! file.

use crate::error::{AgentError, ErrorKind, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// Entries kept in memory.
pub const DEFAULT_LOG_CAPACITY: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryLogEntry {
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub question: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub row_count: usize,
    /// Seconds
    pub execution_time: f64,
    pub degraded: bool,
    pub cache_hit: bool,
    pub fallback_tiers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
}

pub struct QueryLog {
    entries: Mutex<VecDeque<QueryLogEntry>>,
    capacity: usize,
    file: Option<Mutex<File>>,
}

impl QueryLog {
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            file: None,
        }
    }

    /// Also append every entry to `path`.
    pub fn with_file(capacity: usize, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| AgentError::Config(format!("Failed to open query log {}: {}", path.display(), e)))?;
        let mut log = Self::in_memory(capacity);
        log.file = Some(Mutex::new(file));
        Ok(log)
    }

    pub fn record(&self, entry: QueryLogEntry) {
        if let Some(file) = &self.file {
            match (serde_json::to_string(&entry), file.lock()) {
                (Ok(line), Ok(mut file)) => {
                    if let Err(e) = writeln!(file, "{}", line) {
                        warn!("Failed to append to query log: {}", e);
                    }
                }
                (Err(e), _) => warn!("Failed to serialize query log entry: {}", e),
                (_, Err(_)) => warn!("Query log file lock poisoned"),
            }
        }

        match self.entries.lock() {
            Ok(mut entries) => {
                if entries.len() == self.capacity {
                    entries.pop_front();
                }
                entries.push_back(entry);
            }
            Err(_) => warn!("Query log lock poisoned, entry dropped"),
        }
    }

    /// Most recent entries first.
    pub fn recent(&self, limit: usize) -> Vec<QueryLogEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.iter().rev().take(limit).cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(question: &str, success: bool) -> QueryLogEntry {
        QueryLogEntry {
            request_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            question: question.to_string(),
            sql: Some("SELECT 1".to_string()),
            success,
            error_kind: if success { None } else { Some(ErrorKind::QueryExecutionFailed) },
            row_count: 1,
            execution_time: 0.01,
            degraded: false,
            cache_hit: false,
            fallback_tiers: vec![],
            backend: Some("sqlite".to_string()),
        }
    }

    #[test]
    fn test_ring_keeps_latest_entries() {
        let log = QueryLog::in_memory(2);
        log.record(entry("first", true));
        log.record(entry("second", true));
        log.record(entry("third", false));
        assert_eq!(log.len(), 2);
        let recent = log.recent(10);
        assert_eq!(recent[0].question, "third");
        assert_eq!(recent[1].question, "second");
        assert_eq!(log.recent(1).len(), 1);
    }

    #[test]
    fn test_file_receives_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queries.jsonl");
        let log = QueryLog::with_file(10, &path).unwrap();
        log.record(entry("first", true));
        log.record(entry("second", false));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: QueryLogEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.question, "second");
        assert_eq!(parsed.error_kind, Some(ErrorKind::QueryExecutionFailed));
    }
}
