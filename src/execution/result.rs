//! Query Result - Standardized result format from execution engines

use crate::error::Result;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Standardized query result from any backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,

    /// Row-major values, JSON-typed
    pub rows: Vec<Vec<Value>>,

    /// Number of rows returned (after truncation)
    pub row_count: usize,

    pub execution_time_ms: u64,

    /// Backend that executed the query
    pub backend: String,

    /// Served from the result cache
    #[serde(default)]
    pub cache_hit: bool,

    /// More rows were available than the row limit allowed
    #[serde(default)]
    pub truncated: bool,

    /// Warnings (non-fatal issues)
    #[serde(default)]
    pub warnings: Vec<String>,

    /// Engine-specific metadata
    #[serde(default)]
    pub engine_metadata: HashMap<String, Value>,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>, backend: impl Into<String>) -> Self {
        let row_count = rows.len();
        Self {
            columns,
            rows,
            row_count,
            execution_time_ms: 0,
            backend: backend.into(),
            cache_hit: false,
            truncated: false,
            warnings: Vec::new(),
            engine_metadata: HashMap::new(),
        }
    }

    /// Build from a polars DataFrame, keeping at most `row_limit` rows.
    pub fn from_dataframe(
        df: &DataFrame,
        backend: impl Into<String>,
        row_limit: Option<usize>,
    ) -> Result<Self> {
        let columns: Vec<String> = df.get_column_names().iter().map(|s| s.to_string()).collect();
        let height = df.height();
        let take = row_limit.map(|l| l.min(height)).unwrap_or(height);

        let mut rows = Vec::with_capacity(take);
        for row_idx in 0..take {
            let mut row = Vec::with_capacity(columns.len());
            for series in df.get_columns() {
                row.push(series_to_json_value(series, row_idx)?);
            }
            rows.push(row);
        }

        let mut result = Self::new(columns, rows, backend);
        result.truncated = take < height;
        Ok(result)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Values of one column, in row order.
    pub fn column_values(&self, idx: usize) -> impl Iterator<Item = &Value> + '_ {
        self.rows.iter().map(move |row| row.get(idx).unwrap_or(&Value::Null))
    }

    /// Drop rows beyond `limit`, marking the result truncated.
    pub fn truncate(&mut self, limit: usize) {
        if self.rows.len() > limit {
            self.rows.truncate(limit);
            self.row_count = self.rows.len();
            self.truncated = true;
        }
    }

    /// Rows as column-name keyed objects.
    pub fn to_records(&self) -> Vec<serde_json::Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }
}

fn series_to_json_value(series: &Series, row_idx: usize) -> Result<Value> {
    let any_val = series.get(row_idx)?;

    Ok(match any_val {
        AnyValue::Null => Value::Null,
        AnyValue::Boolean(b) => Value::Bool(b),
        AnyValue::String(s) => Value::String(s.to_string()),
        AnyValue::Int8(i) => Value::Number(i.into()),
        AnyValue::Int16(i) => Value::Number(i.into()),
        AnyValue::Int32(i) => Value::Number(i.into()),
        AnyValue::Int64(i) => Value::Number(i.into()),
        AnyValue::UInt8(u) => Value::Number(u.into()),
        AnyValue::UInt16(u) => Value::Number(u.into()),
        AnyValue::UInt32(u) => Value::Number(u.into()),
        AnyValue::UInt64(u) => Value::Number(u.into()),
        AnyValue::Float32(f) => float_value(f as f64),
        AnyValue::Float64(f) => float_value(f),
        // dates, datetimes and anything exotic render through Display
        other => Value::String(other.to_string()),
    })
}

pub(crate) fn float_value(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
