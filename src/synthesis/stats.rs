//! Per-column profiling of a result set

use crate::execution::result::QueryResult;
use crate::sql::templates::{is_identifier_name, is_temporal};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

lazy_static! {
    static ref ISO_TEMPORAL: Regex = Regex::new(r"^\d{4}-\d{2}(?:-\d{2})?(?:[ T]\d{2}:\d{2}(?::\d{2}(?:\.\d+)?)?)?").unwrap();
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Numeric,
    Temporal,
    Categorical,
    /// Only nulls
    Empty,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NumericStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub mean: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnProfile {
    pub name: String,
    pub kind: ColumnKind,
    pub non_null: usize,
    pub distinct: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numeric: Option<NumericStats>,
}

impl ColumnProfile {
    pub fn is_numeric(&self) -> bool {
        self.kind == ColumnKind::Numeric
    }
}

/// Profile every column of a result.
pub fn profile_columns(result: &QueryResult) -> Vec<ColumnProfile> {
    result
        .columns
        .iter()
        .enumerate()
        .map(|(idx, name)| profile_column(name, result.column_values(idx)))
        .collect()
}

pub fn profile_column<'a>(name: &str, values: impl Iterator<Item = &'a Value>) -> ColumnProfile {
    let mut non_null = 0;
    let mut numbers = Vec::new();
    let mut all_numbers = true;
    let mut all_temporal = true;
    let mut distinct = HashSet::new();

    for value in values {
        if value.is_null() {
            continue;
        }
        non_null += 1;
        distinct.insert(display_value(value));
        match value {
            Value::Number(n) => {
                if let Some(f) = n.as_f64() {
                    numbers.push(f);
                }
                all_temporal = false;
            }
            Value::String(s) => {
                all_numbers = false;
                if !ISO_TEMPORAL.is_match(s) {
                    all_temporal = false;
                }
            }
            _ => {
                all_numbers = false;
                all_temporal = false;
            }
        }
    }

    let kind = if non_null == 0 {
        ColumnKind::Empty
    } else if all_temporal && !all_numbers {
        ColumnKind::Temporal
    } else if all_numbers && is_temporal(name, "") {
        // year / month numbers
        ColumnKind::Temporal
    } else if all_numbers && !is_identifier_name(name) {
        ColumnKind::Numeric
    } else {
        ColumnKind::Categorical
    };

    let numeric = if kind == ColumnKind::Numeric && !numbers.is_empty() {
        let sum: f64 = numbers.iter().sum();
        Some(NumericStats {
            count: numbers.len(),
            min: numbers.iter().cloned().fold(f64::INFINITY, f64::min),
            max: numbers.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            sum,
            mean: sum / numbers.len() as f64,
        })
    } else {
        None
    };

    ColumnProfile {
        name: name.to_string(),
        kind,
        non_null,
        distinct: distinct.len(),
        numeric,
    }
}

/// Cell text as shown to users.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => format_number(n),
        other => other.to_string(),
    }
}

fn format_number(n: &serde_json::Number) -> String {
    if n.is_f64() {
        n.as_f64().map(format_float).unwrap_or_else(|| n.to_string())
    } else {
        n.to_string()
    }
}

/// Floats without representation noise: at most four decimals, trailing zeros
/// dropped.
pub fn format_float(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        return format!("{}", value as i64);
    }
    let text = format!("{:.4}", value);
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}
