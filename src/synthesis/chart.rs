//! Chart selection
//!
//! Deterministic rules over column profiles, evaluated in order: line, pie,
//! bar, scatter. A time series is charted from a single row; the other
//! rules need at least two.

use crate::execution::result::QueryResult;
use crate::synthesis::stats::{display_value, ColumnKind, ColumnProfile};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Distinct categories a bar chart can carry.
pub const MAX_BAR_CATEGORIES: usize = 20;

/// Points embedded in a chart payload.
const MAX_POINTS: usize = 500;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    Bar,
    Line,
    Scatter,
    Pie,
}

impl ChartType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChartType::Bar => "bar",
            ChartType::Line => "line",
            ChartType::Scatter => "scatter",
            ChartType::Pie => "pie",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChartPoint {
    pub x: Value,
    pub y: Value,
}

/// Chart payload returned to clients for rendering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChartSpec {
    pub chart_type: ChartType,
    pub title: String,
    pub x_field: String,
    pub y_field: String,
    pub data: Vec<ChartPoint>,
}

/// Pick a chart type for the result, or none.
pub fn select_chart(profiles: &[ColumnProfile], row_count: usize) -> Option<(ChartType, usize, usize)> {
    if row_count == 0 {
        return None;
    }

    let of_kind = |kind: ColumnKind| -> Vec<usize> {
        profiles
            .iter()
            .enumerate()
            .filter(|(_, p)| p.kind == kind)
            .map(|(i, _)| i)
            .collect()
    };
    let numeric = of_kind(ColumnKind::Numeric);
    let temporal = of_kind(ColumnKind::Temporal);
    let categorical = of_kind(ColumnKind::Categorical);

    if numeric.len() == 1 && !temporal.is_empty() {
        return Some((ChartType::Line, temporal[0], numeric[0]));
    }

    if row_count < 2 {
        return None;
    }

    if numeric.len() == 1 && categorical.len() == 1 && is_proportion(&profiles[numeric[0]]) {
        return Some((ChartType::Pie, categorical[0], numeric[0]));
    }

    if numeric.len() == 1 {
        if let Some(&label) = categorical
            .iter()
            .find(|&&i| profiles[i].distinct <= MAX_BAR_CATEGORIES)
        {
            return Some((ChartType::Bar, label, numeric[0]));
        }
    }

    if numeric.len() == 2 {
        return Some((ChartType::Scatter, numeric[0], numeric[1]));
    }

    None
}

/// Non-negative values summing to about 100 (percentages) or about 1 (shares).
fn is_proportion(profile: &ColumnProfile) -> bool {
    match &profile.numeric {
        Some(stats) if stats.min >= 0.0 => {
            (stats.sum - 100.0).abs() <= 1.0 || (stats.sum - 1.0).abs() <= 0.01
        }
        _ => false,
    }
}

/// Build the chart payload for a result.
pub fn build_chart(result: &QueryResult, profiles: &[ColumnProfile], title: &str) -> Option<ChartSpec> {
    let (chart_type, x_idx, y_idx) = select_chart(profiles, result.row_count)?;

    let mut data: Vec<ChartPoint> = result
        .rows
        .iter()
        .filter_map(|row| {
            let x = row.get(x_idx)?;
            let y = row.get(y_idx)?;
            if x.is_null() || y.is_null() {
                return None;
            }
            let x = match chart_type {
                ChartType::Scatter => x.clone(),
                _ => Value::String(display_value(x)),
            };
            Some(ChartPoint { x, y: y.clone() })
        })
        .take(MAX_POINTS)
        .collect();

    if chart_type == ChartType::Line {
        // ISO dates order lexically
        data.sort_by(|a, b| display_value(&a.x).cmp(&display_value(&b.x)));
    }

    Some(ChartSpec {
        chart_type,
        title: title.to_string(),
        x_field: result.columns[x_idx].clone(),
        y_field: result.columns[y_idx].clone(),
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesis::stats::profile_columns;
    use serde_json::json;

    fn chart_for(columns: &[&str], rows: Vec<Vec<Value>>) -> Option<ChartSpec> {
        let result = QueryResult::new(columns.iter().map(|c| c.to_string()).collect(), rows, "sqlite");
        let profiles = profile_columns(&result);
        build_chart(&result, &profiles, "test")
    }

    #[test]
    fn test_date_and_numeric_is_line() {
        let chart = chart_for(
            &["week", "units"],
            vec![
                vec![json!("2024-01-08"), json!(7)],
                vec![json!("2024-01-01"), json!(5)],
            ],
        )
        .unwrap();
        assert_eq!(chart.chart_type, ChartType::Line);
        assert_eq!(chart.x_field, "week");
        assert_eq!(chart.data[0].x, json!("2024-01-01"));
    }

    #[test]
    fn test_line_wins_even_with_few_dates() {
        // two distinct dates would also qualify as bar categories
        let chart = chart_for(
            &["sale_date", "revenue"],
            vec![vec![json!("2024-01-01"), json!(1.5)], vec![json!("2024-01-02"), json!(2.5)]],
        )
        .unwrap();
        assert_eq!(chart.chart_type, ChartType::Line);
    }

    #[test]
    fn test_category_and_numeric_is_bar() {
        let chart = chart_for(
            &["region", "revenue"],
            vec![vec![json!("East"), json!(120.0)], vec![json!("West"), json!(80.5)]],
        )
        .unwrap();
        assert_eq!(chart.chart_type, ChartType::Bar);
        assert_eq!(chart.data.len(), 2);
    }

    #[test]
    fn test_shares_are_pie() {
        let chart = chart_for(
            &["brand", "share_pct"],
            vec![
                vec![json!("A"), json!(55.0)],
                vec![json!("B"), json!(30.0)],
                vec![json!("C"), json!(15.0)],
            ],
        )
        .unwrap();
        assert_eq!(chart.chart_type, ChartType::Pie);
    }

    #[test]
    fn test_too_many_categories_has_no_bar() {
        let rows = (0..25).map(|i| vec![json!(format!("item {}", i)), json!(i * 3)]).collect();
        assert!(chart_for(&["name", "units"], rows).is_none());
    }

    #[test]
    fn test_two_numeric_is_scatter() {
        let chart = chart_for(
            &["price", "units"],
            vec![vec![json!(1.5), json!(10)], vec![json!(2.0), json!(7)]],
        )
        .unwrap();
        assert_eq!(chart.chart_type, ChartType::Scatter);
        assert_eq!(chart.data[0].x, json!(1.5));
    }

    #[test]
    fn test_single_row_has_no_chart() {
        assert!(chart_for(&["region", "revenue"], vec![vec![json!("East"), json!(1)]]).is_none());
    }

    #[test]
    fn test_single_dated_row_is_line() {
        let chart = chart_for(&["sale_date", "revenue"], vec![vec![json!("2024-03-01"), json!(99.6)]]).unwrap();
        assert_eq!(chart.chart_type, ChartType::Line);
        assert_eq!(chart.data.len(), 1);
        assert_eq!(chart.data[0].x, json!("2024-03-01"));
    }

    #[test]
    fn test_empty_result_has_no_chart() {
        assert!(chart_for(&["sale_date", "revenue"], Vec::new()).is_none());
    }
}
