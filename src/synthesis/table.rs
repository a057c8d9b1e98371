//! Result table rendering

use crate::error::{AgentError, Result};
use crate::execution::result::QueryResult;
use crate::synthesis::stats::display_value;
use serde::{Deserialize, Serialize};

/// Cell text wider than this is cut in the text rendering.
const MAX_CELL_WIDTH: usize = 60;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TableFormat {
    #[default]
    Html,
    Text,
    Csv,
}

impl TableFormat {
    pub fn parse(value: &str) -> Option<TableFormat> {
        match value.trim().to_lowercase().as_str() {
            "html" => Some(TableFormat::Html),
            "text" | "txt" | "ascii" => Some(TableFormat::Text),
            "csv" => Some(TableFormat::Csv),
            _ => None,
        }
    }
}

/// Render at most `max_rows` rows of the result.
pub fn render_table(result: &QueryResult, format: TableFormat, max_rows: usize) -> Result<String> {
    let rows: Vec<Vec<String>> = result
        .rows
        .iter()
        .take(max_rows)
        .map(|row| row.iter().map(display_value).collect())
        .collect();
    let hidden = result.rows.len().saturating_sub(rows.len());

    match format {
        TableFormat::Html => Ok(render_html(&result.columns, &rows, hidden)),
        TableFormat::Text => Ok(render_text(&result.columns, &rows, hidden)),
        TableFormat::Csv => render_csv(&result.columns, &rows),
    }
}

fn render_html(columns: &[String], rows: &[Vec<String>], hidden: usize) -> String {
    let mut out = String::from("<table class=\"result-table\">\n<thead><tr>");
    for column in columns {
        out.push_str(&format!("<th>{}</th>", escape_html(column)));
    }
    out.push_str("</tr></thead>\n<tbody>\n");
    for row in rows {
        out.push_str("<tr>");
        for cell in row {
            out.push_str(&format!("<td>{}</td>", escape_html(cell)));
        }
        out.push_str("</tr>\n");
    }
    out.push_str("</tbody>\n</table>");
    if hidden > 0 {
        out.push_str(&format!("\n<p class=\"truncated\">{} more rows not shown</p>", hidden));
    }
    out
}

fn render_text(columns: &[String], rows: &[Vec<String>], hidden: usize) -> String {
    let cut = |value: &str| -> String {
        if value.chars().count() > MAX_CELL_WIDTH {
            let head: String = value.chars().take(MAX_CELL_WIDTH - 3).collect();
            format!("{}...", head)
        } else {
            value.to_string()
        }
    };
    let rows: Vec<Vec<String>> = rows.iter().map(|r| r.iter().map(|c| cut(c)).collect()).collect();

    let mut widths: Vec<usize> = columns.iter().map(|c| c.chars().count()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(i) {
                *width = (*width).max(cell.chars().count());
            }
        }
    }

    let line = |cells: &[String]| -> String {
        let padded: Vec<String> = cells
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{:<width$}", c, width = widths.get(i).copied().unwrap_or(0)))
            .collect();
        format!("| {} |", padded.join(" | "))
    };

    let mut out = String::new();
    out.push_str(&line(columns));
    out.push('\n');
    let separator: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    out.push_str(&format!("|-{}-|", separator.join("-+-")));
    for row in &rows {
        out.push('\n');
        out.push_str(&line(row));
    }
    if rows.is_empty() {
        out.push_str("\n(no rows)");
    }
    if hidden > 0 {
        out.push_str(&format!("\n... {} more rows", hidden));
    }
    out
}

fn render_csv(columns: &[String], rows: &[Vec<String>]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(columns)
        .map_err(|e| AgentError::SynthesisDegraded(format!("CSV rendering failed: {}", e)))?;
    for row in rows {
        writer
            .write_record(row)
            .map_err(|e| AgentError::SynthesisDegraded(format!("CSV rendering failed: {}", e)))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| AgentError::SynthesisDegraded(format!("CSV rendering failed: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| AgentError::SynthesisDegraded(format!("CSV rendering failed: {}", e)))
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> QueryResult {
        QueryResult::new(
            vec!["product_name".into(), "price".into()],
            vec![
                vec![json!("Cola <12oz>"), json!(2.49)],
                vec![json!("Chips, \"BBQ\""), json!(3.0)],
                vec![json!("Water"), serde_json::Value::Null],
            ],
            "sqlite",
        )
    }

    #[test]
    fn test_html_escapes_cells() {
        let html = render_table(&sample(), TableFormat::Html, 50).unwrap();
        assert!(html.contains("<th>product_name</th>"));
        assert!(html.contains("<td>Cola &lt;12oz&gt;</td><td>2.49</td>"));
        assert!(!html.contains("<12oz>"));
    }

    #[test]
    fn test_text_alignment_and_hidden_rows() {
        let text = render_table(&sample(), TableFormat::Text, 2).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "| product_name | price |");
        assert_eq!(lines[2], "| Cola <12oz>  | 2.49  |");
        assert_eq!(lines.last().copied(), Some("... 1 more rows"));
    }

    #[test]
    fn test_csv_quotes_fields() {
        let csv = render_table(&sample(), TableFormat::Csv, 50).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "product_name,price");
        assert_eq!(lines[2], "\"Chips, \"\"BBQ\"\"\",3");
        assert_eq!(lines[3], "Water,");
    }

    #[test]
    fn test_parse_format() {
        assert_eq!(TableFormat::parse("CSV"), Some(TableFormat::Csv));
        assert_eq!(TableFormat::parse("ascii"), Some(TableFormat::Text));
        assert_eq!(TableFormat::parse("pdf"), None);
    }
}
