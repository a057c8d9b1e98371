//! Pattern-based SQL generation
//!
//! Deterministic fallback when the language model is unavailable or its
//! output keeps failing validation. A shape is chosen from `(intent,
//! complexity)`, refined by question signals, then filled from the column
//! roles of the best-matching table in the context. Entity values only ever
//! enter the statement as escaped literals.

use crate::analyzer::{Complexity, EntityKind, ExtractedEntity, Intent, ProcessedQuestion};
use crate::context::QueryContext;
use crate::metadata::{is_safe_identifier, SchemaInfo};
use crate::sql::dialect::SqlDialect;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Names that are quoted when used as identifiers.
const QUOTED_NAMES: &[&str] = &[
    "select", "from", "where", "group", "order", "by", "limit", "table", "date", "time",
    "timestamp", "user", "key", "value", "desc", "asc", "index", "count",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TemplateShape {
    Lookup,
    GroupedAggregate,
    TimeSeries,
    Ranking,
    Comparison,
}

/// Template table keyed by intent and complexity.
pub fn shape_for(intent: Intent, complexity: Complexity) -> TemplateShape {
    use TemplateShape::*;
    match (intent, complexity) {
        (Intent::Pricing, Complexity::Simple) => Lookup,
        (Intent::Pricing, Complexity::Moderate) => Ranking,
        (Intent::Pricing, Complexity::Complex) => Comparison,
        (Intent::Elasticity, Complexity::Simple) => Lookup,
        (Intent::Elasticity, Complexity::Moderate | Complexity::Complex) => TimeSeries,
        (Intent::Competitive, Complexity::Simple) => Lookup,
        (Intent::Competitive, Complexity::Moderate | Complexity::Complex) => Comparison,
        (Intent::Sales, Complexity::Simple | Complexity::Moderate) => GroupedAggregate,
        (Intent::Sales, Complexity::Complex) => Comparison,
        (Intent::Margin, Complexity::Simple) => Lookup,
        (Intent::Margin, Complexity::Moderate) => GroupedAggregate,
        (Intent::Margin, Complexity::Complex) => Comparison,
        (Intent::Other, Complexity::Simple) => Lookup,
        (Intent::Other, Complexity::Moderate | Complexity::Complex) => GroupedAggregate,
    }
}

/// Measure-name preferences per intent, most specific first.
fn measure_preferences(intent: Intent) -> &'static [&'static str] {
    match intent {
        Intent::Pricing => &["price", "cost"],
        Intent::Elasticity => &["elasticity", "price"],
        Intent::Competitive => &["competitor_price", "price"],
        Intent::Sales => &["revenue", "sales", "units", "quantity", "amount"],
        Intent::Margin => &["margin", "profit"],
        Intent::Other => &[],
    }
}

fn label_preferences(intent: Intent) -> &'static [&'static str] {
    match intent {
        Intent::Competitive => &["competitor", "retailer", "store"],
        Intent::Pricing | Intent::Elasticity | Intent::Sales | Intent::Margin | Intent::Other => {
            &["category", "brand", "name", "store", "region"]
        }
    }
}

pub fn is_numeric_type(data_type: &str) -> bool {
    let upper = data_type.to_uppercase();
    let polars_like = {
        let mut chars = upper.chars();
        matches!(chars.next(), Some('I') | Some('U') | Some('F'))
            && upper.len() > 1
            && upper[1..].chars().all(|c| c.is_ascii_digit())
    };
    polars_like
        || ["INT", "REAL", "FLOA", "DOUB", "DEC", "NUM"]
            .iter()
            .any(|t| upper.contains(t))
}

pub fn is_temporal(name: &str, data_type: &str) -> bool {
    let upper = data_type.to_uppercase();
    let lower = name.to_lowercase();
    upper.contains("DATE")
        || upper.contains("TIME")
        || lower.contains("date")
        || lower.ends_with("_at")
        || ["day", "week", "month", "year", "period"].contains(&lower.as_str())
}

pub fn is_identifier_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    ["upc", "sku", "gtin", "ean", "id", "code"].contains(&lower.as_str())
        || ["_id", "_upc", "_code", "_sku"].iter().any(|s| lower.ends_with(s))
}

/// Column roles for one table.
#[derive(Debug)]
struct TableRoles<'a> {
    schema: &'a SchemaInfo,
    identifiers: Vec<&'a str>,
    measures: Vec<&'a str>,
    dates: Vec<&'a str>,
    labels: Vec<&'a str>,
}

impl<'a> TableRoles<'a> {
    fn new(schema: &'a SchemaInfo) -> Self {
        let mut roles = TableRoles {
            schema,
            identifiers: Vec::new(),
            measures: Vec::new(),
            dates: Vec::new(),
            labels: Vec::new(),
        };
        for column in &schema.columns {
            let name = column.name.as_str();
            if is_identifier_name(name) {
                roles.identifiers.push(name);
            } else if is_temporal(name, &column.data_type) {
                roles.dates.push(name);
            } else if is_numeric_type(&column.data_type) {
                roles.measures.push(name);
            } else {
                roles.labels.push(name);
            }
        }
        roles
    }

    fn measure(&self, intent: Intent) -> Option<&'a str> {
        measure_preferences(intent)
            .iter()
            .find_map(|pref| self.measures.iter().find(|m| m.to_lowercase().contains(pref)))
            .or_else(|| self.measures.first())
            .copied()
    }

    fn has_preferred_measure(&self, intent: Intent) -> bool {
        measure_preferences(intent)
            .iter()
            .any(|pref| self.measures.iter().any(|m| m.to_lowercase().contains(pref)))
    }

    /// Label column, preferring one whose sample values contain `values`.
    fn label(&self, intent: Intent, values: &[&str]) -> Option<&'a str> {
        if !values.is_empty() {
            for label in &self.labels {
                let Some(idx) = self.schema.columns.iter().position(|c| c.name == *label) else {
                    continue;
                };
                let matches = self.schema.sample_rows.iter().any(|row| {
                    row.get(idx)
                        .and_then(|v| v.as_str())
                        .map(|s| {
                            let s = s.to_lowercase();
                            values.iter().any(|v| s.contains(&v.to_lowercase()))
                        })
                        .unwrap_or(false)
                });
                if matches {
                    return Some(*label);
                }
            }
        }
        label_preferences(intent)
            .iter()
            .find_map(|pref| self.labels.iter().find(|l| l.to_lowercase().contains(pref)))
            .or_else(|| self.labels.first())
            .copied()
    }

    fn identifier_for(&self, entity: &ExtractedEntity) -> Option<&'a str> {
        entity
            .column_hint
            .as_deref()
            .and_then(|hint| self.identifiers.iter().find(|c| c.eq_ignore_ascii_case(hint)))
            .or_else(|| self.identifiers.first())
            .copied()
    }
}

/// SQL produced by a template, before validation.
#[derive(Debug, Clone)]
pub struct TemplateSql {
    pub sql: String,
    pub shape: TemplateShape,
    pub table: String,
}

#[derive(Debug, Clone)]
pub struct TemplateGenerator {
    default_limit: usize,
}

impl TemplateGenerator {
    pub fn new(default_limit: usize) -> Self {
        Self {
            default_limit: default_limit.max(1),
        }
    }

    pub fn generate(&self, pq: &ProcessedQuestion, context: &QueryContext, dialect: SqlDialect) -> Option<TemplateSql> {
        let roles = self.pick_table(pq, context)?;
        let intent = pq.intent;

        let mut shape = shape_for(intent, pq.complexity);
        if pq.signals.trend && !roles.dates.is_empty() {
            shape = TemplateShape::TimeSeries;
        } else if pq.signals.ranking_limit.is_some() {
            shape = TemplateShape::Ranking;
        }

        let categories: Vec<&str> = pq
            .entities_of(EntityKind::Category)
            .map(|e| e.value.as_str())
            .collect();
        let measure = roles.measure(intent);
        let label = roles.label(intent, &categories);
        let date = roles.dates.first().copied();

        // degrade when the table lacks the columns a shape needs
        shape = match shape {
            TemplateShape::TimeSeries if date.is_none() || measure.is_none() => TemplateShape::GroupedAggregate,
            other => other,
        };
        shape = match shape {
            TemplateShape::Comparison | TemplateShape::GroupedAggregate if measure.is_none() => TemplateShape::Lookup,
            TemplateShape::Comparison if label.is_none() => TemplateShape::GroupedAggregate,
            TemplateShape::Ranking if measure.is_none() => TemplateShape::Lookup,
            other => other,
        };

        let filters = self.filters(pq, &roles, label, measure, date, dialect);
        let where_clause = if filters.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", filters.join(" AND "))
        };
        let table = ident(&roles.schema.table_name);
        let limit = pq.signals.ranking_limit.unwrap_or(self.default_limit);
        let aggregate = match intent {
            Intent::Sales => "SUM",
            Intent::Pricing | Intent::Elasticity | Intent::Competitive | Intent::Margin | Intent::Other => "AVG",
        };
        let direction = if pq.signals.ascending { "ASC" } else { "DESC" };

        let sql = match shape {
            TemplateShape::Lookup => {
                let mut columns: Vec<&str> = Vec::new();
                columns.extend(roles.identifiers.iter().take(1));
                columns.extend(roles.labels.iter().take(2));
                columns.extend(measure);
                columns.extend(date);
                if columns.is_empty() {
                    columns = roles.schema.columns.iter().take(8).map(|c| c.name.as_str()).collect();
                }
                let select = columns.iter().map(|c| ident(c)).join(", ");
                match (pq.signals.latest, date) {
                    (true, Some(d)) => format!(
                        "SELECT {} FROM {}{} ORDER BY {} DESC LIMIT 1",
                        select,
                        table,
                        where_clause,
                        ident(d)
                    ),
                    _ => format!("SELECT {} FROM {}{} LIMIT {}", select, table, where_clause, limit),
                }
            }
            TemplateShape::GroupedAggregate => {
                let m = measure?;
                let alias = aggregate_alias(aggregate, m);
                match label {
                    Some(l) => format!(
                        "SELECT {l}, {agg}({m}) AS {alias} FROM {t}{w} GROUP BY {l} ORDER BY {alias} {dir} LIMIT {n}",
                        l = ident(l),
                        agg = aggregate,
                        m = ident(m),
                        alias = alias,
                        t = table,
                        w = where_clause,
                        dir = direction,
                        n = limit
                    ),
                    None => format!(
                        "SELECT {}({}) AS {} FROM {}{}",
                        aggregate,
                        ident(m),
                        alias,
                        table,
                        where_clause
                    ),
                }
            }
            TemplateShape::TimeSeries => {
                let (d, m) = (date?, measure?);
                let alias = aggregate_alias(aggregate, m);
                format!(
                    "SELECT {d}, {agg}({m}) AS {alias} FROM {t}{w} GROUP BY {d} ORDER BY {d} LIMIT {n}",
                    d = ident(d),
                    agg = aggregate,
                    m = ident(m),
                    alias = alias,
                    t = table,
                    w = where_clause,
                    n = limit
                )
            }
            TemplateShape::Ranking => {
                let m = measure?;
                let mut columns: Vec<&str> = Vec::new();
                columns.extend(roles.identifiers.iter().take(1));
                columns.extend(label);
                columns.push(m);
                let select = columns.iter().map(|c| ident(c)).join(", ");
                format!(
                    "SELECT {} FROM {}{} ORDER BY {} {} LIMIT {}",
                    select,
                    table,
                    where_clause,
                    ident(m),
                    direction,
                    limit
                )
            }
            TemplateShape::Comparison => {
                let (l, m) = (label?, measure?);
                let lower_m = m.to_lowercase();
                format!(
                    "SELECT {l}, {agg}({m}) AS {agg_l}_{lm}, MIN({m}) AS min_{lm}, MAX({m}) AS max_{lm} \
                     FROM {t}{w} GROUP BY {l} ORDER BY {agg_l}_{lm} {dir} LIMIT {n}",
                    l = ident(l),
                    agg = aggregate,
                    agg_l = aggregate.to_lowercase(),
                    m = ident(m),
                    lm = lower_m,
                    t = table,
                    w = where_clause,
                    dir = direction,
                    n = limit
                )
            }
        };

        debug!("Template {:?} on {}: {}", shape, roles.schema.table_name, sql);
        Some(TemplateSql {
            sql,
            shape,
            table: roles.schema.table_name.clone(),
        })
    }

    /// Best table for the question: hinted tables first, then intent measures,
    /// identifier columns and dates. Ties go to context order.
    fn pick_table<'a>(&self, pq: &ProcessedQuestion, context: &'a QueryContext) -> Option<TableRoles<'a>> {
        let hinted: Vec<&SchemaInfo> = context
            .schemas
            .iter()
            .filter(|s| pq.table_hints.iter().any(|h| h.eq_ignore_ascii_case(&s.table_name)))
            .collect();
        let candidates: Vec<&SchemaInfo> = if hinted.is_empty() {
            context.schemas.iter().collect()
        } else {
            hinted
        };

        let has_identifier = pq.has_entity(EntityKind::Identifier);
        let mut best: Option<(i32, TableRoles<'a>)> = None;
        for schema in candidates {
            let roles = TableRoles::new(schema);
            let mut score = 0;
            if roles.has_preferred_measure(pq.intent) {
                score += 5;
            } else if !roles.measures.is_empty() {
                score += 1;
            }
            if has_identifier && !roles.identifiers.is_empty() {
                score += 3;
            }
            if pq.signals.trend && !roles.dates.is_empty() {
                score += 2;
            }
            if pq.has_entity(EntityKind::Category) && !roles.labels.is_empty() {
                score += 1;
            }
            if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                best = Some((score, roles));
            }
        }
        best.map(|(_, roles)| roles)
    }

    fn filters(
        &self,
        pq: &ProcessedQuestion,
        roles: &TableRoles<'_>,
        label: Option<&str>,
        measure: Option<&str>,
        date: Option<&str>,
        dialect: SqlDialect,
    ) -> Vec<String> {
        let mut filters = Vec::new();

        for entity in pq.entities_of(EntityKind::Identifier) {
            if let Some(column) = roles.identifier_for(entity) {
                filters.push(format!("{} = {}", ident(column), quote_literal(&entity.value)));
            }
        }

        if let Some(l) = label {
            let likes: Vec<String> = pq
                .entities_of(EntityKind::Category)
                .map(|e| format!("lower({}) LIKE {}", ident(l), quote_literal(&format!("%{}%", e.value.to_lowercase()))))
                .collect();
            match likes.len() {
                0 => {}
                1 => filters.extend(likes),
                _ => filters.push(format!("({})", likes.join(" OR "))),
            }
        }

        if let Some(d) = date {
            for entity in pq.entities_of(EntityKind::Date) {
                let prefix = prefix_before(&pq.raw, entity.span.0);
                if entity.value.len() == 4 {
                    let Ok(year) = entity.value.parse::<i32>() else {
                        continue;
                    };
                    filters.push(format!(
                        "{d} >= {} AND {d} < {}",
                        date_literal(dialect, &format!("{}-01-01", year)),
                        date_literal(dialect, &format!("{}-01-01", year + 1)),
                        d = ident(d)
                    ));
                } else {
                    let op = if ["since", "after", "from"].iter().any(|w| prefix.ends_with(w)) {
                        ">="
                    } else if ["before", "until", "prior to"].iter().any(|w| prefix.ends_with(w)) {
                        "<"
                    } else {
                        "="
                    };
                    filters.push(format!("{} {} {}", ident(d), op, date_literal(dialect, &entity.value)));
                }
            }
        }

        if let Some(m) = measure {
            for entity in pq.entities.iter().filter(|e| {
                matches!(e.kind, EntityKind::Currency | EntityKind::Percentage | EntityKind::Number)
            }) {
                let prefix = prefix_before(&pq.raw, entity.span.0);
                let Some(op) = comparator(&prefix) else {
                    continue;
                };
                if entity.value.parse::<f64>().is_ok() {
                    filters.push(format!("{} {} {}", ident(m), op, entity.value));
                }
            }
        }

        filters
    }
}

fn prefix_before(raw: &str, pos: usize) -> String {
    let head = raw.get(..pos).unwrap_or("");
    let tail: Vec<char> = head.chars().rev().take(24).collect();
    tail.into_iter()
        .rev()
        .collect::<String>()
        .trim_end_matches(|c: char| c == '$' || c.is_whitespace())
        .to_lowercase()
}

fn comparator(prefix: &str) -> Option<&'static str> {
    const TABLE: &[(&str, &str)] = &[
        ("at least", ">="),
        ("at most", "<="),
        ("more than", ">"),
        ("greater than", ">"),
        ("higher than", ">"),
        ("above", ">"),
        ("over", ">"),
        ("exceeding", ">"),
        ("less than", "<"),
        ("lower than", "<"),
        ("cheaper than", "<"),
        ("below", "<"),
        ("under", "<"),
    ];
    TABLE
        .iter()
        .find(|(phrase, _)| prefix.ends_with(phrase))
        .map(|(_, op)| *op)
}

/// Identifier as written in generated SQL.
pub fn ident(name: &str) -> String {
    if is_safe_identifier(name) && !QUOTED_NAMES.contains(&name.to_lowercase().as_str()) {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// `sum_revenue` style alias for an aggregated column, quoted when needed.
fn aggregate_alias(aggregate: &str, column: &str) -> String {
    let name: String = format!("{}_{}", aggregate, column)
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    ident(&name)
}

/// Single-quoted SQL string literal.
pub fn quote_literal(value: &str) -> String {
    let cleaned: String = value.chars().filter(|c| !c.is_control()).collect();
    format!("'{}'", cleaned.replace('\'', "''"))
}

fn date_literal(dialect: SqlDialect, value: &str) -> String {
    match dialect {
        SqlDialect::Trino => format!("DATE {}", quote_literal(value)),
        SqlDialect::Sqlite | SqlDialect::Polars => quote_literal(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::QuestionAnalyzer;
    use crate::context::ContextSource;
    use crate::metadata::ColumnInfo;
    use crate::sql::validator::SqlValidator;

    fn col(name: &str, data_type: &str) -> ColumnInfo {
        ColumnInfo {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
        }
    }

    fn context() -> QueryContext {
        let mut products = SchemaInfo::new(
            "products",
            vec![
                col("upc", "TEXT"),
                col("product_name", "TEXT"),
                col("brand", "TEXT"),
                col("category", "TEXT"),
                col("price", "REAL"),
            ],
        );
        products.sample_rows = vec![vec![
            "0020282000000".into(),
            "Cola 12oz".into(),
            "Fizz".into(),
            "Soda".into(),
            serde_json::json!(2.49),
        ]];
        let sales = SchemaInfo::new(
            "store_sales",
            vec![
                col("upc", "TEXT"),
                col("store", "TEXT"),
                col("sale_date", "TEXT"),
                col("units", "INTEGER"),
                col("revenue", "REAL"),
            ],
        );
        QueryContext {
            schemas: vec![sales, products],
            examples: vec![],
            rules: vec![],
            token_budget: 1500,
            tokens_used: 0,
            source: ContextSource::LiveSchema,
            warnings: vec![],
        }
    }

    fn generate(question: &str) -> TemplateSql {
        let pq = QuestionAnalyzer::new(vec!["products".into(), "store_sales".into()]).analyze(question);
        TemplateGenerator::new(100)
            .generate(&pq, &context(), SqlDialect::Sqlite)
            .unwrap()
    }

    #[test]
    fn test_every_intent_and_complexity_has_a_shape() {
        let intents = [
            Intent::Pricing,
            Intent::Elasticity,
            Intent::Competitive,
            Intent::Sales,
            Intent::Margin,
            Intent::Other,
        ];
        for intent in intents {
            for complexity in [Complexity::Simple, Complexity::Moderate, Complexity::Complex] {
                let _ = shape_for(intent, complexity);
            }
        }
        assert_eq!(shape_for(Intent::Pricing, Complexity::Simple), TemplateShape::Lookup);
    }

    #[test]
    fn test_upc_lookup() {
        let template = generate("What is the price for UPC 0020282000000?");
        assert_eq!(template.shape, TemplateShape::Lookup);
        assert_eq!(template.table, "products");
        assert_eq!(
            template.sql,
            "SELECT upc, product_name, brand, price FROM products WHERE upc = '0020282000000' LIMIT 100"
        );
    }

    #[test]
    fn test_sales_aggregate_by_store() {
        let template = generate("total revenue by store");
        assert_eq!(template.table, "store_sales");
        assert_eq!(template.shape, TemplateShape::GroupedAggregate);
        assert!(template.sql.starts_with("SELECT store, SUM(revenue) AS sum_revenue FROM store_sales"));
        assert!(template.sql.contains("GROUP BY store"));
    }

    #[test]
    fn test_trend_uses_date_column() {
        let template = generate("daily revenue trend");
        assert_eq!(template.shape, TemplateShape::TimeSeries);
        assert!(template.sql.contains("GROUP BY sale_date ORDER BY sale_date"));
    }

    #[test]
    fn test_category_value_is_escaped_literal() {
        let template = generate("price of 'O'Brien''s'); DROP TABLE x; --' soda");
        assert!(!template.sql.contains("DROP TABLE x; --'"));
        assert!(template.sql.contains("LIKE '%"));
    }

    #[test]
    fn test_ranking_with_threshold() {
        let template = generate("top 3 cheapest products with price under $5");
        assert_eq!(template.shape, TemplateShape::Ranking);
        assert!(template.sql.contains("price < 5"));
        assert!(template.sql.ends_with("ORDER BY price ASC LIMIT 3"));
    }

    #[test]
    fn test_literal_and_identifier_quoting() {
        assert_eq!(quote_literal("O'Brien"), "'O''Brien'");
        assert_eq!(ident("price"), "price");
        assert_eq!(ident("date"), "\"date\"");
        assert_eq!(ident("unit price"), "\"unit price\"");
    }

    #[test]
    fn test_aggregate_alias_with_awkward_column_name() {
        let sales = SchemaInfo::new(
            "store_sales",
            vec![col("store", "TEXT"), col("sale_date", "TEXT"), col("Net Revenue", "REAL")],
        );
        let context = QueryContext {
            schemas: vec![sales],
            ..context()
        };
        let pq = QuestionAnalyzer::new(vec!["store_sales".into()]).analyze("total revenue by store");
        let template = TemplateGenerator::new(100)
            .generate(&pq, &context, SqlDialect::Sqlite)
            .unwrap();

        assert!(template.sql.contains("SUM(\"Net Revenue\") AS sum_net_revenue"), "{}", template.sql);
        let validated = SqlValidator::new(SqlDialect::Sqlite).validate(&template.sql, &context.schemas);
        assert!(validated.is_ok(), "{}: {:?}", template.sql, validated.err());

        assert_eq!(aggregate_alias("SUM", "units sold"), "sum_units_sold");
        assert_eq!(aggregate_alias("AVG", "price"), "avg_price");
    }

    #[test]
    fn test_column_roles() {
        assert!(is_numeric_type("REAL"));
        assert!(is_numeric_type("i64"));
        assert!(is_numeric_type("f64"));
        assert!(!is_numeric_type("TEXT"));
        assert!(!is_numeric_type("str"));
        assert!(is_temporal("sale_date", "TEXT"));
        assert!(is_identifier_name("store_id"));
    }
}
