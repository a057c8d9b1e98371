//! Query Profile - Extracts characteristics from a SQL AST
//!
//! Used by the router to pick a backend and by the generator to classify
//! the query it produced.

use crate::sql::dialect::SqlDialect;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    Expr, GroupByExpr, ObjectName, Query, SetExpr, Statement, Visit, Visitor,
};
use sqlparser::parser::Parser;
use std::collections::HashSet;
use std::ops::ControlFlow;

/// Coarse classification of a generated query
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Select,
    Aggregate,
    Join,
    Window,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Select => "select",
            QueryType::Aggregate => "aggregate",
            QueryType::Join => "join",
            QueryType::Window => "window",
        }
    }
}

const AGGREGATE_FUNCTIONS: &[&str] = &["COUNT", "SUM", "AVG", "MIN", "MAX", "STDDEV", "VARIANCE", "MEDIAN"];

/// Query profile extracted from a SQL AST
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryProfile {
    /// Query uses Common Table Expressions (WITH clauses)
    pub uses_ctes: bool,

    pub uses_window_functions: bool,

    pub uses_case_expressions: bool,

    /// GROUP BY or an aggregate function in the query
    pub uses_aggregation: bool,

    pub uses_subqueries: bool,

    /// Number of joins across all SELECT blocks
    pub join_count: usize,

    /// Physical tables referenced (CTE names excluded), lowercased
    pub tables: Vec<String>,

    /// Query complexity score (0-100)
    pub complexity_score: u8,

    /// Parsed as a single read-only query
    pub is_read_only: bool,

    /// Parsing succeeded
    pub parsed: bool,
}

impl QueryProfile {
    /// Extract profile from SQL using the dialect's parser. Unparseable SQL
    /// yields a profile with `parsed = false` and `is_read_only = false`.
    pub fn from_sql(sql: &str, dialect: SqlDialect) -> Self {
        let parser_dialect = dialect.parser_dialect();
        match Parser::parse_sql(parser_dialect.as_ref(), sql) {
            Ok(statements) => Self::from_statements(&statements),
            Err(e) => {
                tracing::debug!("SQL parsing failed during profiling: {}", e);
                Self::default()
            }
        }
    }

    pub fn from_statements(statements: &[Statement]) -> Self {
        let mut profile = Self {
            parsed: true,
            is_read_only: statements.len() == 1
                && matches!(statements[0], Statement::Query(_)),
            ..Self::default()
        };

        let mut collector = ProfileCollector::default();
        for statement in statements {
            let _ = statement.visit(&mut collector);
        }

        profile.uses_ctes = !collector.cte_names.is_empty();
        profile.uses_window_functions = collector.window_functions;
        profile.uses_case_expressions = collector.case_expressions;
        profile.uses_aggregation = collector.aggregation;
        profile.uses_subqueries = collector.query_blocks > 1 + collector.cte_names.len();
        profile.join_count = collector.joins;

        let mut seen = HashSet::new();
        for table in collector.relations {
            if !collector.cte_names.contains(&table) && seen.insert(table.clone()) {
                profile.tables.push(table);
            }
        }

        profile.complexity_score = profile.score();
        profile
    }

    fn score(&self) -> u8 {
        let mut complexity = 0usize;
        if self.uses_ctes {
            complexity += 10;
        }
        if self.uses_window_functions {
            complexity += 15;
        }
        if self.uses_case_expressions {
            complexity += 5;
        }
        if self.uses_aggregation {
            complexity += 10;
        }
        if self.uses_subqueries {
            complexity += 10;
        }
        complexity += (self.join_count * 5).min(30);
        complexity.min(100) as u8
    }

    /// Window beats join beats aggregate beats plain select.
    pub fn query_type(&self) -> QueryType {
        if self.uses_window_functions {
            QueryType::Window
        } else if self.join_count > 0 {
            QueryType::Join
        } else if self.uses_aggregation {
            QueryType::Aggregate
        } else {
            QueryType::Select
        }
    }
}

#[derive(Default)]
struct ProfileCollector {
    cte_names: HashSet<String>,
    relations: Vec<String>,
    joins: usize,
    query_blocks: usize,
    window_functions: bool,
    case_expressions: bool,
    aggregation: bool,
}

impl ProfileCollector {
    fn inspect_set_expr(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                for table in &select.from {
                    self.joins += table.joins.len();
                }
                // comma joins count too
                self.joins += select.from.len().saturating_sub(1);
                let grouped = match &select.group_by {
                    GroupByExpr::All => true,
                    GroupByExpr::Expressions(exprs) => !exprs.is_empty(),
                };
                if grouped || select.having.is_some() {
                    self.aggregation = true;
                }
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.inspect_set_expr(left);
                self.inspect_set_expr(right);
            }
            _ => {}
        }
    }
}

impl Visitor for ProfileCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        self.query_blocks += 1;
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.cte_names.insert(cte.alias.name.value.to_lowercase());
            }
        }
        self.inspect_set_expr(&query.body);
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        self.relations.push(relation_name(relation));
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Function(func) => {
                if func.over.is_some() {
                    self.window_functions = true;
                } else {
                    let name = func.name.to_string().to_uppercase();
                    if AGGREGATE_FUNCTIONS.contains(&name.as_str()) {
                        self.aggregation = true;
                    }
                }
            }
            Expr::Case { .. } => self.case_expressions = true,
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

/// Lowercased relation name with identifier quotes stripped.
pub fn relation_name(name: &ObjectName) -> String {
    name.0
        .iter()
        .map(|ident| ident.value.to_lowercase())
        .collect::<Vec<_>>()
        .join(".")
}

/// Last part of a possibly qualified table name.
pub fn base_table_name(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_select() {
        let profile = QueryProfile::from_sql("SELECT upc, price FROM products WHERE upc = '1'", SqlDialect::Sqlite);
        assert!(profile.parsed);
        assert!(profile.is_read_only);
        assert_eq!(profile.tables, vec!["products".to_string()]);
        assert_eq!(profile.query_type(), QueryType::Select);
    }

    #[test]
    fn test_aggregate_and_join_classification() {
        let agg = QueryProfile::from_sql(
            "SELECT category, AVG(price) FROM products GROUP BY category",
            SqlDialect::Sqlite,
        );
        assert_eq!(agg.query_type(), QueryType::Aggregate);

        let join = QueryProfile::from_sql(
            "SELECT p.upc, h.price FROM products p JOIN price_history h ON p.upc = h.upc",
            SqlDialect::Sqlite,
        );
        assert_eq!(join.join_count, 1);
        assert_eq!(join.query_type(), QueryType::Join);
        assert_eq!(join.tables, vec!["products".to_string(), "price_history".to_string()]);
    }

    #[test]
    fn test_window_and_cte() {
        let profile = QueryProfile::from_sql(
            "WITH ranked AS (SELECT upc, RANK() OVER (ORDER BY price DESC) AS r FROM products) \
             SELECT * FROM ranked WHERE r <= 5",
            SqlDialect::Sqlite,
        );
        assert!(profile.uses_ctes);
        assert!(profile.uses_window_functions);
        assert_eq!(profile.tables, vec!["products".to_string()]);
        assert_eq!(profile.query_type(), QueryType::Window);
    }

    #[test]
    fn test_write_statement_not_read_only() {
        let profile = QueryProfile::from_sql("DELETE FROM products", SqlDialect::Sqlite);
        assert!(profile.parsed);
        assert!(!profile.is_read_only);
    }

    #[test]
    fn test_unparseable() {
        let profile = QueryProfile::from_sql("SELEC upc FROM", SqlDialect::Sqlite);
        assert!(!profile.parsed);
        assert!(!profile.is_read_only);
    }
}
