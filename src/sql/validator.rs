//! SQL validation
//!
//! Three checks, applied to every statement regardless of who wrote it:
//! the modifying-keyword safety rule, single well-formed query for the target
//! dialect, and name resolution against known schemas.

use crate::execution::profile::{base_table_name, relation_name, QueryProfile, QueryType};
use crate::metadata::SchemaInfo;
use crate::sql::dialect::SqlDialect;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{Expr, Query, SelectItem, SetExpr, Statement, TableFactor, Visit, Visitor};
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::HashSet;
use std::ops::ControlFlow;
use tracing::debug;

/// Keywords that modify data, schema, permissions or the database itself.
pub const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "TRUNCATE", "GRANT", "REVOKE", "CREATE",
    "MERGE", "UPSERT", "ATTACH", "DETACH", "PRAGMA", "VACUUM", "REINDEX",
];

/// Identifiers accepted without a backing column.
const PSEUDO_COLUMNS: &[&str] = &[
    "current_date", "current_time", "current_timestamp", "rowid", "null", "true", "false",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Modifying keyword present
    Unsafe(String),
    /// Does not parse for the dialect
    Syntax(String),
    /// Parses, but is not exactly one SELECT query
    NotSingleQuery(String),
    UnknownTables(Vec<String>),
    UnknownColumns(Vec<String>),
}

impl ValidationError {
    pub fn is_unsafe(&self) -> bool {
        matches!(self, ValidationError::Unsafe(_))
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(
            self,
            ValidationError::UnknownTables(_) | ValidationError::UnknownColumns(_)
        )
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Unsafe(reason) => write!(f, "unsafe statement: {}", reason),
            ValidationError::Syntax(detail) => write!(f, "syntax error: {}", detail),
            ValidationError::NotSingleQuery(detail) => write!(f, "{}", detail),
            ValidationError::UnknownTables(tables) => {
                write!(f, "unknown tables: {}", tables.join(", "))
            }
            ValidationError::UnknownColumns(columns) => {
                write!(f, "unknown columns: {}", columns.join(", "))
            }
        }
    }
}

/// A statement that passed every check.
#[derive(Debug, Clone)]
pub struct ValidatedSql {
    pub sql: String,
    pub profile: QueryProfile,
    /// Distinct column references found in the statement
    pub referenced_columns: usize,
    /// ... of which resolved against a known table
    pub resolved_columns: usize,
    pub warnings: Vec<String>,
}

impl ValidatedSql {
    /// Share of referenced columns found in the known schemas (1.0 when none).
    pub fn column_ratio(&self) -> f64 {
        if self.referenced_columns == 0 {
            1.0
        } else {
            self.resolved_columns as f64 / self.referenced_columns as f64
        }
    }
}

/// Outcome reported by `POST /validate-sql`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_type: Option<String>,
}

/// Reject any statement with a modifying keyword outside literals and comments.
pub fn check_safety(sql: &str, dialect: SqlDialect) -> Result<(), ValidationError> {
    let parser_dialect = dialect.parser_dialect();
    let tokens = Tokenizer::new(parser_dialect.as_ref(), sql)
        .tokenize()
        .map_err(|e| ValidationError::Unsafe(format!("statement could not be tokenized: {}", e)))?;

    for token in &tokens {
        if let Token::Word(word) = token {
            if word.quote_style.is_some() {
                continue;
            }
            let upper = word.value.to_uppercase();
            if FORBIDDEN_KEYWORDS.contains(&upper.as_str()) {
                return Err(ValidationError::Unsafe(format!(
                    "contains forbidden keyword {}",
                    upper
                )));
            }
        }
    }
    Ok(())
}

/// True when the text carries a modifying keyword as a bare word, whatever
/// the surrounding syntax. Used for questions and for the keyword property.
pub fn contains_forbidden_word(text: &str) -> bool {
    text.split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .any(|word| FORBIDDEN_KEYWORDS.contains(&word.to_uppercase().as_str()))
}

fn find_schema<'a>(schemas: &'a [SchemaInfo], table: &str) -> Option<&'a SchemaInfo> {
    schemas
        .iter()
        .find(|s| s.table_name.eq_ignore_ascii_case(base_table_name(table)))
}

pub struct SqlValidator {
    dialect: SqlDialect,
}

impl SqlValidator {
    pub fn new(dialect: SqlDialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    /// Safety, syntax and single-query checks, no name resolution.
    pub fn parse(&self, sql: &str) -> Result<Statement, ValidationError> {
        check_safety(sql, self.dialect)?;

        let parser_dialect = self.dialect.parser_dialect();
        let mut statements = Parser::parse_sql(parser_dialect.as_ref(), sql)
            .map_err(|e| ValidationError::Syntax(e.to_string()))?;

        if statements.len() != 1 {
            return Err(ValidationError::NotSingleQuery(format!(
                "expected exactly one statement, found {}",
                statements.len()
            )));
        }
        let statement = statements.remove(0);
        if !matches!(statement, Statement::Query(_)) {
            return Err(ValidationError::NotSingleQuery(
                "only SELECT queries are allowed".to_string(),
            ));
        }
        if !self.dialect.supports_ctes() {
            if let Statement::Query(ref query) = statement {
                if query.with.is_some() {
                    return Err(ValidationError::Syntax(format!(
                        "{} does not support WITH clauses",
                        self.dialect
                    )));
                }
            }
        }
        Ok(statement)
    }

    /// Full validation against the given schemas.
    pub fn validate(&self, sql: &str, schemas: &[SchemaInfo]) -> Result<ValidatedSql, ValidationError> {
        let statement = self.parse(sql)?;
        let profile = QueryProfile::from_statements(std::slice::from_ref(&statement));

        let mut names = NameCollector::default();
        let _ = statement.visit(&mut names);

        // tables
        let unknown_tables: Vec<String> = profile
            .tables
            .iter()
            .filter(|t| find_schema(schemas, t).is_none())
            .cloned()
            .collect();
        if !unknown_tables.is_empty() {
            return Err(ValidationError::UnknownTables(unknown_tables));
        }
        let in_scope: Vec<&SchemaInfo> = profile
            .tables
            .iter()
            .filter_map(|t| find_schema(schemas, t))
            .collect();

        // columns
        let mut warnings = Vec::new();
        let mut unknown_columns = Vec::new();
        let mut referenced = 0;
        let mut resolved = 0;
        let mut unchecked = 0;
        for column in &names.columns {
            let (qualifier, name) = match column.rsplit_once('.') {
                Some((q, n)) => (Some(q), n),
                None => (None, column.as_str()),
            };
            if PSEUDO_COLUMNS.contains(&name) || names.aliases.contains(name) {
                continue;
            }
            referenced += 1;

            let candidates: Vec<&SchemaInfo> = match qualifier {
                Some(q) => match names.table_aliases.iter().find(|(alias, _)| alias == base_table_name(q)) {
                    Some((_, table)) => in_scope
                        .iter()
                        .copied()
                        .filter(|s| s.table_name.eq_ignore_ascii_case(base_table_name(table)))
                        .collect(),
                    None => in_scope
                        .iter()
                        .copied()
                        .filter(|s| s.table_name.eq_ignore_ascii_case(base_table_name(q)))
                        .collect(),
                },
                None => in_scope.clone(),
            };

            if candidates.iter().any(|s| s.has_column(name)) {
                resolved += 1;
            } else if names.opaque_sources || qualifier.map(|q| names.derived.contains(base_table_name(q))).unwrap_or(false) {
                // columns of CTEs and subqueries are not tracked
                debug!("Column {} could not be checked", column);
                unchecked += 1;
            } else {
                unknown_columns.push(column.clone());
            }
        }
        if !unknown_columns.is_empty() {
            return Err(ValidationError::UnknownColumns(unknown_columns));
        }
        if unchecked > 0 {
            warnings.push(format!("{} derived column references could not be checked", unchecked));
        }

        let bounded = match &statement {
            Statement::Query(query) => query.limit.is_some() || query.fetch.is_some(),
            _ => false,
        };
        if !bounded && profile.query_type() != QueryType::Aggregate {
            warnings.push("query has no LIMIT clause".to_string());
        }

        Ok(ValidatedSql {
            sql: sql.trim().trim_end_matches(';').trim().to_string(),
            profile,
            referenced_columns: referenced,
            resolved_columns: resolved,
            warnings,
        })
    }

    /// Report form used by the validation endpoint.
    pub fn report(&self, sql: &str, schemas: &[SchemaInfo]) -> ValidationReport {
        match self.validate(sql, schemas) {
            Ok(validated) => ValidationReport {
                valid: true,
                warnings: validated.warnings,
                error: None,
                query_type: Some(validated.profile.query_type().as_str().to_string()),
            },
            Err(e) => ValidationReport {
                valid: false,
                warnings: vec![e.to_string()],
                error: Some(e.to_string()),
                query_type: None,
            },
        }
    }
}

#[derive(Default)]
struct NameCollector {
    /// Column references, lowercased, qualified as written
    columns: Vec<String>,
    /// Select-list aliases
    aliases: HashSet<String>,
    /// (alias, table) for aliased physical tables
    table_aliases: Vec<(String, String)>,
    /// Aliases of subqueries and CTE names
    derived: HashSet<String>,
    /// A CTE or derived table is in play
    opaque_sources: bool,
}

impl NameCollector {
    fn collect_set_expr(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                for item in &select.projection {
                    if let SelectItem::ExprWithAlias { alias, .. } = item {
                        self.aliases.insert(alias.value.to_lowercase());
                    }
                }
                for table in &select.from {
                    self.collect_factor(&table.relation);
                    for join in &table.joins {
                        self.collect_factor(&join.relation);
                    }
                }
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.collect_set_expr(left);
                self.collect_set_expr(right);
            }
            _ => {}
        }
    }

    fn collect_factor(&mut self, factor: &TableFactor) {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                if let Some(alias) = alias {
                    self.table_aliases
                        .push((alias.name.value.to_lowercase(), relation_name(name)));
                }
            }
            TableFactor::Derived { alias, .. } => {
                self.opaque_sources = true;
                if let Some(alias) = alias {
                    self.derived.insert(alias.name.value.to_lowercase());
                }
            }
            TableFactor::NestedJoin { table_with_joins, .. } => {
                self.collect_factor(&table_with_joins.relation);
                for join in &table_with_joins.joins {
                    self.collect_factor(&join.relation);
                }
            }
            _ => self.opaque_sources = true,
        }
    }
}

impl Visitor for NameCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            self.opaque_sources = true;
            for cte in &with.cte_tables {
                self.derived.insert(cte.alias.name.value.to_lowercase());
            }
        }
        self.collect_set_expr(&query.body);
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => {
                let name = ident.value.to_lowercase();
                if !self.columns.contains(&name) {
                    self.columns.push(name);
                }
            }
            Expr::CompoundIdentifier(parts) => {
                let name = parts
                    .iter()
                    .map(|p| p.value.to_lowercase())
                    .collect::<Vec<_>>()
                    .join(".");
                if !self.columns.contains(&name) {
                    self.columns.push(name);
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}
