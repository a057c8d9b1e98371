use serde::{Deserialize, Serialize};
use sqlparser::dialect::{Dialect, GenericDialect, SQLiteDialect};

/// SQL flavour of a backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    Sqlite,
    Trino,
    Polars,
}

impl SqlDialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlDialect::Sqlite => "sqlite",
            SqlDialect::Trino => "trino",
            SqlDialect::Polars => "polars",
        }
    }

    pub fn parser_dialect(&self) -> Box<dyn Dialect> {
        match self {
            SqlDialect::Sqlite => Box::new(SQLiteDialect {}),
            SqlDialect::Trino | SqlDialect::Polars => Box::new(GenericDialect {}),
        }
    }

    /// Dialect notes included in generation prompts.
    pub fn prompt_notes(&self) -> &'static str {
        match self {
            SqlDialect::Sqlite => {
                "SQLite: use LIMIT, strftime() for date parts, date('now') for today, || for string concatenation."
            }
            SqlDialect::Trino => {
                "Trino: use LIMIT, date_trunc() and current_date, CAST(x AS DOUBLE) for numeric division."
            }
            SqlDialect::Polars => {
                "Polars SQL: single SELECT without WITH clauses, tables are file names, use LIMIT."
            }
        }
    }

    /// Whether the dialect accepts common table expressions.
    pub fn supports_ctes(&self) -> bool {
        !matches!(self, SqlDialect::Polars)
    }
}

impl std::fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
