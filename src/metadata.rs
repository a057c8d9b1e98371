//! Schema Store
//!
//! Table/column metadata for the target database. Live inspection goes through
//! the execution engine; descriptions can be layered on from a JSON file.

use crate::error::{AgentError, Result};
use crate::execution::engine::{ExecutionContext, ExecutionEngine};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(default)]
    pub data_type: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

/// Where a schema fragment came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchemaSource {
    KnowledgeIndex,
    #[default]
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaInfo {
    pub table_name: String,
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sample_rows: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    pub source: SchemaSource,
}

impl SchemaInfo {
    pub fn new(table_name: impl Into<String>, columns: Vec<ColumnInfo>) -> Self {
        Self {
            table_name: table_name.into(),
            columns,
            description: None,
            sample_rows: Vec::new(),
            source: SchemaSource::Live,
        }
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// True when both fragments describe the same column names (order-insensitive).
    pub fn same_columns(&self, other: &SchemaInfo) -> bool {
        let mut a: Vec<String> = self.columns.iter().map(|c| c.name.to_lowercase()).collect();
        let mut b: Vec<String> = other.columns.iter().map(|c| c.name.to_lowercase()).collect();
        a.sort();
        b.sort();
        a == b
    }

    /// Compact text used in prompts and for token accounting.
    pub fn to_prompt_text(&self) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let null = if c.nullable { "" } else { " NOT NULL" };
                format!("  {} {}{}", c.name, c.data_type, null)
            })
            .collect();
        let mut text = format!("TABLE {} (\n{}\n)", self.table_name, columns.join(",\n"));
        if let Some(ref description) = self.description {
            text.push_str(&format!("\n-- {}", description));
        }
        if !self.sample_rows.is_empty() {
            let rows: Vec<String> = self
                .sample_rows
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|v| match v {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect::<Vec<_>>()
                        .join(" | ")
                })
                .collect();
            text.push_str(&format!("\n-- sample rows:\n-- {}", rows.join("\n-- ")));
        }
        text
    }

    /// Rough token estimate (four characters per token).
    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.to_prompt_text())
    }
}

pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() + 3) / 4
}

/// Ground-truth schema lookups.
#[async_trait]
pub trait SchemaStore: Send + Sync {
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Live schema for one table, `None` when the table does not exist.
    async fn inspect(&self, table: &str) -> Result<Option<SchemaInfo>>;

    /// Live schema for every table.
    async fn inspect_all(&self) -> Result<Vec<SchemaInfo>> {
        let mut schemas = Vec::new();
        for table in self.list_tables().await? {
            if let Some(schema) = self.inspect(&table).await? {
                schemas.push(schema);
            }
        }
        Ok(schemas)
    }
}

/// Schema store backed by live inspection of an execution engine.
pub struct EngineSchemaStore {
    engine: Arc<dyn ExecutionEngine>,
    sample_rows: usize,
    descriptions: HashMap<String, String>,
}

impl EngineSchemaStore {
    pub fn new(engine: Arc<dyn ExecutionEngine>, sample_rows: usize) -> Self {
        Self {
            engine,
            sample_rows,
            descriptions: HashMap::new(),
        }
    }

    pub fn with_descriptions(mut self, descriptions: HashMap<String, String>) -> Self {
        self.descriptions = descriptions
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        self
    }

    /// Load `{"table": "description", ...}` from a JSON file.
    pub fn load_descriptions(path: impl AsRef<Path>) -> Result<HashMap<String, String>> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    async fn fetch_samples(&self, table: &str) -> Vec<Vec<serde_json::Value>> {
        if self.sample_rows == 0 {
            return Vec::new();
        }
        let sql = format!("SELECT * FROM {} LIMIT {}", table, self.sample_rows);
        let ctx = ExecutionContext::with_row_limit(self.sample_rows);
        match self.engine.execute(&sql, &ctx).await {
            Ok(result) => result.rows,
            Err(e) => {
                debug!("Sample rows unavailable for {}: {}", table, e);
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl SchemaStore for EngineSchemaStore {
    async fn list_tables(&self) -> Result<Vec<String>> {
        self.engine.list_tables().await
    }

    async fn inspect(&self, table: &str) -> Result<Option<SchemaInfo>> {
        if !is_safe_identifier(table) {
            warn!("Refusing to inspect table with unsafe name: {:?}", table);
            return Ok(None);
        }
        let Some(mut schema) = self.engine.describe_table(table).await? else {
            return Ok(None);
        };
        schema.source = SchemaSource::Live;
        if schema.description.is_none() {
            schema.description = self.descriptions.get(&table.to_lowercase()).cloned();
        }
        schema.sample_rows = self.fetch_samples(&schema.table_name).await;
        Ok(Some(schema))
    }
}

/// Schema stores for every execution backend, so a request is grounded in
/// the tables of the backend it will run on.
pub struct SchemaCatalog {
    stores: Vec<(String, Arc<dyn SchemaStore>)>,
    default_backend: String,
}

impl SchemaCatalog {
    pub fn new(default_backend: impl Into<String>, stores: Vec<(String, Arc<dyn SchemaStore>)>) -> Result<Self> {
        let default_backend = default_backend.into();
        if !stores.iter().any(|(name, _)| name.eq_ignore_ascii_case(&default_backend)) {
            return Err(AgentError::Config(format!(
                "No schema store for default backend '{}'",
                default_backend
            )));
        }
        Ok(Self { stores, default_backend })
    }

    /// Catalog with a single backend.
    pub fn single(backend: impl Into<String>, store: Arc<dyn SchemaStore>) -> Self {
        let backend = backend.into();
        Self {
            stores: vec![(backend.clone(), store)],
            default_backend: backend,
        }
    }

    /// Live inspection through every engine.
    pub fn from_engines(
        engines: &[Arc<dyn ExecutionEngine>],
        default_backend: &str,
        sample_rows: usize,
        descriptions: &HashMap<String, String>,
    ) -> Result<Self> {
        let stores = engines
            .iter()
            .map(|engine| {
                let store = EngineSchemaStore::new(Arc::clone(engine), sample_rows)
                    .with_descriptions(descriptions.clone());
                (engine.name().to_string(), Arc::new(store) as Arc<dyn SchemaStore>)
            })
            .collect();
        Self::new(default_backend, stores)
    }

    /// Store for `backend`, or for the default backend when unset.
    pub fn store(&self, backend: Option<&str>) -> Result<Arc<dyn SchemaStore>> {
        let name = backend.unwrap_or(&self.default_backend);
        self.stores
            .iter()
            .find(|(backend, _)| backend.eq_ignore_ascii_case(name))
            .map(|(_, store)| Arc::clone(store))
            .ok_or_else(|| {
                AgentError::Config(format!(
                    "Unknown backend '{}'. Available: {}",
                    name,
                    self.backends().join(", ")
                ))
            })
    }

    pub fn default_backend(&self) -> &str {
        &self.default_backend
    }

    pub fn backends(&self) -> Vec<&str> {
        self.stores.iter().map(|(name, _)| name.as_str()).collect()
    }
}

/// Plain (optionally dotted) SQL identifier.
pub fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn products() -> SchemaInfo {
        SchemaInfo::new(
            "products",
            vec![
                ColumnInfo { name: "upc".into(), data_type: "TEXT".into(), nullable: false },
                ColumnInfo { name: "price".into(), data_type: "REAL".into(), nullable: true },
            ],
        )
    }

    #[test]
    fn test_prompt_text_lists_columns() {
        let text = products().to_prompt_text();
        assert!(text.contains("TABLE products"));
        assert!(text.contains("upc TEXT NOT NULL"));
        assert!(text.contains("price REAL"));
    }

    #[test]
    fn test_same_columns_ignores_order_and_case() {
        let mut other = products();
        other.columns.reverse();
        other.columns[0].name = "PRICE".into();
        assert!(products().same_columns(&other));
        other.columns.pop();
        assert!(!products().same_columns(&other));
    }

    #[test]
    fn test_safe_identifier() {
        assert!(is_safe_identifier("products"));
        assert!(is_safe_identifier("sales.weekly_2024"));
        assert!(!is_safe_identifier("products; DROP TABLE x"));
        assert!(!is_safe_identifier("1table"));
        assert!(!is_safe_identifier(""));
    }

    struct FixedStore(Vec<&'static str>);

    #[async_trait]
    impl SchemaStore for FixedStore {
        async fn list_tables(&self) -> Result<Vec<String>> {
            Ok(self.0.iter().map(|t| t.to_string()).collect())
        }

        async fn inspect(&self, table: &str) -> Result<Option<SchemaInfo>> {
            Ok(self
                .0
                .iter()
                .find(|t| t.eq_ignore_ascii_case(table))
                .map(|t| SchemaInfo::new(*t, vec![])))
        }
    }

    #[tokio::test]
    async fn test_catalog_selects_store_per_backend() {
        let catalog = SchemaCatalog::new(
            "sqlite",
            vec![
                ("sqlite".to_string(), Arc::new(FixedStore(vec!["products"])) as Arc<dyn SchemaStore>),
                ("polars".to_string(), Arc::new(FixedStore(vec!["weekly_units"])) as Arc<dyn SchemaStore>),
            ],
        )
        .unwrap();

        let default = catalog.store(None).unwrap();
        assert_eq!(default.list_tables().await.unwrap(), vec!["products"]);
        let polars = catalog.store(Some("POLARS")).unwrap();
        assert!(polars.inspect("weekly_units").await.unwrap().is_some());
        assert!(polars.inspect("products").await.unwrap().is_none());

        assert!(matches!(catalog.store(Some("oracle")), Err(AgentError::Config(_))));
        assert!(SchemaCatalog::new("trino", vec![]).is_err());
    }
}
