//! Retail pricing demo dataset
//!
//! A small products / price history / store sales schema with matching
//! knowledge documents. Used by `nlq seed` and by the integration tests.

use crate::error::Result;
use crate::knowledge::{BusinessRule, KnowledgeDocument, QueryExample};
use crate::metadata::SchemaStore;
use std::collections::HashMap;

pub const DEMO_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS products (
    upc TEXT PRIMARY KEY,
    product_name TEXT NOT NULL,
    brand TEXT,
    category TEXT,
    price REAL
);

CREATE TABLE IF NOT EXISTS price_history (
    upc TEXT NOT NULL,
    effective_date TEXT NOT NULL,
    price REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS store_sales (
    store TEXT NOT NULL,
    upc TEXT NOT NULL,
    sale_date TEXT NOT NULL,
    units INTEGER NOT NULL,
    revenue REAL NOT NULL
);
"#;

pub const DEMO_DATA: &str = r#"
INSERT INTO products VALUES
    ('0020282000000', 'Cola 12oz', 'Fizz', 'Soda', 2.49),
    ('0020282000017', 'Diet Cola 12oz', 'Fizz', 'Soda', 2.49),
    ('0041220576463', 'Sparkling Water 1L', 'Clearly', 'Water', 1.29),
    ('0078742370842', 'Potato Chips 8oz', 'Crunchy', 'Snacks', 3.99),
    ('0078742015439', 'Tortilla Chips 10oz', 'Crunchy', 'Snacks', 4.49),
    ('0011110838520', 'Orange Juice 52oz', 'Sunny', 'Juice', 5.79);

INSERT INTO price_history VALUES
    ('0020282000000', '2024-01-01', 2.29),
    ('0020282000000', '2024-02-01', 2.39),
    ('0020282000000', '2024-03-01', 2.49),
    ('0078742370842', '2024-01-01', 3.79),
    ('0078742370842', '2024-03-01', 3.99);

INSERT INTO store_sales VALUES
    ('Downtown', '0020282000000', '2024-03-01', 40, 99.60),
    ('Downtown', '0078742370842', '2024-03-01', 12, 47.88),
    ('Uptown', '0020282000000', '2024-03-01', 25, 62.25),
    ('Downtown', '0020282000000', '2024-03-02', 38, 94.62),
    ('Uptown', '0041220576463', '2024-03-02', 30, 38.70),
    ('Downtown', '0011110838520', '2024-03-03', 9, 52.11),
    ('Uptown', '0078742015439', '2024-03-03', 14, 62.86),
    ('Airport', '0020282000000', '2024-03-04', 55, 136.95);
"#;

/// Schema plus rows, ready for `SqliteEngine::seed`.
pub fn demo_script() -> String {
    format!("{}\n{}", DEMO_SCHEMA, DEMO_DATA)
}

pub fn demo_descriptions() -> HashMap<String, String> {
    HashMap::from([
        (
            "products".to_string(),
            "Product catalog with the current shelf price per UPC".to_string(),
        ),
        (
            "price_history".to_string(),
            "Price changes per UPC with the date each price took effect".to_string(),
        ),
        (
            "store_sales".to_string(),
            "Daily unit and revenue totals per store and UPC".to_string(),
        ),
    ])
}

pub fn demo_examples() -> Vec<QueryExample> {
    vec![
        QueryExample {
            question: "What is the price of UPC 0041220576463?".to_string(),
            sql: "SELECT upc, product_name, price FROM products WHERE upc = '0041220576463'".to_string(),
            intent: Some("pricing".to_string()),
        },
        QueryExample {
            question: "Total revenue by store".to_string(),
            sql: "SELECT store, SUM(revenue) AS total_revenue FROM store_sales GROUP BY store ORDER BY total_revenue DESC"
                .to_string(),
            intent: Some("sales".to_string()),
        },
        QueryExample {
            question: "How has the price of UPC 0078742370842 changed over time?".to_string(),
            sql: "SELECT effective_date, price FROM price_history WHERE upc = '0078742370842' ORDER BY effective_date"
                .to_string(),
            intent: Some("pricing".to_string()),
        },
    ]
}

pub fn demo_rules() -> Vec<BusinessRule> {
    vec![
        BusinessRule {
            name: "current price".to_string(),
            description: "The current price of a product is products.price; price_history holds past prices."
                .to_string(),
            tables: vec!["products".to_string(), "price_history".to_string()],
        },
        BusinessRule {
            name: "revenue".to_string(),
            description: "Revenue is store_sales.revenue summed over the period asked about.".to_string(),
            tables: vec!["store_sales".to_string()],
        },
    ]
}

/// Knowledge documents for every table in `store` plus the demo examples and
/// rules.
pub async fn demo_documents(store: &dyn SchemaStore) -> Result<Vec<KnowledgeDocument>> {
    let mut documents = Vec::new();
    for schema in store.inspect_all().await? {
        documents.push(KnowledgeDocument::schema(&schema)?);
    }
    for example in demo_examples() {
        documents.push(KnowledgeDocument::example(&example)?);
    }
    for rule in demo_rules() {
        documents.push(KnowledgeDocument::rule(&rule)?);
    }
    Ok(documents)
}
