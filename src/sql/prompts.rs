//! Prompt construction for SQL generation

use crate::analyzer::ProcessedQuestion;
use crate::context::QueryContext;
use crate::sql::dialect::SqlDialect;
use std::fmt::Write;

/// Examples included in a generation prompt.
const MAX_EXAMPLES: usize = 3;

pub const SQL_SYSTEM_PROMPT: &str = "You are an analytics SQL generator. \
You write exactly one read-only SELECT statement for the given database. \
Never modify data or schema. Use only the tables and columns listed.";

pub fn build_sql_prompt(
    pq: &ProcessedQuestion,
    context: &QueryContext,
    dialect: SqlDialect,
    feedback: Option<&str>,
) -> String {
    let mut prompt = String::new();

    let _ = writeln!(prompt, "## Database ({})", dialect);
    let _ = writeln!(prompt, "{}\n", dialect.prompt_notes());

    let _ = writeln!(prompt, "## Tables\n");
    for schema in &context.schemas {
        let _ = writeln!(prompt, "{}\n", schema.to_prompt_text());
    }

    if !context.rules.is_empty() {
        let _ = writeln!(prompt, "## Business rules\n");
        for rule in &context.rules {
            let _ = writeln!(prompt, "- {}: {}", rule.name, rule.description);
        }
        let _ = writeln!(prompt);
    }

    if !context.examples.is_empty() {
        let _ = writeln!(prompt, "## Examples\n");
        for (idx, example) in context.examples.iter().take(MAX_EXAMPLES).enumerate() {
            let _ = writeln!(prompt, "### Example {}", idx + 1);
            let _ = writeln!(prompt, "Question: {}", example.question);
            let _ = writeln!(prompt, "SQL: {}\n", example.sql);
        }
    }

    if !pq.entities.is_empty() {
        let _ = writeln!(prompt, "## Values mentioned\n");
        for entity in &pq.entities {
            let hint = entity
                .column_hint
                .as_deref()
                .map(|c| format!(" (likely column {})", c))
                .unwrap_or_default();
            let _ = writeln!(prompt, "- {:?}: {}{}", entity.kind, entity.value, hint);
        }
        let _ = writeln!(prompt);
    }

    let _ = writeln!(prompt, "## Task");
    let _ = writeln!(prompt, "Question: {}", pq.raw.trim());
    let _ = writeln!(prompt, "Intent: {}\n", pq.intent);

    if let Some(feedback) = feedback {
        let _ = writeln!(prompt, "## Previous attempt was rejected");
        let _ = writeln!(prompt, "{}\nFix the query.\n", feedback);
    }

    let _ = writeln!(prompt, "## Output Format");
    let _ = writeln!(
        prompt,
        "Return only the SQL statement, no markdown. On the last line add \
         `-- confidence: <0.0-1.0>` with your certainty that the query answers the question."
    );

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::QuestionAnalyzer;
    use crate::context::ContextSource;
    use crate::knowledge::QueryExample;
    use crate::metadata::{ColumnInfo, SchemaInfo};

    #[test]
    fn test_prompt_contains_schema_examples_and_feedback() {
        let pq = QuestionAnalyzer::new(vec![]).analyze("price for UPC 0020282000000");
        let context = QueryContext {
            schemas: vec![SchemaInfo::new(
                "products",
                vec![ColumnInfo { name: "upc".into(), data_type: "TEXT".into(), nullable: false }],
            )],
            examples: vec![QueryExample {
                question: "price of item".into(),
                sql: "SELECT price FROM products".into(),
                intent: None,
            }],
            rules: vec![],
            token_budget: 100,
            tokens_used: 10,
            source: ContextSource::Mixed,
            warnings: vec![],
        };
        let prompt = build_sql_prompt(&pq, &context, SqlDialect::Sqlite, Some("unknown columns: cost"));
        assert!(prompt.contains("TABLE products"));
        assert!(prompt.contains("upc TEXT NOT NULL"));
        assert!(prompt.contains("SQL: SELECT price FROM products"));
        assert!(prompt.contains("0020282000000 (likely column upc)"));
        assert!(prompt.contains("unknown columns: cost"));
        assert!(prompt.contains("-- confidence:"));
    }
}
