use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nlq_agent::agent::{AgentBuilder, AgentOrchestrator, RequestContext};
use nlq_agent::config::AgentConfig;
use nlq_agent::demo;
use nlq_agent::execution::{ExecutionEngine, SqliteEngine};
use nlq_agent::metadata::EngineSchemaStore;
use nlq_agent::synthesis::TableFormat;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nlq")]
#[command(about = "Answer natural-language questions over SQL backends")]
struct Args {
    /// JSON config file; environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer one question and print the response
    Ask {
        question: String,

        /// Backend to run the query on (default from config)
        #[arg(short, long)]
        backend: Option<String>,

        /// Table rendering: html, text or csv
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Print the full response as JSON
        #[arg(long)]
        json: bool,

        #[arg(long)]
        no_cache: bool,
    },
    /// Start the HTTP API
    Serve {
        /// Listen address (default from config)
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Check a SQL statement without running it
    Validate {
        sql: String,

        #[arg(short, long)]
        backend: Option<String>,
    },
    /// Print the live schema of one table, or all tables
    Schema {
        table: Option<String>,

        #[arg(short, long)]
        backend: Option<String>,
    },
    /// Create the demo SQLite database and knowledge file
    Seed {
        /// SQLite database to create
        #[arg(long, default_value = "data/demo.db")]
        db: PathBuf,

        /// Knowledge documents to write
        #[arg(long, default_value = "data/knowledge.json")]
        knowledge: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("nlq_agent=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::from_env()?,
    };

    match args.command {
        Command::Ask {
            question,
            backend,
            format,
            json,
            no_cache,
        } => {
            let table_format = TableFormat::parse(&format)
                .with_context(|| format!("Unknown table format '{}'", format))?;
            let orchestrator = build(config).await?;
            let context = RequestContext {
                backend,
                table_format,
                use_cache: !no_cache,
                ..RequestContext::default()
            };
            let response = orchestrator.process_question(&question, context).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                if let Some(sql) = &response.sql_query {
                    println!("SQL: {}\n", sql);
                }
                println!("{}", response.response);
                if let Some(table) = &response.data_table {
                    println!("\n{}", table);
                }
                for insight in &response.key_insights {
                    println!("- {}", insight);
                }
                if response.degraded {
                    println!(
                        "\n(degraded: {})",
                        response
                            .metadata
                            .fallback_tiers
                            .iter()
                            .map(|t| t.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                }
            }
            if !response.success {
                std::process::exit(1);
            }
        }
        Command::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            let orchestrator = build(config).await?;
            nlq_agent::api::serve(orchestrator, &bind).await?;
        }
        Command::Validate { sql, backend } => {
            let orchestrator = build(config).await?;
            let report = orchestrator.validate_sql(&sql, backend.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.valid {
                std::process::exit(1);
            }
        }
        Command::Schema { table, backend } => {
            let orchestrator = build(config).await?;
            match table {
                Some(table) => match orchestrator.schema(&table, backend.as_deref()).await? {
                    Some(info) => println!("{}", serde_json::to_string_pretty(&info)?),
                    None => anyhow::bail!("Table '{}' not found", table),
                },
                None => println!("{}", serde_json::to_string_pretty(&orchestrator.schemas(backend.as_deref()).await?)?),
            }
        }
        Command::Seed { db, knowledge } => seed(&db, &knowledge).await?,
    }

    Ok(())
}

async fn build(config: AgentConfig) -> Result<Arc<AgentOrchestrator>> {
    let orchestrator = AgentBuilder::new(config)
        .build()
        .await
        .context("Failed to initialise the agent")?;
    Ok(Arc::new(orchestrator))
}

async fn seed(db: &Path, knowledge: &Path) -> Result<()> {
    if db.exists() {
        anyhow::bail!("{} already exists; remove it to reseed", db.display());
    }
    for path in [db, knowledge] {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let engine = SqliteEngine::open(Some(db))?;
    engine.seed(&demo::demo_script())?;
    let engine: Arc<dyn ExecutionEngine> = Arc::new(engine);
    info!("Seeded demo tables into {}", db.display());

    let store = EngineSchemaStore::new(engine, 0).with_descriptions(demo::demo_descriptions());
    let documents = demo::demo_documents(&store).await?;
    std::fs::write(knowledge, serde_json::to_string_pretty(&documents)?)
        .with_context(|| format!("Failed to write {}", knowledge.display()))?;
    info!("Wrote {} knowledge documents to {}", documents.len(), knowledge.display());

    println!("Set NLQ_SQLITE_PATH={} and NLQ_KNOWLEDGE_PATH={}", db.display(), knowledge.display());
    Ok(())
}
