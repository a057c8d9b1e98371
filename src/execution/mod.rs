//! Query execution: backends behind one trait, routing, caching.

pub mod cache;
pub mod engine;
pub mod executor;
pub mod polars_engine;
pub mod profile;
pub mod result;
pub mod router;
pub mod sqlite_engine;
pub mod trino_engine;

pub use cache::{CacheStats, ResultCache};
pub use engine::{EngineCapabilities, ExecutionContext, ExecutionEngine};
pub use executor::{ExecuteOptions, QueryExecutor};
pub use profile::{QueryProfile, QueryType};
pub use result::QueryResult;
pub use router::ExecutionRouter;
pub use sqlite_engine::SqliteEngine;
