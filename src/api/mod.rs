//! HTTP API
//!
//! `POST /query`, `GET /health`, `GET /schema`, `POST /validate-sql`,
//! `GET /stats`, `GET /history` and `POST /cache/clear`, all backed by one
//! shared `AgentOrchestrator`.

pub mod routes;

pub use routes::{
    ClearCacheResponse, HistoryParams, QueryRequest, SchemaParams, ValidateSqlRequest,
};

use crate::agent::AgentOrchestrator;
use crate::error::AgentError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub type AppState = Arc<AgentOrchestrator>;

/// Error body for requests rejected before reaching the pipeline.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Agent(AgentError),
}

impl From<AgentError> for ApiError {
    fn from(e: AgentError) -> Self {
        ApiError::Agent(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse {
                    error: "BadRequest".to_string(),
                    message,
                },
            ),
            ApiError::NotFound(message) => (
                StatusCode::NOT_FOUND,
                ErrorResponse {
                    error: "NotFound".to_string(),
                    message,
                },
            ),
            ApiError::Agent(e) => {
                error!("Request failed: {}", e);
                let status = match &e {
                    AgentError::Config(_) => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (
                    status,
                    ErrorResponse {
                        error: e.kind().as_str().to_string(),
                        message: e.user_message(),
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

pub fn create_router(orchestrator: AppState) -> Router {
    Router::new()
        .route("/query", post(routes::query))
        .route("/health", get(routes::health))
        .route("/schema", get(routes::schema))
        .route("/validate-sql", post(routes::validate_sql))
        .route("/stats", get(routes::stats))
        .route("/history", get(routes::history))
        .route("/cache/clear", post(routes::clear_cache))
        .with_state(orchestrator)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until the process is stopped.
pub async fn serve(orchestrator: AppState, bind: &str) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, create_router(orchestrator)).await?;
    Ok(())
}
