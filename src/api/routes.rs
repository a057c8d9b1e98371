//! Request handlers

use super::{ApiError, AppState};
use crate::agent::{AgentResponse, HealthReport, RequestContext};
use crate::observability::{QueryLogEntry, StatsSnapshot};
use crate::sql::ValidationReport;
use axum::{
    extract::{Query, State},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Entries returned by `/history` when no limit is given.
const DEFAULT_HISTORY_LIMIT: usize = 20;

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub context: RequestContext,
}

#[derive(Debug, Deserialize)]
pub struct SchemaParams {
    pub table: Option<String>,
    pub backend: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ValidateSqlRequest {
    pub sql: String,
    #[serde(default)]
    pub backend: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearCacheResponse {
    pub removed: usize,
}

/// POST /query
pub async fn query(
    State(orchestrator): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<AgentResponse>, ApiError> {
    if request.question.trim().is_empty() {
        return Err(ApiError::BadRequest("question must not be empty".to_string()));
    }
    check_backend(&orchestrator.backends(), request.context.backend.as_deref())?;

    // a dropped handler (client gone) cancels the pipeline
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let response = orchestrator
        .process_question_with_cancel(&request.question, request.context, cancel)
        .await;
    guard.disarm();
    Ok(Json(response))
}

/// GET /health
pub async fn health(State(orchestrator): State<AppState>) -> Json<HealthReport> {
    Json(orchestrator.health().await)
}

/// GET /schema?table=<name>&backend=<name>
pub async fn schema(
    State(orchestrator): State<AppState>,
    Query(params): Query<SchemaParams>,
) -> Result<Response, ApiError> {
    let backend = params.backend.as_deref();
    check_backend(&orchestrator.backends(), backend)?;
    match params.table.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        Some(table) => match orchestrator.schema(table, backend).await? {
            Some(info) => Ok(Json(info).into_response()),
            None => Err(ApiError::NotFound(format!("Table '{}' not found", table))),
        },
        None => {
            let tables = orchestrator.schemas(backend).await?;
            Ok(Json(serde_json::json!({ "tables": tables })).into_response())
        }
    }
}

/// POST /validate-sql
pub async fn validate_sql(
    State(orchestrator): State<AppState>,
    Json(request): Json<ValidateSqlRequest>,
) -> Result<Json<ValidationReport>, ApiError> {
    if request.sql.trim().is_empty() {
        return Err(ApiError::BadRequest("sql must not be empty".to_string()));
    }
    check_backend(&orchestrator.backends(), request.backend.as_deref())?;
    let report = orchestrator
        .validate_sql(&request.sql, request.backend.as_deref())
        .await?;
    Ok(Json(report))
}

/// GET /stats
pub async fn stats(State(orchestrator): State<AppState>) -> Json<StatsSnapshot> {
    Json(orchestrator.stats())
}

/// GET /history?limit=N
pub async fn history(
    State(orchestrator): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Json<Vec<QueryLogEntry>> {
    Json(orchestrator.history(params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT)))
}

/// POST /cache/clear
pub async fn clear_cache(State(orchestrator): State<AppState>) -> Json<ClearCacheResponse> {
    let removed = orchestrator.clear_cache();
    info!("Cleared {} cached results", removed);
    Json(ClearCacheResponse { removed })
}

fn check_backend(available: &[String], backend: Option<&str>) -> Result<(), ApiError> {
    match backend {
        Some(name) if !available.iter().any(|b| b == name) => Err(ApiError::BadRequest(format!(
            "Unknown backend '{}'. Available: {}",
            name,
            available.join(", ")
        ))),
        _ => Ok(()),
    }
}
