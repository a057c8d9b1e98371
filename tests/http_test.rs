mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::*;
use nlq_agent::api::create_router;
use nlq_agent::config::AgentConfig;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

async fn app() -> Router {
    let model = Arc::new(ScriptedModel::new(UPC_SQL, Some(upc_summary())));
    create_router(Arc::new(demo_agent(model, AgentConfig::default()).await))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_query_endpoint() {
    let app = app().await;
    let (status, body) = send(
        &app,
        post("/query", json!({ "question": UPC_QUESTION, "context": { "table_format": "csv" } })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["row_count"], 1);
    assert!(body["response"].as_str().unwrap().contains("2.49"));
    assert!(body["data_table"].as_str().unwrap().starts_with("upc,product_name,price"));
    assert_eq!(body["degraded"], false);
    assert!(body["metadata"]["request_id"].is_string());
}

#[tokio::test]
async fn test_query_rejections() {
    let app = app().await;

    let (status, _) = send(&app, post("/query", json!({ "question": "   " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        post("/query", json!({ "question": UPC_QUESTION, "context": { "backend": "oracle" } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("oracle"));

    let (status, body) = send(&app, post("/query", json!({ "question": "DROP TABLE products" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["kind"], "SQLValidationRejected");
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = app().await;
    let (status, body) = send(&app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["overall_status"], "healthy");
    assert_eq!(body["database"]["status"], "healthy");
    assert_eq!(body["knowledge_index"]["status"], "healthy");
}

#[tokio::test]
async fn test_schema_endpoint() {
    let app = app().await;

    let (status, body) = send(&app, get("/schema?table=products")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["table_name"], "products");
    assert!(body["columns"].as_array().unwrap().iter().any(|c| c["name"] == "upc"));

    let (status, body) = send(&app, get("/schema")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tables"].as_array().unwrap().len(), 3);

    let (status, _) = send(&app, get("/schema?table=missing_table")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_validate_sql_endpoint() {
    let app = app().await;

    let (status, body) = send(&app, post("/validate-sql", json!({ "sql": "SELECT price FROM products" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);

    let (status, body) = send(&app, post("/validate-sql", json!({ "sql": "DROP TABLE products" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], false);
}

#[tokio::test]
async fn test_stats_history_and_cache_clear() {
    let app = app().await;
    for _ in 0..2 {
        let (status, _) = send(&app, post("/query", json!({ "question": UPC_QUESTION }))).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (_, stats) = send(&app, get("/stats")).await;
    assert_eq!(stats["total_queries"], 2);
    assert_eq!(stats["success_rate"], 1.0);
    assert_eq!(stats["cache_hit_rate"], 0.5);

    let (_, history) = send(&app, get("/history?limit=1")).await;
    let entries = history.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["cache_hit"], true);

    let (status, cleared) = send(&app, post("/cache/clear", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cleared["removed"], 1);
}
