#![cfg(feature = "http-client")]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use logsearch::http::HttpBackend;
use logsearch::{Error, SearchBackend, SearchParams};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct Received {
    bodies: Arc<Mutex<Vec<Value>>>,
    queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

async fn details(State(received): State<Received>, Json(body): Json<Value>) -> Json<Value> {
    received.bodies.lock().unwrap().push(body);
    Json(json!({
        "code": "0000",
        "message": "ok",
        "data": {
            "rows": [{"log_time": "2024-03-13 10:15:00.000", "status": "ERROR"}],
            "totalCount": 42,
            "columns": ["log_time", "status"],
            "executionTimeMs": 7
        }
    }))
}

async fn columns(
    State(received): State<Received>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    received.queries.lock().unwrap().push(query);
    Json(json!({
        "code": "0000",
        "data": [
            {"columnName": "log_time", "dataType": "DATETIME"},
            {"columnName": "status", "dataType": "VARCHAR(16)", "isNullable": true}
        ]
    }))
}

async fn rejected() -> Json<Value> {
    Json(json!({"code": "4001", "message": "module not authorized", "data": null}))
}

async fn unavailable() -> (StatusCode, &'static str) {
    (StatusCode::SERVICE_UNAVAILABLE, "upstream down")
}

async fn serve() -> (HttpBackend, Received) {
    let received = Received::default();
    let app = Router::new()
        .route("/api/logs/search/details", post(details))
        .route("/api/logs/columns", get(columns))
        .route("/api/logs/search/histogram", post(rejected))
        .route("/api/modules/query-config", get(unavailable))
        .with_state(received.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    let backend = HttpBackend::new(format!("http://{}/", addr), Duration::from_secs(5)).unwrap();
    (backend, received)
}

fn params() -> SearchParams {
    SearchParams {
        module: Some("orders".to_string()),
        datasource_id: Some(1),
        where_predicates: vec!["status = 'ERROR'".to_string()],
        active_fields: vec!["log_time".to_string(), "status".to_string()],
        ..SearchParams::default()
    }
}

#[tokio::test]
async fn should_post_query_and_unwrap_detail_page() {
    // given
    let (backend, received) = serve().await;

    // when
    let page = backend
        .fetch_log_details(&params(), &CancellationToken::new())
        .await
        .unwrap();

    // then
    assert_eq!(page.total_count, 42);
    assert_eq!(page.rows.len(), 1);
    assert_eq!(page.rows[0]["status"], json!("ERROR"));
    assert_eq!(page.execution_time_ms, 7);
    let bodies = received.bodies.lock().unwrap();
    assert_eq!(bodies[0]["module"], json!("orders"));
    assert_eq!(bodies[0]["whereSqls"], json!(["status = 'ERROR'"]));
    assert_eq!(bodies[0]["fields"], json!(["log_time", "status"]));
    assert_eq!(bodies[0]["pageSize"], json!(50));
}

#[tokio::test]
async fn should_send_column_lookup_as_query_parameters() {
    // given
    let (backend, received) = serve().await;

    // when
    let columns = backend.fetch_columns(3, "orders").await.unwrap();

    // then
    assert_eq!(columns.len(), 2);
    assert_eq!(columns[1].column_name, "status");
    assert!(columns[1].is_nullable);
    let queries = received.queries.lock().unwrap();
    assert_eq!(queries[0].get("datasourceId").map(String::as_str), Some("3"));
    assert_eq!(queries[0].get("module").map(String::as_str), Some("orders"));
}

#[tokio::test]
async fn should_surface_server_error_code() {
    // given
    let (backend, _) = serve().await;

    // when
    let result = backend
        .fetch_log_histogram(&params(), &CancellationToken::new())
        .await;

    // then
    assert!(matches!(
        result,
        Err(Error::Server { code, message }) if code == "4001" && message == "module not authorized"
    ));
}

#[tokio::test]
async fn should_map_http_failure_status_to_server_error() {
    // given
    let (backend, _) = serve().await;

    // when
    let result = backend.get_module_query_config("orders").await;

    // then
    assert!(matches!(
        result,
        Err(Error::Server { code, message }) if code == "503" && message == "Service Unavailable"
    ));
}

#[tokio::test]
async fn should_map_unknown_route_to_server_error() {
    // given
    let (backend, _) = serve().await;

    // when
    let result = backend
        .fetch_distributions(&params(), &CancellationToken::new())
        .await;

    // then
    assert!(matches!(result, Err(Error::Server { code, .. }) if code == "404"));
}

#[tokio::test]
async fn should_not_send_cancelled_request() {
    // given
    let (backend, received) = serve().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    // when
    let result = backend.fetch_log_details(&params(), &cancel).await;

    // then
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(received.bodies.lock().unwrap().is_empty());
}
