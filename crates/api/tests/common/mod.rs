#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use chunkflow_api::config::ServerConfig;
use chunkflow_api::router::build_app_router;
use chunkflow_api::state::AppState;
use chunkflow_db::{JobStore, MemoryStore};
use chunkflow_events::{EventBus, Notifier};
use chunkflow_pipeline::EngineConfig;
use chunkflow_worker::runtime;
use http_body_util::BodyExt;
use tower::ServiceExt;

/// Build a test `ServerConfig` with safe defaults.
///
/// Small chunks so short inputs split into several.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 30,
        database_url: String::new(),
        max_connections: 1,
        embedded_workers: false,
        processor: None,
        engine: EngineConfig {
            chunk_chars: 16,
            chunk_overlap_chars: 4,
            ..EngineConfig::default()
        },
    }
}

/// An app backed by an in-memory store and a local event bus.
pub struct TestApp {
    pub router: Router,
    pub store: Arc<MemoryStore>,
    pub state: AppState,
}

/// Build the full application router with all middleware layers.
pub fn build_test_app() -> TestApp {
    let config = test_config();
    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn JobStore> = store.clone();
    let notifier = Notifier::local(Arc::new(EventBus::default()), Arc::clone(&dyn_store));
    let coordinator = runtime::build_coordinator(Arc::clone(&dyn_store), notifier.clone(), &config.engine)
        .expect("test engine config is valid");

    let state = AppState {
        store: dyn_store,
        coordinator,
        notifier,
        config: Arc::new(config.clone()),
    };

    TestApp {
        router: build_app_router(state.clone(), &config),
        store,
        state,
    }
}

/// Send a GET request through the full middleware stack.
pub async fn get(app: &Router, uri: &str) -> Response {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

/// Send a POST request with a JSON body.
pub async fn post_json(app: &Router, uri: &str, body: serde_json::Value) -> Response {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

/// Send a POST request with no body.
pub async fn post_empty(app: &Router, uri: &str) -> Response {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

/// Read the response body as JSON.
pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Submit a job and return its id.
pub async fn submit(app: &Router, owner_ref: &str, input: &str) -> i64 {
    let response = post_json(
        app,
        "/api/v1/jobs",
        serde_json::json!({ "owner_ref": owner_ref, "input": input }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await["data"]["job_id"].as_i64().unwrap()
}
