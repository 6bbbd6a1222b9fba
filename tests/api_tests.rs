//! HTTP surface: request validation, response shapes and SSE framing.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{StubClient, StubManager, SKY_CHUNKS};
use foundry_chat::config::Config;
use foundry_chat::server::api::{build_router, AppState, GENERIC_ERROR_MESSAGE};

fn app_with(manager: Arc<StubManager>, configure: impl FnOnce(&mut Config)) -> Router {
    let mut config = Config::default();
    config.model.enable_streaming_delay = false;
    configure(&mut config);
    let state = Arc::new(AppState::new(Arc::new(config), manager));
    build_router(state)
}

fn sky_manager() -> Arc<StubManager> {
    Arc::new(StubManager::new(StubClient::with_chunks(&SKY_CHUNKS)))
}

fn post_chat(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

/// Data payloads of every event in an SSE body.
fn sse_payloads(body: &str) -> Vec<Value> {
    body.split("\n\n")
        .filter_map(|event| {
            let data: Vec<&str> = event
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|d| d.strip_prefix(' ').unwrap_or(d))
                .collect();
            (!data.is_empty()).then(|| serde_json::from_str(&data.join("\n")).unwrap())
        })
        .collect()
}

#[tokio::test]
async fn test_chat_returns_response() {
    let app = app_with(sky_manager(), |_| {});

    let response = app
        .oneshot(post_chat(r#"{"message": "Why is the sky blue?"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["response"], "Because of Rayleigh scattering.");
    assert_eq!(body["success"], true);
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_chat_rejects_blank_and_missing_message() {
    let manager = sky_manager();

    for payload in [r#"{"message": ""}"#, r#"{"message": "   "}"#, r#"{}"#] {
        let app = app_with(manager.clone(), |_| {});
        let response = app.oneshot(post_chat(payload)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{payload}");

        let body = body_json(response).await;
        assert_eq!(body["error"], "Message cannot be empty");
        assert_eq!(body["success"], false);
    }
    assert_eq!(manager.starts(), 0);
}

#[tokio::test]
async fn test_chat_rejects_malformed_body() {
    let app = app_with(sky_manager(), |_| {});
    let response = app.oneshot(post_chat("not json")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "Invalid request body");
}

#[tokio::test]
async fn test_chat_length_limit() {
    let manager = sky_manager();

    let ok = json!({ "message": "a".repeat(4000) }).to_string();
    let response = app_with(manager.clone(), |_| {})
        .oneshot(post_chat(&ok))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let too_long = json!({ "message": "a".repeat(4001) }).to_string();
    let response = app_with(manager, |_| {})
        .oneshot(post_chat(&too_long))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(response).await["error"],
        "Message must be between 1 and 4000 characters"
    );
}

#[tokio::test]
async fn test_chat_internal_error_is_generic() {
    let manager = Arc::new(StubManager::new(StubClient {
        fail_complete: true,
        ..StubClient::with_chunks(&["x"])
    }));

    let response = app_with(manager.clone(), |_| {})
        .oneshot(post_chat(r#"{"message": "hi"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert_eq!(body["error"], GENERIC_ERROR_MESSAGE);
    assert!(body.get("details").is_none());

    let response = app_with(manager, |c| c.api.enable_detailed_errors = true)
        .oneshot(post_chat(r#"{"message": "hi"}"#))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert!(body["details"].as_str().unwrap().contains("model busy"));
}

#[tokio::test]
async fn test_stream_sky_scenario() {
    let manager = sky_manager();
    let app = app_with(manager.clone(), |_| {});

    let response = app
        .oneshot(get("/api/chat/stream/Why%20is%20the%20sky%20blue%3F"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let headers = response.headers();
    assert!(headers[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
    assert_eq!(headers[header::CONNECTION], "keep-alive");

    let events = sse_payloads(&body_text(response).await);
    assert_eq!(
        events,
        vec![
            json!({"chunk": "Because "}),
            json!({"chunk": "of "}),
            json!({"chunk": "Rayleigh "}),
            json!({"chunk": "scattering."}),
            json!({"done": true}),
        ]
    );
    assert_eq!(manager.client.prompts(), vec!["Why is the sky blue?"]);
}

#[tokio::test]
async fn test_stream_error_event_after_partial_output() {
    let manager = Arc::new(StubManager::new(StubClient {
        fail_after: Some(1),
        ..StubClient::with_chunks(&SKY_CHUNKS)
    }));
    let app = app_with(manager, |_| {});

    let response = app.oneshot(get("/api/chat/stream/hi")).await.unwrap();
    let events = sse_payloads(&body_text(response).await);

    assert_eq!(events.len(), 2);
    assert_eq!(events[0], json!({"chunk": "Because "}));
    assert!(events[1]["error"].is_string());
    assert!(events.iter().all(|e| e.get("done").is_none()));
}

#[tokio::test]
async fn test_stream_initialization_failure_is_error_event() {
    let manager = sky_manager();
    manager.fail_starts.store(1, std::sync::atomic::Ordering::SeqCst);
    let app = app_with(manager, |c| c.api.enable_detailed_errors = true);

    let response = app.oneshot(get("/api/chat/stream/hi")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let events = sse_payloads(&body_text(response).await);
    assert_eq!(events.len(), 1);
    assert!(events[0]["error"]
        .as_str()
        .unwrap()
        .contains("initialization failed"));
}

#[tokio::test]
async fn test_stream_rejects_blank_message() {
    let manager = sky_manager();
    let app = app_with(manager.clone(), |_| {});

    let response = app.oneshot(get("/api/chat/stream/%20%20")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "Message cannot be empty");
    assert_eq!(manager.starts(), 0);
}

#[tokio::test]
async fn test_health_reports_model_state() {
    let manager = sky_manager();
    let config = {
        let mut c = Config::default();
        c.model.enable_streaming_delay = false;
        Arc::new(c)
    };
    let state = Arc::new(AppState::new(config, manager));
    let app = build_router(state.clone());

    let body = body_json(app.clone().oneshot(get("/health")).await.unwrap()).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["model"]["alias"], "qwen2.5-0.5b");
    assert_eq!(body["model"]["state"], "uninitialized");
    assert!(body["model"].get("model_id").is_none());

    state.gateway.chat("hi").await.unwrap();

    let body = body_json(app.oneshot(get("/health")).await.unwrap()).await;
    assert_eq!(body["model"]["state"], "ready");
    assert_eq!(body["model"]["model_id"], "qwen2.5-0.5b-instruct-generic-cpu:1");
}

#[tokio::test]
async fn test_static_files_served_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<h1>chat</h1>").unwrap();
    let path = dir.path().to_path_buf();

    let app = app_with(sky_manager(), move |c| c.api.static_dir = Some(path));
    let response = app.oneshot(get("/index.html")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "<h1>chat</h1>");
}

#[tokio::test]
async fn test_cors_allows_configured_origin() {
    let app = app_with(sky_manager(), |c| {
        c.api.allowed_origins = vec!["http://localhost:3000".to_string()]
    });

    let request = Request::builder()
        .uri("/health")
        .header(header::ORIGIN, "http://localhost:3000")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "http://localhost:3000"
    );
}
