//! Chat HTTP API.
//!
//! - POST /api/chat
//! - GET /api/chat/stream/{message}
//! - GET /health

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::client::{ClientState, LazyModelClient};
use crate::config::Config;
use crate::error::ChatError;
use crate::gateway::{ChatGateway, GatewayOptions};
use crate::runtime::RuntimeManager;
use crate::server::streaming::{chunk_events, error_events, sse_response};

/// Message returned for server-side failures when detailed errors are off.
pub const GENERIC_ERROR_MESSAGE: &str = "An error occurred while processing your request";

/// Application state shared across handlers.
pub struct AppState {
    pub gateway: ChatGateway,
    pub config: Arc<Config>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: Arc<Config>, manager: Arc<dyn RuntimeManager>) -> Self {
        let client = Arc::new(LazyModelClient::new(manager, config.model.alias.clone()));
        let options = GatewayOptions::from_config(&config.model, &config.api);
        Self {
            gateway: ChatGateway::new(client, options),
            config,
            start_time: Instant::now(),
        }
    }

    pub fn client(&self) -> &Arc<LazyModelClient> {
        self.gateway.client()
    }

    fn detailed_errors(&self) -> bool {
        self.config.api.enable_detailed_errors
    }
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.api.allowed_origins);
    let static_dir = state.config.api.static_dir.clone();

    let mut router = Router::new()
        .route("/api/chat", post(chat))
        .route("/api/chat/stream/{message}", get(chat_stream))
        .route("/health", get(health))
        .with_state(state);

    if let Some(dir) = static_dir {
        router = router.fallback_service(ServeDir::new(dir));
    }

    router.layer(cors).layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let values = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect::<Vec<_>>();
    layer.allow_origin(AllowOrigin::list(values))
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub model: ModelStatus,
}

#[derive(Debug, Serialize)]
pub struct ModelStatus {
    pub alias: String,
    pub state: ClientState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

/// A failure rendered as `ErrorResponse` with the matching status code.
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    pub fn bad_request(error: impl Into<String>, details: Option<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorResponse {
                error: error.into(),
                details,
                timestamp: Utc::now(),
                success: false,
            },
        }
    }

    pub fn from_chat_error(err: &ChatError, detailed: bool) -> Self {
        if err.is_client_error() {
            return Self::bad_request(err.to_string(), None);
        }
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: ErrorResponse {
                error: GENERIC_ERROR_MESSAGE.to_string(),
                details: detailed.then(|| err.to_string()),
                timestamp: Utc::now(),
                success: false,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn chat(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let request_id = Uuid::new_v4().to_string();

    let Json(req) = payload.map_err(|rejection| {
        warn!(request_id, "Malformed chat request: {rejection}");
        ApiError::bad_request(
            "Invalid request body",
            state.detailed_errors().then(|| rejection.body_text()),
        )
    })?;

    info!(request_id, chars = req.message.chars().count(), "Chat request");

    match state.gateway.chat(&req.message).await {
        Ok(response) => Ok(Json(ChatResponse {
            response,
            timestamp: Utc::now(),
            success: true,
        })),
        Err(err) => {
            warn!(request_id, kind = err.kind(), "Chat request failed: {err}");
            Err(ApiError::from_chat_error(&err, state.detailed_errors()))
        }
    }
}

async fn chat_stream(
    State(state): State<Arc<AppState>>,
    Path(message): Path<String>,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    info!(request_id, chars = message.chars().count(), "Chat stream request");

    let detailed = state.detailed_errors();
    match state
        .gateway
        .chat_stream(&message, CancellationToken::new())
        .await
    {
        Ok(chunks) => sse_response(chunk_events(chunks, detailed)),
        Err(err) if err.is_client_error() => {
            ApiError::from_chat_error(&err, detailed).into_response()
        }
        Err(err) => {
            warn!(request_id, kind = err.kind(), "Chat stream failed to open: {err}");
            sse_response(error_events(&err, detailed))
        }
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let client = state.client();
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        model: ModelStatus {
            alias: client.alias().to_string(),
            state: client.state(),
            model_id: client.handle().map(|h| h.model_id().to_string()),
        },
    })
}
