use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::agent::SamplingLoop;
use crate::bridge::StreamBridge;
use crate::catalog::{ConfigResponse, config_response};
use crate::config::ServerConfig;
use crate::credentials::EnvCredentials;
use crate::protocol::{ApiKeyStatus, AuthValidateRequest, AuthValidateResponse, ChatRequest};

#[derive(Clone)]
pub struct AppState {
    pub bridge: StreamBridge,
    pub credentials: EnvCredentials,
    pub reset_script: PathBuf,
}

impl AppState {
    pub fn from_config(config: &ServerConfig) -> Self {
        let credentials = EnvCredentials::from_process();
        let agent = SamplingLoop::new(config.display()).with_base_url(&config.anthropic_base_url);
        Self {
            bridge: StreamBridge::new(Arc::new(agent), Arc::new(credentials.clone())),
            credentials,
            reset_script: config.reset_script.clone(),
        }
    }
}

pub async fn run(config: ServerConfig) -> std::io::Result<()> {
    let frontend = config.frontend_root();
    match &frontend {
        Some(dir) => info!(dir = %dir.display(), "serving frontend"),
        None => warn!("no frontend build found; serving the API only"),
    }

    let app = build_router(AppState::from_config(&config), frontend);
    let listener = tokio::net::TcpListener::bind(config.listen_addr()).await?;
    info!(addr = %config.listen_addr(), "cua-bridge listening");
    axum::serve(listener, app).await
}

pub fn build_router(state: AppState, frontend: Option<PathBuf>) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/config", get(get_config))
        .route("/api-key", get(api_key))
        .route("/auth/validate", post(validate_auth))
        .route("/reset", post(reset))
        .route("/chat/stream", post(chat_stream))
        .fallback(api_not_found);

    let router = Router::new().nest("/api", api);
    let router = match frontend {
        Some(dir) => {
            let index = dir.join("index.html");
            router.fallback_service(ServeDir::new(dir).fallback(ServeFile::new(index)))
        }
        None => router,
    };

    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// JSON error body `{"error": message}` with a status code.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

async fn get_config() -> Json<ConfigResponse> {
    Json(config_response())
}

async fn api_key(State(state): State<AppState>) -> Json<ApiKeyStatus> {
    Json(state.credentials.api_key_status())
}

async fn validate_auth(
    State(state): State<AppState>,
    Json(request): Json<AuthValidateRequest>,
) -> Json<AuthValidateResponse> {
    Json(
        state
            .credentials
            .validate(request.provider, request.api_key.as_deref()),
    )
}

async fn reset(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    info!(script = %state.reset_script.display(), "resetting desktop environment");
    run_shell("pkill Xvfb; pkill tint2").await?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let status = Command::new(&state.reset_script)
        .status()
        .await
        .map_err(|err| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("failed to run {}: {err}", state.reset_script.display()),
        })?;
    if !status.success() {
        warn!(%status, "reset script exited unsuccessfully");
    }

    Ok(Json(json!({
        "status": "ok",
        "message": "Environment reset successfully"
    })))
}

async fn run_shell(script: &str) -> Result<(), ApiError> {
    Command::new("sh")
        .arg("-c")
        .arg(script)
        .status()
        .await
        .map(|_| ())
        .map_err(|err| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("failed to run `{script}`: {err}"),
        })
}

async fn chat_stream(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> impl IntoResponse {
    let (messages, config) = request.into_run();
    let events = state.bridge.start(messages, config);
    info!(run_id = events.run_id(), "chat stream opened");

    let stream = events.map(|event| {
        Ok::<Event, Infallible>(
            Event::default()
                .event(event.name())
                .data(event.payload().to_string()),
        )
    });

    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    );
    ([("cache-control", "no-cache"), ("x-accel-buffering", "no")], sse)
}

async fn api_not_found() -> ApiError {
    ApiError {
        status: StatusCode::NOT_FOUND,
        message: "Not found".to_string(),
    }
}
