//! Admin HTTP API: health, build info, and manual command submission (spec §5.2).
//!
//! Grounded on `hdds-gateway`'s `routes.rs`/`handlers.rs` split (axum `Router<Arc<AppState>>`,
//! one handler function per route) and on the bearer-token gate pattern used across the
//! pack's other axum services.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::presence::command_queue::CommandQueue;
use crate::presence::PresenceStore;

pub struct AppState {
    pub presence: PresenceStore,
    pub commands: CommandQueue,
    pub secret_key: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/info", get(info))
        .route("/api/commands/:imei", post(enqueue_command))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Serialize)]
struct InfoResponse {
    name: &'static str,
    version: &'static str,
    uptime_seconds: i64,
}

async fn info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    Json(InfoResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: (chrono::Utc::now() - state.started_at).num_seconds(),
    })
}

#[derive(Deserialize)]
struct EnqueueCommandRequest {
    command: String,
}

#[derive(Serialize)]
struct EnqueueCommandResponse {
    message: String,
}

async fn enqueue_command(
    State(state): State<Arc<AppState>>,
    Path(imei): Path<String>,
    headers: HeaderMap,
    Json(request): Json<EnqueueCommandRequest>,
) -> Response {
    if !authorized(&headers, &state.secret_key) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    match state.presence.is_authorized(&imei).await {
        Ok(true) => {}
        Ok(false) => return StatusCode::NOT_FOUND.into_response(),
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }

    match state.commands.enqueue(&imei, &request.command).await {
        Ok(id) => Json(EnqueueCommandResponse {
            message: format!("command {} queued for {}", id, imei),
        })
        .into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn authorized(headers: &HeaderMap, secret_key: &str) -> bool {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value == format!("Bearer {}", secret_key))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorized_requires_exact_bearer_match() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer secret".parse().unwrap());
        assert!(authorized(&headers, "secret"));
        assert!(!authorized(&headers, "other"));
    }

    #[test]
    fn test_authorized_rejects_missing_header() {
        let headers = HeaderMap::new();
        assert!(!authorized(&headers, "secret"));
    }
}
