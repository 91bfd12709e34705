//! HTTP query surface.
//!
//! Read-only endpoints for service discovery, health checks and session
//! presence, served beside the WebSocket listener.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use relay_core::Relay;
use serde::Serialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

const SERVICE_NAME: &str = "whiteboard-relay";

#[derive(Debug, Serialize)]
pub struct SessionUsers {
    pub session_id: String,
    pub active_users: Vec<String>,
}

/// Build the HTTP router over a shared relay.
pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/sessions/{session_id}/users", get(session_users))
        .layer(TraceLayer::new_for_http())
        .with_state(relay)
}

async fn root(State(relay): State<Arc<Relay>>) -> impl IntoResponse {
    Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "connected_peers": relay.peer_count(),
        "active_sessions": relay.session_count(),
    }))
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
    }))
}

/// Unknown sessions report an empty user list rather than 404.
async fn session_users(
    State(relay): State<Arc<Relay>>,
    Path(session_id): Path<String>,
) -> Json<SessionUsers> {
    let active_users = relay.get_session_users(&session_id);
    tracing::debug!(session_id, count = active_users.len(), "Session users queried");
    Json(SessionUsers {
        session_id,
        active_users,
    })
}
