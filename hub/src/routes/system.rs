use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::state::AppState;

/// Build system sub-router.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}

/// GET /health — 200 while serving, 503 while starting or draining.
async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let sessions = state.active_sessions();
    if state.is_healthy() {
        (StatusCode::OK, Json(json!({ "status": "ok", "sessions": sessions })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "sessions": sessions })),
        )
    }
}
