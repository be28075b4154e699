//! Market-data replay hub.
//!
//! Serves historical OHLCV candles over WebSocket at a configurable playback
//! speed. Streams are created over HTTP (`POST /v1/replay/create`), which
//! returns a channel id and bearer token; the client then opens
//! `/v1/replay/stream` and authenticates in-band.

pub mod auth;
pub mod candle;
pub mod config;
pub mod db;
pub mod error;
pub mod market;
pub mod replay;
pub mod routes;
pub mod state;
pub mod ws;

use axum::http::HeaderValue;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use auth::AdminToken;
use state::AppState;

/// Build the full HTTP application for `state`.
pub fn app(state: Arc<AppState>) -> Router {
    let admin_token = AdminToken(state.config.admin_token.clone());
    let cors = cors_layer(&state.config.cors_origins);

    routes::api_router()
        .layer(axum::Extension(admin_token))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Permissive when no origins are configured, otherwise an exact allow-list.
fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}
