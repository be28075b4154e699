use axum::{
    extract::{rejection::JsonRejection, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::HubError;
use crate::replay::{CreatedStream, StreamRequest};
use crate::state::AppState;
use crate::ws;

/// Body for POST /v1/replay/create.
#[derive(Debug, Deserialize)]
pub struct CreateStreamBody {
    pub exchange: String,
    pub symbol: String,
    /// Defaults to `1m`.
    pub interval: Option<String>,
    /// Defaults to 1.0 when omitted or not positive.
    pub playback_speed: Option<f64>,
    pub start_time_unix_milli: i64,
    pub end_time_unix_milli: i64,
}

/// Build replay sub-router.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/replay/create", post(create_stream))
        .route("/v1/replay/stream", get(stream))
}

fn millis_to_utc(field: &str, ms: i64) -> Result<DateTime<Utc>, HubError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| HubError::BadRequest(format!("{field} out of range: {ms}")))
}

impl CreateStreamBody {
    fn into_request(self) -> Result<StreamRequest, HubError> {
        let exchange = self.exchange.trim().to_string();
        let symbol = self.symbol.trim().to_string();
        if exchange.is_empty() || symbol.is_empty() {
            return Err(HubError::BadRequest("exchange and symbol are required".into()));
        }
        let start = millis_to_utc("start_time_unix_milli", self.start_time_unix_milli)?;
        let end = millis_to_utc("end_time_unix_milli", self.end_time_unix_milli)?;
        if end <= start {
            return Err(HubError::BadRequest(
                "end_time_unix_milli must be after start_time_unix_milli".into(),
            ));
        }
        Ok(StreamRequest {
            exchange,
            symbol,
            interval: self.interval,
            playback_speed: self.playback_speed,
            start,
            end,
        })
    }
}

/// POST /v1/replay/create — issue a channel and token for a historical range.
async fn create_stream(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateStreamBody>, JsonRejection>,
) -> Result<Json<CreatedStream>, HubError> {
    let Json(body) = body?;
    let created = state.registry.create_stream(body.into_request()?).await?;
    Ok(Json(created))
}

/// GET /v1/replay/stream — upgrade and run the replay protocol.
async fn stream(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws::run_session(socket, state))
}
