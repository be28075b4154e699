use axum::{
    extract::{rejection::JsonRejection, State},
    middleware,
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::auth::require_admin_token;
use crate::candle::Interval;
use crate::error::HubError;
use crate::market::binance::MAX_KLINES_LIMIT;
use crate::market::import::PAGE_PAUSE;
use crate::market::{import_candles, ImportRequest, ImportSummary};
use crate::state::AppState;

/// Body for POST /v1/write/binance.
#[derive(Debug, Deserialize)]
pub struct ImportBinanceBody {
    pub symbol: String,
    pub interval: String,
    /// Page size per upstream call. Defaults to the venue maximum.
    pub limit: Option<u32>,
    pub start_time_unix_milli: i64,
    /// Zero or absent imports up to the newest available bar.
    pub end_time_unix_milli: Option<i64>,
}

/// Build write sub-router. Guarded by the admin token when one is configured.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/write/binance", post(import_binance))
        .route_layer(middleware::from_fn(require_admin_token))
}

impl ImportBinanceBody {
    fn into_request(self) -> Result<ImportRequest, HubError> {
        let symbol = self.symbol.trim().to_ascii_uppercase();
        if symbol.is_empty() {
            return Err(HubError::BadRequest("symbol is required".into()));
        }
        let interval: Interval = self.interval.parse()?;
        if self.start_time_unix_milli < 0 {
            return Err(HubError::BadRequest("start_time_unix_milli must not be negative".into()));
        }
        let end_ms = self.end_time_unix_milli.filter(|&end| end != 0);
        if end_ms.is_some_and(|end| end < self.start_time_unix_milli) {
            return Err(HubError::BadRequest(
                "end_time_unix_milli must not precede start_time_unix_milli".into(),
            ));
        }
        Ok(ImportRequest {
            symbol,
            interval,
            limit: self.limit.unwrap_or(MAX_KLINES_LIMIT).clamp(1, MAX_KLINES_LIMIT),
            start_ms: self.start_time_unix_milli,
            end_ms,
        })
    }
}

/// POST /v1/write/binance — backfill the store from Binance klines.
async fn import_binance(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ImportBinanceBody>, JsonRejection>,
) -> Result<Json<ImportSummary>, HubError> {
    let Json(body) = body?;
    let req = body.into_request()?;
    let summary = import_candles(
        state.market_data.as_ref(),
        state.store.as_ref(),
        req,
        PAGE_PAUSE,
    )
    .await?;
    Ok(Json(summary))
}
