//! Upstream market data used to backfill the candle store.

pub mod binance;
pub mod import;

use async_trait::async_trait;

use crate::candle::{Candle, Interval};
use crate::error::HubError;

pub use binance::BinanceClient;
pub use import::{import_candles, ImportRequest, ImportSummary};

/// A venue that can serve historical candles.
///
/// `fetch_candles` returns bars whose open time is at or after `start_ms`,
/// oldest first. An empty vec means nothing more is available.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Exchange name stamped on every returned candle.
    fn exchange(&self) -> &'static str;

    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Candle>, HubError>;
}
