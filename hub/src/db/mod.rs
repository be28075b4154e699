pub mod candles;
pub mod pool;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::candle::{Candle, Interval};
use crate::error::HubError;

pub use candles::SqliteCandleStore;

/// Historical candle storage consumed by the registry and the replay pipeline.
///
/// Ranges are half-open: `[start, end)`. `get_range` returns rows ascending by
/// epoch and an empty vec once nothing remains.
#[async_trait]
pub trait CandleStore: Send + Sync {
    async fn insert_many(&self, interval: Interval, candles: Vec<Candle>) -> Result<usize, HubError>;

    async fn count(
        &self,
        interval: Interval,
        exchange: &str,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, HubError>;

    async fn get_range(
        &self,
        interval: Interval,
        exchange: &str,
        symbol: &str,
        cursor: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candle>, HubError>;
}
