#![allow(dead_code)]

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;

use replay_hub::candle::{Candle, Interval};
use replay_hub::config::HubConfig;
use replay_hub::db::pool::open_memory_pool;
use replay_hub::db::{CandleStore, SqliteCandleStore};
use replay_hub::error::HubError;
use replay_hub::market::MarketDataSource;
use replay_hub::state::AppState;

pub const T0: i64 = 1_700_000_000;

pub fn bar(epoch: i64) -> Candle {
    let px = Decimal::from_str("43210.12345678").unwrap();
    Candle {
        epoch,
        pair: "BTCUSDT".into(),
        exchange: "binance".into(),
        open: px,
        high: px,
        low: px,
        close: px,
        volume: Decimal::from_str("1.5").unwrap(),
    }
}

/// Venue that serves `bars` one-minute candles starting at `T0`.
pub struct StaticVenue {
    pub bars: i64,
}

#[async_trait]
impl MarketDataSource for StaticVenue {
    fn exchange(&self) -> &'static str {
        "binance"
    }

    async fn fetch_candles(
        &self,
        _symbol: &str,
        _interval: Interval,
        start_ms: i64,
        end_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Candle>, HubError> {
        Ok((0..self.bars)
            .map(|i| T0 + i * 60)
            .filter(|e| e * 1000 >= start_ms)
            .filter(|e| end_ms.map_or(true, |end| e * 1000 <= end))
            .take(limit as usize)
            .map(bar)
            .collect())
    }
}

/// Healthy state over an in-memory store seeded with `bars` candles from `T0`.
pub async fn seeded_state(config: HubConfig, bars: i64) -> Arc<AppState> {
    let store: Arc<dyn CandleStore> = Arc::new(SqliteCandleStore::new(open_memory_pool().unwrap()));
    let candles: Vec<Candle> = (0..bars).map(|i| bar(T0 + i * 60)).collect();
    store.insert_many(Interval::Minute1, candles).await.unwrap();

    let state = AppState::with_parts(config, store, Arc::new(StaticVenue { bars: 0 }));
    state.set_healthy(true);
    state
}
