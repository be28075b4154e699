use serde::Serialize;
use std::time::Duration;

use super::MarketDataSource;
use crate::candle::Interval;
use crate::db::CandleStore;
use crate::error::HubError;

/// Pause between upstream pages.
pub const PAGE_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub symbol: String,
    pub interval: Interval,
    pub limit: u32,
    pub start_ms: i64,
    /// Inclusive. `None` imports until the venue runs out of data.
    pub end_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub pages: u64,
    pub last_epoch: Option<i64>,
}

/// Page through `source` from `req.start_ms` and write every bar to `store`.
///
/// After each page the start moves to one interval past the newest bar. The
/// loop stops on an empty page, once the start passes `end_ms`, or when a page
/// makes no forward progress.
pub async fn import_candles(
    source: &dyn MarketDataSource,
    store: &dyn CandleStore,
    req: ImportRequest,
    page_pause: Duration,
) -> Result<ImportSummary, HubError> {
    let mut summary = ImportSummary::default();
    let mut start_ms = req.start_ms;
    let step = i64::try_from(req.interval.duration_secs()).unwrap_or(i64::MAX);

    tracing::info!(
        exchange = source.exchange(),
        symbol = %req.symbol,
        interval = %req.interval,
        start_ms,
        end_ms = ?req.end_ms,
        limit = req.limit,
        "candle import started"
    );

    loop {
        let candles = source
            .fetch_candles(&req.symbol, req.interval, start_ms, req.end_ms, req.limit)
            .await
            .inspect_err(|e| {
                tracing::error!(error = %e, symbol = %req.symbol, start_ms, "candle import fetch failed");
            })?;

        let Some(last_epoch) = candles.iter().map(|c| c.epoch).max() else {
            break;
        };

        let inserted = store
            .insert_many(req.interval, candles)
            .await
            .inspect_err(|e| {
                tracing::error!(error = %e, symbol = %req.symbol, start_ms, "candle import insert failed");
            })?;
        summary.imported += inserted;
        summary.pages += 1;
        summary.last_epoch = Some(last_epoch);

        let next_ms = last_epoch.saturating_add(step).saturating_mul(1000);
        if next_ms <= start_ms {
            tracing::warn!(start_ms, last_epoch, "candle import made no progress; stopping");
            break;
        }
        start_ms = next_ms;

        if req.end_ms.is_some_and(|end| start_ms > end) {
            break;
        }

        tracing::info!(
            symbol = %req.symbol,
            last_epoch,
            next_ms = start_ms,
            imported = summary.imported,
            "candle import in progress"
        );
        tokio::time::sleep(page_pause).await;
    }

    tracing::info!(
        symbol = %req.symbol,
        imported = summary.imported,
        pages = summary.pages,
        last_epoch = ?summary.last_epoch,
        "candle import done"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle::Candle;
    use crate::db::pool::open_memory_pool;
    use crate::db::SqliteCandleStore;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use std::sync::Mutex;

    const T0: i64 = 1_700_000_000;

    /// Venue holding `bars` one-minute bars from T0, served `page` at a time.
    struct FakeVenue {
        bars: i64,
        page: i64,
        starts: Mutex<Vec<i64>>,
        fail: bool,
    }

    impl FakeVenue {
        fn new(bars: i64, page: i64) -> Self {
            Self {
                bars,
                page,
                starts: Mutex::new(Vec::new()),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl MarketDataSource for FakeVenue {
        fn exchange(&self) -> &'static str {
            "binance"
        }

        async fn fetch_candles(
            &self,
            symbol: &str,
            _: Interval,
            start_ms: i64,
            end_ms: Option<i64>,
            _: u32,
        ) -> Result<Vec<Candle>, HubError> {
            self.starts.lock().unwrap().push(start_ms);
            if self.fail {
                return Err(HubError::Upstream("HTTP 503".into()));
            }
            let first = ((start_ms / 1000 - T0).max(0) + 59) / 60;
            Ok((first..self.bars)
                .take(self.page as usize)
                .map(|i| T0 + i * 60)
                .filter(|epoch| end_ms.map_or(true, |end| epoch * 1000 <= end))
                .map(|epoch| Candle {
                    epoch,
                    pair: symbol.to_string(),
                    exchange: "binance".into(),
                    open: Decimal::ONE,
                    high: Decimal::ONE,
                    low: Decimal::ONE,
                    close: Decimal::ONE,
                    volume: Decimal::ONE,
                })
                .collect())
        }
    }

    fn request(end_ms: Option<i64>) -> ImportRequest {
        ImportRequest {
            symbol: "BTCUSDT".into(),
            interval: Interval::Minute1,
            limit: 4,
            start_ms: T0 * 1000,
            end_ms,
        }
    }

    async fn stored(store: &SqliteCandleStore) -> u64 {
        store
            .count(
                Interval::Minute1,
                "binance",
                "BTCUSDT",
                Utc.timestamp_opt(T0, 0).unwrap(),
                Utc.timestamp_opt(T0 + 86_400, 0).unwrap(),
            )
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn pages_until_the_venue_runs_dry() {
        let venue = FakeVenue::new(10, 4);
        let store = SqliteCandleStore::new(open_memory_pool().unwrap());

        let summary = import_candles(&venue, &store, request(None), PAGE_PAUSE).await.unwrap();

        assert_eq!(summary.imported, 10);
        assert_eq!(summary.pages, 3);
        assert_eq!(summary.last_epoch, Some(T0 + 540));
        assert_eq!(stored(&store).await, 10);
        // Each page starts one interval after the previous page's newest bar.
        let starts = venue.starts.lock().unwrap().clone();
        assert_eq!(
            starts,
            vec![T0 * 1000, (T0 + 240) * 1000, (T0 + 480) * 1000, (T0 + 600) * 1000]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stops_once_start_passes_end() {
        let venue = FakeVenue::new(100, 4);
        let store = SqliteCandleStore::new(open_memory_pool().unwrap());
        let end_ms = (T0 + 300) * 1000;

        let summary = import_candles(&venue, &store, request(Some(end_ms)), PAGE_PAUSE)
            .await
            .unwrap();

        assert_eq!(summary.imported, 6);
        assert_eq!(summary.last_epoch, Some(T0 + 300));
        assert_eq!(venue.starts.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn upstream_failure_is_returned() {
        let mut venue = FakeVenue::new(10, 4);
        venue.fail = true;
        let store = SqliteCandleStore::new(open_memory_pool().unwrap());

        let err = import_candles(&venue, &store, request(None), PAGE_PAUSE)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Upstream(_)));
        assert_eq!(stored(&store).await, 0);
    }
}
