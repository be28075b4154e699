use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;

use super::MarketDataSource;
use crate::candle::{Candle, Interval};
use crate::error::HubError;

pub const EXCHANGE: &str = "binance";
/// Largest page `/v1/klines` will serve.
pub const MAX_KLINES_LIMIT: u32 = 1500;

const MAX_RETRIES: u32 = 3;

/// Binance USDⓈ-M futures REST client (klines only).
#[derive(Clone)]
pub struct BinanceClient {
    http: Client,
    fapi_base_url: String,
    timeout: Duration,
}

impl BinanceClient {
    pub fn new(fapi_base_url: &str, timeout: Duration) -> Result<Self, HubError> {
        let http = Client::builder()
            .user_agent("replay-hub")
            .build()
            .map_err(|e| HubError::Internal(format!("build reqwest client: {e}")))?;
        Ok(Self {
            http,
            fapi_base_url: fapi_base_url.trim_end_matches('/').to_string(),
            timeout: timeout.max(Duration::from_secs(1)),
        })
    }

    fn klines_url(&self) -> String {
        format!("{}/v1/klines", self.fapi_base_url)
    }

    async fn get_klines(&self, query: &[(&str, String)]) -> Result<Vec<Value>, HubError> {
        let mut last_err: Option<HubError> = None;

        for attempt in 1..=MAX_RETRIES {
            let res = self
                .http
                .get(self.klines_url())
                .query(query)
                .timeout(self.timeout)
                .send()
                .await;

            let mut backoff: Option<Duration> = None;
            match res {
                Ok(resp) if resp.status().is_success() => {
                    let v: Value = resp.json().await?;
                    return match v {
                        Value::Array(rows) => Ok(rows),
                        other => Err(HubError::Upstream(format!(
                            "binance klines: expected array, got {other}"
                        ))),
                    };
                }
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        // Respect Retry-After when present; otherwise back off harder on rate limit.
                        let retry_after = resp
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.trim().parse::<u64>().ok());
                        backoff = Some(
                            retry_after
                                .map(Duration::from_secs)
                                .unwrap_or_else(|| Duration::from_secs(u64::from(attempt) * 2))
                                .min(Duration::from_secs(60)),
                        );
                        last_err = Some(HubError::Upstream(format!("binance klines HTTP {status}")));
                    } else {
                        let body = resp.text().await.unwrap_or_default();
                        if status.is_client_error() {
                            // Bad symbol, bad range: retrying will not help.
                            return Err(HubError::BadRequest(format!(
                                "binance rejected klines request ({status}): {body}"
                            )));
                        }
                        last_err = Some(HubError::Upstream(format!(
                            "binance klines HTTP {status}: {body}"
                        )));
                    }
                }
                Err(e) => {
                    last_err = Some(HubError::Upstream(format!("binance klines request failed: {e}")));
                }
            }

            if attempt < MAX_RETRIES {
                let d = backoff
                    .unwrap_or_else(|| Duration::from_millis(200 * u64::from(attempt).pow(2)));
                tracing::warn!(attempt, backoff_ms = d.as_millis() as u64, "binance klines retry");
                tokio::time::sleep(d).await;
            }
        }

        Err(last_err.unwrap_or_else(|| HubError::Upstream("binance klines failed".into())))
    }
}

#[async_trait]
impl MarketDataSource for BinanceClient {
    fn exchange(&self) -> &'static str {
        EXCHANGE
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Candle>, HubError> {
        let mut query = vec![
            ("symbol", symbol.to_string()),
            ("interval", interval.as_str().to_string()),
            ("limit", limit.clamp(1, MAX_KLINES_LIMIT).to_string()),
            ("startTime", start_ms.to_string()),
        ];
        if let Some(end) = end_ms {
            query.push(("endTime", end.to_string()));
        }

        let rows = self.get_klines(&query).await?;
        Ok(normalize_klines(&rows, symbol))
    }
}

/// Convert raw kline rows (`[openTime, open, high, low, close, volume, ...]`)
/// into candles. Malformed rows are logged and skipped.
pub fn normalize_klines(rows: &[Value], symbol: &str) -> Vec<Candle> {
    rows.iter()
        .enumerate()
        .filter_map(|(idx, row)| match parse_kline(row, symbol) {
            Ok(candle) => Some(candle),
            Err(reason) => {
                tracing::warn!(row = idx, data = %row, reason, "skipping kline row");
                None
            }
        })
        .collect()
}

fn parse_kline(row: &Value, symbol: &str) -> Result<Candle, &'static str> {
    let cols = row.as_array().ok_or("not an array")?;
    if cols.len() < 6 {
        return Err("not enough columns");
    }
    let open_ms = cols[0].as_i64().ok_or("invalid open time")?;
    let dec = |idx: usize| -> Result<Decimal, &'static str> {
        let raw = cols[idx].as_str().ok_or("price/volume is not a string")?;
        Decimal::from_str(raw).map_err(|_| "invalid decimal")
    };

    Ok(Candle {
        epoch: open_ms.div_euclid(1000),
        pair: symbol.to_string(),
        exchange: EXCHANGE.to_string(),
        open: dec(1)?,
        high: dec(2)?,
        low: dec(3)?,
        close: dec(4)?,
        volume: dec(5)?,
    })
}
