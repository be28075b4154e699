use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::HubError;

/// One OHLCV bar. Prices and volume are serialized as JSON strings so they
/// survive the wire without float rounding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time, seconds since the Unix epoch.
    pub epoch: i64,
    pub pair: String,
    pub exchange: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub open: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub high: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub low: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub close: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub volume: Decimal,
}

/// Candle granularity supported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    Minute1,
}

impl Interval {
    /// Interval used when a request does not name one.
    pub const DEFAULT: Interval = Interval::Minute1;

    /// Wire spelling, also used when hashing channel ids.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Interval::Minute1 => "1m",
        }
    }

    /// Store table holding bars of this interval.
    pub const fn table_name(&self) -> &'static str {
        match self {
            Interval::Minute1 => "candles_1m",
        }
    }

    pub const fn duration_secs(&self) -> u64 {
        match self {
            Interval::Minute1 => 60,
        }
    }

    /// Real-time length of one bar.
    pub const fn cadence(&self) -> Duration {
        Duration::from_secs(self.duration_secs())
    }

    pub const fn all() -> &'static [Interval] {
        &[Interval::Minute1]
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Interval::all()
            .iter()
            .copied()
            .find(|iv| iv.as_str() == wanted)
            .ok_or_else(|| HubError::UnsupportedInterval(wanted.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn sample() -> Candle {
        Candle {
            epoch: 1_700_000_040,
            pair: "BTCUSDT".into(),
            exchange: "binance".into(),
            open: Decimal::from_str("37123.10000001").unwrap(),
            high: Decimal::from_str("37150.5").unwrap(),
            low: Decimal::from_str("37100").unwrap(),
            close: Decimal::from_str("37140.25").unwrap(),
            volume: Decimal::from_str("12.3456789012345678").unwrap(),
        }
    }

    #[test]
    fn decimals_are_encoded_as_strings() {
        let v: Value = serde_json::to_value(sample()).unwrap();
        assert_eq!(
            v,
            json!({
                "epoch": 1_700_000_040i64,
                "pair": "BTCUSDT",
                "exchange": "binance",
                "open": "37123.10000001",
                "high": "37150.5",
                "low": "37100",
                "close": "37140.25",
                "volume": "12.3456789012345678",
            })
        );
    }

    #[test]
    fn wire_decoding_keeps_full_precision() {
        let text = serde_json::to_string(&sample()).unwrap();
        let back: Candle = serde_json::from_str(&text).unwrap();
        assert_eq!(back.volume.to_string(), "12.3456789012345678");
        assert_eq!(back, sample());
    }

    #[test]
    fn interval_parses_known_spelling_only() {
        assert_eq!("1m".parse::<Interval>().unwrap(), Interval::Minute1);
        assert_eq!(" 1m ".parse::<Interval>().unwrap(), Interval::Minute1);
        assert!(matches!(
            "5m".parse::<Interval>(),
            Err(HubError::UnsupportedInterval(iv)) if iv == "5m"
        ));
    }

    #[test]
    fn minute_interval_cadence_is_one_minute() {
        assert_eq!(Interval::Minute1.cadence(), Duration::from_secs(60));
        assert_eq!(Interval::Minute1.table_name(), "candles_1m");
    }
}
