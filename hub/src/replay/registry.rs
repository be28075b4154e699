use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha512};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::constant_time_eq;
use crate::candle::Interval;
use crate::db::CandleStore;
use crate::error::HubError;

/// Everything needed to replay one stream. Immutable once issued; sessions get
/// their own clone so sweeping the registry never disturbs a running replay.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescriptor {
    pub interval: Interval,
    pub exchange: String,
    pub symbol: String,
    pub playback_speed: f64,
    pub start: DateTime<Utc>,
    /// Exclusive upper bound.
    pub end: DateTime<Utc>,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl StreamDescriptor {
    /// Delay between two emitted records.
    pub fn latency(&self) -> Duration {
        self.interval.cadence().div_f64(self.playback_speed)
    }
}

/// Parameters of a create-stream call.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub exchange: String,
    pub symbol: String,
    /// `None` selects [`Interval::DEFAULT`].
    pub interval: Option<String>,
    pub playback_speed: Option<f64>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedStream {
    pub candle_count: u64,
    pub channel: String,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub ttl: Duration,
    pub token_len: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            token_len: 20,
        }
    }
}

/// In-memory table of issued replay channels.
///
/// The mutex only ever guards a map operation; store calls happen before the
/// lock is taken.
pub struct ChannelRegistry {
    store: Arc<dyn CandleStore>,
    settings: RegistrySettings,
    channels: Mutex<HashMap<String, StreamDescriptor>>,
    last_stamp_ms: AtomicI64,
}

impl ChannelRegistry {
    pub fn new(store: Arc<dyn CandleStore>, settings: RegistrySettings) -> Self {
        Self {
            store,
            settings,
            channels: Mutex::new(HashMap::new()),
            last_stamp_ms: AtomicI64::new(0),
        }
    }

    pub fn store(&self) -> Arc<dyn CandleStore> {
        Arc::clone(&self.store)
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, StreamDescriptor>> {
        // A panic while holding the lock cannot leave the map half-written.
        self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Millisecond creation stamp that never repeats within this registry.
    fn next_stamp_ms(&self, now: DateTime<Utc>) -> i64 {
        let now_ms = now.timestamp_millis();
        let prev = self
            .last_stamp_ms
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now_ms.max(last + 1))
            })
            .unwrap_or(now_ms);
        now_ms.max(prev + 1)
    }

    fn new_token(&self) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(self.settings.token_len)
            .map(char::from)
            .collect()
    }

    /// Issue a new channel for `req` and return its token and candle count.
    pub async fn create_stream(&self, req: StreamRequest) -> Result<CreatedStream, HubError> {
        let interval: Interval = match req.interval.as_deref() {
            None | Some("") => Interval::DEFAULT,
            Some(raw) => raw.parse::<Interval>().inspect_err(|_| {
                tracing::warn!(
                    exchange = %req.exchange,
                    symbol = %req.symbol,
                    interval = raw,
                    "create stream rejected: interval not implemented"
                );
            })?,
        };

        let candle_count = self
            .store
            .count(interval, &req.exchange, &req.symbol, req.start, req.end)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    error = %e,
                    exchange = %req.exchange,
                    symbol = %req.symbol,
                    start = %req.start,
                    end = %req.end,
                    "create stream failed: candle count"
                );
            })?;

        let playback_speed = match req.playback_speed {
            Some(speed) if speed > 0.0 && speed.is_finite() => speed,
            _ => 1.0,
        };

        let now = Utc::now();
        let stamp_ms = self.next_stamp_ms(now);
        let channel = channel_id(&req.exchange, &req.symbol, interval, stamp_ms);
        let token = self.new_token();
        let ttl = ChronoDuration::from_std(self.settings.ttl).unwrap_or(ChronoDuration::MAX);

        let descriptor = StreamDescriptor {
            interval,
            exchange: req.exchange,
            symbol: req.symbol,
            playback_speed,
            start: req.start,
            end: req.end,
            token: token.clone(),
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        tracing::info!(
            channel = %channel,
            exchange = %descriptor.exchange,
            symbol = %descriptor.symbol,
            interval = %interval,
            playback_speed,
            candle_count,
            "replay stream created"
        );

        self.table().insert(channel.clone(), descriptor);

        Ok(CreatedStream {
            candle_count,
            channel,
            token,
        })
    }

    /// Look up a channel and check its bearer token.
    pub fn resolve(&self, channel: &str, token: &str) -> Result<StreamDescriptor, HubError> {
        let descriptor = self
            .table()
            .get(channel)
            .cloned()
            .ok_or_else(|| HubError::ChannelNotFound(channel.to_string()))?;

        if !constant_time_eq(descriptor.token.as_bytes(), token.as_bytes()) {
            return Err(HubError::InvalidToken);
        }
        Ok(descriptor)
    }

    /// Drop every channel whose expiry has passed. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut table = self.table();
        let before = table.len();
        table.retain(|_, d| now < d.expires_at);
        before - table.len()
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `"ch:" + hex(sha512(exchange ‖ symbol ‖ interval ‖ creation millis))`.
pub fn channel_id(exchange: &str, symbol: &str, interval: Interval, stamp_ms: i64) -> String {
    let digest = Sha512::digest(format!("{exchange}{symbol}{interval}{stamp_ms}").as_bytes());
    format!("ch:{}", hex::encode(digest))
}

/// Background task: sweep expired channels every `period` until `shutdown`.
pub fn spawn_sweeper(
    registry: Arc<ChannelRegistry>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await; // Skip the immediate first tick
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = registry.sweep();
                    tracing::debug!(removed, remaining = registry.len(), "channel sweep");
                }
            }
        }
    })
}
