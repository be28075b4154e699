use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::replay::{RegistrySettings, DEFAULT_PAGE_SIZE, MIN_PAGE_SIZE};

/// Hub configuration derived from `REPLAY_*` environment variables.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub bind: String,
    pub port: u16,

    // ── Storage ────────────────────────────────────────────────────
    pub candles_db: PathBuf,
    pub db_pool_size: u32,

    // ── HTTP ───────────────────────────────────────────────────────
    /// Allowed CORS origins. Empty ⇒ permissive.
    pub cors_origins: Vec<String>,
    /// Bearer token for the write routes. Empty ⇒ auth disabled.
    pub admin_token: String,

    // ── Upstream ───────────────────────────────────────────────────
    pub binance_fapi_url: String,
    pub binance_timeout_s: u64,

    // ── Replay ─────────────────────────────────────────────────────
    pub stream_ttl_secs: u64,
    pub sweep_secs: u64,
    pub token_len: usize,
    pub page_size: usize,
    pub sink_capacity: usize,
    pub close_grace_ms: u64,

    pub shutdown_grace_secs: u64,
}

fn env_str(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_u16(name: &str, default: u16) -> u16 {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_csv(name: &str) -> Vec<String> {
    env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
            candles_db: PathBuf::from("candles.db"),
            db_pool_size: 4,
            cors_origins: Vec::new(),
            admin_token: String::new(),
            binance_fapi_url: "https://fapi.binance.com/fapi".to_string(),
            binance_timeout_s: 10,
            stream_ttl_secs: 24 * 60 * 60,
            sweep_secs: 60 * 60,
            token_len: 20,
            page_size: DEFAULT_PAGE_SIZE,
            sink_capacity: 64,
            close_grace_ms: 100,
            shutdown_grace_secs: 5,
        }
    }
}

impl HubConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bind: env_str("REPLAY_BIND", &d.bind),
            port: env_u16("REPLAY_PORT", d.port),
            candles_db: PathBuf::from(env_str("REPLAY_CANDLES_DB", "candles.db")),
            db_pool_size: env_u64("REPLAY_DB_POOL_SIZE", u64::from(d.db_pool_size))
                .clamp(1, 64) as u32,
            cors_origins: env_csv("REPLAY_CORS_ORIGINS"),
            admin_token: env_str("REPLAY_ADMIN_TOKEN", ""),
            binance_fapi_url: env_str("REPLAY_BINANCE_FAPI_URL", &d.binance_fapi_url)
                .trim_end_matches('/')
                .to_string(),
            binance_timeout_s: env_u64("REPLAY_BINANCE_TIMEOUT_S", d.binance_timeout_s).max(1),
            stream_ttl_secs: env_u64("REPLAY_STREAM_TTL_SECS", d.stream_ttl_secs),
            sweep_secs: env_u64("REPLAY_SWEEP_SECS", d.sweep_secs).max(1),
            token_len: env_usize("REPLAY_TOKEN_LEN", d.token_len).clamp(8, 128),
            page_size: env_usize("REPLAY_PAGE_SIZE", d.page_size).max(MIN_PAGE_SIZE),
            sink_capacity: env_usize("REPLAY_SINK_CAPACITY", d.sink_capacity).max(1),
            close_grace_ms: env_u64("REPLAY_CLOSE_GRACE_MS", d.close_grace_ms),
            shutdown_grace_secs: env_u64("REPLAY_SHUTDOWN_GRACE_SECS", d.shutdown_grace_secs),
        }
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            ttl: Duration::from_secs(self.stream_ttl_secs),
            token_len: self.token_len,
        }
    }

    pub fn sweep_period(&self) -> Duration {
        Duration::from_secs(self.sweep_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
