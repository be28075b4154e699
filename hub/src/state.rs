use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::HubConfig;
use crate::db::pool::open_rw_pool;
use crate::db::{CandleStore, SqliteCandleStore};
use crate::error::HubError;
use crate::market::{BinanceClient, MarketDataSource};
use crate::replay::{ChannelRegistry, ReplayPipeline};

/// Shared application state, passed to all route handlers via `axum::extract::State`.
pub struct AppState {
    pub config: HubConfig,
    pub store: Arc<dyn CandleStore>,
    pub registry: Arc<ChannelRegistry>,
    pub market_data: Arc<dyn MarketDataSource>,

    /// False while starting up and once shutdown begins; drives `/health`.
    healthy: AtomicBool,
    /// WebSocket sessions that have not finished closing yet.
    sessions: AtomicUsize,
    /// Process-wide shutdown. Every session token is a child of this one.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Open the candle database and build the Binance client from `config`.
    pub fn new(config: HubConfig) -> Result<Arc<Self>, HubError> {
        let pool = open_rw_pool(&config.candles_db, config.db_pool_size)?;
        let store: Arc<dyn CandleStore> = Arc::new(SqliteCandleStore::new(pool));
        let market_data: Arc<dyn MarketDataSource> = Arc::new(BinanceClient::new(
            &config.binance_fapi_url,
            Duration::from_secs(config.binance_timeout_s),
        )?);
        Ok(Self::with_parts(config, store, market_data))
    }

    /// Assemble state from already-built collaborators.
    pub fn with_parts(
        config: HubConfig,
        store: Arc<dyn CandleStore>,
        market_data: Arc<dyn MarketDataSource>,
    ) -> Arc<Self> {
        let registry = Arc::new(ChannelRegistry::new(
            Arc::clone(&store),
            config.registry_settings(),
        ));
        Arc::new(Self {
            config,
            store,
            registry,
            market_data,
            healthy: AtomicBool::new(false),
            sessions: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn pipeline(&self) -> ReplayPipeline {
        ReplayPipeline::new(Arc::clone(&self.store)).with_page_size(self.config.page_size)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.load(Ordering::Acquire)
    }

    pub(crate) fn session_opened(&self) {
        self.sessions.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn session_closed(&self) {
        self.sessions.fetch_sub(1, Ordering::AcqRel);
    }
}
