use anyhow::Context;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use replay_hub::config::HubConfig;
use replay_hub::replay::spawn_sweeper;
use replay_hub::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = HubConfig::from_env();
    let addr: SocketAddr = format!("{}:{}", cfg.bind, cfg.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", cfg.bind, cfg.port))?;
    let sweep_period = cfg.sweep_period();
    let shutdown_grace = cfg.shutdown_grace();

    let state = AppState::new(cfg).context("initialise hub state")?;
    let sweeper = spawn_sweeper(
        Arc::clone(&state.registry),
        sweep_period,
        state.shutdown.clone(),
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    state.set_healthy(true);
    tracing::info!("Replay hub listening on http://{addr}");

    let server = axum::serve(listener, replay_hub::app(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&state)))
        .into_future();

    let shutdown = state.shutdown.clone();
    tokio::select! {
        res = server => res.context("serve")?,
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(shutdown_grace).await;
        } => tracing::warn!("graceful shutdown timed out after {shutdown_grace:?}"),
    }

    if let Err(e) = sweeper.await {
        tracing::warn!("sweeper task failed: {e}");
    }
    tracing::info!("Replay hub stopped");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM, after flipping health and cancelling every
/// live session.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, gracefully stopping…");
    state.set_healthy(false);
    state.shutdown.cancel();
}
