//! chainweave daemon
//!
//! Connects to every configured chain, starts block sync on the chains listed
//! under `sync.autostart`, purges stale transaction records and serves Prometheus metrics until signalled.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use chainweave::metrics::MetricsServer;
use chainweave::{ChainManager, Settings, SyncManager, TransactionManager};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting chainweave v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!("Loaded configuration for {} chains", settings.chains.len());

    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let chain_manager = Arc::new(ChainManager::with_ethers(settings.manager.clone()));
    chain_manager
        .configure(settings.chains.clone())
        .await
        .context("Failed to connect configured chains")?;
    info!("Chain connections initialized");

    let tx_manager = Arc::new(TransactionManager::new(
        chain_manager.clone(),
        settings.transactions.clone(),
    ));
    tx_manager.start_purge_task().await;

    let sync_manager = SyncManager::new(chain_manager.clone(), settings.sync.clone());
    for chain in &settings.sync.autostart {
        match sync_manager.start_sync(chain, None, None).await {
            Ok(status) => info!(
                "Sync started on chain {} at block {}",
                chain, status.current_block
            ),
            Err(e) => warn!("Could not start sync on chain {}: {}", chain, e),
        }
    }

    info!("chainweave is running");
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    sync_manager.stop_all().await;
    tx_manager.stop().await;
    chain_manager.stop().await;
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("chainweave stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,chainweave=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
