//! Active health monitoring, one task per connected chain
//!
//! Each tick re-dials evicted endpoints, probes every pooled session for its
//! block height under the probe timeout, and folds the results into the
//! chain-level status: any success resets the failure counter, and the
//! configured number of consecutive failed ticks flips the chain to `error`.

use super::pool::{ConnectionPool, Dialer};
use crate::metrics;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Error,
}

/// Health record shared between a monitor and status queries
#[derive(Debug, Clone)]
pub struct ChainHealth {
    pub state: ConnectionState,
    pub last_block: Option<u64>,
    pub consecutive_failures: u32,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ChainHealth {
    pub fn connected(block: Option<u64>) -> Self {
        Self {
            state: ConnectionState::Connected,
            last_block: block,
            consecutive_failures: 0,
            last_checked: Some(Utc::now()),
            last_error: None,
        }
    }
}

pub struct HealthMonitor {
    chain: String,
    chain_id: u64,
    pool: Arc<ConnectionPool>,
    dialer: Dialer,
    statuses: Arc<DashMap<String, ChainHealth>>,
    interval: Duration,
    probe_timeout: Duration,
    unhealthy_threshold: u32,
}

impl HealthMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: &str,
        chain_id: u64,
        pool: Arc<ConnectionPool>,
        dialer: Dialer,
        statuses: Arc<DashMap<String, ChainHealth>>,
        interval: Duration,
        probe_timeout: Duration,
        unhealthy_threshold: u32,
    ) -> Self {
        Self {
            chain: chain.to_string(),
            chain_id,
            pool,
            dialer,
            statuses,
            interval,
            probe_timeout,
            unhealthy_threshold: unhealthy_threshold.max(1),
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(
            chain = %self.chain,
            interval_ms = self.interval.as_millis() as u64,
            "Health monitor starting"
        );

        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.check() => {}
            }
        }

        info!(chain = %self.chain, "Health monitor stopped");
    }

    /// One health tick
    pub async fn check(&self) {
        if let Some(e) = self.dialer.fill(&self.pool, self.chain_id).await {
            debug!(chain = %self.chain, error = %e, "Re-dial incomplete");
        }

        let mut best_block = None;
        let mut last_error = None;

        for connection in self.pool.snapshot().await {
            match time::timeout(self.probe_timeout, connection.client.block_number()).await {
                Ok(Ok(block)) => {
                    self.pool.mark_checked(connection.index).await;
                    best_block = best_block.max(Some(block));
                }
                Ok(Err(e)) => {
                    warn!(chain = %self.chain, endpoint = %connection.endpoint, error = %e, "Health check failed: connection error");
                    self.pool.evict(connection.index).await;
                    last_error = Some(e.to_string());
                }
                Err(_) => {
                    warn!(chain = %self.chain, endpoint = %connection.endpoint, "Health check failed: timeout");
                    self.pool.evict(connection.index).await;
                    last_error = Some(format!("health probe to {} timed out", connection.endpoint));
                }
            }
        }

        match best_block {
            Some(block) => self.record_success(block),
            None => self.record_failure(
                last_error.unwrap_or_else(|| "no live connections".to_string()),
            ),
        }
    }

    fn record_success(&self, block: u64) {
        let mut health = self
            .statuses
            .entry(self.chain.clone())
            .or_insert_with(|| ChainHealth::connected(None));

        if health.state != ConnectionState::Connected {
            info!(chain = %self.chain, block, "Chain healthy again");
        }
        health.state = ConnectionState::Connected;
        health.last_block = Some(block);
        health.consecutive_failures = 0;
        health.last_checked = Some(Utc::now());
        health.last_error = None;

        metrics::record_chain_health(&self.chain, true);
        metrics::record_block_height(&self.chain, block);
    }

    fn record_failure(&self, message: String) {
        let mut health = self
            .statuses
            .entry(self.chain.clone())
            .or_insert_with(|| ChainHealth::connected(None));

        health.consecutive_failures += 1;
        health.last_checked = Some(Utc::now());
        health.last_error = Some(message);

        if health.consecutive_failures >= self.unhealthy_threshold
            && health.state != ConnectionState::Error
        {
            error!(
                chain = %self.chain,
                failures = health.consecutive_failures,
                "Chain marked unhealthy"
            );
            health.state = ConnectionState::Error;
            metrics::record_chain_health(&self.chain, false);
        }

        metrics::record_health_failure(&self.chain);
    }
}
