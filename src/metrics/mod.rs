//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status and health probes
//! - Transaction submission, retries and failures
//! - Sync progress and reorganizations
//! - Cross-chain transaction lifecycle
//! - Contract deployments and decoded events

use anyhow::Context;
use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "chainweave_chain_connected",
        "Chain connection status (1=connected, 0=disconnected or unhealthy)",
        &["chain"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "chainweave_chain_block_height",
        "Latest block height observed per chain",
        &["chain"]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "chainweave_health_check_failure_total",
        "Total failed health ticks",
        &["chain"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "chainweave_transactions_submitted_total",
        "Total transactions submitted",
        &["chain"]
    ).unwrap();

    pub static ref TX_RETRIED: CounterVec = register_counter_vec!(
        "chainweave_transactions_retried_total",
        "Total submission retries after transport failures",
        &["chain"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "chainweave_transactions_failed_total",
        "Total transactions failed",
        &["chain"]
    ).unwrap();

    pub static ref TX_LATENCY: HistogramVec = register_histogram_vec!(
        "chainweave_transaction_latency_seconds",
        "Time from submission to receipt",
        &["chain"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    // Sync metrics
    pub static ref SYNC_BLOCKS_PROCESSED: CounterVec = register_counter_vec!(
        "chainweave_sync_blocks_processed_total",
        "Total blocks processed by the sync loop",
        &["chain"]
    ).unwrap();

    pub static ref SYNC_CURRENT_BLOCK: GaugeVec = register_gauge_vec!(
        "chainweave_sync_current_block",
        "Sync cursor per chain",
        &["chain"]
    ).unwrap();

    pub static ref REORGS: CounterVec = register_counter_vec!(
        "chainweave_reorgs_total",
        "Total chain reorganizations detected",
        &["chain"]
    ).unwrap();

    // Cross-chain metrics
    pub static ref CROSS_CHAIN_TRANSITIONS: CounterVec = register_counter_vec!(
        "chainweave_cross_chain_transitions_total",
        "Cross-chain transaction status transitions",
        &["status"]
    ).unwrap();

    // Contract metrics
    pub static ref CONTRACTS_DEPLOYED: CounterVec = register_counter_vec!(
        "chainweave_contracts_deployed_total",
        "Total contracts deployed",
        &["chain"]
    ).unwrap();

    pub static ref EVENTS_DECODED: CounterVec = register_counter_vec!(
        "chainweave_contract_events_total",
        "Total contract events decoded by name",
        &["chain", "event"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind metrics server to {}", addr))?;
        axum::serve(listener, app)
            .await
            .context("Metrics server failed")?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    render().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// Text exposition of every registered metric
pub fn render() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// Helper functions to record metrics

pub fn record_chain_health(chain: &str, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[chain])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_block_height(chain: &str, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[chain])
        .set(block_number as f64);
}

pub fn record_health_failure(chain: &str) {
    HEALTH_CHECK_FAILURE.with_label_values(&[chain]).inc();
}

pub fn record_tx_submitted(chain: &str) {
    TX_SUBMITTED.with_label_values(&[chain]).inc();
}

pub fn record_tx_retry(chain: &str) {
    TX_RETRIED.with_label_values(&[chain]).inc();
}

pub fn record_tx_failed(chain: &str) {
    TX_FAILED.with_label_values(&[chain]).inc();
}

pub fn record_tx_latency(chain: &str, latency_secs: f64) {
    TX_LATENCY.with_label_values(&[chain]).observe(latency_secs);
}

pub fn record_blocks_processed(chain: &str, count: u64, current_block: u64) {
    SYNC_BLOCKS_PROCESSED
        .with_label_values(&[chain])
        .inc_by(count as f64);
    SYNC_CURRENT_BLOCK
        .with_label_values(&[chain])
        .set(current_block as f64);
}

pub fn record_reorg(chain: &str) {
    REORGS.with_label_values(&[chain]).inc();
}

pub fn record_cross_chain_status(status: &str) {
    CROSS_CHAIN_TRANSITIONS.with_label_values(&[status]).inc();
}

pub fn record_contract_deployed(chain: &str) {
    CONTRACTS_DEPLOYED.with_label_values(&[chain]).inc();
}

pub fn record_event(chain: &str, event: &str) {
    EVENTS_DECODED.with_label_values(&[chain, event]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_series() {
        record_reorg("metrics-test");
        record_blocks_processed("metrics-test", 5, 105);

        let text = render().unwrap();
        assert!(text.contains("chainweave_reorgs_total"));
        assert!(text.contains("chainweave_sync_current_block{chain=\"metrics-test\"} 105"));
    }
}
