//! Chain module - owns pooled connections to every configured chain
//!
//! This module provides:
//! - Validated, all-or-nothing chain configuration
//! - Bounded concurrent dialing with per-endpoint failover pools
//! - One health monitor task per chain, cancelled and awaited on disconnect
//! - Adapter-driven transaction execution with bounded retries
//! - Confirmation tracking

pub mod finality;
pub mod health;
pub mod pool;
pub mod provider;

pub use finality::{confirmations, TrackOptions, TrackedStatus, TrackedTransaction};
pub use health::{ChainHealth, ConnectionState, HealthMonitor};
pub use pool::{ConnectionPool, Dialer, PooledConnection};
pub use provider::{Connector, EthersConnector, EthersRpcClient, RpcClient};

use crate::config::{ChainConfig, ManagerConfig};
use crate::error::{ChainError, ChainResult};
use crate::metrics;
use crate::protocol::{AdapterRegistry, ProtocolAdapter};
use crate::types::TxParams;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ethers::types::{H256, U256};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

lazy_static! {
    static ref RPC_URL: Regex =
        Regex::new(r"^(https?|wss?)://[^\s/]+").expect("valid url pattern");
}

/// Run one RPC call under `limit`, surfacing expiry as a typed timeout
pub async fn with_timeout<T>(
    chain: &str,
    operation: &str,
    limit: Duration,
    call: impl Future<Output = ChainResult<T>>,
) -> ChainResult<T> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| ChainError::timeout(chain, operation))?
}

/// Externally visible state of one chain
#[derive(Debug, Clone, Serialize)]
pub struct ChainStatus {
    pub chain: String,
    pub chain_id: u64,
    pub protocol: String,
    pub state: ConnectionState,
    pub last_block: Option<u64>,
    pub consecutive_failures: u32,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub pool_size: usize,
}

struct MonitorHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl MonitorHandle {
    async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            error!("Health monitor task ended abnormally: {}", e);
        }
    }
}

#[derive(Default)]
struct ManagerState {
    configs: HashMap<String, ChainConfig>,
    pools: HashMap<String, Arc<ConnectionPool>>,
    monitors: HashMap<String, MonitorHandle>,
}

/// Manages connections to all configured chains
pub struct ChainManager {
    config: ManagerConfig,
    adapters: AdapterRegistry,
    dialer: Dialer,
    /// Structural changes: configs, pools, monitor registry
    state: Mutex<ManagerState>,
    statuses: Arc<DashMap<String, ChainHealth>>,
    /// Serializes rotate-and-check retrieval
    retrieval: Mutex<()>,
}

impl ChainManager {
    pub fn new(
        config: ManagerConfig,
        adapters: AdapterRegistry,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let dialer = Dialer::new(
            connector,
            config.max_concurrent_connections,
            config.connect_timeout(),
        );

        Self {
            config,
            adapters,
            dialer,
            state: Mutex::new(ManagerState::default()),
            statuses: Arc::new(DashMap::new()),
            retrieval: Mutex::new(()),
        }
    }

    /// Manager dialing real nodes over HTTP with the built-in adapters
    pub fn with_ethers(config: ManagerConfig) -> Self {
        let connector = Arc::new(EthersConnector::new(config.request_timeout()));
        Self::new(config, AdapterRegistry::default(), connector)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Validate every chain, then connect them concurrently, each under the
    /// connect timeout
    ///
    /// Validation failure leaves the manager untouched. A chain that fails to
    /// connect is rolled back; the first such error is returned after all
    /// chains have been attempted.
    pub async fn configure(&self, chains: HashMap<String, ChainConfig>) -> ChainResult<()> {
        for (key, chain_config) in &chains {
            self.validate_chain_config(key, chain_config)?;
        }

        let mut keys: Vec<String> = chains.keys().cloned().collect();
        keys.sort();

        let mut replaced = Vec::new();
        {
            let mut state = self.state.lock().await;
            for (key, chain_config) in chains {
                if let Some(monitor) = state.monitors.remove(&key) {
                    replaced.push(monitor);
                }
                state.pools.remove(&key);
                state.configs.insert(key, chain_config);
            }
        }
        for monitor in replaced {
            monitor.shutdown().await;
        }

        info!("Configured {} chains", keys.len());

        let connects = keys.iter().map(|key| async move {
            let connect = self.connect_chain(key);
            let result = match tokio::time::timeout(self.config.connect_timeout(), connect).await {
                Ok(result) => result,
                Err(_) => Err(ChainError::timeout(key, "connect")),
            };
            (key, result)
        });

        let mut first_error = None;
        for (key, result) in futures::future::join_all(connects).await {
            if let Err(e) = result {
                error!("Failed to connect chain {}: {}", key, e);
                self.rollback_chain(key).await;
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Static checks only; no network access
    fn validate_chain_config(&self, key: &str, chain_config: &ChainConfig) -> ChainResult<()> {
        if key.trim().is_empty() {
            return Err(ChainError::Configuration("chain key must not be empty".into()));
        }
        for url in chain_config.endpoints() {
            if !RPC_URL.is_match(&url) {
                return Err(ChainError::Configuration(format!(
                    "chain {}: invalid rpc url {:?}",
                    key, url
                )));
            }
        }
        if chain_config.chain_id == 0 {
            return Err(ChainError::Configuration(format!(
                "chain {}: chain_id must be positive",
                key
            )));
        }
        if !self.adapters.contains(&chain_config.protocol) {
            return Err(ChainError::Configuration(format!(
                "chain {}: unsupported protocol {}",
                key, chain_config.protocol
            )));
        }
        Ok(())
    }

    async fn rollback_chain(&self, chain: &str) {
        let monitor = {
            let mut state = self.state.lock().await;
            state.configs.remove(chain);
            state.pools.remove(chain);
            state.monitors.remove(chain)
        };
        if let Some(monitor) = monitor {
            monitor.shutdown().await;
        }
        self.statuses.remove(chain);
        metrics::record_chain_health(chain, false);
        warn!("Rolled back chain {}", chain);
    }

    /// Dial every endpoint of a configured chain and start its health monitor
    pub async fn connect_chain(&self, chain: &str) -> ChainResult<()> {
        let chain_config = {
            let state = self.state.lock().await;
            if state.monitors.contains_key(chain) {
                debug!("Chain {} already connected", chain);
                return Ok(());
            }
            state
                .configs
                .get(chain)
                .cloned()
                .ok_or_else(|| ChainError::ChainNotFound {
                    chain: chain.to_string(),
                })?
        };

        let pool = Arc::new(ConnectionPool::new(chain, chain_config.endpoints()));
        let dial_error = self.dialer.fill(&pool, chain_config.chain_id).await;

        let head = match pool.next().await {
            Some(connection) => {
                tokio::time::timeout(
                    self.config.health_check_timeout(),
                    connection.client.block_number(),
                )
                .await
                .ok()
                .and_then(|r| r.ok())
            }
            None => {
                return Err(dial_error
                    .unwrap_or_else(|| ChainError::connection(chain, "no endpoints dialed")))
            }
        };

        let mut state = self.state.lock().await;
        if !state.configs.contains_key(chain) {
            return Err(ChainError::ChainNotFound {
                chain: chain.to_string(),
            });
        }
        // A concurrent connect won the race; keep its pool and monitor
        if state.monitors.contains_key(chain) {
            drop(state);
            pool.clear().await;
            debug!("Chain {} connected concurrently, dropping duplicate pool", chain);
            return Ok(());
        }

        let monitor = HealthMonitor::new(
            chain,
            chain_config.chain_id,
            pool.clone(),
            self.dialer.clone(),
            self.statuses.clone(),
            self.config.health_check_interval(),
            self.config.health_check_timeout(),
            self.config.unhealthy_threshold,
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(monitor.run(cancel.clone()));

        state.pools.insert(chain.to_string(), pool.clone());
        state
            .monitors
            .insert(chain.to_string(), MonitorHandle { cancel, handle });
        self.statuses
            .insert(chain.to_string(), ChainHealth::connected(head));

        metrics::record_chain_health(chain, true);
        if let Some(block) = head {
            metrics::record_block_height(chain, block);
        }

        info!(
            "Chain {} connected ({} of {} endpoints)",
            chain,
            pool.len().await,
            pool.endpoints().len()
        );
        Ok(())
    }

    /// Stop the health monitor, drop the pool and forget the configuration
    pub async fn disconnect_chain(&self, chain: &str) -> ChainResult<()> {
        let (pool, monitor) = {
            let mut state = self.state.lock().await;
            if state.configs.remove(chain).is_none() {
                return Err(ChainError::ChainNotFound {
                    chain: chain.to_string(),
                });
            }
            (state.pools.remove(chain), state.monitors.remove(chain))
        };

        if let Some(monitor) = monitor {
            monitor.shutdown().await;
        }
        if let Some(pool) = pool {
            pool.clear().await;
        }
        self.statuses.remove(chain);
        metrics::record_chain_health(chain, false);

        info!("Chain {} disconnected", chain);
        Ok(())
    }

    pub async fn get_chain_status(&self, chain: &str) -> ChainResult<ChainStatus> {
        let (chain_config, pool) = {
            let state = self.state.lock().await;
            let chain_config =
                state
                    .configs
                    .get(chain)
                    .cloned()
                    .ok_or_else(|| ChainError::ChainNotFound {
                        chain: chain.to_string(),
                    })?;
            (chain_config, state.pools.get(chain).cloned())
        };

        let pool_size = match &pool {
            Some(pool) => pool.len().await,
            None => 0,
        };

        let health = self.statuses.get(chain).map(|h| h.clone());
        let status = match health {
            Some(health) => ChainStatus {
                chain: chain.to_string(),
                chain_id: chain_config.chain_id,
                protocol: chain_config.protocol,
                state: health.state,
                last_block: health.last_block,
                consecutive_failures: health.consecutive_failures,
                last_checked: health.last_checked,
                last_error: health.last_error,
                pool_size,
            },
            None => ChainStatus {
                chain: chain.to_string(),
                chain_id: chain_config.chain_id,
                protocol: chain_config.protocol,
                state: ConnectionState::Disconnected,
                last_block: None,
                consecutive_failures: 0,
                last_checked: None,
                last_error: None,
                pool_size,
            },
        };

        Ok(status)
    }

    pub async fn configured_chains(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut chains: Vec<String> = state.configs.keys().cloned().collect();
        chains.sort();
        chains
    }

    pub async fn chain_config(&self, chain: &str) -> ChainResult<ChainConfig> {
        self.state
            .lock()
            .await
            .configs
            .get(chain)
            .cloned()
            .ok_or_else(|| ChainError::ChainNotFound {
                chain: chain.to_string(),
            })
    }

    pub async fn adapter_for(&self, chain: &str) -> ChainResult<Arc<dyn ProtocolAdapter>> {
        let chain_config = self.chain_config(chain).await?;
        self.adapters.get(&chain_config.protocol).ok_or_else(|| {
            ChainError::Configuration(format!(
                "chain {}: unsupported protocol {}",
                chain, chain_config.protocol
            ))
        })
    }

    /// Next pooled session, verified live with a cheap call
    ///
    /// A session failing the check is evicted and the call fails; the health
    /// monitor re-dials it.
    pub async fn connection(&self, chain: &str) -> ChainResult<Arc<dyn RpcClient>> {
        let pool = {
            let state = self.state.lock().await;
            if !state.configs.contains_key(chain) {
                return Err(ChainError::ChainNotFound {
                    chain: chain.to_string(),
                });
            }
            state
                .pools
                .get(chain)
                .cloned()
                .ok_or_else(|| ChainError::connection(chain, "not connected"))?
        };

        let _guard = self.retrieval.lock().await;
        let connection = pool
            .next()
            .await
            .ok_or_else(|| ChainError::connection(chain, "no live connections"))?;

        let liveness =
            tokio::time::timeout(self.config.liveness_timeout(), connection.client.block_number())
                .await;

        match liveness {
            Ok(Ok(_)) => Ok(connection.client),
            Ok(Err(e)) => {
                pool.evict(connection.index).await;
                Err(ChainError::connection(
                    chain,
                    format!("endpoint {} failed liveness check: {}", connection.endpoint, e),
                ))
            }
            Err(_) => {
                pool.evict(connection.index).await;
                Err(ChainError::connection(
                    chain,
                    format!("endpoint {} liveness check timed out", connection.endpoint),
                ))
            }
        }
    }

    /// Validate addresses and fill in buffered gas and gas price
    pub async fn prepare_transaction(&self, chain: &str, tx: TxParams) -> ChainResult<TxParams> {
        let adapter = self.adapter_for(chain).await?;
        let client = self.connection(chain).await?;
        self.prepare_with(chain, adapter.as_ref(), client.as_ref(), tx)
            .await
    }

    async fn prepare_with(
        &self,
        chain: &str,
        adapter: &dyn ProtocolAdapter,
        client: &dyn RpcClient,
        mut tx: TxParams,
    ) -> ChainResult<TxParams> {
        if !adapter.validate_address(&tx.from) {
            return Err(ChainError::Transaction(format!(
                "invalid sender address {}",
                tx.from
            )));
        }
        if let Some(to) = &tx.to {
            if !adapter.validate_address(to) {
                return Err(ChainError::Transaction(format!(
                    "invalid recipient address {}",
                    to
                )));
            }
        }

        let timeout = self.config.request_timeout();

        let gas = match tx.gas {
            Some(gas) => {
                adapter.check_gas_limit(gas)?;
                gas
            }
            None => tokio::time::timeout(timeout, adapter.estimate_gas(client, &tx))
                .await
                .map_err(|_| ChainError::timeout(chain, "gas estimation"))??,
        };

        let gas_price = match (tx.gas_price, tx.gas_strategy) {
            (Some(price), _) => price,
            (None, Some(strategy)) => tokio::time::timeout(
                timeout,
                adapter.strategy_gas_price(client, strategy),
            )
            .await
            .map_err(|_| ChainError::timeout(chain, "gas price"))??,
            (None, None) => {
                let price = tokio::time::timeout(timeout, adapter.estimate_gas_price(client))
                    .await
                    .map_err(|_| ChainError::timeout(chain, "gas price"))??;
                adapter.policy().buffered_gas_price(price)
            }
        };

        tx.gas = Some(gas);
        tx.gas_price = Some(gas_price);
        Ok(tx)
    }

    /// Prepare and submit, retrying transport failures with backoff
    ///
    /// Validation failures and send timeouts are returned immediately; a send
    /// that timed out may still have been accepted by the node.
    pub async fn execute_transaction(&self, chain: &str, tx: TxParams) -> ChainResult<H256> {
        let adapter = self.adapter_for(chain).await?;
        let retry = &self.config.retry;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.try_execute(chain, adapter.as_ref(), tx.clone()).await {
                Ok(hash) => {
                    metrics::record_tx_submitted(chain);
                    debug!("Submitted {:?} to chain {} (attempt {})", hash, chain, attempt);
                    return Ok(hash);
                }
                Err(e @ ChainError::ChainConnection { .. }) if attempt < retry.max_attempts => {
                    let delay = retry.delay_for(attempt);
                    warn!(
                        "Submission to chain {} failed (attempt {}/{}), retrying in {:?}: {}",
                        chain, attempt, retry.max_attempts, delay, e
                    );
                    metrics::record_tx_retry(chain);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    metrics::record_tx_failed(chain);
                    return Err(e);
                }
            }
        }
    }

    async fn try_execute(
        &self,
        chain: &str,
        adapter: &dyn ProtocolAdapter,
        tx: TxParams,
    ) -> ChainResult<H256> {
        let client = self.connection(chain).await?;
        let prepared = self.prepare_with(chain, adapter, client.as_ref(), tx).await?;

        tokio::time::timeout(
            self.config.submit_timeout(),
            adapter.send_transaction(client.as_ref(), &prepared),
        )
        .await
        .map_err(|_| ChainError::timeout(chain, "transaction submission"))?
    }

    /// Submit `txs` with at most `max_concurrent` in flight
    ///
    /// A failure does not cancel siblings; the first failure (in input order)
    /// is reported with the number of successful submissions.
    pub async fn execute_transaction_batch(
        &self,
        chain: &str,
        txs: Vec<TxParams>,
        max_concurrent: usize,
    ) -> ChainResult<Vec<H256>> {
        let total = txs.len();
        let limiter = Semaphore::new(max_concurrent.max(1));

        let submissions = txs.into_iter().map(|tx| {
            let limiter = &limiter;
            async move {
                let _permit = limiter
                    .acquire()
                    .await
                    .map_err(|_| ChainError::connection(chain, "batch limiter closed"))?;
                self.execute_transaction(chain, tx).await
            }
        });

        let results = futures::future::join_all(submissions).await;
        let completed = results.iter().filter(|r| r.is_ok()).count();

        let mut hashes = Vec::with_capacity(total);
        let mut first_error = None;
        for result in results {
            match result {
                Ok(hash) => hashes.push(hash),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            None => Ok(hashes),
            Some(source) => {
                error!(
                    "Batch on chain {} incomplete: {} of {} submitted",
                    chain, completed, total
                );
                Err(ChainError::BatchIncomplete {
                    completed,
                    total,
                    source: Box::new(source),
                })
            }
        }
    }

    /// Native balance of `address`
    pub async fn get_balance(&self, chain: &str, address: &str) -> ChainResult<U256> {
        let adapter = self.adapter_for(chain).await?;
        let client = self.connection(chain).await?;
        tokio::time::timeout(
            self.config.request_timeout(),
            adapter.get_balance(client.as_ref(), address),
        )
        .await
        .map_err(|_| ChainError::timeout(chain, "balance"))?
    }

    /// Cancel and await every health monitor, then drop all pools
    pub async fn stop(&self) {
        let (monitors, pools) = {
            let mut state = self.state.lock().await;
            let monitors: Vec<MonitorHandle> = state.monitors.drain().map(|(_, m)| m).collect();
            let pools: Vec<Arc<ConnectionPool>> = state.pools.drain().map(|(_, p)| p).collect();
            (monitors, pools)
        };

        futures::future::join_all(monitors.into_iter().map(MonitorHandle::shutdown)).await;
        for pool in pools {
            pool.clear().await;
            self.statuses.remove(pool.chain());
        }

        info!("Chain manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        connected_manager, signed_tx, test_manager_config, MockConnector, MockRpcClient, ALICE,
        BOB,
    };

    fn evm(url: &str, chain_id: u64) -> ChainConfig {
        ChainConfig::new(url, chain_id, "evm")
    }

    fn manager_with(connector: Arc<MockConnector>) -> ChainManager {
        ChainManager::new(test_manager_config(), AdapterRegistry::default(), connector)
    }

    #[tokio::test]
    async fn test_configure_rejects_invalid_without_partial_state() {
        let manager = manager_with(Arc::new(MockConnector::new()));

        let mut chains = HashMap::new();
        chains.insert("good".to_string(), evm("http://node-a", 1));
        chains.insert("bad".to_string(), evm("http://node-b", 0));

        let err = manager.configure(chains).await.unwrap_err();
        assert!(matches!(err, ChainError::Configuration(_)));
        assert!(manager.configured_chains().await.is_empty());

        let mut chains = HashMap::new();
        chains.insert("x".to_string(), ChainConfig::new("http://node-a", 1, "solana"));
        assert!(manager.configure(chains).await.is_err());

        let mut chains = HashMap::new();
        chains.insert("x".to_string(), evm("node-a:8545", 1));
        assert!(manager.configure(chains).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_rolls_back_chain() {
        let connector = Arc::new(MockConnector::new());
        connector.set_failing("http://node-b", true);
        let manager = manager_with(connector);

        let mut chains = HashMap::new();
        chains.insert("a".to_string(), evm("http://node-a", 1));
        chains.insert("b".to_string(), evm("http://node-b", 2));

        let err = manager.configure(chains).await.unwrap_err();
        assert!(matches!(err, ChainError::ChainConnection { .. }));
        assert_eq!(manager.configured_chains().await, vec!["a".to_string()]);
        assert!(matches!(
            manager.get_chain_status("b").await,
            Err(ChainError::ChainNotFound { .. })
        ));
        assert_eq!(
            manager.get_chain_status("a").await.unwrap().state,
            ConnectionState::Connected
        );
    }

    #[tokio::test]
    async fn test_connect_timeout_rolls_back_chain() {
        let connector = Arc::new(MockConnector::new());
        connector.set_hanging("http://slow");
        let mut config = test_manager_config();
        config.connect_timeout_ms = 30;
        let manager = ChainManager::new(config, AdapterRegistry::default(), connector);

        let mut chains = HashMap::new();
        chains.insert("slow".to_string(), evm("http://slow", 1));

        let err = manager.configure(chains).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ChainConnection);
        assert!(manager.configured_chains().await.is_empty());
    }

    #[tokio::test]
    async fn test_dial_concurrency_bounded() {
        let connector =
            Arc::new(MockConnector::new().with_dial_delay(Duration::from_millis(20)));
        let mut config = test_manager_config();
        config.max_concurrent_connections = 3;
        let manager = ChainManager::new(config, AdapterRegistry::default(), connector.clone());

        let mut chains = HashMap::new();
        for i in 0..10u64 {
            let mut chain_config = evm(&format!("http://node-{}", i), i + 1);
            chain_config.fallback_urls = vec![format!("http://backup-{}", i)];
            chains.insert(format!("c{}", i), chain_config);
        }

        manager.configure(chains).await.unwrap();
        assert_eq!(connector.dials(), 20);
        assert!(connector.max_in_flight() <= 3);
    }

    #[tokio::test]
    async fn test_concurrent_connects_leave_one_monitor() {
        let connector =
            Arc::new(MockConnector::new().with_dial_delay(Duration::from_millis(30)));
        connector.add_client("http://node-a", MockRpcClient::new(1));
        let mut config = test_manager_config();
        config.health_check_interval_ms = 40;
        let manager = ChainManager::new(config, AdapterRegistry::default(), connector);

        let mut chains = HashMap::new();
        chains.insert("c1".to_string(), evm("http://node-a", 1));
        manager.configure(chains).await.unwrap();
        manager.stop().await;

        let (first, second) =
            tokio::join!(manager.connect_chain("c1"), manager.connect_chain("c1"));
        first.unwrap();
        second.unwrap();
        assert_eq!(manager.state.lock().await.monitors.len(), 1);

        manager.disconnect_chain("c1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!manager.statuses.contains_key("c1"));
        assert!(manager.configured_chains().await.is_empty());
    }

    #[tokio::test]
    async fn test_status_idempotent() {
        let (manager, _node) = connected_manager().await;

        let first = manager.get_chain_status("c1").await.unwrap();
        let second = manager.get_chain_status("c1").await.unwrap();
        assert_eq!(first.state, ConnectionState::Connected);
        assert_eq!(first.state, second.state);
        assert_eq!(first.last_block, second.last_block);
        assert_eq!(first.pool_size, second.pool_size);
        assert_eq!(first.last_block, Some(1_000));
    }

    #[tokio::test]
    async fn test_disconnect_removes_chain() {
        let (manager, _node) = connected_manager().await;

        manager.disconnect_chain("c1").await.unwrap();
        assert!(manager.configured_chains().await.is_empty());
        assert!(matches!(
            manager.connection("c1").await,
            Err(ChainError::ChainNotFound { .. })
        ));
        assert!(manager.disconnect_chain("c1").await.is_err());
    }

    #[tokio::test]
    async fn test_unhealthy_connection_evicted() {
        let (manager, node) = connected_manager().await;
        node.set_offline(true);

        let err = manager.connection("c1").await.err().unwrap();
        assert!(matches!(err, ChainError::ChainConnection { .. }));
        assert_eq!(manager.get_chain_status("c1").await.unwrap().pool_size, 0);
    }

    #[tokio::test]
    async fn test_failover_rotates_to_backup() {
        let connector = Arc::new(MockConnector::new());
        let primary = MockRpcClient::new(1);
        let backup = MockRpcClient::new(1);
        connector.add_client("http://primary", primary.clone());
        connector.add_client("http://backup", backup.clone());
        let manager = manager_with(connector);

        let mut chain_config = evm("http://primary", 1);
        chain_config.fallback_urls = vec!["http://backup".to_string()];
        let mut chains = HashMap::new();
        chains.insert("c1".to_string(), chain_config);
        manager.configure(chains).await.unwrap();

        primary.set_offline(true);
        let mut sent = 0;
        for _ in 0..4 {
            if manager
                .execute_transaction("c1", signed_tx(ALICE, BOB))
                .await
                .is_ok()
            {
                sent += 1;
            }
        }
        assert_eq!(sent, 4);
        assert_eq!(backup.sent_count(), 4);
        assert_eq!(primary.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_execute_retries_transport_failures() {
        let (manager, node) = connected_manager().await;
        node.fail_next_sends(2);

        let hash = manager
            .execute_transaction("c1", signed_tx(ALICE, BOB))
            .await
            .unwrap();
        assert_ne!(hash, H256::zero());
        assert_eq!(node.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_execute_gives_up_after_max_attempts() {
        let (manager, node) = connected_manager().await;
        node.fail_next_sends(3);

        let err = manager
            .execute_transaction("c1", signed_tx(ALICE, BOB))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(node.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_gas_ceiling_rejected_with_zero_submissions() {
        let (manager, node) = connected_manager().await;

        let err = manager
            .execute_transaction("c1", signed_tx(ALICE, BOB).with_gas(15_000_001))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::GasLimitExceeded { .. }));

        node.set_gas_estimate(13_000_000);
        let err = manager
            .execute_transaction("c1", signed_tx(ALICE, BOB))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::GasLimitExceeded { .. }));
        assert_eq!(node.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_prepare_applies_buffers() {
        let (manager, node) = connected_manager().await;
        node.set_gas_estimate(100_000);
        node.set_base_fee(Some(U256::from(10_000_000_000u64)));

        let prepared = manager
            .prepare_transaction("c1", signed_tx(ALICE, BOB))
            .await
            .unwrap();
        assert_eq!(prepared.gas, Some(120_000));
        // (10 gwei + 1.5 gwei) * 1.1
        assert_eq!(prepared.gas_price, Some(U256::from(12_650_000_000u64)));

        let err = manager
            .prepare_transaction("c1", signed_tx("0xnothex", BOB))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Transaction(_)));
    }

    #[tokio::test]
    async fn test_prepare_prices_by_strategy() {
        let (manager, node) = connected_manager().await;
        node.set_base_fee(Some(U256::from(10_000_000_000u64)));

        let prepared = manager
            .prepare_transaction(
                "c1",
                signed_tx(ALICE, BOB).with_gas_strategy(crate::types::GasStrategy::High),
            )
            .await
            .unwrap();
        assert_eq!(prepared.gas_price, Some(U256::from(15_000_000_000u64)));

        // explicit price wins over the strategy
        let mut tx = signed_tx(ALICE, BOB).with_gas_strategy(crate::types::GasStrategy::High);
        tx.gas_price = Some(U256::from(7u64));
        let prepared = manager.prepare_transaction("c1", tx).await.unwrap();
        assert_eq!(prepared.gas_price, Some(U256::from(7u64)));
    }

    #[tokio::test]
    async fn test_parallel_batch_of_ten() {
        let (manager, node) = connected_manager().await;
        let txs = (0..10).map(|_| signed_tx(ALICE, BOB)).collect();

        let hashes = manager
            .execute_transaction_batch("c1", txs, 4)
            .await
            .unwrap();
        assert_eq!(hashes.len(), 10);
        assert_eq!(node.sent_count(), 10);
    }

    #[tokio::test]
    async fn test_batch_reports_first_error_and_completed() {
        let (manager, node) = connected_manager().await;
        let mut txs: Vec<TxParams> = (0..5).map(|_| signed_tx(ALICE, BOB)).collect();
        txs[2].gas = Some(99_000_000);

        let err = manager
            .execute_transaction_batch("c1", txs, 2)
            .await
            .unwrap_err();
        match err {
            ChainError::BatchIncomplete {
                completed, total, ..
            } => {
                assert_eq!(completed, 4);
                assert_eq!(total, 5);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(node.sent_count(), 4);
    }

    #[tokio::test]
    async fn test_balance_validates_address() {
        let (manager, _node) = connected_manager().await;
        assert_eq!(
            manager.get_balance("c1", ALICE).await.unwrap(),
            U256::exp10(18)
        );
        assert!(manager.get_balance("c1", "0x12").await.is_err());
    }

    #[tokio::test]
    async fn test_stop_awaits_monitors() {
        let (manager, _node) = connected_manager().await;
        manager.stop().await;
        assert!(manager.connection("c1").await.is_err());
    }
}
