//! Per-chain connection pool with round-robin rotation

use super::provider::{Connector, RpcClient};
use crate::error::{ChainError, ChainResult};

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, warn};

/// Dials sessions under the shared dial limiter and connect timeout
#[derive(Clone)]
pub struct Dialer {
    connector: Arc<dyn Connector>,
    limiter: Arc<Semaphore>,
    connect_timeout: Duration,
}

impl Dialer {
    pub fn new(
        connector: Arc<dyn Connector>,
        max_concurrent: usize,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            limiter: Arc::new(Semaphore::new(max_concurrent.max(1))),
            connect_timeout,
        }
    }

    pub async fn dial(
        &self,
        chain: &str,
        endpoint: &str,
        chain_id: u64,
    ) -> ChainResult<Arc<dyn RpcClient>> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| ChainError::connection(chain, "dial limiter closed"))?;

        tokio::time::timeout(
            self.connect_timeout,
            self.connector.connect(chain, endpoint, chain_id),
        )
        .await
        .map_err(|_| ChainError::timeout(chain, format!("connect to {}", endpoint)))?
    }

    /// Dial every endpoint of `pool` that has no live session
    pub async fn fill(&self, pool: &ConnectionPool, chain_id: u64) -> Option<ChainError> {
        let missing = pool.missing().await;
        let dials = missing.iter().map(|&index| async move {
            let endpoint = &pool.endpoints()[index];
            (index, self.dial(pool.chain(), endpoint, chain_id).await)
        });

        let mut first_error = None;
        for (index, result) in futures::future::join_all(dials).await {
            match result {
                Ok(client) => pool.insert(index, client).await,
                Err(e) => {
                    warn!(
                        "Dial to {} for chain {} failed: {}",
                        pool.endpoints()[index],
                        pool.chain(),
                        e
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error
    }
}

/// One live RPC session
#[derive(Clone)]
pub struct PooledConnection {
    pub endpoint: String,
    pub client: Arc<dyn RpcClient>,
    pub last_health_check: DateTime<Utc>,
    /// Position of `endpoint` in the chain's endpoint list
    pub index: usize,
}

/// All sessions of one chain
pub struct ConnectionPool {
    chain: String,
    endpoints: Vec<String>,
    connections: RwLock<Vec<PooledConnection>>,
    cursor: AtomicUsize,
}

impl ConnectionPool {
    pub fn new(chain: &str, endpoints: Vec<String>) -> Self {
        Self {
            chain: chain.to_string(),
            endpoints,
            connections: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub async fn insert(&self, index: usize, client: Arc<dyn RpcClient>) {
        let mut connections = self.connections.write().await;
        connections.retain(|c| c.index != index);
        connections.push(PooledConnection {
            endpoint: self.endpoints[index].clone(),
            client,
            last_health_check: Utc::now(),
            index,
        });
        connections.sort_by_key(|c| c.index);
        debug!(
            "Pooled endpoint {} for chain {} ({} live)",
            self.endpoints[index],
            self.chain,
            connections.len()
        );
    }

    /// Next session in rotation
    pub async fn next(&self) -> Option<PooledConnection> {
        let connections = self.connections.read().await;
        if connections.is_empty() {
            return None;
        }
        let position = self.cursor.fetch_add(1, Ordering::Relaxed) % connections.len();
        Some(connections[position].clone())
    }

    pub async fn evict(&self, index: usize) {
        let mut connections = self.connections.write().await;
        let before = connections.len();
        connections.retain(|c| c.index != index);
        if connections.len() < before {
            warn!(
                "Evicted endpoint {} from chain {} pool",
                self.endpoints[index], self.chain
            );
        }
    }

    pub async fn mark_checked(&self, index: usize) {
        let mut connections = self.connections.write().await;
        if let Some(connection) = connections.iter_mut().find(|c| c.index == index) {
            connection.last_health_check = Utc::now();
        }
    }

    pub async fn snapshot(&self) -> Vec<PooledConnection> {
        self.connections.read().await.clone()
    }

    /// Endpoint indexes with no live session
    pub async fn missing(&self) -> Vec<usize> {
        let connections = self.connections.read().await;
        (0..self.endpoints.len())
            .filter(|i| !connections.iter().any(|c| c.index == *i))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn clear(&self) {
        self.connections.write().await.clear();
    }
}
