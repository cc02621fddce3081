//! Confirmation tracking for submitted transactions
//!
//! A transaction counts `head - receipt_block` confirmations. Tracking polls
//! for the receipt first, then keeps polling the head until the required
//! depth is reached. The overall timeout is a terminal failure.

use super::ChainManager;
use crate::error::{ChainError, ChainResult};

use ethers::types::H256;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackedStatus {
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedTransaction {
    pub hash: H256,
    pub status: TrackedStatus,
    pub block_number: u64,
    pub confirmations: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct TrackOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub required_confirmations: u64,
}

impl Default for TrackOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3_600),
            poll_interval: Duration::from_secs(15),
            required_confirmations: 12,
        }
    }
}

/// Confirmations of a transaction mined in `receipt_block`
pub fn confirmations(head: u64, receipt_block: u64) -> u64 {
    head.saturating_sub(receipt_block)
}

impl ChainManager {
    /// Wait until `hash` is mined and buried under the required confirmations
    pub async fn track_transaction(
        &self,
        chain: &str,
        hash: H256,
        options: TrackOptions,
    ) -> ChainResult<TrackedTransaction> {
        let tracking = self.poll_confirmations(chain, hash, options);

        match tokio::time::timeout(options.timeout, tracking).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Gave up tracking {:?} on chain {} after {:?}",
                    hash, chain, options.timeout
                );
                Err(ChainError::timeout(
                    chain,
                    format!("confirmation of {:?}", hash),
                ))
            }
        }
    }

    async fn poll_confirmations(
        &self,
        chain: &str,
        hash: H256,
        options: TrackOptions,
    ) -> ChainResult<TrackedTransaction> {
        loop {
            match self.confirmation_snapshot(chain, hash).await {
                Ok(Some(tracked)) => {
                    if tracked.status == TrackedStatus::Failed {
                        warn!("Transaction {:?} failed on chain {}", hash, chain);
                        return Ok(tracked);
                    }
                    if tracked.confirmations >= options.required_confirmations {
                        info!(
                            "Transaction {:?} confirmed on chain {} ({} confirmations)",
                            hash, chain, tracked.confirmations
                        );
                        return Ok(tracked);
                    }
                    debug!(
                        "Transaction {:?} has {} / {} confirmations on chain {}",
                        hash, tracked.confirmations, options.required_confirmations, chain
                    );
                }
                Ok(None) => debug!("Transaction {:?} not yet mined on chain {}", hash, chain),
                Err(e) if e.is_retryable() => {
                    warn!("Confirmation poll for {:?} on chain {} failed: {}", hash, chain, e)
                }
                Err(e) => return Err(e),
            }

            tokio::time::sleep(options.poll_interval).await;
        }
    }

    /// Current receipt state of `hash`, `None` while unmined
    pub async fn confirmation_snapshot(
        &self,
        chain: &str,
        hash: H256,
    ) -> ChainResult<Option<TrackedTransaction>> {
        let client = self.connection(chain).await?;
        let timeout = self.config().request_timeout();

        let receipt = tokio::time::timeout(timeout, client.transaction_receipt(hash))
            .await
            .map_err(|_| ChainError::timeout(chain, "receipt lookup"))??;

        let (receipt, block_number) = match receipt {
            Some(r) => match r.block_number {
                Some(block) => (r, block),
                None => return Ok(None),
            },
            None => return Ok(None),
        };

        let head = tokio::time::timeout(timeout, client.block_number())
            .await
            .map_err(|_| ChainError::timeout(chain, "block number"))??;

        Ok(Some(TrackedTransaction {
            hash,
            status: if receipt.status {
                TrackedStatus::Confirmed
            } else {
                TrackedStatus::Failed
            },
            block_number,
            confirmations: confirmations(head, block_number),
        }))
    }
}
