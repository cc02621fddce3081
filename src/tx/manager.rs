//! Transaction manager - nonce-safe submission, batches and status queries

use super::batch::{BatchFailure, BatchReceipt, TransactionBatch};
use super::nonce::NonceManager;
use crate::chain::{confirmations, with_timeout, ChainManager};
use crate::config::TransactionConfig;
use crate::error::{ChainError, ChainResult};
use crate::metrics;
use crate::protocol::ProtocolAdapter;
use crate::security::check_signature;
use crate::types::{TxParams, TxReceipt};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ethers::types::{H256, U256};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where a transaction stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    Pending,
    Confirmed,
    Failed,
    NotFound,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Confirmed | TransactionState::Failed)
    }
}

/// Submitted transaction awaiting its receipt
#[derive(Debug, Clone)]
pub struct PendingTransaction {
    pub hash: H256,
    pub chain: String,
    pub sender: String,
    pub nonce: u64,
    pub params: TxParams,
    pub submitted_at: DateTime<Utc>,
    pub state: TransactionState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedTransaction {
    pub hash: H256,
    pub chain: String,
    pub nonce: u64,
    /// Present when the caller waited for the receipt
    pub receipt: Option<TxReceipt>,
}

/// Mined fields merged with live confirmation depth
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionStatus {
    pub hash: H256,
    pub chain: String,
    pub state: TransactionState,
    pub block_number: Option<u64>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub value: Option<U256>,
    pub gas_price: Option<U256>,
    pub gas_used: Option<U256>,
    pub nonce: Option<u64>,
    pub confirmations: u64,
}

/// Submits transactions with one nonce lock per (chain, sender)
pub struct TransactionManager {
    chains: Arc<ChainManager>,
    config: TransactionConfig,
    nonces: NonceManager,
    pending: DashMap<H256, PendingTransaction>,
    batches: DashMap<String, TransactionBatch>,
    purger: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl TransactionManager {
    pub fn new(chains: Arc<ChainManager>, config: TransactionConfig) -> Self {
        Self {
            chains,
            config,
            nonces: NonceManager::new(),
            pending: DashMap::new(),
            batches: DashMap::new(),
            purger: Mutex::new(None),
        }
    }

    /// Start purging terminal and expired records every `purge_interval`
    pub async fn start_purge_task(self: &Arc<Self>) {
        let mut purger = self.purger.lock().await;
        if purger.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(self.clone().run_purge(cancel.clone()));
        *purger = Some((cancel, handle));
    }

    async fn run_purge(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.config.purge_interval();
        info!(interval_ms = period.as_millis() as u64, "Pending purge starting");

        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.purge_stale();
        }

        info!("Pending purge stopped");
    }

    /// Cancel and await the purge task
    pub async fn stop(&self) {
        let purger = self.purger.lock().await.take();
        if let Some((cancel, handle)) = purger {
            cancel.cancel();
            if let Err(e) = handle.await {
                error!("Pending purge task ended abnormally: {}", e);
            }
        }
    }

    pub fn chains(&self) -> &Arc<ChainManager> {
        &self.chains
    }

    /// Prepare, sign off and submit one transaction
    ///
    /// The signature is checked before any network access. The sender's nonce
    /// lock is held from the pending-nonce read until the node accepts the
    /// transaction. With `wait_for_receipt` a reverted receipt is an error.
    pub async fn submit_transaction(
        &self,
        chain: &str,
        tx: TxParams,
        wait_for_receipt: bool,
    ) -> ChainResult<SubmittedTransaction> {
        check_signature(&tx)?;

        let result = self.submit_inner(chain, tx, wait_for_receipt).await;
        if let Err(e) = &result {
            metrics::record_tx_failed(chain);
            warn!("Transaction submission on chain {} failed: {}", chain, e);
        }
        result
    }

    async fn submit_inner(
        &self,
        chain: &str,
        tx: TxParams,
        wait_for_receipt: bool,
    ) -> ChainResult<SubmittedTransaction> {
        let adapter = self.chains.adapter_for(chain).await?;
        let prepared = self.chains.prepare_transaction(chain, tx).await?;
        let started = Instant::now();

        let (hash, nonce) = self.send_locked(chain, adapter.as_ref(), prepared).await?;
        metrics::record_tx_submitted(chain);
        info!("Submitted {:?} on chain {} with nonce {}", hash, chain, nonce);

        let receipt = if wait_for_receipt {
            let receipt = self.wait_for_receipt(chain, hash).await?;
            metrics::record_tx_latency(chain, started.elapsed().as_secs_f64());
            Some(receipt)
        } else {
            None
        };

        Ok(SubmittedTransaction {
            hash,
            chain: chain.to_string(),
            nonce,
            receipt,
        })
    }

    async fn send_locked(
        &self,
        chain: &str,
        adapter: &dyn ProtocolAdapter,
        mut tx: TxParams,
    ) -> ChainResult<(H256, u64)> {
        let sender = tx.from.clone();
        let mut nonce_state = self.nonces.lock(chain, &sender).await;

        let client = self.chains.connection(chain).await?;
        let nonce = match tx.nonce {
            Some(nonce) => {
                nonce_state.check_explicit(chain, &sender, nonce)?;
                nonce
            }
            None => {
                let pending = with_timeout(
                    chain,
                    "pending nonce",
                    self.chains.config().request_timeout(),
                    client.transaction_count(&sender),
                )
                .await?;
                nonce_state.allocate(pending)
            }
        };
        tx.nonce = Some(nonce);

        let sent = tokio::time::timeout(
            self.chains.config().submit_timeout(),
            adapter.send_transaction(client.as_ref(), &tx),
        )
        .await;

        match sent {
            Ok(Ok(hash)) => {
                nonce_state.commit(nonce);
                self.pending.insert(
                    hash,
                    PendingTransaction {
                        hash,
                        chain: chain.to_string(),
                        sender,
                        nonce,
                        params: tx,
                        submitted_at: Utc::now(),
                        state: TransactionState::Pending,
                    },
                );
                Ok((hash, nonce))
            }
            // rejected: the nonce was not consumed and is handed out again
            Ok(Err(e)) => Err(e),
            Err(_) => {
                // the node may or may not hold the transaction; re-read its count next time
                nonce_state.reset();
                Err(ChainError::timeout(chain, "transaction submission"))
            }
        }
    }

    /// Poll until the receipt of `hash` is mined; a reverted receipt is an error
    pub async fn wait_for_receipt(&self, chain: &str, hash: H256) -> ChainResult<TxReceipt> {
        let polling = self.poll_receipt(chain, hash);
        let receipt = match tokio::time::timeout(self.config.receipt_timeout(), polling).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("No receipt for {:?} on chain {} in time", hash, chain);
                return Err(ChainError::timeout(chain, format!("receipt of {:?}", hash)));
            }
        };

        if !receipt.status {
            self.mark(hash, TransactionState::Failed);
            error!("Transaction {:?} reverted on chain {}", hash, chain);
            return Err(ChainError::Reverted {
                chain: chain.to_string(),
                tx_hash: format!("{:?}", hash),
            });
        }

        self.mark(hash, TransactionState::Confirmed);
        Ok(receipt)
    }

    async fn poll_receipt(&self, chain: &str, hash: H256) -> ChainResult<TxReceipt> {
        let request_timeout = self.chains.config().request_timeout();
        loop {
            let lookup = async {
                let client = self.chains.connection(chain).await?;
                with_timeout(chain, "receipt lookup", request_timeout, client.transaction_receipt(hash))
                    .await
            };

            match lookup.await {
                Ok(Some(receipt)) if receipt.block_number.is_some() => return Ok(receipt),
                Ok(_) => debug!("Receipt for {:?} not available yet", hash),
                Err(e) if e.is_retryable() => {
                    warn!("Receipt poll for {:?} on chain {} failed: {}", hash, chain, e)
                }
                Err(e) => return Err(e),
            }

            tokio::time::sleep(self.config.receipt_poll_interval()).await;
        }
    }

    fn mark(&self, hash: H256, state: TransactionState) {
        if let Some(mut record) = self.pending.get_mut(&hash) {
            record.state = state;
        }
    }

    /// Mined fields and live confirmations; absence is `NotFound`, never an error
    pub async fn get_transaction_status(
        &self,
        chain: &str,
        hash: H256,
    ) -> ChainResult<TransactionStatus> {
        let client = self.chains.connection(chain).await?;
        let request_timeout = self.chains.config().request_timeout();

        let details =
            with_timeout(chain, "transaction lookup", request_timeout, client.transaction(hash))
                .await?;
        let receipt = with_timeout(
            chain,
            "receipt lookup",
            request_timeout,
            client.transaction_receipt(hash),
        )
        .await?;

        let mined_block = receipt.as_ref().and_then(|r| r.block_number);
        let confirmations = match mined_block {
            Some(block) => {
                let head =
                    with_timeout(chain, "block number", request_timeout, client.block_number())
                        .await?;
                confirmations(head, block)
            }
            None => 0,
        };

        let local = self.pending.get(&hash).map(|record| record.clone());
        let state = match (&receipt, mined_block) {
            (Some(receipt), Some(_)) if receipt.status => TransactionState::Confirmed,
            (Some(_), Some(_)) => TransactionState::Failed,
            _ if details.is_some() || local.is_some() => TransactionState::Pending,
            _ => TransactionState::NotFound,
        };
        if state.is_terminal() {
            self.mark(hash, state);
        }

        let status = match details {
            Some(details) => TransactionStatus {
                hash,
                chain: chain.to_string(),
                state,
                block_number: mined_block.or(details.block_number),
                from: Some(details.from),
                to: details.to,
                value: Some(details.value),
                gas_price: details.gas_price,
                gas_used: receipt.and_then(|r| r.gas_used),
                nonce: Some(details.nonce),
                confirmations,
            },
            None => TransactionStatus {
                hash,
                chain: chain.to_string(),
                state,
                block_number: mined_block,
                from: local.as_ref().map(|r| r.sender.clone()),
                to: local.as_ref().and_then(|r| r.params.to.clone()),
                value: local.as_ref().map(|r| r.params.value),
                gas_price: local.as_ref().and_then(|r| r.params.gas_price),
                gas_used: receipt.and_then(|r| r.gas_used),
                nonce: local.as_ref().map(|r| r.nonce),
                confirmations,
            },
        };

        Ok(status)
    }

    /// Locally recorded transactions of `chain`, oldest first
    pub fn pending_transactions(&self, chain: &str) -> Vec<PendingTransaction> {
        let mut records: Vec<PendingTransaction> = self
            .pending
            .iter()
            .filter(|entry| entry.chain == chain)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|r| (r.submitted_at, r.nonce));
        records
    }

    /// Drop terminal records and records older than the pending TTL, and
    /// forget nonce locks of senders idle for as long
    pub fn purge_stale(&self) -> usize {
        let ttl = chrono::Duration::seconds(self.config.pending_ttl_secs as i64);
        let now = Utc::now();
        let before = self.pending.len();

        self.pending
            .retain(|_, record| !record.state.is_terminal() && now - record.submitted_at < ttl);

        let purged = before.saturating_sub(self.pending.len());
        if purged > 0 {
            debug!("Purged {} pending transaction records", purged);
        }
        let senders = self.nonces.prune_idle(self.config.pending_ttl());
        if senders > 0 {
            debug!("Forgot {} idle senders", senders);
        }
        purged
    }

    /// Register a batch for later submission; nothing is sent yet
    pub async fn create_transaction_batch(
        &self,
        chain: &str,
        transactions: Vec<TxParams>,
        parallel: bool,
    ) -> ChainResult<String> {
        self.chains.chain_config(chain).await?;
        if transactions.is_empty() {
            return Err(ChainError::Transaction("batch must not be empty".into()));
        }

        let batch = TransactionBatch::new(chain, transactions, parallel);
        let batch_id = batch.batch_id.clone();
        info!(
            "Created {} batch {} with {} transactions on chain {}",
            if parallel { "parallel" } else { "sequential" },
            batch_id,
            batch.len(),
            chain
        );
        self.batches.insert(batch_id.clone(), batch);
        Ok(batch_id)
    }

    /// Submit and consume a batch
    ///
    /// Sequential batches stop at the first failure and report it as
    /// `BatchIncomplete`. Parallel batches submit every member and list the
    /// failures in the receipt.
    pub async fn submit_transaction_batch(&self, batch_id: &str) -> ChainResult<BatchReceipt> {
        let (_, batch) =
            self.batches
                .remove(batch_id)
                .ok_or_else(|| ChainError::TransactionNotFound {
                    tx_id: batch_id.to_string(),
                })?;

        if batch.parallel {
            Ok(self.submit_parallel(batch).await)
        } else {
            self.submit_sequential(batch).await
        }
    }

    async fn submit_sequential(&self, batch: TransactionBatch) -> ChainResult<BatchReceipt> {
        let total = batch.len();
        let mut submitted = Vec::with_capacity(total);

        for tx in batch.transactions {
            match self.submit_transaction(&batch.chain, tx, false).await {
                Ok(done) => submitted.push(done),
                Err(source) => {
                    error!(
                        "Sequential batch {} stopped after {} of {} transactions",
                        batch.batch_id,
                        submitted.len(),
                        total
                    );
                    return Err(ChainError::BatchIncomplete {
                        completed: submitted.len(),
                        total,
                        source: Box::new(source),
                    });
                }
            }
        }

        Ok(BatchReceipt {
            batch_id: batch.batch_id,
            chain: batch.chain,
            submitted,
            failures: Vec::new(),
        })
    }

    async fn submit_parallel(&self, batch: TransactionBatch) -> BatchReceipt {
        let limiter = Semaphore::new(self.config.max_concurrent_submissions.max(1));
        let chain = batch.chain.as_str();

        let submissions = batch.transactions.into_iter().map(|tx| {
            let limiter = &limiter;
            async move {
                let _permit = limiter
                    .acquire()
                    .await
                    .map_err(|_| ChainError::connection(chain, "batch limiter closed"))?;
                self.submit_transaction(chain, tx, false).await
            }
        });
        let results = futures::future::join_all(submissions).await;

        let mut submitted = Vec::new();
        let mut failures = Vec::new();
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(done) => submitted.push(done),
                Err(error) => failures.push(BatchFailure { index, error }),
            }
        }

        if !failures.is_empty() {
            warn!(
                "Parallel batch {} finished with {} failures",
                batch.batch_id,
                failures.len()
            );
        }

        BatchReceipt {
            batch_id: batch.batch_id.clone(),
            chain: batch.chain.clone(),
            submitted,
            failures,
        }
    }
}
