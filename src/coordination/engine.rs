//! Cross-chain coordinator: validates, prepares and executes paired transactions

use super::dependency::{derive_id, CrossChainStatus, CrossChainTransaction, Leg, LegSide};
use crate::chain::{ChainManager, TrackedStatus};
use crate::config::CoordinatorConfig;
use crate::error::{ChainError, ChainResult};
use crate::metrics;
use crate::security::SecurityValidator;
use crate::tx::TransactionManager;
use crate::types::TxParams;

use chrono::Utc;
use ethers::types::H256;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Cross-chain transaction coordinator
pub struct CrossChainCoordinator {
    txs: Arc<TransactionManager>,
    security: Arc<dyn SecurityValidator>,
    config: CoordinatorConfig,
    transactions: Arc<RwLock<HashMap<String, CrossChainTransaction>>>,
    sequence: AtomicU64,
}

/// Marks an execution `failed` if its future is dropped before finishing
struct ExecutionGuard {
    id: String,
    transactions: Arc<RwLock<HashMap<String, CrossChainTransaction>>>,
    armed: bool,
}

impl ExecutionGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

fn abandon(transactions: &mut HashMap<String, CrossChainTransaction>, id: &str) {
    if let Some(record) = transactions.get_mut(id) {
        if record.status == CrossChainStatus::Executing {
            record.error = Some("execution abandoned".to_string());
            record.set_status(CrossChainStatus::Failed);
            metrics::record_cross_chain_status(CrossChainStatus::Failed.as_str());
            warn!("Cross-chain transaction {} abandoned while executing", id);
        }
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let id = std::mem::take(&mut self.id);
        if let Ok(mut transactions) = self.transactions.try_write() {
            abandon(&mut transactions, &id);
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let transactions = self.transactions.clone();
                handle.spawn(async move {
                    abandon(&mut *transactions.write().await, &id);
                });
            }
            Err(_) => error!(
                "Cross-chain transaction {} abandoned outside a runtime; left executing",
                id
            ),
        }
    }
}

impl CrossChainCoordinator {
    pub fn new(
        txs: Arc<TransactionManager>,
        security: Arc<dyn SecurityValidator>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            txs,
            security,
            config,
            transactions: Arc::new(RwLock::new(HashMap::new())),
            sequence: AtomicU64::new(0),
        }
    }

    fn chains(&self) -> &Arc<ChainManager> {
        self.txs.chains()
    }

    /// Register a source/target pair without submitting anything
    ///
    /// Both chains must be configured and every dependency must already be
    /// known. Both legs pass the security validator and are prepared before
    /// the record is stored as `pending`.
    pub async fn initiate_cross_chain_transaction(
        &self,
        source_chain: &str,
        target_chain: &str,
        source_tx: TxParams,
        target_tx: TxParams,
        dependencies: Vec<String>,
    ) -> ChainResult<String> {
        self.chains().chain_config(source_chain).await?;
        self.chains().chain_config(target_chain).await?;

        let dependencies: BTreeSet<String> = dependencies.into_iter().collect();
        {
            let transactions = self.transactions.read().await;
            if let Some(missing) = dependencies.iter().find(|d| !transactions.contains_key(*d)) {
                return Err(ChainError::TransactionNotFound {
                    tx_id: missing.clone(),
                });
            }
        }

        self.security
            .validate_transaction(source_chain, &source_tx)
            .await?;
        self.security
            .validate_transaction(target_chain, &target_tx)
            .await?;

        let source_tx = self
            .chains()
            .prepare_transaction(source_chain, source_tx)
            .await?;
        let target_tx = self
            .chains()
            .prepare_transaction(target_chain, target_tx)
            .await?;

        let source = Leg::new(source_chain, source_tx);
        let target = Leg::new(target_chain, target_tx);
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let id = derive_id(&source, &target, &dependencies, Utc::now(), sequence);

        let record = CrossChainTransaction::new(id.clone(), source, target, dependencies);
        self.transactions.write().await.insert(id.clone(), record);
        metrics::record_cross_chain_status(CrossChainStatus::Pending.as_str());

        info!(
            "Initiated cross-chain transaction {} ({} -> {})",
            id, source_chain, target_chain
        );
        Ok(id)
    }

    /// Execute a pending cross-chain transaction
    ///
    /// Submits the source leg, waits for the configured confirmations, then
    /// does the same for the target leg. Nothing is submitted while a
    /// dependency is not `completed`. Any failure afterwards marks the
    /// transaction `failed` and is returned.
    pub async fn execute_transaction(&self, id: &str) -> ChainResult<CrossChainTransaction> {
        {
            let mut transactions = self.transactions.write().await;
            let record = transactions
                .get(id)
                .ok_or_else(|| ChainError::TransactionNotFound {
                    tx_id: id.to_string(),
                })?;

            if record.status != CrossChainStatus::Pending {
                return Err(ChainError::Transaction(format!(
                    "cross-chain transaction {} is {}",
                    id,
                    record.status.as_str()
                )));
            }
            if let Some(dependency) = record.unmet_dependency(&transactions) {
                debug!("Cross-chain transaction {} waits on {}", id, dependency);
                return Err(ChainError::DependencyNotReady {
                    tx_id: id.to_string(),
                    dependency: dependency.to_string(),
                });
            }

            if let Some(record) = transactions.get_mut(id) {
                record.set_status(CrossChainStatus::Executing);
            }
        }
        metrics::record_cross_chain_status(CrossChainStatus::Executing.as_str());
        let mut guard = ExecutionGuard {
            id: id.to_string(),
            transactions: self.transactions.clone(),
            armed: true,
        };

        let outcome = match self.execute_leg(id, LegSide::Source).await {
            Ok(()) => self.execute_leg(id, LegSide::Target).await,
            Err(e) => Err(e),
        };

        let mut transactions = self.transactions.write().await;
        guard.disarm();
        let record = transactions
            .get_mut(id)
            .ok_or_else(|| ChainError::TransactionNotFound {
                tx_id: id.to_string(),
            })?;

        match outcome {
            Ok(()) => {
                record.set_status(CrossChainStatus::Completed);
                metrics::record_cross_chain_status(CrossChainStatus::Completed.as_str());
                info!("Cross-chain transaction {} completed", id);
                Ok(record.clone())
            }
            Err(e) => {
                record.error = Some(e.to_string());
                record.set_status(CrossChainStatus::Failed);
                metrics::record_cross_chain_status(CrossChainStatus::Failed.as_str());
                error!("Cross-chain transaction {} failed: {}", id, e);
                Err(e)
            }
        }
    }

    async fn execute_leg(&self, id: &str, side: LegSide) -> ChainResult<()> {
        let (chain, tx) = {
            let transactions = self.transactions.read().await;
            let leg = transactions
                .get(id)
                .map(|r| r.leg(side))
                .ok_or_else(|| ChainError::TransactionNotFound {
                    tx_id: id.to_string(),
                })?;
            (leg.chain.clone(), leg.tx.clone())
        };

        let submitted = self.txs.submit_transaction(&chain, tx, false).await?;
        self.update_leg(id, side, |leg| leg.hash = Some(submitted.hash))
            .await;
        debug!(
            "Cross-chain transaction {}: {:?} leg sent as {:?}",
            id, side, submitted.hash
        );

        let waiting = self.await_confirmations(id, side, &chain, submitted.hash);
        match tokio::time::timeout(self.config.confirmation_timeout(), waiting).await {
            Ok(result) => result,
            Err(_) => Err(ChainError::timeout(
                &chain,
                format!("confirmation of {:?}", submitted.hash),
            )),
        }
    }

    /// Poll until the leg is buried, publishing the count on every poll
    async fn await_confirmations(
        &self,
        id: &str,
        side: LegSide,
        chain: &str,
        hash: H256,
    ) -> ChainResult<()> {
        let required = self.config.required_confirmations;
        loop {
            match self.chains().confirmation_snapshot(chain, hash).await {
                Ok(Some(tracked)) => {
                    self.update_leg(id, side, |leg| {
                        leg.block_number = Some(tracked.block_number);
                        leg.confirmations = tracked.confirmations;
                    })
                    .await;

                    if tracked.status == TrackedStatus::Failed {
                        return Err(ChainError::Reverted {
                            chain: chain.to_string(),
                            tx_hash: format!("{:?}", hash),
                        });
                    }
                    if tracked.confirmations >= required {
                        return Ok(());
                    }
                }
                Ok(None) => debug!("{:?} not yet mined on chain {}", hash, chain),
                Err(e) if e.is_retryable() => {
                    warn!("Confirmation poll for {:?} on chain {} failed: {}", hash, chain, e)
                }
                Err(e) => return Err(e),
            }

            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    async fn update_leg(&self, id: &str, side: LegSide, update: impl FnOnce(&mut Leg)) {
        if let Some(record) = self.transactions.write().await.get_mut(id) {
            update(record.leg_mut(side));
            record.updated_at = Utc::now();
        }
    }

    /// Snapshot of a cross-chain transaction including per-leg confirmations
    pub async fn get_transaction_status(&self, id: &str) -> ChainResult<CrossChainTransaction> {
        self.transactions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ChainError::TransactionNotFound {
                tx_id: id.to_string(),
            })
    }

    pub async fn list_transactions(&self) -> Vec<CrossChainTransaction> {
        let mut all: Vec<_> = self.transactions.read().await.values().cloned().collect();
        all.sort_by_key(|tx| tx.created_at);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{MockSecurityValidator, PolicySecurityValidator};
    use crate::test_utils::{
        signed_tx, test_tx_config, two_chain_manager, MockRpcClient, ALICE, BOB,
    };
    use std::time::Duration;
    use tokio_test::assert_ok;
    use tokio_util::sync::CancellationToken;

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig {
            required_confirmations: 3,
            poll_interval_ms: 5,
            confirmation_timeout_ms: 2_000,
        }
    }

    async fn coordinator_with(
        security: Arc<dyn SecurityValidator>,
        config: CoordinatorConfig,
    ) -> (CrossChainCoordinator, MockRpcClient, MockRpcClient) {
        let (chains, node1, node2) = two_chain_manager().await;
        let txs = Arc::new(TransactionManager::new(Arc::new(chains), test_tx_config()));
        (CrossChainCoordinator::new(txs, security, config), node1, node2)
    }

    async fn coordinator() -> (CrossChainCoordinator, MockRpcClient, MockRpcClient) {
        coordinator_with(Arc::new(PolicySecurityValidator::new()), fast_config()).await
    }

    /// Mine a block on both nodes every couple of milliseconds
    fn keep_mining(nodes: [MockRpcClient; 2]) -> CancellationToken {
        let token = CancellationToken::new();
        let stop = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(2)) => {
                        for node in &nodes {
                            node.advance(1);
                        }
                    }
                }
            }
        });
        token
    }

    #[tokio::test]
    async fn test_execute_completes_both_legs() {
        let (coordinator, node1, node2) = coordinator().await;

        let id = coordinator
            .initiate_cross_chain_transaction(
                "c1",
                "c2",
                signed_tx(ALICE, BOB),
                signed_tx(BOB, ALICE),
                vec![],
            )
            .await
            .unwrap();

        let status = coordinator.get_transaction_status(&id).await.unwrap();
        assert_eq!(status.status, CrossChainStatus::Pending);
        assert!(status.source.tx.gas.is_some());
        assert_eq!(node1.sent_count() + node2.sent_count(), 0);

        let mining = keep_mining([node1.clone(), node2.clone()]);
        let done = coordinator.execute_transaction(&id).await;
        mining.cancel();
        let done = assert_ok!(done);

        assert_eq!(done.status, CrossChainStatus::Completed);
        assert!(done.source.confirmations >= 3);
        assert!(done.target.confirmations >= 3);
        assert!(done.source.hash.is_some());
        assert_eq!(node1.sent_count(), 1);
        assert_eq!(node2.sent_count(), 1);

        // Re-execution is refused
        assert!(matches!(
            coordinator.execute_transaction(&id).await,
            Err(ChainError::Transaction(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_execution_marks_failed() {
        let (coordinator, _node1, _node2) = coordinator().await;
        let id = coordinator
            .initiate_cross_chain_transaction(
                "c1",
                "c2",
                signed_tx(ALICE, BOB),
                signed_tx(BOB, ALICE),
                vec![],
            )
            .await
            .unwrap();

        // nothing is mined, so the source leg never reaches 3 confirmations
        let cut_short =
            tokio::time::timeout(Duration::from_millis(50), coordinator.execute_transaction(&id))
                .await;
        assert!(cut_short.is_err());

        let record = coordinator.get_transaction_status(&id).await.unwrap();
        assert_eq!(record.status, CrossChainStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("execution abandoned"));
        assert!(record.source.hash.is_some());

        assert!(matches!(
            coordinator.execute_transaction(&id).await,
            Err(ChainError::Transaction(_))
        ));
    }

    #[tokio::test]
    async fn test_dependency_gating_submits_nothing() {
        let (coordinator, node1, node2) = coordinator().await;

        let first = coordinator
            .initiate_cross_chain_transaction(
                "c1",
                "c2",
                signed_tx(ALICE, BOB),
                signed_tx(BOB, ALICE),
                vec![],
            )
            .await
            .unwrap();
        let second = coordinator
            .initiate_cross_chain_transaction(
                "c2",
                "c1",
                signed_tx(BOB, ALICE),
                signed_tx(ALICE, BOB),
                vec![first.clone()],
            )
            .await
            .unwrap();
        assert_ne!(first, second);

        let err = coordinator.execute_transaction(&second).await.unwrap_err();
        assert!(matches!(
            err,
            ChainError::DependencyNotReady { ref dependency, .. } if *dependency == first
        ));
        assert_eq!(node1.sent_count() + node2.sent_count(), 0);
        assert_eq!(
            coordinator.get_transaction_status(&second).await.unwrap().status,
            CrossChainStatus::Pending
        );

        let mining = keep_mining([node1.clone(), node2.clone()]);
        assert_ok!(coordinator.execute_transaction(&first).await);
        assert_ok!(coordinator.execute_transaction(&second).await);
        mining.cancel();
        assert_eq!(coordinator.list_transactions().await.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_dependency_and_chain_rejected() {
        let (coordinator, _node1, _node2) = coordinator().await;

        let err = coordinator
            .initiate_cross_chain_transaction(
                "c1",
                "c2",
                signed_tx(ALICE, BOB),
                signed_tx(BOB, ALICE),
                vec!["0xmissing".to_string()],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::TransactionNotFound { .. }));

        let err = coordinator
            .initiate_cross_chain_transaction(
                "c1",
                "nowhere",
                signed_tx(ALICE, BOB),
                signed_tx(BOB, ALICE),
                vec![],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::ChainNotFound { .. }));

        assert!(matches!(
            coordinator.get_transaction_status("0xmissing").await,
            Err(ChainError::TransactionNotFound { .. })
        ));
        assert!(coordinator.list_transactions().await.is_empty());
    }

    #[tokio::test]
    async fn test_security_rejection_stores_nothing() {
        let mut security = MockSecurityValidator::new();
        security
            .expect_validate_transaction()
            .times(1)
            .returning(|_, _| Err(ChainError::Security("recipient blocked".into())));

        let (coordinator, node1, _node2) =
            coordinator_with(Arc::new(security), fast_config()).await;

        let err = coordinator
            .initiate_cross_chain_transaction(
                "c1",
                "c2",
                signed_tx(ALICE, BOB),
                signed_tx(BOB, ALICE),
                vec![],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Security(_)));
        assert!(coordinator.list_transactions().await.is_empty());
        assert_eq!(node1.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_target_revert_marks_failed() {
        let (coordinator, node1, node2) = coordinator().await;
        node2.set_revert_sends(true);

        let id = coordinator
            .initiate_cross_chain_transaction(
                "c1",
                "c2",
                signed_tx(ALICE, BOB),
                signed_tx(BOB, ALICE),
                vec![],
            )
            .await
            .unwrap();

        let mining = keep_mining([node1.clone(), node2.clone()]);
        let err = coordinator.execute_transaction(&id).await.unwrap_err();
        mining.cancel();
        assert!(matches!(err, ChainError::Reverted { .. }));

        let status = coordinator.get_transaction_status(&id).await.unwrap();
        assert_eq!(status.status, CrossChainStatus::Failed);
        assert!(status.error.is_some());
        assert!(status.source.confirmations >= 3);
        assert_eq!(node1.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_confirmation_timeout_marks_failed() {
        let mut config = fast_config();
        config.confirmation_timeout_ms = 50;
        let (coordinator, node1, _node2) =
            coordinator_with(Arc::new(PolicySecurityValidator::new()), config).await;

        let id = coordinator
            .initiate_cross_chain_transaction(
                "c1",
                "c2",
                signed_tx(ALICE, BOB),
                signed_tx(BOB, ALICE),
                vec![],
            )
            .await
            .unwrap();

        // No blocks are mined, so the source leg never reaches depth
        let err = coordinator.execute_transaction(&id).await.unwrap_err();
        assert!(matches!(err, ChainError::Timeout { .. }));
        assert_eq!(node1.sent_count(), 1);
        assert_eq!(
            coordinator.get_transaction_status(&id).await.unwrap().status,
            CrossChainStatus::Failed
        );
    }
}
