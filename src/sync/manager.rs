//! Sync manager - follows chain heads and rolls back on reorganizations

use super::reorg::{HeadChange, HeadTracker};
use super::state::{ProcessedBlock, SyncPhase, SyncState};
use crate::chain::{with_timeout, ChainManager};
use crate::config::SyncConfig;
use crate::error::{ChainError, ChainResult, ErrorKind};
use crate::metrics;
use crate::protocol::ProtocolAdapter;
use crate::types::{BlockId, BlockInfo};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ethers::types::H256;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Notifications for subscribers of synced data
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    BlockProcessed {
        chain: String,
        number: u64,
        hash: H256,
    },
    Reorg {
        chain: String,
        at: u64,
        discarded: usize,
    },
}

/// Snapshot of one chain's sync progress
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub chain: String,
    pub phase: SyncPhase,
    pub current_block: u64,
    pub latest_known_block: u64,
    pub processed_blocks: usize,
    pub reorg_detected: bool,
    pub reorg_count: u64,
    pub last_error: Option<String>,
    pub last_update: Option<DateTime<Utc>>,
}

impl SyncStatus {
    fn stopped(chain: &str) -> Self {
        Self {
            chain: chain.to_string(),
            phase: SyncPhase::Stopped,
            current_block: 0,
            latest_known_block: 0,
            processed_blocks: 0,
            reorg_detected: false,
            reorg_count: 0,
            last_error: None,
            last_update: None,
        }
    }
}

impl From<&SyncState> for SyncStatus {
    fn from(state: &SyncState) -> Self {
        Self {
            chain: state.chain.clone(),
            phase: state.phase,
            current_block: state.current_block,
            latest_known_block: state.latest_known_block,
            processed_blocks: state.processed_count(),
            reorg_detected: state.reorg_detected,
            reorg_count: state.reorg_count,
            last_error: state.last_error.clone(),
            last_update: state.last_update,
        }
    }
}

struct SyncTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl SyncTasks {
    async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Sync task ended abnormally: {}", e);
            }
        }
    }
}

/// Outcome of one fetch step
enum Progress {
    Processed(usize),
    CaughtUp,
}

/// What happened to a fetched batch
enum Applied {
    Blocks(usize, u64),
    Stale,
    Conflict { at: u64, discarded: usize },
}

/// Everything one chain's loops share
#[derive(Clone)]
struct SyncWorker {
    chain: String,
    chains: Arc<ChainManager>,
    adapter: Arc<dyn ProtocolAdapter>,
    states: Arc<DashMap<String, SyncState>>,
    events: broadcast::Sender<SyncEvent>,
    poll_interval: Duration,
    error_backoff: Duration,
}

impl SyncWorker {
    async fn run_fetch(self, cancel: CancellationToken) {
        debug!("Fetch loop for chain {} started", self.chain);
        loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => break,
                step = self.fetch_step() => step,
            };

            let pause = match step {
                Ok(Progress::Processed(count)) if count > 0 => continue,
                Ok(_) => self.poll_interval,
                Err(e) if e.kind() == ErrorKind::Configuration => {
                    self.fail(&e);
                    break;
                }
                Err(e) => {
                    warn!("Sync fetch on chain {} failed: {}", self.chain, e);
                    self.record_error(&e);
                    self.error_backoff
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        debug!("Fetch loop for chain {} stopped", self.chain);
    }

    async fn fetch_step(&self) -> ChainResult<Progress> {
        let client = self.chains.connection(&self.chain).await?;
        let request_timeout = self.chains.config().request_timeout();

        let (mut range, generation) =
            self.with_state(|state| (state.next_range(), state.generation()))?;
        if range.is_none() {
            let head = with_timeout(
                &self.chain,
                "block number",
                request_timeout,
                client.block_number(),
            )
            .await?;
            range = self.with_state(|state| {
                state.observe_head(head);
                state.next_range()
            })?;
        }

        let (from, to) = match range {
            Some(range) => range,
            None => return Ok(Progress::CaughtUp),
        };

        let mut blocks: Vec<BlockInfo> = Vec::with_capacity((to - from + 1) as usize);
        for number in from..=to {
            let block = with_timeout(
                &self.chain,
                "block fetch",
                request_timeout,
                self.adapter.get_block(client.as_ref(), BlockId::Number(number)),
            )
            .await?;

            match block {
                Some(block) => blocks.push(block),
                None => {
                    debug!("Block {} not yet available on chain {}", number, self.chain);
                    break;
                }
            }
        }

        let outcome = self.with_state(|state| {
            // a rollback while fetching makes the whole batch stale
            if state.generation() != generation || state.current_block + 1 != from {
                return Applied::Stale;
            }
            if let Some(at) = state.parent_conflict(&blocks) {
                let head = state.latest_known_block;
                return Applied::Conflict {
                    at,
                    discarded: state.rollback(at, head),
                };
            }
            Applied::Blocks(state.apply(&blocks), state.current_block)
        })?;

        let (applied, current) = match outcome {
            Applied::Blocks(applied, current) if applied > 0 => (applied, current),
            Applied::Blocks(..) => return Ok(Progress::CaughtUp),
            Applied::Stale => {
                debug!(
                    "Dropping stale batch {}..{} on chain {}",
                    from, to, self.chain
                );
                return Ok(Progress::CaughtUp);
            }
            Applied::Conflict { at, discarded } => {
                self.announce_reorg(at, discarded);
                return Ok(Progress::CaughtUp);
            }
        };

        for block in blocks.iter().take(applied) {
            let _ = self.events.send(SyncEvent::BlockProcessed {
                chain: self.chain.clone(),
                number: block.number,
                hash: block.hash,
            });
        }
        metrics::record_blocks_processed(&self.chain, applied as u64, current);
        debug!(
            "Chain {}: processed blocks {} to {}",
            self.chain,
            from,
            from + applied as u64 - 1
        );

        Ok(Progress::Processed(applied))
    }

    async fn run_reorg_monitor(self, cancel: CancellationToken) {
        debug!("Reorg monitor for chain {} started", self.chain);
        let mut tracker = HeadTracker::new();

        loop {
            let checked = tokio::select! {
                _ = cancel.cancelled() => break,
                checked = self.check_head(&mut tracker) => checked,
            };

            let pause = match checked {
                Ok(()) => self.poll_interval,
                Err(e) if e.kind() == ErrorKind::Configuration => {
                    self.fail(&e);
                    break;
                }
                Err(e) => {
                    warn!("Reorg check on chain {} failed: {}", self.chain, e);
                    self.record_error(&e);
                    self.error_backoff
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        debug!("Reorg monitor for chain {} stopped", self.chain);
    }

    async fn check_head(&self, tracker: &mut HeadTracker) -> ChainResult<()> {
        let client = self.chains.connection(&self.chain).await?;
        let head = with_timeout(
            &self.chain,
            "head fetch",
            self.chains.config().request_timeout(),
            self.adapter.get_block(client.as_ref(), BlockId::Latest),
        )
        .await?;

        let head = match head {
            Some(head) => head,
            None => return Ok(()),
        };

        match tracker.observe(head.number, head.hash) {
            HeadChange::Reorg { at } => self.rollback(at, head.number),
            HeadChange::Advanced | HeadChange::First => {
                self.with_state(|state| state.observe_head(head.number))
            }
            HeadChange::Unchanged => Ok(()),
        }
    }

    fn rollback(&self, at: u64, head: u64) -> ChainResult<()> {
        let discarded = self.with_state(|state| state.rollback(at, head))?;
        self.announce_reorg(at, discarded);
        Ok(())
    }

    fn announce_reorg(&self, at: u64, discarded: usize) {
        warn!(
            "Reorg detected on chain {} at block {}, discarded {} processed blocks",
            self.chain, at, discarded
        );
        metrics::record_reorg(&self.chain);
        let _ = self.events.send(SyncEvent::Reorg {
            chain: self.chain.clone(),
            at,
            discarded,
        });
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SyncState) -> T) -> ChainResult<T> {
        let mut state = self
            .states
            .get_mut(&self.chain)
            .ok_or_else(|| ChainError::sync(&self.chain, "sync state removed"))?;
        Ok(f(&mut state))
    }

    fn record_error(&self, e: &ChainError) {
        if let Some(mut state) = self.states.get_mut(&self.chain) {
            state.record_error(e);
        }
    }

    fn fail(&self, e: &ChainError) {
        error!("Sync on chain {} failed permanently: {}", self.chain, e);
        if let Some(mut state) = self.states.get_mut(&self.chain) {
            state.record_error(e);
            state.phase = SyncPhase::Failed;
        }
    }
}

/// Runs one fetch loop and one reorg monitor per synced chain
pub struct SyncManager {
    chains: Arc<ChainManager>,
    config: SyncConfig,
    states: Arc<DashMap<String, SyncState>>,
    tasks: Mutex<HashMap<String, SyncTasks>>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncManager {
    pub fn new(chains: Arc<ChainManager>, config: SyncConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            chains,
            config,
            states: Arc::new(DashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Processed blocks and reorgs of every synced chain
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Seed the cursor and launch the fetch loop and reorg monitor
    ///
    /// Without `from_block` sync starts `default_lookback` blocks behind the
    /// head. `from_block` itself is the first block processed.
    pub async fn start_sync(
        &self,
        chain: &str,
        from_block: Option<u64>,
        batch_size: Option<u64>,
    ) -> ChainResult<SyncStatus> {
        let adapter = self
            .chains
            .adapter_for(chain)
            .await
            .map_err(|e| unknown_chain(chain, e))?;
        let batch_size = batch_size.unwrap_or(self.config.default_batch_size);
        if batch_size == 0 {
            return Err(ChainError::Configuration("sync batch size must be positive".into()));
        }

        let client = self.chains.connection(chain).await?;
        let latest = with_timeout(
            chain,
            "block number",
            self.chains.config().request_timeout(),
            client.block_number(),
        )
        .await?;

        let current = match from_block {
            Some(from) if from > latest => {
                return Err(ChainError::sync(
                    chain,
                    format!("start block {} is beyond head {}", from, latest),
                ))
            }
            Some(from) => from.saturating_sub(1),
            None => latest.saturating_sub(self.config.default_lookback),
        };

        let mut tasks = self.tasks.lock().await;
        if let Some(running) = tasks.get(chain) {
            if running.handles.iter().any(|h| !h.is_finished()) {
                return Err(ChainError::sync(chain, "sync already running"));
            }
        }
        if let Some(finished) = tasks.remove(chain) {
            finished.shutdown().await;
        }

        let state = SyncState::new(
            chain,
            current,
            latest,
            batch_size,
            self.config.processed_window,
        );
        let status = SyncStatus::from(&state);
        self.states.insert(chain.to_string(), state);

        let poll_interval = self
            .config
            .poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(adapter.policy().block_time);
        let worker = SyncWorker {
            chain: chain.to_string(),
            chains: self.chains.clone(),
            adapter,
            states: self.states.clone(),
            events: self.events.clone(),
            poll_interval,
            error_backoff: self.config.error_backoff(),
        };

        let cancel = CancellationToken::new();
        let handles = vec![
            tokio::spawn(worker.clone().run_fetch(cancel.clone())),
            tokio::spawn(worker.run_reorg_monitor(cancel.clone())),
        ];
        tasks.insert(chain.to_string(), SyncTasks { cancel, handles });

        info!(
            "Started sync for chain {} after block {} (head {}, batch {})",
            chain, current, latest, batch_size
        );
        Ok(status)
    }

    /// Cancel both loops, await them and drop the sync state
    pub async fn stop_sync(&self, chain: &str) -> ChainResult<()> {
        let tasks = self
            .tasks
            .lock()
            .await
            .remove(chain)
            .ok_or_else(|| ChainError::sync(chain, "sync not running"))?;

        tasks.shutdown().await;
        self.states.remove(chain);
        info!("Stopped sync for chain {}", chain);
        Ok(())
    }

    /// Stop every chain
    pub async fn stop_all(&self) {
        let all: Vec<(String, SyncTasks)> = self.tasks.lock().await.drain().collect();
        for (chain, tasks) in all {
            tasks.shutdown().await;
            self.states.remove(&chain);
        }
        info!("Sync manager stopped");
    }

    /// Current progress; a configured chain that is not syncing reports `Stopped`
    pub async fn get_sync_status(&self, chain: &str) -> ChainResult<SyncStatus> {
        if let Some(state) = self.states.get(chain) {
            return Ok(SyncStatus::from(state.value()));
        }
        self.chains
            .chain_config(chain)
            .await
            .map_err(|e| unknown_chain(chain, e))?;
        Ok(SyncStatus::stopped(chain))
    }

    pub fn processed_block(&self, chain: &str, number: u64) -> Option<ProcessedBlock> {
        self.states
            .get(chain)
            .and_then(|state| state.processed(number).cloned())
    }
}

/// Sync callers see an unconfigured chain as a sync error
fn unknown_chain(chain: &str, e: ChainError) -> ChainError {
    match e {
        ChainError::ChainNotFound { .. } => ChainError::sync(chain, "chain not configured"),
        e => e,
    }
}
