//! Per-chain sync progress

use crate::types::BlockInfo;

use chrono::{DateTime, Utc};
use ethers::types::H256;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Stopped,
    Running,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedBlock {
    pub number: u64,
    pub hash: H256,
    pub parent_hash: H256,
    pub transaction_count: usize,
    pub processed_at: DateTime<Utc>,
}

impl ProcessedBlock {
    pub fn from_block(block: &BlockInfo) -> Self {
        Self {
            number: block.number,
            hash: block.hash,
            parent_hash: block.parent_hash,
            transaction_count: block.transactions.len(),
            processed_at: Utc::now(),
        }
    }
}

/// Sync progress of one chain
///
/// `current_block` is the highest block covered so far and never exceeds
/// `latest_known_block`.
#[derive(Debug, Clone)]
pub struct SyncState {
    pub chain: String,
    pub phase: SyncPhase,
    pub current_block: u64,
    pub latest_known_block: u64,
    pub batch_size: u64,
    pub reorg_detected: bool,
    pub reorg_count: u64,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_update: Option<DateTime<Utc>>,
    processed: BTreeMap<u64, ProcessedBlock>,
    window: usize,
    /// Bumped on every rollback
    generation: u64,
}

impl SyncState {
    pub fn new(
        chain: &str,
        current_block: u64,
        latest_block: u64,
        batch_size: u64,
        window: usize,
    ) -> Self {
        Self {
            chain: chain.to_string(),
            phase: SyncPhase::Running,
            current_block: current_block.min(latest_block),
            latest_known_block: latest_block,
            batch_size,
            reorg_detected: false,
            reorg_count: 0,
            last_error: None,
            started_at: Utc::now(),
            last_update: None,
            processed: BTreeMap::new(),
            window: window.max(1),
            generation: 0,
        }
    }

    /// Next range to fetch, `None` when caught up with the known head
    pub fn next_range(&self) -> Option<(u64, u64)> {
        if self.current_block >= self.latest_known_block {
            return None;
        }
        let from = self.current_block + 1;
        let to = self
            .current_block
            .saturating_add(self.batch_size)
            .min(self.latest_known_block);
        Some((from, to))
    }

    pub fn observe_head(&mut self, head: u64) {
        self.latest_known_block = self.latest_known_block.max(head);
    }

    /// Record consecutive blocks starting right after `current_block`
    ///
    /// Stops at the first block that does not extend the chain recorded so
    /// far; see `parent_conflict`.
    pub fn apply(&mut self, blocks: &[BlockInfo]) -> usize {
        let mut applied = 0;
        for block in blocks {
            if block.number != self.current_block + 1 || !self.links(block) {
                break;
            }
            self.processed
                .insert(block.number, ProcessedBlock::from_block(block));
            self.current_block = block.number;
            applied += 1;
        }
        self.latest_known_block = self.latest_known_block.max(self.current_block);

        while self.processed.len() > self.window {
            let oldest = match self.processed.keys().next() {
                Some(number) => *number,
                None => break,
            };
            self.processed.remove(&oldest);
        }

        if applied > 0 {
            self.last_update = Some(Utc::now());
            self.last_error = None;
        }
        applied
    }

    /// Whether `block` names the recorded block below it as its parent
    fn links(&self, block: &BlockInfo) -> bool {
        block
            .number
            .checked_sub(1)
            .and_then(|parent| self.processed.get(&parent))
            .map_or(true, |parent| parent.hash == block.parent_hash)
    }

    /// Height of the first block the batch contradicts, if any
    ///
    /// A block whose parent hash differs from the hash recorded (or fetched
    /// just before it) for the height below means that height was replaced.
    pub fn parent_conflict(&self, blocks: &[BlockInfo]) -> Option<u64> {
        let mut previous: Option<&BlockInfo> = None;
        for block in blocks {
            let parent_hash = match previous {
                Some(prev) if prev.number + 1 == block.number => Some(prev.hash),
                Some(_) => return None,
                None => block
                    .number
                    .checked_sub(1)
                    .and_then(|parent| self.processed.get(&parent))
                    .map(|parent| parent.hash),
            };
            if parent_hash.map_or(false, |hash| hash != block.parent_hash) {
                return Some(block.number - 1);
            }
            previous = Some(block);
        }
        None
    }

    /// Discard every processed block at or above `at` and rewind the cursor
    pub fn rollback(&mut self, at: u64, head: u64) -> usize {
        let discarded = self.processed.split_off(&at).len();
        self.current_block = self.current_block.min(at.saturating_sub(1));
        self.latest_known_block = head.max(self.current_block);
        self.reorg_detected = true;
        self.reorg_count += 1;
        self.generation += 1;
        self.last_update = Some(Utc::now());
        discarded
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn record_error(&mut self, error: impl ToString) {
        self.last_error = Some(error.to_string());
    }

    pub fn processed(&self, number: u64) -> Option<&ProcessedBlock> {
        self.processed.get(&number)
    }

    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }
}
