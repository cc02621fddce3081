//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - One lock per (chain, sender), created on first use
//! - Local next-nonce tracking merged with the node's pending count
//! - Rejection of explicit nonces the sender has already used

use crate::error::{ChainError, ChainResult};

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Per-sender nonce state, only touched under its lock
#[derive(Debug, Default)]
pub struct SenderNonce {
    /// Next nonce to use, `None` until first submission or after a reset
    next: Option<u64>,
    last_commit: Option<Instant>,
}

impl SenderNonce {
    /// Next nonce given the node's pending transaction count
    pub fn allocate(&self, pending: u64) -> u64 {
        match self.next {
            Some(local) => local.max(pending),
            None => pending,
        }
    }

    /// Accept an explicit nonce unless it is below what was already used
    pub fn check_explicit(&self, chain: &str, sender: &str, nonce: u64) -> ChainResult<()> {
        match self.next {
            Some(next) if nonce < next => Err(ChainError::NonceTooLow {
                chain: chain.to_string(),
                sender: sender.to_string(),
                nonce,
            }),
            _ => Ok(()),
        }
    }

    /// Record that `nonce` reached the node
    pub fn commit(&mut self, nonce: u64) {
        let next = nonce + 1;
        self.next = Some(self.next.map_or(next, |current| current.max(next)));
        self.last_commit = Some(Instant::now());
    }

    fn idle_for(&self, max_idle: Duration) -> bool {
        self.last_commit.map_or(true, |at| at.elapsed() >= max_idle)
    }

    /// Forget local state; the next allocation trusts the node again
    pub fn reset(&mut self) {
        if self.next.take().is_some() {
            warn!("Discarded local nonce tracking");
        }
    }

    pub fn next(&self) -> Option<u64> {
        self.next
    }
}

/// Manages nonce locks across chains and senders
#[derive(Default)]
pub struct NonceManager {
    senders: DashMap<(String, String), Arc<Mutex<SenderNonce>>>,
}

impl NonceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the (chain, sender) pair; hold the guard over nonce read and submit
    pub async fn lock(&self, chain: &str, sender: &str) -> OwnedMutexGuard<SenderNonce> {
        let key = (chain.to_string(), sender.to_lowercase());
        let lock = self
            .senders
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(SenderNonce::default())))
            .clone();

        let guard = lock.lock_owned().await;
        debug!("Acquired nonce lock for {} on chain {}", sender, chain);
        guard
    }

    pub fn tracked_senders(&self) -> usize {
        self.senders.len()
    }

    /// Forget senders nobody holds or waits on and that committed nothing
    /// for `max_idle`
    pub fn prune_idle(&self, max_idle: Duration) -> usize {
        let before = self.senders.len();
        self.senders.retain(|_, lock| {
            if Arc::strong_count(lock) > 1 {
                return true;
            }
            match lock.try_lock() {
                Ok(state) => !state.idle_for(max_idle),
                Err(_) => true,
            }
        });
        before.saturating_sub(self.senders.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_takes_max_of_local_and_pending() {
        let mut state = SenderNonce::default();
        assert_eq!(state.allocate(4), 4);

        state.commit(4);
        assert_eq!(state.allocate(3), 5);
        assert_eq!(state.allocate(9), 9);

        state.reset();
        assert_eq!(state.allocate(3), 3);
    }

    #[test]
    fn test_explicit_nonce_below_next_rejected() {
        let mut state = SenderNonce::default();
        state.commit(7);

        assert!(state.check_explicit("c1", "0xabc", 8).is_ok());
        let err = state.check_explicit("c1", "0xabc", 5).unwrap_err();
        assert!(matches!(err, ChainError::NonceTooLow { nonce: 5, .. }));

        // committing an older nonce never moves the cursor back
        state.commit(2);
        assert_eq!(state.next(), Some(8));
    }

    #[tokio::test]
    async fn test_locks_are_per_sender() {
        let manager = NonceManager::new();

        let alice = manager.lock("c1", "0xAAA").await;
        // a different sender and the same sender on another chain are independent
        let bob = manager.lock("c1", "0xBBB").await;
        let alice_c2 = manager.lock("c2", "0xaaa").await;
        drop((alice, bob, alice_c2));

        assert_eq!(manager.tracked_senders(), 3);

        // sender addresses are case-insensitive
        let guard = manager.lock("c1", "0xaaa").await;
        drop(guard);
        assert_eq!(manager.tracked_senders(), 3);
    }

    #[tokio::test]
    async fn test_prune_keeps_held_and_recent_senders() {
        let manager = NonceManager::new();

        let mut recent = manager.lock("c1", "0xaaa").await;
        recent.commit(3);
        drop(recent);
        drop(manager.lock("c1", "0xbbb").await);
        let held = manager.lock("c1", "0xccc").await;

        assert_eq!(manager.prune_idle(Duration::from_secs(60)), 1);
        assert_eq!(manager.tracked_senders(), 2);

        drop(held);
        assert_eq!(manager.prune_idle(Duration::ZERO), 2);
        assert_eq!(manager.tracked_senders(), 0);
    }
}
