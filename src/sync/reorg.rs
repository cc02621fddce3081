//! Head-only reorganization detection
//!
//! Only the chain head is compared between polls, so a fork that replaces
//! blocks below the head without changing it is noticed late or not at all.

use ethers::types::H256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadChange {
    First,
    Unchanged,
    Advanced,
    /// Blocks at or above `at` are no longer canonical
    Reorg { at: u64 },
}

#[derive(Debug, Default)]
pub struct HeadTracker {
    last: Option<(u64, H256)>,
}

impl HeadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, number: u64, hash: H256) -> HeadChange {
        let change = match self.last {
            None => HeadChange::First,
            Some((last_number, last_hash)) if number == last_number => {
                if hash == last_hash {
                    HeadChange::Unchanged
                } else {
                    HeadChange::Reorg { at: number }
                }
            }
            Some((last_number, _)) if number < last_number => HeadChange::Reorg { at: number },
            Some(_) => HeadChange::Advanced,
        };

        self.last = Some((number, hash));
        change
    }

    pub fn last(&self) -> Option<(u64, H256)> {
        self.last
    }
}
