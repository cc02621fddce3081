//! Sync module - per-chain block following with head-based reorg detection

mod manager;
mod reorg;
mod state;

pub use manager::{SyncEvent, SyncManager, SyncStatus};
pub use reorg::{HeadChange, HeadTracker};
pub use state::{ProcessedBlock, SyncPhase, SyncState};
