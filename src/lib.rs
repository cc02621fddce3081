//! chainweave - blockchain integration layer
//!
//! Pooled, health-checked connections to many chains behind protocol
//! adapters, nonce-safe transaction submission, block sync with reorg
//! detection, contract deployment and event monitoring, and coordination of
//! transactions that span two chains.

pub mod chain;
pub mod config;
pub mod contract;
pub mod coordination;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod security;
pub mod sync;
pub mod tx;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use chain::ChainManager;
pub use config::Settings;
pub use contract::ContractManager;
pub use coordination::CrossChainCoordinator;
pub use error::{ChainError, ChainResult, ErrorKind};
pub use sync::SyncManager;
pub use tx::TransactionManager;
