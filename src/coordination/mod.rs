//! Cross-chain coordination
//!
//! A cross-chain transaction pairs a source leg with a target leg. Both legs
//! are validated and prepared when it is initiated; execution submits the
//! source leg, waits for it to be buried under the configured confirmations,
//! then does the same for the target leg. Dependencies gate execution until
//! every transaction they name has completed.

mod dependency;
mod engine;

pub use dependency::{CrossChainStatus, CrossChainTransaction, Leg, LegSide};
pub use engine::CrossChainCoordinator;
