//! Transaction submission module with per-sender nonce locks and batches

mod batch;
mod manager;
mod nonce;

pub use batch::{BatchFailure, BatchReceipt, TransactionBatch};
pub use manager::{
    PendingTransaction, SubmittedTransaction, TransactionManager, TransactionState,
    TransactionStatus,
};
pub use nonce::{NonceManager, SenderNonce};
