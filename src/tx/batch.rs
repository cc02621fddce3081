//! Named transaction batches

use super::SubmittedTransaction;
use crate::error::ChainError;
use crate::types::TxParams;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Transactions for one chain, submitted together
#[derive(Debug, Clone)]
pub struct TransactionBatch {
    pub batch_id: String,
    pub chain: String,
    /// Submit concurrently and aggregate failures instead of stopping at the first
    pub parallel: bool,
    pub transactions: Vec<TxParams>,
    pub created_at: DateTime<Utc>,
}

impl TransactionBatch {
    pub fn new(chain: &str, transactions: Vec<TxParams>, parallel: bool) -> Self {
        Self {
            batch_id: Uuid::new_v4().to_string(),
            chain: chain.to_string(),
            parallel,
            transactions,
            created_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

/// One member that did not make it
#[derive(Debug)]
pub struct BatchFailure {
    /// Position in the batch
    pub index: usize,
    pub error: ChainError,
}

/// Outcome of a submitted batch
#[derive(Debug)]
pub struct BatchReceipt {
    pub batch_id: String,
    pub chain: String,
    /// Successful members in batch order
    pub submitted: Vec<SubmittedTransaction>,
    pub failures: Vec<BatchFailure>,
}

impl BatchReceipt {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}
