//! Error types for the chain integration layer

use thiserror::Error;

/// Coarse error taxonomy that callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    ChainConnection,
    Security,
    Transaction,
    Contract,
    Sync,
}

/// Main error type for chain operations
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Chain {chain} not configured")]
    ChainNotFound { chain: String },

    #[error("Chain connection error for chain {chain}: {message}")]
    ChainConnection { chain: String, message: String },

    #[error("Timeout waiting for {operation} on chain {chain}")]
    Timeout { chain: String, operation: String },

    #[error("Security error: {0}")]
    Security(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Gas limit {requested} exceeds maximum {max} for protocol {protocol}")]
    GasLimitExceeded {
        protocol: String,
        requested: u64,
        max: u64,
    },

    #[error("Transaction {tx_hash} reverted on chain {chain}")]
    Reverted { chain: String, tx_hash: String },

    #[error("Nonce {nonce} already used by {sender} on chain {chain}")]
    NonceTooLow {
        chain: String,
        sender: String,
        nonce: u64,
    },

    #[error("Transaction {tx_id} not found")]
    TransactionNotFound { tx_id: String },

    #[error("Dependency {dependency} of {tx_id} not ready")]
    DependencyNotReady { tx_id: String, dependency: String },

    #[error("Batch failed after {completed} of {total} transactions: {source}")]
    BatchIncomplete {
        completed: usize,
        total: usize,
        #[source]
        source: Box<ChainError>,
    },

    #[error("Contract error: {0}")]
    Contract(String),

    #[error("Sync error for chain {chain}: {message}")]
    Sync { chain: String, message: String },
}

impl ChainError {
    pub fn connection(chain: impl Into<String>, message: impl ToString) -> Self {
        ChainError::ChainConnection {
            chain: chain.into(),
            message: message.to_string(),
        }
    }

    pub fn timeout(chain: impl Into<String>, operation: impl Into<String>) -> Self {
        ChainError::Timeout {
            chain: chain.into(),
            operation: operation.into(),
        }
    }

    pub fn sync(chain: impl Into<String>, message: impl Into<String>) -> Self {
        ChainError::Sync {
            chain: chain.into(),
            message: message.into(),
        }
    }

    /// Taxonomy member this error belongs to
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChainError::Configuration(_) | ChainError::ChainNotFound { .. } => {
                ErrorKind::Configuration
            }
            ChainError::ChainConnection { .. } | ChainError::Timeout { .. } => {
                ErrorKind::ChainConnection
            }
            ChainError::Security(_) => ErrorKind::Security,
            ChainError::Transaction(_)
            | ChainError::GasLimitExceeded { .. }
            | ChainError::Reverted { .. }
            | ChainError::NonceTooLow { .. }
            | ChainError::TransactionNotFound { .. }
            | ChainError::DependencyNotReady { .. } => ErrorKind::Transaction,
            ChainError::BatchIncomplete { source, .. } => source.kind(),
            ChainError::Contract(_) => ErrorKind::Contract,
            ChainError::Sync { .. } => ErrorKind::Sync,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChainError::ChainConnection { .. } | ChainError::Timeout { .. }
        )
    }
}

/// Result type for chain operations
pub type ChainResult<T> = Result<T, ChainError>;
