//! Credentials and the transaction security collaborator

use crate::error::{ChainError, ChainResult};
use crate::types::TxParams;

use async_trait::async_trait;
use ethers::types::{Signature, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use tracing::warn;

/// Ordered privilege levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Operator,
    Admin,
}

/// Caller identity supplied by the embedding application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub subject: String,
    pub role: Role,
}

impl Credential {
    pub fn new(subject: impl Into<String>, role: Role) -> Self {
        Self {
            subject: subject.into(),
            role,
        }
    }

    /// The lower of the credential role and the chain's configured role
    pub fn effective_role(&self, chain_role: Option<Role>) -> Role {
        match chain_role {
            Some(chain_role) => self.role.min(chain_role),
            None => self.role,
        }
    }

    pub fn require(&self, chain_role: Option<Role>, required: Role) -> ChainResult<()> {
        let effective = self.effective_role(chain_role);
        if effective < required {
            return Err(ChainError::Security(format!(
                "{} has {:?} access, {:?} required",
                self.subject, effective, required
            )));
        }
        Ok(())
    }
}

/// Format check of the authorization signature; no network access
pub fn check_signature(tx: &TxParams) -> ChainResult<()> {
    let signature = tx
        .signature
        .as_deref()
        .ok_or_else(|| ChainError::Security("transaction signature missing".into()))?;

    Signature::from_str(signature)
        .map(|_| ())
        .map_err(|e| ChainError::Security(format!("malformed signature: {}", e)))
}

/// Validates transactions before anything is prepared or submitted
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecurityValidator: Send + Sync {
    async fn validate_transaction(&self, chain: &str, tx: &TxParams) -> ChainResult<()>;
}

/// Static policy: signature required, blocked recipients, value ceiling
#[derive(Debug, Clone, Default)]
pub struct PolicySecurityValidator {
    blocked: HashSet<String>,
    max_value: Option<U256>,
}

impl PolicySecurityValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_address(mut self, address: &str) -> Self {
        self.blocked.insert(address.to_lowercase());
        self
    }

    pub fn with_max_value(mut self, max_value: U256) -> Self {
        self.max_value = Some(max_value);
        self
    }
}

#[async_trait]
impl SecurityValidator for PolicySecurityValidator {
    async fn validate_transaction(&self, chain: &str, tx: &TxParams) -> ChainResult<()> {
        check_signature(tx)?;

        if let Some(to) = &tx.to {
            if self.blocked.contains(&to.to_lowercase()) {
                warn!("Rejected transaction to blocked address {} on chain {}", to, chain);
                return Err(ChainError::Security(format!("recipient {} is blocked", to)));
            }
        }

        if let Some(max_value) = self.max_value {
            if tx.value > max_value {
                return Err(ChainError::Security(format!(
                    "value {} exceeds ceiling {}",
                    tx.value, max_value
                )));
            }
        }

        Ok(())
    }
}
