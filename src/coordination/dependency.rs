//! Cross-chain transaction records and dependency gating

use crate::types::TxParams;

use chrono::{DateTime, Utc};
use ethers::types::H256;
use serde::Serialize;
use sha3::{Digest, Keccak256};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CrossChainStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl CrossChainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrossChainStatus::Pending => "pending",
            CrossChainStatus::Executing => "executing",
            CrossChainStatus::Completed => "completed",
            CrossChainStatus::Failed => "failed",
        }
    }
}

/// One side of a cross-chain transaction
#[derive(Debug, Clone, Serialize)]
pub struct Leg {
    pub chain: String,
    /// Prepared parameters, submitted on execute
    pub tx: TxParams,
    pub hash: Option<H256>,
    pub block_number: Option<u64>,
    pub confirmations: u64,
}

impl Leg {
    pub fn new(chain: &str, tx: TxParams) -> Self {
        Self {
            chain: chain.to_string(),
            tx,
            hash: None,
            block_number: None,
            confirmations: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegSide {
    Source,
    Target,
}

/// Source/target pair executed in order
#[derive(Debug, Clone, Serialize)]
pub struct CrossChainTransaction {
    pub id: String,
    pub status: CrossChainStatus,
    pub source: Leg,
    pub target: Leg,
    /// Ids that must be `completed` before this executes
    pub dependencies: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl CrossChainTransaction {
    pub fn new(id: String, source: Leg, target: Leg, dependencies: BTreeSet<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: CrossChainStatus::Pending,
            source,
            target,
            dependencies,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    pub fn leg(&self, side: LegSide) -> &Leg {
        match side {
            LegSide::Source => &self.source,
            LegSide::Target => &self.target,
        }
    }

    pub fn leg_mut(&mut self, side: LegSide) -> &mut Leg {
        match side {
            LegSide::Source => &mut self.source,
            LegSide::Target => &mut self.target,
        }
    }

    pub fn set_status(&mut self, status: CrossChainStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// First dependency that is missing or not yet completed
    pub fn unmet_dependency<'a>(
        &'a self,
        all: &HashMap<String, CrossChainTransaction>,
    ) -> Option<&'a str> {
        self.dependencies
            .iter()
            .find(|dep| {
                all.get(dep.as_str())
                    .map_or(true, |tx| tx.status != CrossChainStatus::Completed)
            })
            .map(|dep| dep.as_str())
    }
}

/// Keccak-256 over both legs, the dependencies and a per-coordinator sequence
///
/// Two initiations with identical content still get distinct ids.
pub fn derive_id(
    source: &Leg,
    target: &Leg,
    dependencies: &BTreeSet<String>,
    created_at: DateTime<Utc>,
    sequence: u64,
) -> String {
    let mut hasher = Keccak256::new();
    for leg in [source, target] {
        hasher.update(leg.chain.as_bytes());
        hasher.update([0u8]);
        // serializing plain data into memory cannot fail
        hasher.update(serde_json::to_vec(&leg.tx).unwrap_or_default());
        hasher.update([0u8]);
    }
    for dep in dependencies {
        hasher.update(dep.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(created_at.timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
    hasher.update(sequence.to_be_bytes());

    format!("0x{}", hex::encode(hasher.finalize()))
}
