//! Chain-agnostic value types passed between the managers

use ethers::types::{Bytes, H256, U256};
use serde::{Deserialize, Serialize};

/// Parameters of a transaction as supplied by callers
///
/// Addresses stay as hex strings until an adapter has validated them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxParams {
    pub from: String,
    pub to: Option<String>,
    #[serde(default)]
    pub value: U256,
    #[serde(default)]
    pub data: Bytes,
    pub gas: Option<u64>,
    pub gas_price: Option<U256>,
    pub nonce: Option<u64>,
    /// Hex encoded 65-byte signature authorizing the transaction
    pub signature: Option<String>,
    /// Price from the base fee instead of the adapter's buffered estimate
    #[serde(default)]
    pub gas_strategy: Option<GasStrategy>,
}

/// Surcharge over the latest base fee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GasStrategy {
    Low,
    Medium,
    High,
}

impl GasStrategy {
    pub fn surcharge_percent(&self) -> u64 {
        match self {
            GasStrategy::Low => 10,
            GasStrategy::Medium => 30,
            GasStrategy::High => 50,
        }
    }

    pub fn apply(&self, base: U256) -> U256 {
        base * (100 + self.surcharge_percent()) / 100
    }
}

impl TxParams {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: Some(to.into()),
            ..Default::default()
        }
    }

    pub fn with_value(mut self, value: impl Into<U256>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = Some(nonce);
        self
    }

    pub fn with_gas(mut self, gas: u64) -> Self {
        self.gas = Some(gas);
        self
    }

    pub fn with_gas_strategy(mut self, strategy: GasStrategy) -> Self {
        self.gas_strategy = Some(strategy);
        self
    }
}

/// Block selector for lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockId {
    Number(u64),
    Latest,
}

impl From<u64> for BlockId {
    fn from(number: u64) -> Self {
        BlockId::Number(number)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub number: u64,
    pub hash: H256,
    pub parent_hash: H256,
    pub timestamp: u64,
    pub base_fee: Option<U256>,
    pub transactions: Vec<H256>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub block_number: Option<u64>,
    /// `true` when the node reports execution success
    pub status: bool,
    pub gas_used: Option<U256>,
    pub contract_address: Option<String>,
}

/// Transaction as reported by a node lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxDetails {
    pub hash: H256,
    pub from: String,
    pub to: Option<String>,
    pub value: U256,
    pub gas_price: Option<U256>,
    pub nonce: u64,
    pub block_number: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogFilter {
    pub address: String,
    pub topics: Vec<H256>,
    pub from_block: u64,
    pub to_block: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub address: String,
    pub topics: Vec<H256>,
    pub data: Bytes,
    pub block_number: u64,
    pub tx_hash: H256,
    pub log_index: u64,
}
