//! Protocol adapters - per chain-family strategy objects
//!
//! An adapter owns the chain-specific policy (gas buffers, gas ceiling, block
//! time, fee model) and implements the capability set every manager relies on.
//! Policy is plain data so that a new family usually only needs a new
//! [`AdapterPolicy`].

pub mod bnb;
pub mod ethereum;

pub use bnb::BnbChainAdapter;
pub use ethereum::EthereumAdapter;

use crate::chain::RpcClient;
use crate::error::{ChainError, ChainResult};
use crate::types::{BlockId, BlockInfo, GasStrategy, TxParams};

use async_trait::async_trait;
use ethers::types::{H256, U256};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

lazy_static! {
    static ref HEX_ADDRESS: Regex =
        Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("valid address pattern");
}

/// How a family prices gas
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeeModel {
    /// Node-reported `eth_gasPrice`
    Legacy,
    /// Latest base fee plus a fixed priority fee, legacy price when no base fee
    Eip1559 { priority_fee: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdapterPolicy {
    pub native_currency: &'static str,
    pub block_time: Duration,
    pub max_gas_limit: u64,
    pub gas_buffer_percent: u64,
    pub gas_price_buffer_percent: u64,
    pub fee_model: FeeModel,
    /// Blocks per `eth_getLogs` page
    pub event_batch_size: u64,
}

impl AdapterPolicy {
    pub fn buffered_gas(&self, estimate: u64) -> u64 {
        estimate.saturating_mul(100 + self.gas_buffer_percent) / 100
    }

    pub fn buffered_gas_price(&self, price: U256) -> U256 {
        price + price * self.gas_price_buffer_percent / 100
    }
}

/// Capability set of one chain family
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn policy(&self) -> &AdapterPolicy;

    fn validate_address(&self, address: &str) -> bool {
        HEX_ADDRESS.is_match(address)
    }

    /// Buffered gas estimate; estimates above the family ceiling are rejected
    async fn estimate_gas(&self, client: &dyn RpcClient, tx: &TxParams) -> ChainResult<u64> {
        let raw = client.estimate_gas(tx).await?;
        let gas = self.policy().buffered_gas(raw);
        self.check_gas_limit(gas)?;

        debug!("{} gas estimate {} buffered to {}", self.name(), raw, gas);
        Ok(gas)
    }

    async fn estimate_gas_price(&self, client: &dyn RpcClient) -> ChainResult<U256> {
        match self.policy().fee_model {
            FeeModel::Legacy => client.gas_price().await,
            FeeModel::Eip1559 { priority_fee } => {
                let latest = client.get_block(BlockId::Latest).await?;
                match latest.and_then(|b| b.base_fee) {
                    Some(base_fee) if !base_fee.is_zero() => {
                        Ok(base_fee + U256::from(priority_fee))
                    }
                    _ => client.gas_price().await,
                }
            }
        }
    }

    /// Latest base fee with the strategy's surcharge; node gas price when the
    /// chain reports no base fee
    async fn strategy_gas_price(
        &self,
        client: &dyn RpcClient,
        strategy: GasStrategy,
    ) -> ChainResult<U256> {
        let latest = client.get_block(BlockId::Latest).await?;
        let base = match latest.and_then(|b| b.base_fee) {
            Some(base_fee) if !base_fee.is_zero() => base_fee,
            _ => client.gas_price().await?,
        };
        Ok(strategy.apply(base))
    }

    /// `None` when the node does not have the block yet
    async fn get_block(
        &self,
        client: &dyn RpcClient,
        block: BlockId,
    ) -> ChainResult<Option<BlockInfo>> {
        client.get_block(block).await
    }

    /// Submit fully-specified parameters, refusing gas above the ceiling
    async fn send_transaction(&self, client: &dyn RpcClient, tx: &TxParams) -> ChainResult<H256> {
        self.check_gas_limit(tx.gas.unwrap_or_default())?;
        client.send_transaction(tx).await
    }

    async fn get_balance(&self, client: &dyn RpcClient, address: &str) -> ChainResult<U256> {
        if !self.validate_address(address) {
            return Err(ChainError::Transaction(format!("invalid address {}", address)));
        }
        client.balance(address).await
    }

    fn check_gas_limit(&self, gas: u64) -> ChainResult<()> {
        let max = self.policy().max_gas_limit;
        if gas > max {
            return Err(ChainError::GasLimitExceeded {
                protocol: self.name().to_string(),
                requested: gas,
                max,
            });
        }
        Ok(())
    }
}

/// protocol name -> adapter
#[derive(Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProtocolAdapter>>,
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, protocol: impl Into<String>, adapter: Arc<dyn ProtocolAdapter>) {
        self.adapters.insert(protocol.into().to_lowercase(), adapter);
    }

    pub fn get(&self, protocol: &str) -> Option<Arc<dyn ProtocolAdapter>> {
        self.adapters.get(&protocol.to_lowercase()).cloned()
    }

    pub fn contains(&self, protocol: &str) -> bool {
        self.adapters.contains_key(&protocol.to_lowercase())
    }
}

impl Default for AdapterRegistry {
    /// Generic EVM family plus the high-throughput BNB variant
    fn default() -> Self {
        let mut registry = Self::empty();

        let ethereum: Arc<dyn ProtocolAdapter> = Arc::new(EthereumAdapter::new());
        registry.register("evm", ethereum.clone());
        registry.register("ethereum", ethereum);

        let bnb: Arc<dyn ProtocolAdapter> = Arc::new(BnbChainAdapter::new());
        registry.register("bnb", bnb.clone());
        registry.register("bsc", bnb);

        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockRpcClient;

    #[test]
    fn test_registry_aliases() {
        let registry = AdapterRegistry::default();
        assert_eq!(registry.get("EVM").unwrap().name(), "ethereum");
        assert_eq!(registry.get("bsc").unwrap().name(), "bnb");
        assert!(!registry.contains("solana"));
    }

    #[test]
    fn test_validate_address() {
        let adapter = EthereumAdapter::new();
        assert!(adapter.validate_address("0x52908400098527886E0F7030069857D2E4169EE7"));
        assert!(!adapter.validate_address("52908400098527886E0F7030069857D2E4169EE7"));
        assert!(!adapter.validate_address("0x1234"));
        assert!(!adapter.validate_address("0xZZ908400098527886E0F7030069857D2E4169EE7"));
    }

    #[tokio::test]
    async fn test_estimate_above_ceiling_rejected() {
        let client = MockRpcClient::new(1);
        client.set_gas_estimate(14_000_000);
        let adapter = EthereumAdapter::new();

        // 14M * 1.2 exceeds the 15M ceiling
        let err = adapter
            .estimate_gas(&client, &TxParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::GasLimitExceeded { requested: 16_800_000, .. }));
    }

    #[tokio::test]
    async fn test_strategy_prices_over_base_fee() {
        let client = MockRpcClient::new(1);
        client.set_base_fee(Some(U256::from(10_000_000_000u64)));
        let adapter = EthereumAdapter::new();

        let low = adapter.strategy_gas_price(&client, GasStrategy::Low).await.unwrap();
        let medium = adapter.strategy_gas_price(&client, GasStrategy::Medium).await.unwrap();
        let high = adapter.strategy_gas_price(&client, GasStrategy::High).await.unwrap();
        assert_eq!(low, U256::from(11_000_000_000u64));
        assert_eq!(medium, U256::from(13_000_000_000u64));
        assert_eq!(high, U256::from(15_000_000_000u64));

        // no base fee: surcharge applies to the node price
        client.set_base_fee(None);
        client.set_gas_price(U256::from(2_000_000_000u64));
        let low = adapter.strategy_gas_price(&client, GasStrategy::Low).await.unwrap();
        assert_eq!(low, U256::from(2_200_000_000u64));
    }

    #[tokio::test]
    async fn test_send_above_ceiling_submits_nothing() {
        let client = MockRpcClient::new(56);
        let adapter = BnbChainAdapter::new();
        let tx = TxParams::default().with_gas(30_000_001);

        let err = adapter.send_transaction(&client, &tx).await.unwrap_err();
        assert!(matches!(err, ChainError::GasLimitExceeded { max: 30_000_000, .. }));
        assert_eq!(client.sent_count(), 0);
    }
}
