//! Generic EVM family (Ethereum mainnet defaults)

use super::{AdapterPolicy, FeeModel, ProtocolAdapter};

use std::time::Duration;

/// 1.5 gwei
const PRIORITY_FEE_WEI: u64 = 1_500_000_000;

pub struct EthereumAdapter {
    policy: AdapterPolicy,
}

impl EthereumAdapter {
    pub fn new() -> Self {
        Self {
            policy: AdapterPolicy {
                native_currency: "ETH",
                block_time: Duration::from_secs(12),
                max_gas_limit: 15_000_000,
                gas_buffer_percent: 20,
                gas_price_buffer_percent: 10,
                fee_model: FeeModel::Eip1559 {
                    priority_fee: PRIORITY_FEE_WEI,
                },
                event_batch_size: 2_000,
            },
        }
    }
}

impl Default for EthereumAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolAdapter for EthereumAdapter {
    fn name(&self) -> &'static str {
        "ethereum"
    }

    fn policy(&self) -> &AdapterPolicy {
        &self.policy
    }
}
