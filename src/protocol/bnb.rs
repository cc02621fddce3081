//! BNB Chain - high-throughput EVM variant with a larger gas ceiling

use super::{AdapterPolicy, FeeModel, ProtocolAdapter};

use std::time::Duration;

pub struct BnbChainAdapter {
    policy: AdapterPolicy,
}

impl BnbChainAdapter {
    pub fn new() -> Self {
        Self {
            policy: AdapterPolicy {
                native_currency: "BNB",
                block_time: Duration::from_secs(3),
                max_gas_limit: 30_000_000,
                gas_buffer_percent: 10,
                gas_price_buffer_percent: 5,
                fee_model: FeeModel::Legacy,
                event_batch_size: 500,
            },
        }
    }
}

impl Default for BnbChainAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolAdapter for BnbChainAdapter {
    fn name(&self) -> &'static str {
        "bnb"
    }

    fn policy(&self) -> &AdapterPolicy {
        &self.policy
    }
}
