//! Scripted in-memory node and connector for tests

use crate::chain::{ChainManager, Connector, RpcClient};
use crate::config::{ChainConfig, ManagerConfig, RetryPolicy, TransactionConfig};
use crate::error::{ChainError, ChainResult};
use crate::protocol::AdapterRegistry;
use crate::types::{BlockId, BlockInfo, LogEntry, LogFilter, TxDetails, TxParams, TxReceipt};

use async_trait::async_trait;
use ethers::types::{Bytes, H256, U256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ALICE: &str = "0x1111111111111111111111111111111111111111";
pub const BOB: &str = "0x2222222222222222222222222222222222222222";
pub const CAROL: &str = "0x3333333333333333333333333333333333333333";

/// Well-formed 65-byte signature
pub fn test_signature() -> String {
    format!("0x{}{}1b", "11".repeat(32), "22".repeat(32))
}

pub fn signed_tx(from: &str, to: &str) -> TxParams {
    TxParams::new(from, to).with_signature(test_signature())
}

/// Manager settings with short timeouts and a health monitor that stays idle
pub fn test_manager_config() -> ManagerConfig {
    ManagerConfig {
        max_concurrent_connections: 10,
        connect_timeout_ms: 2_000,
        health_check_interval_ms: 60_000,
        health_check_timeout_ms: 200,
        unhealthy_threshold: 3,
        liveness_timeout_ms: 200,
        request_timeout_ms: 1_000,
        submit_timeout_ms: 1_000,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 5,
            multiplier: 2,
        },
    }
}

/// Receipt polling fast enough for unit tests
pub fn test_tx_config() -> TransactionConfig {
    TransactionConfig {
        receipt_timeout_ms: 300,
        receipt_poll_interval_ms: 5,
        max_concurrent_submissions: 10,
        pending_ttl_secs: 3_600,
        purge_interval_ms: 60_000,
    }
}

/// Manager with one EVM chain `c1` (chain id 1) served by the returned node
pub async fn connected_manager() -> (ChainManager, MockRpcClient) {
    let node = MockRpcClient::new(1);
    let connector = Arc::new(MockConnector::new());
    connector.add_client("http://node-a", node.clone());

    let manager = ChainManager::new(test_manager_config(), AdapterRegistry::default(), connector);
    let mut chains = HashMap::new();
    chains.insert("c1".to_string(), ChainConfig::new("http://node-a", 1, "evm"));
    manager.configure(chains).await.unwrap();

    (manager, node)
}

/// Manager with `c1` (chain id 1) and `c2` (chain id 56, bnb)
pub async fn two_chain_manager() -> (ChainManager, MockRpcClient, MockRpcClient) {
    let node1 = MockRpcClient::new(1);
    let node2 = MockRpcClient::new(56);
    let connector = Arc::new(MockConnector::new());
    connector.add_client("http://node-a", node1.clone());
    connector.add_client("http://node-b", node2.clone());

    let manager = ChainManager::new(test_manager_config(), AdapterRegistry::default(), connector);
    let mut chains = HashMap::new();
    chains.insert("c1".to_string(), ChainConfig::new("http://node-a", 1, "evm"));
    chains.insert("c2".to_string(), ChainConfig::new("http://node-b", 56, "bnb"));
    manager.configure(chains).await.unwrap();

    (manager, node1, node2)
}

/// Canonical hash the mock reports for an untouched block
pub fn canonical_hash(number: u64) -> H256 {
    H256::from_low_u64_be(number + 1)
}

#[derive(Default)]
struct MockState {
    head: u64,
    overridden_hashes: HashMap<u64, H256>,
    base_fee: Option<U256>,
    gas_price: U256,
    gas_estimate: u64,
    nonces: HashMap<String, u64>,
    sent: Vec<TxParams>,
    receipts: HashMap<H256, TxReceipt>,
    txs: HashMap<H256, TxDetails>,
    logs: Vec<LogEntry>,
    log_queries: Vec<(u64, u64)>,
    call_result: Bytes,
    send_failures: u32,
    log_failures: u32,
    revert_sends: bool,
    offline: bool,
    auto_mine: bool,
    block_delay: Duration,
    head_delay: Duration,
}

/// Scripted node; clones share state so a test can keep a handle after
/// handing a client to a manager
#[derive(Clone)]
pub struct MockRpcClient {
    chain_id: u64,
    endpoint: String,
    state: Arc<Mutex<MockState>>,
}

impl MockRpcClient {
    pub fn new(chain_id: u64) -> Self {
        let state = MockState {
            head: 1_000,
            base_fee: Some(U256::from(1_000_000_000u64)),
            gas_price: U256::from(2_000_000_000u64),
            gas_estimate: 21_000,
            auto_mine: true,
            ..Default::default()
        };

        Self {
            chain_id,
            endpoint: format!("mock://{}", chain_id),
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    pub fn head(&self) -> u64 {
        self.state.lock().unwrap().head
    }

    pub fn advance(&self, blocks: u64) {
        self.state.lock().unwrap().head += blocks;
    }

    /// Replace the hash of one block, simulating a fork
    pub fn set_block_hash(&self, number: u64, hash: H256) {
        self.state
            .lock()
            .unwrap()
            .overridden_hashes
            .insert(number, hash);
    }

    /// Every block lookup takes `delay`
    pub fn set_block_delay(&self, delay: Duration) {
        self.state.lock().unwrap().block_delay = delay;
    }

    pub fn set_head_delay(&self, delay: Duration) {
        self.state.lock().unwrap().head_delay = delay;
    }

    pub fn set_base_fee(&self, base_fee: Option<U256>) {
        self.state.lock().unwrap().base_fee = base_fee;
    }

    pub fn set_gas_price(&self, price: U256) {
        self.state.lock().unwrap().gas_price = price;
    }

    pub fn set_gas_estimate(&self, gas: u64) {
        self.state.lock().unwrap().gas_estimate = gas;
    }

    pub fn set_pending_nonce(&self, address: &str, nonce: u64) {
        self.state
            .lock()
            .unwrap()
            .nonces
            .insert(address.to_lowercase(), nonce);
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    pub fn fail_next_sends(&self, count: u32) {
        self.state.lock().unwrap().send_failures = count;
    }

    pub fn fail_next_log_queries(&self, count: u32) {
        self.state.lock().unwrap().log_failures = count;
    }

    pub fn set_revert_sends(&self, revert: bool) {
        self.state.lock().unwrap().revert_sends = revert;
    }

    /// When off, sent transactions stay without a receipt
    pub fn set_auto_mine(&self, auto_mine: bool) {
        self.state.lock().unwrap().auto_mine = auto_mine;
    }

    pub fn set_call_result(&self, result: Bytes) {
        self.state.lock().unwrap().call_result = result;
    }

    pub fn add_log(&self, log: LogEntry) {
        self.state.lock().unwrap().logs.push(log);
    }

    pub fn sent(&self) -> Vec<TxParams> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.state.lock().unwrap().sent.len()
    }

    pub fn log_queries(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().log_queries.clone()
    }

    fn block_at(state: &MockState, number: u64) -> BlockInfo {
        let hash_of = |n: u64| {
            state
                .overridden_hashes
                .get(&n)
                .copied()
                .unwrap_or_else(|| canonical_hash(n))
        };

        BlockInfo {
            number,
            hash: hash_of(number),
            parent_hash: if number == 0 {
                H256::zero()
            } else {
                hash_of(number - 1)
            },
            timestamp: 1_700_000_000 + number * 12,
            base_fee: state.base_fee,
            transactions: Vec::new(),
        }
    }

    fn check_online(&self, state: &MockState) -> ChainResult<()> {
        if state.offline {
            return Err(ChainError::connection(&self.endpoint, "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl RpcClient for MockRpcClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn chain_id(&self) -> ChainResult<u64> {
        let state = self.state.lock().unwrap();
        self.check_online(&state)?;
        Ok(self.chain_id)
    }

    async fn block_number(&self) -> ChainResult<u64> {
        let delay = self.state.lock().unwrap().head_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock().unwrap();
        self.check_online(&state)?;
        Ok(state.head)
    }

    async fn get_block(&self, block: BlockId) -> ChainResult<Option<BlockInfo>> {
        let delay = self.state.lock().unwrap().block_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock().unwrap();
        self.check_online(&state)?;
        let number = match block {
            BlockId::Number(n) => n,
            BlockId::Latest => state.head,
        };
        if number > state.head {
            return Ok(None);
        }
        Ok(Some(Self::block_at(&state, number)))
    }

    async fn transaction_count(&self, address: &str) -> ChainResult<u64> {
        // Let concurrent callers interleave between the read and the send
        tokio::task::yield_now().await;
        let state = self.state.lock().unwrap();
        self.check_online(&state)?;
        Ok(state
            .nonces
            .get(&address.to_lowercase())
            .copied()
            .unwrap_or_default())
    }

    async fn balance(&self, _address: &str) -> ChainResult<U256> {
        let state = self.state.lock().unwrap();
        self.check_online(&state)?;
        Ok(U256::exp10(18))
    }

    async fn estimate_gas(&self, _tx: &TxParams) -> ChainResult<u64> {
        let state = self.state.lock().unwrap();
        self.check_online(&state)?;
        Ok(state.gas_estimate)
    }

    async fn gas_price(&self) -> ChainResult<U256> {
        let state = self.state.lock().unwrap();
        self.check_online(&state)?;
        Ok(state.gas_price)
    }

    async fn send_transaction(&self, tx: &TxParams) -> ChainResult<H256> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock().unwrap();
        self.check_online(&state)?;
        if state.send_failures > 0 {
            state.send_failures -= 1;
            return Err(ChainError::connection(&self.endpoint, "send failed"));
        }

        let sender = tx.from.to_lowercase();
        let pending = state.nonces.get(&sender).copied().unwrap_or_default();
        let nonce = tx.nonce.unwrap_or(pending);
        if nonce < pending {
            return Err(ChainError::Transaction(format!(
                "nonce too low: {} < {}",
                nonce, pending
            )));
        }
        state.nonces.insert(sender, nonce + 1);

        state.sent.push(tx.clone());
        let index = state.sent.len() as u64;
        let hash = H256::from_low_u64_be((self.chain_id << 32) | index);

        let block_number = state.auto_mine.then_some(state.head);
        state.txs.insert(
            hash,
            TxDetails {
                hash,
                from: tx.from.clone(),
                to: tx.to.clone(),
                value: tx.value,
                gas_price: tx.gas_price,
                nonce,
                block_number,
            },
        );

        if state.auto_mine {
            let receipt = TxReceipt {
                tx_hash: hash,
                block_number,
                status: !state.revert_sends,
                gas_used: tx.gas.map(U256::from),
                contract_address: tx.to.is_none().then(|| format!("0x{:040x}", index)),
            };
            state.receipts.insert(hash, receipt);
        }

        Ok(hash)
    }

    async fn transaction_receipt(&self, hash: H256) -> ChainResult<Option<TxReceipt>> {
        let state = self.state.lock().unwrap();
        self.check_online(&state)?;
        Ok(state.receipts.get(&hash).cloned())
    }

    async fn transaction(&self, hash: H256) -> ChainResult<Option<TxDetails>> {
        let state = self.state.lock().unwrap();
        self.check_online(&state)?;
        Ok(state.txs.get(&hash).cloned())
    }

    async fn call(&self, _tx: &TxParams) -> ChainResult<Bytes> {
        let state = self.state.lock().unwrap();
        self.check_online(&state)?;
        Ok(state.call_result.clone())
    }

    async fn logs(&self, filter: &LogFilter) -> ChainResult<Vec<LogEntry>> {
        let mut state = self.state.lock().unwrap();
        self.check_online(&state)?;
        state.log_queries.push((filter.from_block, filter.to_block));
        if state.log_failures > 0 {
            state.log_failures -= 1;
            return Err(ChainError::connection(&self.endpoint, "log query failed"));
        }

        Ok(state
            .logs
            .iter()
            .filter(|log| {
                log.address.eq_ignore_ascii_case(&filter.address)
                    && (filter.from_block..=filter.to_block).contains(&log.block_number)
                    && filter
                        .topics
                        .first()
                        .map_or(true, |topic| log.topics.first() == Some(topic))
            })
            .cloned()
            .collect())
    }
}

/// Connector handing out scripted clients per endpoint
#[derive(Default)]
pub struct MockConnector {
    clients: Mutex<HashMap<String, MockRpcClient>>,
    failing: Mutex<HashSet<String>>,
    hanging: Mutex<HashSet<String>>,
    dial_delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    dials: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dial_delay(mut self, delay: Duration) -> Self {
        self.dial_delay = delay;
        self
    }

    /// Serve `client` for `endpoint`
    pub fn add_client(&self, endpoint: &str, client: MockRpcClient) {
        self.clients
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), client.with_endpoint(endpoint));
    }

    pub fn set_failing(&self, endpoint: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(endpoint.to_string());
        } else {
            set.remove(endpoint);
        }
    }

    /// Dials to `endpoint` never complete
    pub fn set_hanging(&self, endpoint: &str) {
        self.hanging.lock().unwrap().insert(endpoint.to_string());
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        chain: &str,
        endpoint: &str,
        chain_id: u64,
    ) -> ChainResult<Arc<dyn RpcClient>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        tokio::time::sleep(self.dial_delay).await;
        let hanging = self.hanging.lock().unwrap().contains(endpoint);
        if hanging {
            std::future::pending::<()>().await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.lock().unwrap().contains(endpoint) {
            return Err(ChainError::connection(chain, "dial refused"));
        }

        let client = self
            .clients
            .lock()
            .unwrap()
            .entry(endpoint.to_string())
            .or_insert_with(|| MockRpcClient::new(chain_id).with_endpoint(endpoint))
            .clone();

        if client.chain_id != chain_id {
            return Err(ChainError::connection(chain, "chain id mismatch"));
        }

        Ok(Arc::new(client))
    }
}
