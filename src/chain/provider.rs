//! RPC sessions: the client seam every manager talks through, and its ethers
//! HTTP implementation

use crate::error::{ChainError, ChainResult};
use crate::types::{BlockId, BlockInfo, LogEntry, LogFilter, TxDetails, TxParams, TxReceipt};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError, RpcError};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// One RPC session against one endpoint
#[async_trait]
pub trait RpcClient: Send + Sync {
    fn endpoint(&self) -> &str;

    async fn chain_id(&self) -> ChainResult<u64>;

    async fn block_number(&self) -> ChainResult<u64>;

    async fn get_block(&self, block: BlockId) -> ChainResult<Option<BlockInfo>>;

    /// Pending-inclusive transaction count of `address`
    async fn transaction_count(&self, address: &str) -> ChainResult<u64>;

    async fn balance(&self, address: &str) -> ChainResult<U256>;

    async fn estimate_gas(&self, tx: &TxParams) -> ChainResult<u64>;

    async fn gas_price(&self) -> ChainResult<U256>;

    async fn send_transaction(&self, tx: &TxParams) -> ChainResult<H256>;

    async fn transaction_receipt(&self, hash: H256) -> ChainResult<Option<TxReceipt>>;

    async fn transaction(&self, hash: H256) -> ChainResult<Option<TxDetails>>;

    async fn call(&self, tx: &TxParams) -> ChainResult<Bytes>;

    async fn logs(&self, filter: &LogFilter) -> ChainResult<Vec<LogEntry>>;
}

/// Dials RPC sessions
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session to `endpoint` and check it serves `chain_id`
    async fn connect(
        &self,
        chain: &str,
        endpoint: &str,
        chain_id: u64,
    ) -> ChainResult<Arc<dyn RpcClient>>;
}

/// Connector producing ethers HTTP sessions
#[derive(Debug, Clone)]
pub struct EthersConnector {
    request_timeout: Duration,
}

impl EthersConnector {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

#[async_trait]
impl Connector for EthersConnector {
    async fn connect(
        &self,
        chain: &str,
        endpoint: &str,
        chain_id: u64,
    ) -> ChainResult<Arc<dyn RpcClient>> {
        let client = EthersRpcClient::new(chain, endpoint, self.request_timeout)?;

        let remote_id = client.chain_id().await?;
        if remote_id != chain_id {
            return Err(ChainError::connection(
                chain,
                format!(
                    "endpoint {} serves chain id {}, expected {}",
                    endpoint, remote_id, chain_id
                ),
            ));
        }

        info!("Connected to chain {} via {}", chain, endpoint);
        Ok(Arc::new(client))
    }
}

/// RPC session backed by an ethers HTTP provider
pub struct EthersRpcClient {
    chain: String,
    endpoint: String,
    provider: Provider<Http>,
    request_timeout: Duration,
}

impl EthersRpcClient {
    pub fn new(chain: &str, endpoint: &str, request_timeout: Duration) -> ChainResult<Self> {
        let provider = Provider::<Http>::try_from(endpoint)
            .map_err(|e| ChainError::connection(chain, format!("invalid endpoint: {}", e)))?
            .interval(Duration::from_millis(100));

        debug!("Created HTTP provider for chain {}: {}", chain, endpoint);

        Ok(Self {
            chain: chain.to_string(),
            endpoint: endpoint.to_string(),
            provider,
            request_timeout,
        })
    }

    /// Run one request under the session timeout, classifying failures
    async fn request<T, F>(&self, operation: &str, fut: F) -> ChainResult<T>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(self.classify(operation, e)),
            Err(_) => Err(ChainError::timeout(&self.chain, operation)),
        }
    }

    /// Node-side rejections are transaction errors, everything else is connectivity
    fn classify(&self, operation: &str, err: ProviderError) -> ChainError {
        match RpcError::as_error_response(&err) {
            Some(response) => {
                ChainError::Transaction(format!("{} rejected: {}", operation, response.message))
            }
            None => ChainError::connection(&self.chain, format!("{}: {}", operation, err)),
        }
    }
}

#[async_trait]
impl RpcClient for EthersRpcClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn chain_id(&self) -> ChainResult<u64> {
        let id = self.request("eth_chainId", self.provider.get_chainid()).await?;
        Ok(id.as_u64())
    }

    async fn block_number(&self) -> ChainResult<u64> {
        let number = self
            .request("eth_blockNumber", self.provider.get_block_number())
            .await?;
        Ok(number.as_u64())
    }

    async fn get_block(&self, block: BlockId) -> ChainResult<Option<BlockInfo>> {
        let number = match block {
            BlockId::Number(n) => BlockNumber::Number(n.into()),
            BlockId::Latest => BlockNumber::Latest,
        };

        let block = self
            .request("eth_getBlockByNumber", self.provider.get_block(number))
            .await?;

        Ok(block.and_then(|b| {
            Some(BlockInfo {
                number: b.number?.as_u64(),
                hash: b.hash?,
                parent_hash: b.parent_hash,
                timestamp: b.timestamp.as_u64(),
                base_fee: b.base_fee_per_gas,
                transactions: b.transactions,
            })
        }))
    }

    async fn transaction_count(&self, address: &str) -> ChainResult<u64> {
        let address = parse_address(address)?;
        let count = self
            .request(
                "eth_getTransactionCount",
                self.provider
                    .get_transaction_count(address, Some(BlockNumber::Pending.into())),
            )
            .await?;
        Ok(count.as_u64())
    }

    async fn balance(&self, address: &str) -> ChainResult<U256> {
        let address = parse_address(address)?;
        self.request("eth_getBalance", self.provider.get_balance(address, None))
            .await
    }

    async fn estimate_gas(&self, tx: &TxParams) -> ChainResult<u64> {
        let typed = to_typed_transaction(tx)?;
        let gas = self
            .request("eth_estimateGas", self.provider.estimate_gas(&typed, None))
            .await?;
        Ok(gas.as_u64())
    }

    async fn gas_price(&self) -> ChainResult<U256> {
        self.request("eth_gasPrice", self.provider.get_gas_price())
            .await
    }

    async fn send_transaction(&self, tx: &TxParams) -> ChainResult<H256> {
        let typed = to_typed_transaction(tx)?;
        let pending = self
            .request(
                "eth_sendTransaction",
                self.provider.send_transaction(typed, None),
            )
            .await?;
        Ok(pending.tx_hash())
    }

    async fn transaction_receipt(&self, hash: H256) -> ChainResult<Option<TxReceipt>> {
        let receipt = self
            .request(
                "eth_getTransactionReceipt",
                self.provider.get_transaction_receipt(hash),
            )
            .await?;

        Ok(receipt.map(|r| TxReceipt {
            tx_hash: r.transaction_hash,
            block_number: r.block_number.map(|n| n.as_u64()),
            status: r.status == Some(1u64.into()),
            gas_used: r.gas_used,
            contract_address: r.contract_address.map(|a| format!("{:?}", a)),
        }))
    }

    async fn transaction(&self, hash: H256) -> ChainResult<Option<TxDetails>> {
        let tx = self
            .request(
                "eth_getTransactionByHash",
                self.provider.get_transaction(hash),
            )
            .await?;

        Ok(tx.map(|t| TxDetails {
            hash: t.hash,
            from: format!("{:?}", t.from),
            to: t.to.map(|a| format!("{:?}", a)),
            value: t.value,
            gas_price: t.gas_price,
            nonce: t.nonce.as_u64(),
            block_number: t.block_number.map(|n| n.as_u64()),
        }))
    }

    async fn call(&self, tx: &TxParams) -> ChainResult<Bytes> {
        let typed = to_typed_transaction(tx)?;
        self.request("eth_call", self.provider.call(&typed, None))
            .await
    }

    async fn logs(&self, filter: &LogFilter) -> ChainResult<Vec<LogEntry>> {
        let mut query = Filter::new()
            .address(parse_address(&filter.address)?)
            .from_block(filter.from_block)
            .to_block(filter.to_block);
        if let Some(topic0) = filter.topics.first() {
            query = query.topic0(*topic0);
        }

        let logs = self
            .request("eth_getLogs", self.provider.get_logs(&query))
            .await?;

        Ok(logs
            .into_iter()
            .map(|log| LogEntry {
                address: format!("{:?}", log.address),
                topics: log.topics,
                data: log.data,
                block_number: log.block_number.map(|n| n.as_u64()).unwrap_or_default(),
                tx_hash: log.transaction_hash.unwrap_or_default(),
                log_index: log.log_index.map(|i| i.as_u64()).unwrap_or_default(),
            })
            .collect())
    }
}

fn parse_address(address: &str) -> ChainResult<Address> {
    Address::from_str(address)
        .map_err(|e| ChainError::Transaction(format!("invalid address {}: {}", address, e)))
}

/// Build the wire request for caller-supplied parameters
fn to_typed_transaction(tx: &TxParams) -> ChainResult<TypedTransaction> {
    let mut request = TransactionRequest::new()
        .from(parse_address(&tx.from)?)
        .value(tx.value)
        .data(tx.data.clone());

    if let Some(to) = &tx.to {
        request = request.to(parse_address(to)?);
    }
    if let Some(gas) = tx.gas {
        request = request.gas(gas);
    }
    if let Some(price) = tx.gas_price {
        request = request.gas_price(price);
    }
    if let Some(nonce) = tx.nonce {
        request = request.nonce(nonce);
    }

    Ok(request.into())
}
