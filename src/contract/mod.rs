//! Contract module - deployment, registry, ABI calls and event monitoring
//!
//! Read-only calls go straight to a node through `eth_call` and report
//! contract errors. State-changing calls are regular transactions and go
//! through the transaction manager, keeping its nonce and signature rules.

pub mod events;

pub use events::ContractEvent;

use crate::chain::{with_timeout, ChainManager};
use crate::config::ContractConfig;
use crate::error::{ChainError, ChainResult};
use crate::metrics;
use crate::security::{Credential, Role};
use crate::tx::{SubmittedTransaction, TransactionManager};
use crate::types::TxParams;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use ethers::abi::{Abi, Function, StateMutability, Token};
use ethers::types::{Address, Bytes, H256, U256};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A deployed or registered contract
#[derive(Debug, Clone)]
pub struct ContractRecord {
    pub contract_id: String,
    pub name: String,
    pub chain: String,
    pub address: String,
    pub abi: Abi,
    pub deploy_block: Option<u64>,
    pub deploy_tx: Option<H256>,
    pub owner: Option<String>,
    pub registered_at: DateTime<Utc>,
}

/// Everything needed to deploy one contract
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub contract_id: String,
    pub name: String,
    pub chain: String,
    pub abi: Abi,
    pub bytecode: Bytes,
    pub constructor_args: Vec<Token>,
    /// Sender, value, gas and signature of the deployment transaction
    pub tx: TxParams,
}

/// ABI and creation bytecode read from disk
#[derive(Debug, Clone)]
pub struct ContractArtifact {
    pub abi: Abi,
    pub bytecode: Option<Bytes>,
}

/// Load a bare ABI array or a compiler artifact with an `abi` field
///
/// Bytecode is taken from `bytecode` as a hex string or as `{"object": ...}`.
pub fn load_artifact(path: impl AsRef<Path>) -> ChainResult<ContractArtifact> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        ChainError::Contract(format!("cannot read {}: {}", path.display(), e))
    })?;
    let invalid =
        |e: serde_json::Error| ChainError::Contract(format!("invalid ABI in {}: {}", path.display(), e));

    let value: serde_json::Value = serde_json::from_str(&content).map_err(invalid)?;
    match value {
        serde_json::Value::Array(_) => Ok(ContractArtifact {
            abi: serde_json::from_value(value).map_err(invalid)?,
            bytecode: None,
        }),
        serde_json::Value::Object(mut artifact) => {
            let abi = artifact.remove("abi").ok_or_else(|| {
                ChainError::Contract(format!("{} has no abi field", path.display()))
            })?;
            let bytecode = match artifact.remove("bytecode") {
                Some(serde_json::Value::String(code)) => Some(code),
                Some(serde_json::Value::Object(mut code)) => match code.remove("object") {
                    Some(serde_json::Value::String(code)) => Some(code),
                    _ => None,
                },
                _ => None,
            };
            let bytecode = bytecode
                .filter(|code| !code.trim_start_matches("0x").is_empty())
                .map(|code| {
                    hex::decode(code.trim_start_matches("0x")).map(Bytes::from).map_err(|e| {
                        ChainError::Contract(format!("invalid bytecode in {}: {}", path.display(), e))
                    })
                })
                .transpose()?;

            Ok(ContractArtifact {
                abi: serde_json::from_value(abi).map_err(invalid)?,
                bytecode,
            })
        }
        _ => Err(ChainError::Contract(format!(
            "{} is neither an ABI array nor an artifact",
            path.display()
        ))),
    }
}

pub struct ContractManager {
    txs: Arc<TransactionManager>,
    config: ContractConfig,
    contracts: DashMap<String, ContractRecord>,
    /// Ids with a deployment in flight
    deploying: DashSet<String>,
}

impl ContractManager {
    pub fn new(txs: Arc<TransactionManager>, config: ContractConfig) -> Self {
        Self {
            txs,
            config,
            contracts: DashMap::new(),
            deploying: DashSet::new(),
        }
    }

    fn chains(&self) -> &Arc<ChainManager> {
        self.txs.chains()
    }

    /// Deploy and record a contract; requires effective admin on the chain
    pub async fn deploy_contract(
        &self,
        credential: &Credential,
        request: DeployRequest,
    ) -> ChainResult<ContractRecord> {
        let chain_config = self.chains().chain_config(&request.chain).await?;
        credential.require(chain_config.role, Role::Admin)?;

        let contract_id = request.contract_id.clone();
        if self.contracts.contains_key(&contract_id) || !self.deploying.insert(contract_id.clone())
        {
            return Err(ChainError::Contract(format!(
                "contract id {} already exists",
                contract_id
            )));
        }

        let result = self.deploy_inner(credential, request).await;
        self.deploying.remove(&contract_id);
        result
    }

    async fn deploy_inner(
        &self,
        credential: &Credential,
        request: DeployRequest,
    ) -> ChainResult<ContractRecord> {
        let data = match request.abi.constructor() {
            Some(constructor) => constructor
                .encode_input(request.bytecode.to_vec(), &request.constructor_args)
                .map_err(|e| {
                    ChainError::Contract(format!(
                        "invalid constructor arguments for {}: {}",
                        request.name, e
                    ))
                })?,
            None if request.constructor_args.is_empty() => request.bytecode.to_vec(),
            None => {
                return Err(ChainError::Contract(format!(
                    "{} has no constructor taking arguments",
                    request.name
                )))
            }
        };

        let mut tx = request.tx;
        tx.to = None;
        tx.data = Bytes::from(data);
        let owner = tx.from.clone();

        let submitted = self
            .txs
            .submit_transaction(&request.chain, tx, true)
            .await?;
        let receipt = submitted.receipt.ok_or_else(|| {
            ChainError::Contract(format!("no receipt for deployment of {}", request.name))
        })?;
        let address = receipt.contract_address.clone().ok_or_else(|| {
            ChainError::Contract(format!(
                "deployment of {} returned no contract address",
                request.name
            ))
        })?;

        let record = ContractRecord {
            contract_id: request.contract_id.clone(),
            name: request.name,
            chain: request.chain.clone(),
            address,
            abi: request.abi,
            deploy_block: receipt.block_number,
            deploy_tx: Some(submitted.hash),
            owner: Some(owner),
            registered_at: Utc::now(),
        };
        match self.contracts.entry(record.contract_id.clone()) {
            Entry::Occupied(_) => {
                warn!(
                    "Contract id {} was registered while {:?} deployed it; keeping the registration",
                    record.contract_id, submitted.hash
                );
                return Err(ChainError::Contract(format!(
                    "contract id {} already exists; deployment {:?} not recorded",
                    record.contract_id, submitted.hash
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
            }
        }
        metrics::record_contract_deployed(&request.chain);

        info!(
            "{} deployed contract {} ({}) at {} on chain {}",
            credential.subject, record.contract_id, record.name, record.address, record.chain
        );
        Ok(record)
    }

    /// Track an already deployed contract
    pub async fn register_contract(
        &self,
        contract_id: &str,
        name: &str,
        chain: &str,
        address: &str,
        abi: Abi,
    ) -> ChainResult<ContractRecord> {
        let adapter = self.chains().adapter_for(chain).await?;
        if !adapter.validate_address(address) {
            return Err(ChainError::Contract(format!(
                "invalid contract address {}",
                address
            )));
        }
        if self.deploying.contains(contract_id) {
            return Err(ChainError::Contract(format!(
                "contract id {} already exists",
                contract_id
            )));
        }

        let record = ContractRecord {
            contract_id: contract_id.to_string(),
            name: name.to_string(),
            chain: chain.to_string(),
            address: address.to_string(),
            abi,
            deploy_block: None,
            deploy_tx: None,
            owner: None,
            registered_at: Utc::now(),
        };

        match self.contracts.entry(contract_id.to_string()) {
            Entry::Occupied(_) => Err(ChainError::Contract(format!(
                "contract id {} already exists",
                contract_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                debug!("Registered contract {} at {} on {}", contract_id, address, chain);
                Ok(record)
            }
        }
    }

    /// Track an already deployed contract with its ABI read from `path`
    pub async fn register_contract_from_file(
        &self,
        contract_id: &str,
        name: &str,
        chain: &str,
        address: &str,
        path: impl AsRef<Path>,
    ) -> ChainResult<ContractRecord> {
        let artifact = load_artifact(path)?;
        self.register_contract(contract_id, name, chain, address, artifact.abi)
            .await
    }

    pub fn unregister_contract(&self, contract_id: &str) -> ChainResult<ContractRecord> {
        self.contracts
            .remove(contract_id)
            .map(|(_, record)| record)
            .ok_or_else(|| unknown_contract(contract_id))
    }

    pub fn get_contract(&self, contract_id: &str) -> ChainResult<ContractRecord> {
        self.contracts
            .get(contract_id)
            .map(|record| record.clone())
            .ok_or_else(|| unknown_contract(contract_id))
    }

    pub fn list_contracts(&self, chain: &str) -> Vec<ContractRecord> {
        let mut records: Vec<ContractRecord> = self
            .contracts
            .iter()
            .filter(|entry| entry.chain == chain)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| a.contract_id.cmp(&b.contract_id));
        records
    }

    /// Read-only call through `eth_call`, decoded with the recorded ABI
    pub async fn call_contract_method(
        &self,
        contract_id: &str,
        method: &str,
        args: Vec<Token>,
    ) -> ChainResult<Vec<Token>> {
        let record = self.get_contract(contract_id)?;
        let function = find_method(&record, method)?;
        let data = function.encode_input(&args).map_err(|e| {
            ChainError::Contract(format!(
                "call {}.{}: invalid arguments: {}",
                record.name, method, e
            ))
        })?;

        let call = TxParams {
            from: format!("{:?}", Address::zero()),
            to: Some(record.address.clone()),
            value: U256::zero(),
            data: Bytes::from(data),
            ..Default::default()
        };

        let client = self.chains().connection(&record.chain).await?;
        let output = with_timeout(
            &record.chain,
            "contract call",
            self.chains().config().request_timeout(),
            client.call(&call),
        )
        .await
        .map_err(|e| match e {
            ChainError::Transaction(message) => ChainError::Contract(format!(
                "call {}.{} failed: {}",
                record.name, method, message
            )),
            other => other,
        })?;

        function.decode_output(&output).map_err(|e| {
            ChainError::Contract(format!(
                "call {}.{}: undecodable output: {}",
                record.name, method, e
            ))
        })
    }

    /// State-changing call submitted as a transaction from `tx.from`
    pub async fn send_transaction(
        &self,
        contract_id: &str,
        method: &str,
        args: Vec<Token>,
        tx: TxParams,
        wait_for_receipt: bool,
    ) -> ChainResult<SubmittedTransaction> {
        let record = self.get_contract(contract_id)?;
        let function = find_method(&record, method)?;
        if matches!(
            function.state_mutability,
            StateMutability::View | StateMutability::Pure
        ) {
            return Err(ChainError::Contract(format!(
                "{}.{} is read-only; use a call",
                record.name, method
            )));
        }

        let data = function.encode_input(&args).map_err(|e| {
            ChainError::Contract(format!(
                "transaction {}.{}: invalid arguments: {}",
                record.name, method, e
            ))
        })?;

        let mut tx = tx;
        tx.to = Some(record.address.clone());
        tx.data = Bytes::from(data);

        self.txs
            .submit_transaction(&record.chain, tx, wait_for_receipt)
            .await
    }
}

fn unknown_contract(contract_id: &str) -> ChainError {
    ChainError::Contract(format!("unknown contract {}", contract_id))
}

fn find_method<'a>(record: &'a ContractRecord, method: &str) -> ChainResult<&'a Function> {
    record.abi.function(method).map_err(|_| {
        ChainError::Contract(format!(
            "contract {} has no method {}",
            record.contract_id, method
        ))
    })
}
