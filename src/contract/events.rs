//! Contract event monitoring
//!
//! `monitor_events` returns a finite stream over a fixed block range. Logs are
//! fetched lazily, one page of `event_batch_size` blocks at a time, and each
//! page is retried a bounded number of times. The stream ends after its last
//! page or after the first page that keeps failing; restarting from the last
//! yielded block picks up where it stopped.

use super::{unknown_contract, ContractManager};
use crate::chain::{with_timeout, ChainManager};
use crate::error::{ChainError, ChainResult};
use crate::metrics;
use crate::types::{BlockId, LogEntry, LogFilter};

use ethers::abi::{Event, RawLog, Token};
use ethers::types::H256;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Normalized, decoded contract event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContractEvent {
    pub contract_id: String,
    pub chain: String,
    pub name: String,
    #[serde(skip)]
    pub args: BTreeMap<String, Token>,
    pub block_number: u64,
    pub tx_hash: H256,
    pub log_index: u64,
    /// Block timestamp, `None` when the block could not be fetched
    pub timestamp: Option<u64>,
}

struct EventCursor {
    chains: Arc<ChainManager>,
    contract_id: String,
    chain: String,
    address: String,
    event: Event,
    next_from: u64,
    to: u64,
    page_size: u64,
    attempts: u32,
    retry_delay: Duration,
    buffer: VecDeque<ContractEvent>,
    finished: bool,
}

impl EventCursor {
    async fn next_event(mut self) -> Option<(ChainResult<ContractEvent>, Self)> {
        loop {
            if let Some(event) = self.buffer.pop_front() {
                return Some((Ok(event), self));
            }
            if self.finished || self.next_from > self.to {
                return None;
            }

            let from = self.next_from;
            let to = from.saturating_add(self.page_size - 1).min(self.to);
            match self.fetch_page(from, to).await {
                Ok(events) => {
                    self.buffer.extend(events);
                    self.next_from = to + 1;
                }
                Err(e) => {
                    self.finished = true;
                    return Some((Err(e), self));
                }
            }
        }
    }

    async fn fetch_page(&self, from: u64, to: u64) -> ChainResult<Vec<ContractEvent>> {
        let filter = LogFilter {
            address: self.address.clone(),
            topics: vec![self.event.signature()],
            from_block: from,
            to_block: to,
        };

        let mut attempt = 0;
        let logs = loop {
            attempt += 1;
            match self.query_logs(&filter).await {
                Ok(logs) => break logs,
                Err(e) if attempt < self.attempts => {
                    warn!(
                        "Log query {}..{} on chain {} failed (attempt {}/{}): {}",
                        from, to, self.chain, attempt, self.attempts, e
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        };

        debug!(
            "Chain {}: {} {} logs in blocks {}..{}",
            self.chain,
            logs.len(),
            self.event.name,
            from,
            to
        );
        self.decode_page(logs).await
    }

    async fn query_logs(&self, filter: &LogFilter) -> ChainResult<Vec<LogEntry>> {
        let client = self.chains.connection(&self.chain).await?;
        with_timeout(
            &self.chain,
            "log query",
            self.chains.config().request_timeout(),
            client.logs(filter),
        )
        .await
    }

    async fn decode_page(&self, mut logs: Vec<LogEntry>) -> ChainResult<Vec<ContractEvent>> {
        logs.sort_by_key(|log| (log.block_number, log.log_index));

        let mut timestamps: HashMap<u64, Option<u64>> = HashMap::new();
        let mut events = Vec::with_capacity(logs.len());

        for log in logs {
            let decoded = self.event.parse_log(RawLog {
                topics: log.topics.clone(),
                data: log.data.to_vec(),
            });
            let decoded = match decoded {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(
                        "Skipping undecodable {} log in block {}: {}",
                        self.event.name, log.block_number, e
                    );
                    continue;
                }
            };

            let timestamp = match timestamps.get(&log.block_number) {
                Some(timestamp) => *timestamp,
                None => {
                    let timestamp = self.block_timestamp(log.block_number).await;
                    timestamps.insert(log.block_number, timestamp);
                    timestamp
                }
            };

            metrics::record_event(&self.chain, &self.event.name);
            events.push(ContractEvent {
                contract_id: self.contract_id.clone(),
                chain: self.chain.clone(),
                name: self.event.name.clone(),
                args: decoded
                    .params
                    .into_iter()
                    .map(|param| (param.name, param.value))
                    .collect(),
                block_number: log.block_number,
                tx_hash: log.tx_hash,
                log_index: log.log_index,
                timestamp,
            });
        }

        Ok(events)
    }

    async fn block_timestamp(&self, number: u64) -> Option<u64> {
        let client = self.chains.connection(&self.chain).await.ok()?;
        let block = with_timeout(
            &self.chain,
            "block fetch",
            self.chains.config().request_timeout(),
            client.get_block(BlockId::Number(number)),
        )
        .await;

        match block {
            Ok(block) => block.map(|b| b.timestamp),
            Err(e) => {
                warn!("No timestamp for block {} on chain {}: {}", number, self.chain, e);
                None
            }
        }
    }
}

impl ContractManager {
    /// Lazily stream decoded `event_name` events of a contract
    ///
    /// The range is `from_block..=to_block`; without `to_block` it ends at the
    /// head observed when this is called.
    pub async fn monitor_events(
        &self,
        contract_id: &str,
        event_name: &str,
        from_block: u64,
        to_block: Option<u64>,
    ) -> ChainResult<BoxStream<'static, ChainResult<ContractEvent>>> {
        let record = self
            .contracts
            .get(contract_id)
            .map(|r| r.clone())
            .ok_or_else(|| unknown_contract(contract_id))?;
        let event = record.abi.event(event_name).cloned().map_err(|_| {
            ChainError::Contract(format!(
                "contract {} has no event {}",
                contract_id, event_name
            ))
        })?;

        let chains = self.chains().clone();
        let adapter = chains.adapter_for(&record.chain).await?;

        let to = match to_block {
            Some(to) => to,
            None => {
                let client = chains.connection(&record.chain).await?;
                with_timeout(
                    &record.chain,
                    "block number",
                    chains.config().request_timeout(),
                    client.block_number(),
                )
                .await?
            }
        };
        if from_block > to {
            return Err(ChainError::Contract(format!(
                "empty block range {}..{}",
                from_block, to
            )));
        }

        let cursor = EventCursor {
            chains,
            contract_id: record.contract_id,
            chain: record.chain,
            address: record.address,
            event,
            next_from: from_block,
            to,
            page_size: adapter.policy().event_batch_size.max(1),
            attempts: self.config.max_batch_retries.max(1),
            retry_delay: Duration::from_millis(self.config.retry_delay_ms),
            buffer: VecDeque::new(),
            finished: false,
        };

        Ok(stream::unfold(cursor, EventCursor::next_event).boxed())
    }
}
