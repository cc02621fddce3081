//! Configuration management for chainweave
//!
//! Loads configuration from TOML files with environment variable substitution.
//! Every timeout, limiter size and retry constant the managers use lives here.

use crate::security::Role;

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub manager: ManagerConfig,
    pub transactions: TransactionConfig,
    pub sync: SyncConfig,
    pub coordinator: CoordinatorConfig,
    pub contracts: ContractConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
}

/// A declared network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub protocol: String,
    #[serde(default)]
    pub role: Option<Role>,
    /// Extra endpoints pooled alongside `rpc_url`
    #[serde(default)]
    pub fallback_urls: Vec<String>,
}

impl ChainConfig {
    pub fn new(rpc_url: impl Into<String>, chain_id: u64, protocol: impl Into<String>) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            chain_id,
            protocol: protocol.into(),
            role: None,
            fallback_urls: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    /// Primary endpoint first, then fallbacks
    pub fn endpoints(&self) -> Vec<String> {
        std::iter::once(self.rpc_url.clone())
            .chain(self.fallback_urls.iter().cloned())
            .collect()
    }
}

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = (self.multiplier.max(1) as u64).saturating_pow(attempt - 1);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Simultaneous in-flight dial attempts
    pub max_concurrent_connections: usize,
    pub connect_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub health_check_timeout_ms: u64,
    /// Consecutive failed health checks before a chain is marked `error`
    pub unhealthy_threshold: u32,
    pub liveness_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub submit_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_connections: 10,
            connect_timeout_ms: 10_000,
            health_check_interval_ms: 5_000,
            health_check_timeout_ms: 2_000,
            unhealthy_threshold: 3,
            liveness_timeout_ms: 2_000,
            request_timeout_ms: 10_000,
            submit_timeout_ms: 30_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl ManagerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub receipt_timeout_ms: u64,
    pub receipt_poll_interval_ms: u64,
    /// Concurrent submissions inside one parallel batch
    pub max_concurrent_submissions: usize,
    /// Pending records older than this are purged
    pub pending_ttl_secs: u64,
    /// Period of the background purge of terminal and expired records
    pub purge_interval_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            receipt_timeout_ms: 120_000,
            receipt_poll_interval_ms: 1_000,
            max_concurrent_submissions: 10,
            pending_ttl_secs: 3_600,
            purge_interval_ms: 300_000,
        }
    }
}

impl TransactionConfig {
    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_millis(self.receipt_timeout_ms)
    }

    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_interval_ms)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub default_batch_size: u64,
    /// Blocks behind head to start from when no start block is given
    pub default_lookback: u64,
    pub error_backoff_ms: u64,
    /// Overrides the adapter block time for loop pacing
    pub poll_interval_ms: Option<u64>,
    /// Processed-block records kept per chain
    pub processed_window: usize,
    /// Chains the daemon starts syncing on boot
    pub autostart: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 100,
            default_lookback: 1_000,
            error_backoff_ms: 5_000,
            poll_interval_ms: None,
            processed_window: 10_000,
            autostart: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub required_confirmations: u64,
    pub poll_interval_ms: u64,
    pub confirmation_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            required_confirmations: 12,
            poll_interval_ms: 15_000,
            confirmation_timeout_ms: 3_600_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContractConfig {
    /// Attempts per log page before the event stream gives up
    pub max_batch_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for ContractConfig {
    fn default() -> Self {
        Self {
            max_batch_retries: 3,
            retry_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9102,
        }
    }
}

impl Settings {
    /// Load settings from the file named by `CHAINWEAVE_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("CHAINWEAVE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml(&config_str)
    }

    /// Parse settings from TOML text, substituting `${VAR}` references first
    pub fn from_toml(config_str: &str) -> Result<Self> {
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate cross-section settings; per-chain checks happen on `configure`
    fn validate(&self) -> Result<()> {
        if self.manager.max_concurrent_connections == 0 {
            anyhow::bail!("manager.max_concurrent_connections must be positive");
        }
        if self.transactions.max_concurrent_submissions == 0 {
            anyhow::bail!("transactions.max_concurrent_submissions must be positive");
        }
        if self.manager.retry.max_attempts == 0 {
            anyhow::bail!("manager.retry.max_attempts must be positive");
        }

        for name in &self.sync.autostart {
            if !self.chains.contains_key(name) {
                anyhow::bail!("sync.autostart names unknown chain {}", name);
            }
        }

        Ok(())
    }
}

lazy_static! {
    static ref ENV_VAR: regex::Regex =
        regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}
