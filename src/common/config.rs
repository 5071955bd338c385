//! Environment-based Configuration for the Custody Tracker
//!
//! Loaded once at startup into an immutable struct that is passed by
//! reference into every constructor. A `.env` file is honoured (loaded by
//! `main` before this runs).
//!
//! # Environment Variables
//!
//! ## Chains (at least one required)
//! - `<CHAIN>_RPC_URL` - JSON-RPC endpoint; its presence enables the chain
//!   (`ETHEREUM`, `POLYGON`, `BSC`, `ARBITRUM`, `OPTIMISM`)
//! - `<CHAIN>_CHAIN_ID` - Expected EVM chain id (default: canonical id)
//! - `<CHAIN>_MIN_CONFIRMATIONS` - Confirmation threshold (default: 1)
//!
//! ## Server / Database
//! - `SERVER_HOST` (default "0.0.0.0"), `SERVER_PORT` (default 8080)
//! - `DATABASE_PATH` (default "data/custody.db"), `DATABASE_POOL_SIZE` (default 16)
//!
//! ## Workers
//! - `TRACKER_INTERVAL_SECS` (15), `DISPATCHER_INTERVAL_SECS` (10),
//!   `RECONCILER_INTERVAL_SECS` (60)
//! - `DEPOSIT_PAGE_SIZE` (100), `WITHDRAWAL_BATCH_SIZE` (20)
//! - `DEPOSIT_EXPIRY_SECS` (86400), `SENT_NOT_FOUND_CYCLES` (20)
//! - `RETRY_BACKOFF_MS` (500), `RETRY_BACKOFF_MAX_MS` (30000)
//! - `MAX_WORKER_RESTARTS` (5), `RESTART_BACKOFF_MS` (1000), `RESTART_BACKOFF_MAX_MS` (60000)
//!
//! ## Chain access and signing
//! - `RPC_TIMEOUT_SECS` (10), `INCOMING_SCAN_BLOCKS` (64)
//! - `SIGNER_URL` - External signing service (required by `run`)
//!
//! ## Logging
//! - `LOG_LEVEL` (info), `LOG_JSON` (false)

use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use super::logging::LogLevel;
use crate::types::Chain;

/// Configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("no chains configured: set at least one <CHAIN>_RPC_URL")]
    NoChainsConfigured,

    #[error("chain not configured: {0}")]
    ChainNotConfigured(Chain),
}

/// HTTP status server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Ledger database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub path: String,
    pub pool_size: u32,
}

/// One configured chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    pub chain: Chain,
    pub rpc_url: String,
    pub chain_id: u64,
    pub min_confirmations: u64,
}

/// Worker tunables shared by every chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub tracker_interval: Duration,
    pub dispatcher_interval: Duration,
    pub reconciler_interval: Duration,
    pub deposit_page_size: usize,
    pub withdrawal_batch_size: usize,
    pub deposit_expiry: Duration,
    /// Consecutive polls a sent transaction may be missing before an alert
    pub sent_not_found_cycles: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub max_restarts: u32,
    pub restart_backoff_base_ms: u64,
    pub restart_backoff_max_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tracker_interval: Duration::from_secs(15),
            dispatcher_interval: Duration::from_secs(10),
            reconciler_interval: Duration::from_secs(60),
            deposit_page_size: 100,
            withdrawal_batch_size: 20,
            deposit_expiry: Duration::from_secs(24 * 60 * 60),
            sent_not_found_cycles: 20,
            retry_backoff_base_ms: 500,
            retry_backoff_max_ms: 30_000,
            max_restarts: 5,
            restart_backoff_base_ms: 1_000,
            restart_backoff_max_ms: 60_000,
        }
    }
}

/// Chain client transport settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcConfig {
    pub timeout: Duration,
    pub incoming_scan_blocks: u64,
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct CustodyConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub chains: BTreeMap<Chain, ChainConfig>,
    pub workers: WorkerConfig,
    pub rpc: RpcConfig,
    pub signer_url: Option<String>,
    pub log_level: LogLevel,
    pub log_json: bool,
}

impl CustodyConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let server = ServerConfig {
            host: get("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(&get, "SERVER_PORT", 8080)?,
        };

        let database = DatabaseConfig {
            path: get("DATABASE_PATH").unwrap_or_else(|| "data/custody.db".to_string()),
            pool_size: positive(&get, "DATABASE_POOL_SIZE", 16)?,
        };

        let mut chains = BTreeMap::new();
        for chain in Chain::ALL {
            let prefix = chain.env_prefix();
            let Some(rpc_url) = get(&format!("{}_RPC_URL", prefix)) else {
                continue;
            };
            if !rpc_url.starts_with("http://") && !rpc_url.starts_with("https://") {
                return Err(ConfigError::InvalidValue(
                    format!("{}_RPC_URL", prefix),
                    format!("expected an http(s) URL, got {}", rpc_url),
                ));
            }

            chains.insert(
                chain,
                ChainConfig {
                    chain,
                    rpc_url,
                    chain_id: parse_or(
                        &get,
                        &format!("{}_CHAIN_ID", prefix),
                        chain.default_chain_id(),
                    )?,
                    min_confirmations: parse_or(
                        &get,
                        &format!("{}_MIN_CONFIRMATIONS", prefix),
                        1,
                    )?,
                },
            );
        }
        if chains.is_empty() {
            return Err(ConfigError::NoChainsConfigured);
        }

        let defaults = WorkerConfig::default();
        let workers = WorkerConfig {
            tracker_interval: positive_secs(&get, "TRACKER_INTERVAL_SECS", defaults.tracker_interval)?,
            dispatcher_interval: positive_secs(
                &get,
                "DISPATCHER_INTERVAL_SECS",
                defaults.dispatcher_interval,
            )?,
            reconciler_interval: positive_secs(
                &get,
                "RECONCILER_INTERVAL_SECS",
                defaults.reconciler_interval,
            )?,
            deposit_page_size: positive(&get, "DEPOSIT_PAGE_SIZE", defaults.deposit_page_size)?,
            withdrawal_batch_size: positive(
                &get,
                "WITHDRAWAL_BATCH_SIZE",
                defaults.withdrawal_batch_size,
            )?,
            deposit_expiry: positive_secs(&get, "DEPOSIT_EXPIRY_SECS", defaults.deposit_expiry)?,
            sent_not_found_cycles: positive(
                &get,
                "SENT_NOT_FOUND_CYCLES",
                defaults.sent_not_found_cycles,
            )?,
            retry_backoff_base_ms: positive(&get, "RETRY_BACKOFF_MS", defaults.retry_backoff_base_ms)?,
            retry_backoff_max_ms: positive(
                &get,
                "RETRY_BACKOFF_MAX_MS",
                defaults.retry_backoff_max_ms,
            )?,
            max_restarts: parse_or(&get, "MAX_WORKER_RESTARTS", defaults.max_restarts)?,
            restart_backoff_base_ms: positive(
                &get,
                "RESTART_BACKOFF_MS",
                defaults.restart_backoff_base_ms,
            )?,
            restart_backoff_max_ms: positive(
                &get,
                "RESTART_BACKOFF_MAX_MS",
                defaults.restart_backoff_max_ms,
            )?,
        };

        let rpc = RpcConfig {
            timeout: positive_secs(&get, "RPC_TIMEOUT_SECS", Duration::from_secs(10))?,
            incoming_scan_blocks: positive(&get, "INCOMING_SCAN_BLOCKS", 64)?,
        };

        let log_level = match get("LOG_LEVEL") {
            Some(raw) => raw
                .parse()
                .map_err(|e: String| ConfigError::InvalidValue("LOG_LEVEL".to_string(), e))?,
            None => LogLevel::Info,
        };

        let log_json = match get("LOG_JSON") {
            Some(raw) => parse_bool(&raw)
                .ok_or_else(|| ConfigError::InvalidValue("LOG_JSON".to_string(), raw))?,
            None => false,
        };

        Ok(Self {
            server,
            database,
            chains,
            workers,
            rpc,
            signer_url: get("SIGNER_URL"),
            log_level,
            log_json,
        })
    }

    /// Configuration of a chain the operator asked for
    pub fn chain(&self, chain: Chain) -> Result<&ChainConfig, ConfigError> {
        self.chains
            .get(&chain)
            .ok_or(ConfigError::ChainNotConfigured(chain))
    }

    /// Signing service endpoint, required to dispatch withdrawals
    pub fn require_signer_url(&self) -> Result<&str, ConfigError> {
        self.signer_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("SIGNER_URL".to_string()))
    }

    /// Log configuration summary (no secrets are held here)
    pub fn log_summary(&self) {
        tracing::info!(
            bind = %self.server.bind_addr(),
            database = %self.database.path,
            pool_size = self.database.pool_size,
            chains = ?self.chains.keys().map(|c| c.as_str()).collect::<Vec<_>>(),
            "Custody tracker configuration"
        );
        for cfg in self.chains.values() {
            tracing::info!(
                chain = %cfg.chain,
                chain_id = cfg.chain_id,
                min_confirmations = cfg.min_confirmations,
                "Chain configured"
            );
        }
    }
}

fn parse_or<T, G>(get: &G, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), format!("{}: {}", raw, e))),
        None => Ok(default),
    }
}

fn positive<T, G>(get: &G, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    let value = parse_or(get, name, default)?;
    if value <= T::default() {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            "must be greater than zero".to_string(),
        ));
    }
    Ok(value)
}

fn positive_secs<G>(get: &G, name: &str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    positive(get, name, default.as_secs()).map(Duration::from_secs)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
