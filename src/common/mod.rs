//! Common Infrastructure Module
//!
//! Shared utilities and configuration for the custody tracker.
//!
//! This module contains:
//! - Configuration loading from environment variables
//! - Structured logging setup
//! - Common error types

pub mod config;
pub mod error;
pub mod logging;

// Re-exports for convenience
pub use config::{
    ChainConfig, ConfigError, CustodyConfig, DatabaseConfig, RpcConfig, ServerConfig,
    WorkerConfig,
};
pub use error::{CustodyError, Result};
pub use logging::{
    init_logging, log_cycle_event, log_deposit_event, log_operator_alert, log_system_event,
    log_wallet_event, log_withdrawal_event, log_worker_event, EventCategory, LogEvent, LogLevel,
    LoggingError,
};
