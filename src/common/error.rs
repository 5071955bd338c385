//! Common Error Types for the Custody Tracker
//!
//! Rolls the per-layer errors up into one type for `main` and the CLI.

use thiserror::Error;

use crate::chain::ChainError;
use crate::coordinator::CoordinatorError;
use crate::signer::SignerError;
use crate::storage::StorageError;
use crate::worker::WorkerError;

/// Root error type for the custody tracker
#[derive(Debug, Error)]
pub enum CustodyError {
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] super::config::ConfigError),

    /// Logging errors
    #[error("logging error: {0}")]
    Logging(#[from] super::logging::LoggingError),

    /// Ledger store errors
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Chain client errors
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    /// Signing service errors
    #[error("signer error: {0}")]
    Signer(#[from] SignerError),

    /// Worker errors
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Supervisor errors
    #[error("coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    /// Invalid operator input
    #[error("validation error: {0}")]
    Validation(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CustodyError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        match self {
            CustodyError::Storage(e) => e.is_retryable(),
            CustodyError::Chain(e) => e.is_retryable(),
            CustodyError::Signer(e) => e.is_retryable(),
            CustodyError::Worker(e) => e.is_retryable(),
            CustodyError::Io(_) => true,
            _ => false,
        }
    }

    /// Get error code for API responses and logs
    pub fn error_code(&self) -> &'static str {
        match self {
            CustodyError::Config(_) => "CONFIG_ERROR",
            CustodyError::Logging(_) => "LOGGING_ERROR",
            CustodyError::Storage(StorageError::NotFound(_)) => "NOT_FOUND",
            CustodyError::Storage(StorageError::Duplicate(_)) => "DUPLICATE",
            CustodyError::Storage(_) => "STORAGE_ERROR",
            CustodyError::Chain(_) => "CHAIN_ERROR",
            CustodyError::Signer(_) => "SIGNER_ERROR",
            CustodyError::Worker(_) => "WORKER_ERROR",
            CustodyError::Coordinator(_) => "COORDINATOR_ERROR",
            CustodyError::Validation(_) => "VALIDATION_ERROR",
            CustodyError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias using CustodyError
pub type Result<T> = std::result::Result<T, CustodyError>;
