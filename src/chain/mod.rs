//! Chain Client Module
//!
//! Per-chain adapter consumed by the custody workers:
//! - `ChainClient` trait (height, incoming transfers, receipts, balances, broadcast)
//! - `EvmRpcClient` JSON-RPC implementation
//! - `FakeChainClient` scriptable chain for tests and local development

pub mod evm;
pub mod fake;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use thiserror::Error;

pub use evm::EvmRpcClient;
pub use fake::FakeChainClient;

/// A transfer into a watched address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingTransfer {
    pub tx_hash: String,
    pub from_address: String,
    pub amount: Decimal,
    pub block_number: u64,
}

/// Inclusion status of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxStatus {
    pub block_number: u64,
    /// `height - block_number + 1`, zero if the node is behind the block
    pub confirmations: u64,
    /// `false` for a reverted receipt
    pub succeeded: bool,
}

/// Signed raw transaction ready for broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    /// 0x-prefixed raw transaction bytes
    pub raw_hex: String,
}

impl SignedTransaction {
    /// Keccak-256 of the raw bytes, the hash the network will know it by.
    ///
    /// `None` if `raw_hex` is not valid hex.
    pub fn local_hash(&self) -> Option<String> {
        let raw = self.raw_hex.strip_prefix("0x").unwrap_or(&self.raw_hex);
        let bytes = hex::decode(raw).ok()?;
        Some(format!("0x{}", hex::encode(Keccak256::digest(&bytes))))
    }
}

/// Result of submitting a transaction to the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastOutcome {
    /// Node accepted the transaction; carries its hash
    Accepted(String),
    /// Node refused the transaction; carries the reason
    Rejected(String),
}

/// Chain client errors
///
/// Every variant is a transport-level failure; the caller abandons the cycle
/// and retries later. After a broadcast any of them leaves the outcome
/// unknown.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Request timed out")]
    Timeout,

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    /// The node answered a broadcast without saying whether it took it
    #[error("Broadcast outcome unknown: {0}")]
    UncertainBroadcast(String),
}

impl ChainError {
    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// Confirmations of a transaction included at `block_number` seen from `height`
pub fn confirmations_at(height: u64, block_number: u64) -> u64 {
    if height < block_number {
        0
    } else {
        height - block_number + 1
    }
}

/// Chain access used by the tracker, dispatcher and reconciler
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current chain head
    async fn get_current_height(&self) -> Result<u64, ChainError>;

    /// Transfers into `address` visible to the client
    async fn get_incoming_transactions(
        &self,
        address: &str,
    ) -> Result<Vec<IncomingTransfer>, ChainError>;

    /// Inclusion status, `None` if the transaction is unknown to the node
    async fn get_transaction_status(&self, tx_hash: &str) -> Result<Option<TxStatus>, ChainError>;

    /// Native balance of `address`
    async fn get_balance(&self, address: &str) -> Result<Decimal, ChainError>;

    /// Submit a signed transaction
    async fn broadcast(&self, tx: &SignedTransaction) -> Result<BroadcastOutcome, ChainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmations_at() {
        assert_eq!(confirmations_at(100, 100), 1);
        assert_eq!(confirmations_at(102, 100), 3);
        assert_eq!(confirmations_at(99, 100), 0);
    }

    #[test]
    fn test_chain_errors_are_retryable() {
        assert!(ChainError::Timeout.is_retryable());
        assert!(ChainError::Parse("bad hex".to_string()).is_retryable());
    }

    #[test]
    fn test_local_hash() {
        let empty = SignedTransaction {
            raw_hex: "0x".to_string(),
        };
        assert_eq!(
            empty.local_hash().as_deref(),
            Some("0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470")
        );

        let garbage = SignedTransaction {
            raw_hex: "0xnot-hex".to_string(),
        };
        assert!(garbage.local_hash().is_none());
    }
}
