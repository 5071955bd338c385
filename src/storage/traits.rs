//! Storage Trait Definitions
//!
//! The ledger store contract consumed by the custody workers.
//! Implementations can use SQLite (production) or in-memory (testing).
//!
//! Every update is a single conditional write: it applies only if the stored
//! row is still in a state the new record may legally follow. A write that
//! matches no row reports [`WriteOutcome::NotFound`], which callers treat as
//! "already handled", distinct from a connectivity failure.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::types::{Chain, Deposit, HotWallet, Transaction, Withdrawal, WithdrawalStatus};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

impl StorageError {
    /// Connectivity and engine failures are worth retrying next cycle
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Database(_) | StorageError::Connection(_))
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Outcome of a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Exactly one row was updated
    Applied,
    /// No row matched the identity and state guard
    NotFound,
}

impl WriteOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied)
    }
}

/// Per-chain record counts keyed by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerCounts {
    pub deposits: BTreeMap<String, u64>,
    pub withdrawals: BTreeMap<String, u64>,
}

/// Ledger store interface
///
/// Implementations:
/// - `SqliteLedgerStore` - Production storage with SQLite
/// - `MemoryLedgerStore` - In-memory storage for testing
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a new deposit; returns it with its assigned id.
    ///
    /// Fails with `Duplicate` if the address already has a pending deposit
    /// on the chain.
    async fn create_deposit(&self, deposit: &Deposit) -> StorageResult<Deposit>;

    /// Get a deposit by id
    async fn get_deposit(&self, id: i64) -> StorageResult<Option<Deposit>>;

    /// Most recent deposit for a watched address
    async fn get_deposit_by_address(
        &self,
        chain: Chain,
        address: &str,
    ) -> StorageResult<Option<Deposit>>;

    /// Deposit that already claimed a transaction hash
    async fn get_deposit_by_tx_hash(
        &self,
        chain: Chain,
        tx_hash: &str,
    ) -> StorageResult<Option<Deposit>>;

    /// Oldest pending deposits for a chain
    async fn get_pending_deposits(&self, chain: Chain, limit: usize) -> StorageResult<Vec<Deposit>>;

    /// Conditionally update a deposit
    async fn update_deposit(&self, deposit: &Deposit) -> StorageResult<WriteOutcome>;

    /// Insert a new withdrawal; returns it with its assigned id
    async fn create_withdrawal(&self, withdrawal: &Withdrawal) -> StorageResult<Withdrawal>;

    /// Get a withdrawal by id
    async fn get_withdrawal(&self, id: i64) -> StorageResult<Option<Withdrawal>>;

    /// Oldest pending withdrawals for a chain, in creation order
    async fn get_pending_withdrawals(
        &self,
        chain: Chain,
        limit: usize,
    ) -> StorageResult<Vec<Withdrawal>>;

    /// Withdrawals with a given status, in creation order
    async fn get_withdrawals_by_status(
        &self,
        chain: Chain,
        status: WithdrawalStatus,
        limit: usize,
    ) -> StorageResult<Vec<Withdrawal>>;

    /// Conditionally update a withdrawal
    async fn update_withdrawal(&self, withdrawal: &Withdrawal) -> StorageResult<WriteOutcome>;

    /// Hot wallet for a chain
    async fn get_hot_wallet(&self, chain: Chain) -> StorageResult<Option<HotWallet>>;

    /// Provision or replace the hot wallet for a chain
    async fn upsert_hot_wallet(&self, wallet: &HotWallet) -> StorageResult<HotWallet>;

    /// Refresh the cached balance and its timestamp
    async fn update_hot_wallet_balance(
        &self,
        chain: Chain,
        balance: Decimal,
    ) -> StorageResult<WriteOutcome>;

    /// Insert or refresh a row of the transaction read model
    async fn record_transaction(&self, tx: &Transaction) -> StorageResult<()>;

    /// Most recent transactions for a chain
    async fn get_transactions(&self, chain: Chain, limit: usize) -> StorageResult<Vec<Transaction>>;

    /// Record counts by status
    async fn count_by_status(&self, chain: Chain) -> StorageResult<LedgerCounts>;
}
