//! In-Memory Storage Implementation
//!
//! Provides in-memory storage for testing and development.
//! Data is lost when the service restarts.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::traits::{LedgerCounts, LedgerStore, StorageError, StorageResult, WriteOutcome};
use crate::types::{
    Chain, Deposit, DepositStatus, HotWallet, Transaction, Withdrawal, WithdrawalStatus,
};

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    deposits: BTreeMap<i64, Deposit>,
    withdrawals: BTreeMap<i64, Withdrawal>,
    wallets: HashMap<Chain, HotWallet>,
    transactions: Vec<Transaction>,
    withdrawal_write_failures: u32,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn tx_hash_claimed(&self, deposit: &Deposit) -> bool {
        let Some(hash) = deposit.tx_hash.as_deref() else {
            return false;
        };
        self.deposits.values().any(|d| {
            d.id != deposit.id && d.chain == deposit.chain && d.tx_hash.as_deref() == Some(hash)
        })
    }

    fn address_pending(&self, deposit: &Deposit) -> bool {
        self.deposits.values().any(|d| {
            d.id != deposit.id
                && d.chain == deposit.chain
                && d.address == deposit.address
                && d.status == DepositStatus::Pending
        })
    }
}

/// In-memory ledger store
///
/// Thread-safe storage applying the same write guards as the SQLite store.
/// Uses Arc<RwLock<>> for concurrent access.
#[derive(Clone, Default)]
pub struct MemoryLedgerStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryLedgerStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` withdrawal updates with a connection error
    pub async fn fail_next_withdrawal_writes(&self, count: u32) {
        self.state.write().await.withdrawal_write_failures = count;
    }
}

fn oldest_first<T, K: Ord>(mut records: Vec<T>, key: impl Fn(&T) -> K, limit: usize) -> Vec<T> {
    records.sort_by_key(|r| key(r));
    records.truncate(limit);
    records
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn create_deposit(&self, deposit: &Deposit) -> StorageResult<Deposit> {
        deposit.validate().map_err(StorageError::InvalidData)?;
        let mut state = self.state.write().await;

        if deposit.status == DepositStatus::Pending && state.address_pending(deposit) {
            return Err(StorageError::Duplicate(format!(
                "{} deposit address {}",
                deposit.chain, deposit.address
            )));
        }
        if state.tx_hash_claimed(deposit) {
            return Err(StorageError::Duplicate(format!(
                "deposit tx {:?}",
                deposit.tx_hash
            )));
        }

        let mut created = deposit.clone();
        created.id = state.allocate_id();
        state.deposits.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_deposit(&self, id: i64) -> StorageResult<Option<Deposit>> {
        Ok(self.state.read().await.deposits.get(&id).cloned())
    }

    async fn get_deposit_by_address(
        &self,
        chain: Chain,
        address: &str,
    ) -> StorageResult<Option<Deposit>> {
        let state = self.state.read().await;
        Ok(state
            .deposits
            .values()
            .filter(|d| d.chain == chain && d.address == address)
            .max_by_key(|d| (d.created_at, d.id))
            .cloned())
    }

    async fn get_deposit_by_tx_hash(
        &self,
        chain: Chain,
        tx_hash: &str,
    ) -> StorageResult<Option<Deposit>> {
        let state = self.state.read().await;
        Ok(state
            .deposits
            .values()
            .find(|d| d.chain == chain && d.tx_hash.as_deref() == Some(tx_hash))
            .cloned())
    }

    async fn get_pending_deposits(&self, chain: Chain, limit: usize) -> StorageResult<Vec<Deposit>> {
        let state = self.state.read().await;
        let pending = state
            .deposits
            .values()
            .filter(|d| d.chain == chain && d.status == DepositStatus::Pending)
            .cloned()
            .collect();
        Ok(oldest_first(pending, |d: &Deposit| (d.created_at, d.id), limit))
    }

    async fn update_deposit(&self, deposit: &Deposit) -> StorageResult<WriteOutcome> {
        deposit.validate().map_err(StorageError::InvalidData)?;
        let mut state = self.state.write().await;

        let applies = state
            .deposits
            .get(&deposit.id)
            .map(|stored| deposit.supersedes(stored))
            .unwrap_or(false);
        if !applies {
            return Ok(WriteOutcome::NotFound);
        }
        if state.tx_hash_claimed(deposit) {
            return Err(StorageError::Duplicate(format!(
                "deposit tx {:?}",
                deposit.tx_hash
            )));
        }

        if let Some(stored) = state.deposits.get_mut(&deposit.id) {
            // identity and intent fields stay as created
            stored.received_amount = deposit.received_amount;
            stored.tx_hash = deposit.tx_hash.clone();
            stored.block_number = deposit.block_number;
            stored.confirmations = deposit.confirmations;
            stored.status = deposit.status;
            stored.confirmed_at = deposit.confirmed_at;
        }
        Ok(WriteOutcome::Applied)
    }

    async fn create_withdrawal(&self, withdrawal: &Withdrawal) -> StorageResult<Withdrawal> {
        withdrawal.validate().map_err(StorageError::InvalidData)?;
        let mut state = self.state.write().await;

        let mut created = withdrawal.clone();
        created.id = state.allocate_id();
        state.withdrawals.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_withdrawal(&self, id: i64) -> StorageResult<Option<Withdrawal>> {
        Ok(self.state.read().await.withdrawals.get(&id).cloned())
    }

    async fn get_pending_withdrawals(
        &self,
        chain: Chain,
        limit: usize,
    ) -> StorageResult<Vec<Withdrawal>> {
        self.get_withdrawals_by_status(chain, WithdrawalStatus::Pending, limit)
            .await
    }

    async fn get_withdrawals_by_status(
        &self,
        chain: Chain,
        status: WithdrawalStatus,
        limit: usize,
    ) -> StorageResult<Vec<Withdrawal>> {
        let state = self.state.read().await;
        let matching = state
            .withdrawals
            .values()
            .filter(|w| w.chain == chain && w.status == status)
            .cloned()
            .collect();
        Ok(oldest_first(
            matching,
            |w: &Withdrawal| (w.created_at, w.id),
            limit,
        ))
    }

    async fn update_withdrawal(&self, withdrawal: &Withdrawal) -> StorageResult<WriteOutcome> {
        withdrawal.validate().map_err(StorageError::InvalidData)?;
        let mut state = self.state.write().await;
        if state.withdrawal_write_failures > 0 {
            state.withdrawal_write_failures -= 1;
            return Err(StorageError::Connection("database is locked".to_string()));
        }

        match state.withdrawals.get_mut(&withdrawal.id) {
            Some(stored) if withdrawal.supersedes(stored) => {
                stored.tx_hash = withdrawal.tx_hash.clone();
                stored.status = withdrawal.status;
                stored.block_number = withdrawal.block_number;
                stored.confirmations = withdrawal.confirmations;
                stored.sent_at = withdrawal.sent_at;
                stored.confirmed_at = withdrawal.confirmed_at;
                stored.error = withdrawal.error.clone();
                Ok(WriteOutcome::Applied)
            }
            _ => Ok(WriteOutcome::NotFound),
        }
    }

    async fn get_hot_wallet(&self, chain: Chain) -> StorageResult<Option<HotWallet>> {
        Ok(self.state.read().await.wallets.get(&chain).cloned())
    }

    async fn upsert_hot_wallet(&self, wallet: &HotWallet) -> StorageResult<HotWallet> {
        let mut state = self.state.write().await;

        let id = match state.wallets.get(&wallet.chain) {
            Some(existing) => existing.id,
            None => state.allocate_id(),
        };
        let mut stored = wallet.clone();
        stored.id = id;
        state.wallets.insert(wallet.chain, stored.clone());
        Ok(stored)
    }

    async fn update_hot_wallet_balance(
        &self,
        chain: Chain,
        balance: Decimal,
    ) -> StorageResult<WriteOutcome> {
        let mut state = self.state.write().await;

        match state.wallets.get_mut(&chain) {
            Some(wallet) => {
                wallet.balance = balance;
                wallet.last_checked_at = Some(Utc::now());
                Ok(WriteOutcome::Applied)
            }
            None => Ok(WriteOutcome::NotFound),
        }
    }

    async fn record_transaction(&self, tx: &Transaction) -> StorageResult<()> {
        let mut state = self.state.write().await;

        if let Some(existing) = state
            .transactions
            .iter_mut()
            .find(|t| t.chain == tx.chain && t.tx_hash == tx.tx_hash)
        {
            existing.block_number = tx.block_number;
            existing.status = tx.status;
            existing.confirmations = tx.confirmations;
            return Ok(());
        }

        let mut stored = tx.clone();
        stored.id = state.allocate_id();
        state.transactions.push(stored);
        Ok(())
    }

    async fn get_transactions(&self, chain: Chain, limit: usize) -> StorageResult<Vec<Transaction>> {
        let state = self.state.read().await;
        let mut txs: Vec<_> = state
            .transactions
            .iter()
            .filter(|t| t.chain == chain)
            .cloned()
            .collect();
        txs.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        txs.truncate(limit);
        Ok(txs)
    }

    async fn count_by_status(&self, chain: Chain) -> StorageResult<LedgerCounts> {
        let state = self.state.read().await;
        let mut counts = LedgerCounts::default();

        for d in state.deposits.values().filter(|d| d.chain == chain) {
            *counts.deposits.entry(d.status.to_string()).or_default() += 1;
        }
        for w in state.withdrawals.values().filter(|w| w.chain == chain) {
            *counts.withdrawals.entry(w.status.to_string()).or_default() += 1;
        }

        Ok(counts)
    }
}
