//! Hot Wallet Reconciler
//!
//! Refreshes the cached hot-wallet balance of one chain from the chain
//! itself. The dispatcher funds withdrawals from this cached value.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::fmt;
use std::sync::Arc;

use crate::chain::ChainClient;
use crate::common::logging::log_wallet_event;
use crate::storage::{LedgerStore, WriteOutcome};
use crate::types::{format_amount, Chain};
use crate::worker::{CycleReport, Worker, WorkerError, WorkerId, WorkerRole};

/// Result of a reconciler cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileCycle {
    pub refreshed: bool,
    pub missing_wallet: bool,
    pub balance: Option<Decimal>,
}

impl ReconcileCycle {
    pub fn has_activity(&self) -> bool {
        self.refreshed || self.missing_wallet
    }
}

impl fmt::Display for ReconcileCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.missing_wallet, self.balance) {
            (true, _) => write!(f, "reconciler: no hot wallet configured"),
            (false, Some(balance)) => {
                write!(f, "reconciler: balance={}", format_amount(balance))
            }
            (false, None) => write!(f, "reconciler: not refreshed"),
        }
    }
}

pub struct HotWalletReconciler {
    chain: Chain,
    store: Arc<dyn LedgerStore>,
    client: Arc<dyn ChainClient>,
}

impl HotWalletReconciler {
    pub fn new(chain: Chain, store: Arc<dyn LedgerStore>, client: Arc<dyn ChainClient>) -> Self {
        Self {
            chain,
            store,
            client,
        }
    }

    /// Read the on-chain balance and cache it. Last write wins.
    pub async fn process_cycle(&self) -> Result<ReconcileCycle, WorkerError> {
        let Some(wallet) = self.store.get_hot_wallet(self.chain).await? else {
            tracing::warn!(chain = %self.chain, "No hot wallet configured, skipping balance refresh");
            return Ok(ReconcileCycle {
                missing_wallet: true,
                ..Default::default()
            });
        };

        let balance = self.client.get_balance(&wallet.address).await?;

        match self
            .store
            .update_hot_wallet_balance(self.chain, balance)
            .await?
        {
            WriteOutcome::Applied => {
                if balance != wallet.balance {
                    let previous = wallet.balance;
                    let mut refreshed = wallet;
                    refreshed.balance = balance;
                    log_wallet_event("hot_wallet_balance_changed", &refreshed, previous);
                }
                Ok(ReconcileCycle {
                    refreshed: true,
                    missing_wallet: false,
                    balance: Some(balance),
                })
            }
            WriteOutcome::NotFound => {
                // Removed between the read and the write
                tracing::warn!(chain = %self.chain, "Hot wallet vanished during refresh");
                Ok(ReconcileCycle {
                    missing_wallet: true,
                    ..Default::default()
                })
            }
        }
    }
}

#[async_trait]
impl Worker for HotWalletReconciler {
    fn id(&self) -> WorkerId {
        WorkerId::new(self.chain, WorkerRole::Reconciler)
    }

    async fn run_cycle(&mut self) -> Result<CycleReport, WorkerError> {
        self.process_cycle().await.map(CycleReport::Reconciler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainError, FakeChainClient, MockChainClient};
    use crate::storage::MemoryLedgerStore;
    use crate::types::HotWallet;

    #[tokio::test]
    async fn test_refreshes_cached_balance() {
        let store = MemoryLedgerStore::new();
        store
            .upsert_hot_wallet(&HotWallet::new(
                Chain::Bsc,
                "0xhot".to_string(),
                "kms:key".to_string(),
            ))
            .await
            .unwrap();
        let chain = FakeChainClient::new();
        chain.set_balance("0xhot", "12.5".parse().unwrap()).await;

        let reconciler =
            HotWalletReconciler::new(Chain::Bsc, Arc::new(store.clone()), Arc::new(chain));
        let report = reconciler.process_cycle().await.unwrap();

        assert!(report.refreshed);
        let wallet = store.get_hot_wallet(Chain::Bsc).await.unwrap().unwrap();
        assert_eq!(wallet.balance, "12.5".parse::<Decimal>().unwrap());
        assert!(wallet.last_checked_at.is_some());
    }

    #[tokio::test]
    async fn test_missing_wallet_writes_nothing() {
        let store = MemoryLedgerStore::new();
        let mut client = MockChainClient::new();
        client.expect_get_balance().never();

        let reconciler = HotWalletReconciler::new(Chain::Bsc, Arc::new(store), Arc::new(client));
        let report = reconciler.process_cycle().await.unwrap();

        assert!(report.missing_wallet);
        assert!(!report.refreshed);
    }

    #[tokio::test]
    async fn test_chain_failure_keeps_previous_balance() {
        let store = MemoryLedgerStore::new();
        let mut wallet = HotWallet::new(Chain::Bsc, "0xhot".to_string(), "kms:key".to_string());
        wallet.balance = Decimal::ONE;
        store.upsert_hot_wallet(&wallet).await.unwrap();

        let mut client = MockChainClient::new();
        client
            .expect_get_balance()
            .times(1)
            .returning(|_| Err(ChainError::Timeout));

        let reconciler =
            HotWalletReconciler::new(Chain::Bsc, Arc::new(store.clone()), Arc::new(client));
        let err = reconciler.process_cycle().await.unwrap_err();

        assert!(err.is_retryable());
        let stored = store.get_hot_wallet(Chain::Bsc).await.unwrap().unwrap();
        assert_eq!(stored.balance, Decimal::ONE);
        assert!(stored.last_checked_at.is_none());
    }
}
