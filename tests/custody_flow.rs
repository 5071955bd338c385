//! End-to-end flows over the SQLite ledger and a scripted chain.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

use custody_tracker::chain::{FakeChainClient, IncomingTransfer, SignedTransaction};
use custody_tracker::common::{ChainConfig, WorkerConfig};
use custody_tracker::coordinator::{chain_workers, Coordinator, RestartPolicy, WorkerRegistry};
use custody_tracker::deposit_tracker::{ConfirmationTracker, TrackerSettings};
use custody_tracker::dispatcher::{DispatcherSettings, WithdrawalDispatcher};
use custody_tracker::operator;
use custody_tracker::reconciler::HotWalletReconciler;
use custody_tracker::signer::{SignerError, WithdrawalSigner};
use custody_tracker::storage::{LedgerStore, SqliteLedgerStore};
use custody_tracker::types::{
    Chain, DepositStatus, HotWallet, TransactionKind, Withdrawal, WithdrawalStatus,
};
use custody_tracker::worker::BackoffPolicy;

const WATCHED: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const HOT: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
const DEST: &str = "0xcccccccccccccccccccccccccccccccccccccccc";

struct EchoSigner;

#[async_trait]
impl WithdrawalSigner for EchoSigner {
    async fn sign(
        &self,
        withdrawal: &Withdrawal,
        _hot_wallet: &HotWallet,
    ) -> Result<SignedTransaction, SignerError> {
        Ok(SignedTransaction {
            raw_hex: format!("0x{:x}", withdrawal.id),
        })
    }
}

fn amount(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn sqlite_store(dir: &tempfile::TempDir) -> Arc<SqliteLedgerStore> {
    Arc::new(SqliteLedgerStore::new(dir.path().join("ledger.db"), 4).unwrap())
}

#[tokio::test]
async fn deposit_confirms_after_three_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir);
    let chain = FakeChainClient::new();

    let deposit = operator::register_deposit(
        store.as_ref(),
        Chain::Ethereum,
        WATCHED,
        "user-1",
        "order-1",
        amount("1.0"),
    )
    .await
    .unwrap();

    let mut tracker = ConfirmationTracker::new(
        Chain::Ethereum,
        store.clone(),
        Arc::new(chain.clone()),
        TrackerSettings {
            min_confirmations: 3,
            page_size: 100,
            expiry: chrono::Duration::hours(24),
        },
    );

    chain
        .add_incoming(
            WATCHED,
            IncomingTransfer {
                tx_hash: "0xdeposit".to_string(),
                from_address: "0xpayer".to_string(),
                amount: amount("1.0"),
                block_number: 100,
            },
        )
        .await;

    for (height, expected) in [(100, 1), (101, 2)] {
        chain.set_height(height).await;
        tracker.process_cycle().await.unwrap();
        let stored = store.get_deposit(deposit.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DepositStatus::Pending);
        assert_eq!(stored.confirmations, expected);
    }

    chain.set_height(102).await;
    tracker.process_cycle().await.unwrap();
    let stored = store.get_deposit(deposit.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DepositStatus::Confirmed);
    assert_eq!(stored.confirmations, 3);
    assert!(stored.confirmed_at.is_some());

    // the read model follows
    let txs = store.get_transactions(Chain::Ethereum, 10).await.unwrap();
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].kind, TransactionKind::Deposit);
    assert_eq!(txs[0].tx_hash, "0xdeposit");

    // confirmed deposits are left alone
    chain.set_height(200).await;
    let report = tracker.process_cycle().await.unwrap();
    assert_eq!(report.examined, 0);
}

#[tokio::test]
async fn withdrawal_round_trip_with_reconciled_balance() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir);
    let chain = FakeChainClient::new();

    operator::set_hot_wallet(store.as_ref(), Chain::Polygon, HOT, "kms:hot")
        .await
        .unwrap();
    let withdrawal = operator::submit_withdrawal(
        store.as_ref(),
        Chain::Polygon,
        "payout-1",
        DEST,
        amount("0.5"),
        amount("0.01"),
    )
    .await
    .unwrap();

    let reconciler = HotWalletReconciler::new(Chain::Polygon, store.clone(), Arc::new(chain.clone()));
    let mut dispatcher = WithdrawalDispatcher::new(
        Chain::Polygon,
        store.clone(),
        Arc::new(chain.clone()),
        Arc::new(EchoSigner),
        DispatcherSettings {
            min_confirmations: 2,
            batch_size: 10,
            sent_not_found_cycles: 5,
        },
    );

    // cached balance is still zero: nothing goes out
    let report = dispatcher.process_cycle().await.unwrap();
    assert_eq!(report.deferred, 1);
    assert!(chain.broadcasts().await.is_empty());

    chain.set_balance(HOT, amount("2")).await;
    reconciler.process_cycle().await.unwrap();

    chain.set_height(10).await;
    let report = dispatcher.process_cycle().await.unwrap();
    assert_eq!(report.sent, 1);
    let sent = store.get_withdrawal(withdrawal.id).await.unwrap().unwrap();
    assert_eq!(sent.status, WithdrawalStatus::Sent);
    let tx_hash = sent.tx_hash.clone().unwrap();

    chain.set_receipt(&tx_hash, 11, true).await;
    chain.set_height(12).await;
    let report = dispatcher.process_cycle().await.unwrap();
    assert_eq!(report.confirmed, 1);

    let confirmed = store.get_withdrawal(withdrawal.id).await.unwrap().unwrap();
    assert_eq!(confirmed.status, WithdrawalStatus::Confirmed);
    assert_eq!(confirmed.tx_hash.as_deref(), Some(tx_hash.as_str()));
    assert_eq!(chain.broadcasts().await.len(), 1);

    let counts = store.count_by_status(Chain::Polygon).await.unwrap();
    assert_eq!(counts.withdrawals.get("confirmed"), Some(&1));
}

#[tokio::test]
async fn coordinator_runs_chain_workers_until_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir);
    let chain = FakeChainClient::new();

    operator::set_hot_wallet(store.as_ref(), Chain::Bsc, HOT, "kms:hot")
        .await
        .unwrap();
    chain.set_balance(HOT, amount("5")).await;
    let withdrawal = operator::submit_withdrawal(
        store.as_ref(),
        Chain::Bsc,
        "payout-1",
        DEST,
        amount("1"),
        Decimal::ZERO,
    )
    .await
    .unwrap();

    let workers = WorkerConfig {
        tracker_interval: Duration::from_millis(10),
        dispatcher_interval: Duration::from_millis(10),
        reconciler_interval: Duration::from_millis(10),
        ..WorkerConfig::default()
    };
    let chain_config = ChainConfig {
        chain: Chain::Bsc,
        rpc_url: "http://localhost:8545".to_string(),
        chain_id: 56,
        min_confirmations: 1,
    };

    let mut registry = WorkerRegistry::new();
    for spec in chain_workers(
        &chain_config,
        &workers,
        store.clone(),
        Arc::new(chain.clone()),
        Arc::new(EchoSigner),
    )
    .unwrap()
    {
        registry.register(spec).unwrap();
    }

    let coordinator = Coordinator::new(
        registry,
        BackoffPolicy::new(5, 20),
        RestartPolicy::from_config(&workers),
    );
    let shutdown = coordinator.shutdown_handle();
    let handle = tokio::spawn(coordinator.run());

    // wait for the reconciler to fund the wallet and the dispatcher to pay out
    let mut status = WithdrawalStatus::Pending;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        status = store.get_withdrawal(withdrawal.id).await.unwrap().unwrap().status;
        if status == WithdrawalStatus::Sent {
            break;
        }
    }
    assert_eq!(status, WithdrawalStatus::Sent);

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(chain.broadcasts().await.len(), 1);
}
