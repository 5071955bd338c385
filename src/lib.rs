//! Custody Tracker
//!
//! Multi-chain custody back office for EVM chains. Per configured chain it
//! runs three workers against a shared ledger:
//!
//! 1. **Confirmation Tracker** - advances deposits pending → confirmed/expired
//! 2. **Withdrawal Dispatcher** - signs, broadcasts and confirms withdrawals
//! 3. **Hot Wallet Reconciler** - refreshes the cached hot-wallet balance
//!
//! The coordinator supervises the workers; a read-only HTTP API and an
//! operator CLI sit on top of the same ledger.

pub mod api;
pub mod chain;
pub mod common;
pub mod coordinator;
pub mod deposit_tracker;
pub mod dispatcher;
pub mod operator;
pub mod reconciler;
pub mod signer;
pub mod storage;
pub mod types;
pub mod worker;

// Re-exports: ledger
pub use storage::{LedgerStore, MemoryLedgerStore, SqliteLedgerStore, StorageError, WriteOutcome};

// Re-exports: chain access
pub use chain::{BroadcastOutcome, ChainClient, ChainError, EvmRpcClient, FakeChainClient};
pub use signer::{RemoteSigner, SignerError, WithdrawalSigner};

// Re-exports: workers
pub use coordinator::{Coordinator, CoordinatorError, RestartPolicy, WorkerRegistry};
pub use deposit_tracker::{ConfirmationTracker, TrackerSettings};
pub use dispatcher::{DispatcherSettings, WithdrawalDispatcher};
pub use reconciler::HotWalletReconciler;

pub use common::{CustodyConfig, CustodyError};
pub use types::{Chain, Deposit, DepositStatus, HotWallet, Withdrawal, WithdrawalStatus};
