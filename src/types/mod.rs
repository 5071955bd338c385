//! Shared Types Module
//!
//! Ledger records shared across the custody workers.

pub mod chain;
pub mod deposit;
pub mod transaction;
pub mod units;
pub mod wallet;
pub mod withdrawal;

// Re-exports for convenience
pub use chain::{Chain, UnknownChain};
pub use deposit::{Deposit, DepositStatus};
pub use transaction::{Transaction, TransactionKind, TransactionStatus};
pub use units::{format_amount, native_to_wei, parse_amount, wei_to_native};
pub use wallet::HotWallet;
pub use withdrawal::{Withdrawal, WithdrawalStatus};
