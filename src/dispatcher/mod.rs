//! Withdrawal Dispatcher Module
//!
//! ```text
//! PENDING → SENT → CONFIRMED
//!    ↓        ↓
//!  FAILED   FAILED
//! ```
//!
//! A pending withdrawal is signed and broadcast at most once. Rejected
//! broadcasts fail without a hash; reverted receipts fail with theirs.
//! Failed withdrawals only come back through an operator resubmission,
//! which creates a new pending record.

pub mod service;

pub use service::{DispatchCycle, DispatcherSettings, WithdrawalDispatcher};
