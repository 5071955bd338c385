//! Deposit Tracker Module
//!
//! Tracks deposits of one chain through their lifecycle:
//!
//! ```text
//! PENDING → CONFIRMED
//!        ↘ EXPIRED
//! ```
//!
//! ## Flow Overview
//!
//! 1. An operator registers a deposit (watched address + expected amount)
//! 2. The tracker polls the chain for transfers into the address
//! 3. The largest unclaimed transfer is recorded once
//! 4. Confirmations are recomputed from the chain head every cycle
//! 5. At the chain's threshold the deposit is confirmed; partial payments
//!    are flagged for operators and expire with the window

pub mod service;

// Re-exports
pub use service::{ConfirmationTracker, TrackerCycle, TrackerSettings};
