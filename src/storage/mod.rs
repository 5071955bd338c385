//! Storage Layer Module
//!
//! Provides persistence for deposits, withdrawals, hot wallets and the
//! transaction read model.
//!
//! This module contains:
//! - Storage trait definitions for abstraction
//! - SQLite implementation for production
//! - In-memory implementation for testing

pub mod memory;
pub mod sqlite;
pub mod traits;

// Re-exports for convenience
pub use memory::MemoryLedgerStore;
pub use sqlite::SqliteLedgerStore;
pub use traits::{LedgerCounts, LedgerStore, StorageError, StorageResult, WriteOutcome};
