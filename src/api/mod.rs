//! API Layer Module
//!
//! Read-only HTTP status API over the ledger: deposits by address,
//! withdrawals by status, hot wallets, counts and recent transactions.

pub mod routes;
pub mod server;

// Re-exports for convenience
pub use routes::ApiError;
pub use server::{create_router, start_server, AppState, SharedAppState};
