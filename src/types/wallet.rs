//! Hot Wallet Types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::chain::Chain;

/// Operational wallet for one chain.
///
/// `balance` is a cache of on-chain truth refreshed by the reconciler.
/// `encrypted_key` is opaque here and never serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotWallet {
    pub id: i64,
    pub chain: Chain,
    pub address: String,
    #[serde(skip_serializing, default)]
    pub encrypted_key: String,
    pub balance: Decimal,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl HotWallet {
    /// New wallet with an unknown (zero) balance
    pub fn new(chain: Chain, address: String, encrypted_key: String) -> Self {
        Self {
            id: 0,
            chain,
            address,
            encrypted_key,
            balance: Decimal::ZERO,
            last_checked_at: None,
        }
    }

    /// Cached balance covers `amount`
    pub fn covers(&self, amount: Decimal) -> bool {
        self.balance >= amount
    }
}
