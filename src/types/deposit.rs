//! Deposit Types
//!
//! An expected or observed incoming payment to a watched address:
//! pending → confirmed | pending → expired

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::chain::Chain;

/// Status of a deposit through its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    /// Waiting for a payment or for confirmations
    Pending,
    /// Reached the chain's confirmation threshold
    Confirmed,
    /// Expiry window passed without a qualifying payment
    Expired,
}

impl Default for DepositStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl DepositStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DepositStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown deposit status: {}", other)),
        }
    }
}

/// A deposit record tracked on one chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deposit {
    /// Store-assigned identity (0 until created)
    pub id: i64,
    pub chain: Chain,
    /// Watched address
    pub address: String,
    pub user_id: String,
    pub order_id: String,
    pub expected_amount: Decimal,
    /// Amount of the observed transfer
    pub received_amount: Option<Decimal>,
    /// Hash of the observed transfer
    pub tx_hash: Option<String>,
    /// Block containing the observed transfer
    pub block_number: Option<u64>,
    pub confirmations: u64,
    pub status: DepositStatus,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl Deposit {
    /// Create a new pending deposit
    pub fn new(
        chain: Chain,
        address: String,
        user_id: String,
        order_id: String,
        expected_amount: Decimal,
    ) -> Self {
        Self {
            id: 0,
            chain,
            address,
            user_id,
            order_id,
            expected_amount,
            received_amount: None,
            tx_hash: None,
            block_number: None,
            confirmations: 0,
            status: DepositStatus::Pending,
            created_at: Utc::now(),
            confirmed_at: None,
        }
    }

    /// Whether an on-chain transfer has been recorded
    pub fn is_observed(&self) -> bool {
        self.tx_hash.is_some()
    }

    /// Observed transfer covers the expected amount
    pub fn is_fully_paid(&self) -> bool {
        self.received_amount
            .map(|received| received >= self.expected_amount)
            .unwrap_or(false)
    }

    /// Observed transfer falls short of the expected amount
    pub fn is_partial(&self) -> bool {
        self.is_observed() && !self.is_fully_paid()
    }

    /// Record the observed transfer. Only valid once.
    pub fn record_observation(&mut self, tx_hash: String, block_number: u64, amount: Decimal) {
        debug_assert!(!self.is_observed(), "observation recorded twice");
        self.tx_hash = Some(tx_hash);
        self.block_number = Some(block_number);
        self.received_amount = Some(amount);
    }

    /// Move the observed transfer to a later block (re-inclusion after a reorg)
    pub fn advance_block(&mut self, block_number: u64) {
        if self.block_number.map_or(true, |current| block_number > current) {
            self.block_number = Some(block_number);
        }
    }

    /// Raise the confirmation count; never lowers it
    pub fn raise_confirmations(&mut self, confirmations: u64) {
        self.confirmations = self.confirmations.max(confirmations);
    }

    /// Transition to confirmed
    pub fn mark_confirmed(&mut self, at: DateTime<Utc>) {
        self.status = DepositStatus::Confirmed;
        self.confirmed_at = Some(at);
    }

    /// Transition to expired
    pub fn mark_expired(&mut self) {
        self.status = DepositStatus::Expired;
    }

    /// Pending, not fully paid, and older than the expiry window
    pub fn is_past_expiry(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.status == DepositStatus::Pending
            && !self.is_fully_paid()
            && self.created_at + window <= now
    }

    /// Whether `self` is an allowed successor of the stored record.
    ///
    /// Mirrors the conditional `UPDATE` of the SQLite store: the stored row
    /// must still be pending, observation fields may only be filled once,
    /// the block may only move forward and confirmations may not drop.
    pub fn supersedes(&self, stored: &Deposit) -> bool {
        if self.id != stored.id || self.chain != stored.chain {
            return false;
        }
        if stored.status != DepositStatus::Pending {
            return false;
        }
        if stored.tx_hash.is_some() && stored.tx_hash != self.tx_hash {
            return false;
        }
        if stored.received_amount.is_some() && stored.received_amount != self.received_amount {
            return false;
        }
        match (stored.block_number, self.block_number) {
            (Some(_), None) => return false,
            (Some(old), Some(new)) if new < old => return false,
            _ => {}
        }
        self.confirmations >= stored.confirmations
    }

    /// Field-level consistency checked before every write
    pub fn validate(&self) -> Result<(), String> {
        if (self.status == DepositStatus::Confirmed) != self.confirmed_at.is_some() {
            return Err(format!(
                "deposit {}: confirmed_at must be set iff status is confirmed",
                self.id
            ));
        }
        let observed = [
            self.tx_hash.is_some(),
            self.block_number.is_some(),
            self.received_amount.is_some(),
        ];
        if observed.iter().any(|set| *set) && !observed.iter().all(|set| *set) {
            return Err(format!(
                "deposit {}: tx_hash, block_number and received_amount are set together",
                self.id
            ));
        }
        if self.status == DepositStatus::Confirmed && !self.is_fully_paid() {
            return Err(format!("deposit {}: cannot confirm an under-payment", self.id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amount(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn deposit() -> Deposit {
        let mut d = Deposit::new(
            Chain::Ethereum,
            "0xabc".to_string(),
            "user-1".to_string(),
            "order-1".to_string(),
            amount("1.0"),
        );
        d.id = 7;
        d
    }

    #[test]
    fn test_deposit_lifecycle() {
        let mut record = deposit();
        assert_eq!(record.status, DepositStatus::Pending);
        assert!(!record.is_observed());

        record.record_observation("0xtx".to_string(), 100, amount("1.0"));
        assert!(record.is_fully_paid());
        assert!(!record.is_partial());

        record.raise_confirmations(3);
        record.mark_confirmed(Utc::now());
        assert!(record.status.is_terminal());
        assert!(record.confirmed_at.is_some());
    }

    #[test]
    fn test_partial_payment() {
        let mut record = deposit();
        record.record_observation("0xtx".to_string(), 100, amount("0.4"));
        assert!(record.is_partial());
        assert!(!record.is_fully_paid());
    }

    #[test]
    fn test_confirmations_never_drop() {
        let mut record = deposit();
        record.raise_confirmations(5);
        record.raise_confirmations(2);
        assert_eq!(record.confirmations, 5);
    }

    #[test]
    fn test_expiry_window() {
        let mut record = deposit();
        let window = Duration::hours(24);
        record.created_at = Utc::now() - Duration::hours(25);
        assert!(record.is_past_expiry(Utc::now(), window));

        record.created_at = Utc::now() - Duration::hours(1);
        assert!(!record.is_past_expiry(Utc::now(), window));
    }

    #[test]
    fn test_fully_paid_deposit_never_expires() {
        let mut record = deposit();
        record.created_at = Utc::now() - Duration::days(3);
        record.record_observation("0xtx".to_string(), 100, amount("1.5"));
        assert!(!record.is_past_expiry(Utc::now(), Duration::hours(24)));
    }

    #[test]
    fn test_supersedes_rules() {
        let stored = deposit();

        let mut observed = stored.clone();
        observed.record_observation("0xtx".to_string(), 100, amount("1.0"));
        observed.raise_confirmations(1);
        assert!(observed.supersedes(&stored));

        // tx hash may not be replaced
        let mut replaced = observed.clone();
        replaced.tx_hash = Some("0xother".to_string());
        assert!(!replaced.supersedes(&observed));

        // block may not move backwards
        let mut rewound = observed.clone();
        rewound.block_number = Some(99);
        assert!(!rewound.supersedes(&observed));

        // terminal rows are frozen
        let mut confirmed = observed.clone();
        confirmed.mark_confirmed(Utc::now());
        let mut again = confirmed.clone();
        again.raise_confirmations(10);
        assert!(!again.supersedes(&confirmed));

    }

    #[test]
    fn test_validate() {
        let mut record = deposit();
        assert!(record.validate().is_ok());

        // confirmed_at must accompany confirmed
        record.record_observation("0xtx".to_string(), 100, amount("1.0"));
        record.status = DepositStatus::Confirmed;
        assert!(record.validate().is_err());
        record.confirmed_at = Some(Utc::now());
        assert!(record.validate().is_ok());

        // observation fields travel together
        let mut half = deposit();
        half.tx_hash = Some("0xtx".to_string());
        assert!(half.validate().is_err());

        // under-payments never confirm
        let mut partial = deposit();
        partial.record_observation("0xtx".to_string(), 100, amount("0.2"));
        partial.mark_confirmed(Utc::now());
        assert!(partial.validate().is_err());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(DepositStatus::Pending.to_string(), "pending");
        assert_eq!("expired".parse::<DepositStatus>(), Ok(DepositStatus::Expired));
        assert!("claimed".parse::<DepositStatus>().is_err());
    }
}
