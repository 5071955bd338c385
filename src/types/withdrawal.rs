//! Withdrawal Types
//!
//! One outgoing payment instruction paid from the chain's hot wallet:
//! pending → sent → confirmed | pending → sent → failed | pending → failed

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::chain::Chain;

/// Status of a withdrawal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    /// Waiting to be broadcast
    Pending,
    /// Broadcast accepted, waiting for confirmations
    Sent,
    /// Reached the chain's confirmation threshold
    Confirmed,
    /// Rejected at broadcast or reverted on chain
    Failed,
}

impl Default for WithdrawalStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl WithdrawalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }

    /// Stored statuses a record may be in for a write of `self` to apply
    pub fn predecessors(&self) -> &'static [WithdrawalStatus] {
        match self {
            Self::Pending => &[Self::Pending],
            Self::Sent => &[Self::Pending, Self::Sent],
            Self::Confirmed => &[Self::Sent],
            Self::Failed => &[Self::Pending, Self::Sent],
        }
    }
}

impl std::fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WithdrawalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "confirmed" => Ok(Self::Confirmed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown withdrawal status: {}", other)),
        }
    }
}

/// A withdrawal record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdrawal {
    /// Store-assigned identity (0 until created)
    pub id: i64,
    pub chain: Chain,
    pub order_id: String,
    /// Hot wallet address paying out
    pub from_address: String,
    /// Destination address
    pub to_address: String,
    pub amount: Decimal,
    pub fee: Decimal,
    /// Hash of the broadcast transaction
    pub tx_hash: Option<String>,
    pub status: WithdrawalStatus,
    pub block_number: Option<u64>,
    pub confirmations: u64,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Rejection or failure reason
    pub error: Option<String>,
}

impl Withdrawal {
    /// Create a new pending withdrawal
    pub fn new(
        chain: Chain,
        order_id: String,
        from_address: String,
        to_address: String,
        amount: Decimal,
        fee: Decimal,
    ) -> Self {
        Self {
            id: 0,
            chain,
            order_id,
            from_address,
            to_address,
            amount,
            fee,
            tx_hash: None,
            status: WithdrawalStatus::Pending,
            block_number: None,
            confirmations: 0,
            created_at: Utc::now(),
            sent_at: None,
            confirmed_at: None,
            error: None,
        }
    }

    /// Amount the hot wallet must cover
    pub fn total_debit(&self) -> Decimal {
        self.amount + self.fee
    }

    /// Broadcast accepted
    pub fn mark_sent(&mut self, tx_hash: String, at: DateTime<Utc>) {
        self.tx_hash = Some(tx_hash);
        self.status = WithdrawalStatus::Sent;
        self.sent_at = Some(at);
    }

    /// Move the inclusion block forward; an earlier block is ignored
    pub fn advance_block(&mut self, block_number: u64) {
        if self.block_number.map_or(true, |current| block_number > current) {
            self.block_number = Some(block_number);
        }
    }

    /// Raise the confirmation count; never lowers it
    pub fn raise_confirmations(&mut self, confirmations: u64) {
        self.confirmations = self.confirmations.max(confirmations);
    }

    /// Reached the confirmation threshold
    pub fn mark_confirmed(&mut self, at: DateTime<Utc>) {
        self.status = WithdrawalStatus::Confirmed;
        self.confirmed_at = Some(at);
    }

    /// Rejected at broadcast or reverted on chain
    pub fn mark_failed(&mut self, reason: String) {
        self.error = Some(reason);
        self.status = WithdrawalStatus::Failed;
    }

    /// Fresh pending copy of a failed withdrawal for operator resubmission
    pub fn resubmission(&self) -> Option<Withdrawal> {
        if self.status != WithdrawalStatus::Failed {
            return None;
        }
        Some(Withdrawal::new(
            self.chain,
            self.order_id.clone(),
            self.from_address.clone(),
            self.to_address.clone(),
            self.amount,
            self.fee,
        ))
    }

    /// Whether `self` is an allowed successor of the stored record.
    ///
    /// Same rules as the SQLite conditional `UPDATE`: the stored status must
    /// be a predecessor of the new one, a recorded tx hash is never replaced
    /// and confirmations never drop.
    pub fn supersedes(&self, stored: &Withdrawal) -> bool {
        if self.id != stored.id || self.chain != stored.chain {
            return false;
        }
        if !self.status.predecessors().contains(&stored.status) {
            return false;
        }
        if stored.tx_hash.is_some() && stored.tx_hash != self.tx_hash {
            return false;
        }
        self.confirmations >= stored.confirmations
    }

    /// Field-level consistency checked before every write
    pub fn validate(&self) -> Result<(), String> {
        match self.status {
            WithdrawalStatus::Pending if self.tx_hash.is_some() => Err(format!(
                "withdrawal {}: pending withdrawal cannot carry a tx hash",
                self.id
            )),
            WithdrawalStatus::Sent | WithdrawalStatus::Confirmed if self.tx_hash.is_none() => {
                Err(format!(
                    "withdrawal {}: {} withdrawal requires a tx hash",
                    self.id, self.status
                ))
            }
            WithdrawalStatus::Confirmed if self.confirmed_at.is_none() => Err(format!(
                "withdrawal {}: confirmed withdrawal requires confirmed_at",
                self.id
            )),
            _ if self.tx_hash.is_some() != self.sent_at.is_some() => Err(format!(
                "withdrawal {}: sent_at must be set iff tx_hash is set",
                self.id
            )),
            _ => Ok(()),
        }
    }
}
