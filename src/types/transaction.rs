//! Transaction Read Model
//!
//! Denormalized audit view of chain transactions the core has touched.
//! Derived from deposits and withdrawals; never authoritative.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::chain::Chain;
use super::deposit::Deposit;
use super::withdrawal::{Withdrawal, WithdrawalStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdrawal => "withdrawal",
        }
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(Self::Deposit),
            "withdrawal" => Ok(Self::Withdrawal),
            other => Err(format!("unknown transaction kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown transaction status: {}", other)),
        }
    }
}

/// One chain transaction of interest, unique per (chain, tx_hash)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub chain: Chain,
    pub kind: TransactionKind,
    pub tx_hash: String,
    pub from_address: String,
    pub to_address: String,
    pub amount: Decimal,
    pub fee: Decimal,
    pub block_number: Option<u64>,
    pub status: TransactionStatus,
    pub confirmations: u64,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Audit row for an observed deposit transfer
    pub fn from_deposit(deposit: &Deposit, from_address: Option<&str>) -> Option<Self> {
        let tx_hash = deposit.tx_hash.clone()?;
        let status = if deposit.status == super::deposit::DepositStatus::Confirmed {
            TransactionStatus::Confirmed
        } else {
            TransactionStatus::Pending
        };

        Some(Self {
            id: 0,
            chain: deposit.chain,
            kind: TransactionKind::Deposit,
            tx_hash,
            from_address: from_address.unwrap_or_default().to_string(),
            to_address: deposit.address.clone(),
            amount: deposit.received_amount.unwrap_or_default(),
            fee: Decimal::ZERO,
            block_number: deposit.block_number,
            status,
            confirmations: deposit.confirmations,
            created_at: Utc::now(),
        })
    }

    /// Audit row for a broadcast withdrawal
    pub fn from_withdrawal(withdrawal: &Withdrawal) -> Option<Self> {
        let tx_hash = withdrawal.tx_hash.clone()?;
        let status = match withdrawal.status {
            WithdrawalStatus::Confirmed => TransactionStatus::Confirmed,
            WithdrawalStatus::Failed => TransactionStatus::Failed,
            WithdrawalStatus::Pending | WithdrawalStatus::Sent => TransactionStatus::Pending,
        };

        Some(Self {
            id: 0,
            chain: withdrawal.chain,
            kind: TransactionKind::Withdrawal,
            tx_hash,
            from_address: withdrawal.from_address.clone(),
            to_address: withdrawal.to_address.clone(),
            amount: withdrawal.amount,
            fee: withdrawal.fee,
            block_number: withdrawal.block_number,
            status,
            confirmations: withdrawal.confirmations,
            created_at: Utc::now(),
        })
    }
}
