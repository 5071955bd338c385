//! Operator Actions
//!
//! Ledger writes that come from operators rather than workers: registering
//! deposits to watch, queueing and resubmitting withdrawals, provisioning
//! hot wallets. Inputs are validated here; the workers take it from there.

use rust_decimal::Decimal;

use crate::common::error::{CustodyError, Result};
use crate::common::logging::{log_deposit_event, log_withdrawal_event};
use crate::storage::{LedgerStore, StorageError};
use crate::types::{Chain, Deposit, HotWallet, Withdrawal};

/// Whether `address` is a 20-byte hex EVM address
pub fn is_evm_address(address: &str) -> bool {
    address
        .strip_prefix("0x")
        .map(|hex| hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}

fn require_address(field: &str, address: &str) -> Result<()> {
    if !is_evm_address(address) {
        return Err(CustodyError::validation(format!(
            "{} is not an EVM address: {}",
            field, address
        )));
    }
    Ok(())
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CustodyError::validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// Register an address to watch for a deposit of `expected_amount`
pub async fn register_deposit(
    store: &dyn LedgerStore,
    chain: Chain,
    address: &str,
    user_id: &str,
    order_id: &str,
    expected_amount: Decimal,
) -> Result<Deposit> {
    require_address("address", address)?;
    require_non_empty("user_id", user_id)?;
    require_non_empty("order_id", order_id)?;
    if expected_amount <= Decimal::ZERO {
        return Err(CustodyError::validation("expected amount must be positive"));
    }

    let deposit = store
        .create_deposit(&Deposit::new(
            chain,
            address.to_lowercase(),
            user_id.to_string(),
            order_id.to_string(),
            expected_amount,
        ))
        .await?;

    log_deposit_event("deposit_registered", &deposit);
    Ok(deposit)
}

/// Queue a withdrawal from the chain's hot wallet
pub async fn submit_withdrawal(
    store: &dyn LedgerStore,
    chain: Chain,
    order_id: &str,
    to_address: &str,
    amount: Decimal,
    fee: Decimal,
) -> Result<Withdrawal> {
    require_non_empty("order_id", order_id)?;
    require_address("to_address", to_address)?;
    if amount <= Decimal::ZERO {
        return Err(CustodyError::validation("amount must be positive"));
    }
    if fee < Decimal::ZERO {
        return Err(CustodyError::validation("fee must not be negative"));
    }

    let wallet = store.get_hot_wallet(chain).await?.ok_or_else(|| {
        CustodyError::validation(format!("no hot wallet configured for {}", chain))
    })?;

    let withdrawal = store
        .create_withdrawal(&Withdrawal::new(
            chain,
            order_id.to_string(),
            wallet.address,
            to_address.to_lowercase(),
            amount,
            fee,
        ))
        .await?;

    log_withdrawal_event("withdrawal_submitted", &withdrawal, true);
    Ok(withdrawal)
}

/// Queue a fresh copy of a failed withdrawal. The failed record stays as is.
pub async fn resubmit_withdrawal(store: &dyn LedgerStore, id: i64) -> Result<Withdrawal> {
    let failed = store
        .get_withdrawal(id)
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("withdrawal {}", id)))?;

    let Some(copy) = failed.resubmission() else {
        return Err(CustodyError::validation(format!(
            "withdrawal {} is {}, only failed withdrawals can be resubmitted",
            id, failed.status
        )));
    };

    let withdrawal = store.create_withdrawal(&copy).await?;

    tracing::info!(
        chain = %withdrawal.chain,
        failed_id = id,
        withdrawal_id = withdrawal.id,
        order_id = %withdrawal.order_id,
        "Withdrawal resubmitted"
    );
    log_withdrawal_event("withdrawal_resubmitted", &withdrawal, true);
    Ok(withdrawal)
}

/// Provision or replace a chain's hot wallet.
///
/// The cached balance survives when the address is unchanged; a new address
/// starts at zero until the reconciler refreshes it.
pub async fn set_hot_wallet(
    store: &dyn LedgerStore,
    chain: Chain,
    address: &str,
    encrypted_key: &str,
) -> Result<HotWallet> {
    require_address("address", address)?;
    require_non_empty("encrypted_key", encrypted_key)?;

    let address = address.to_lowercase();
    let mut wallet = HotWallet::new(chain, address.clone(), encrypted_key.to_string());
    if let Some(existing) = store.get_hot_wallet(chain).await? {
        if existing.address == address {
            wallet.balance = existing.balance;
            wallet.last_checked_at = existing.last_checked_at;
        }
    }

    let stored = store.upsert_hot_wallet(&wallet).await?;
    tracing::info!(chain = %chain, address = %stored.address, "Hot wallet provisioned");
    Ok(stored)
}
