//! Confirmation Tracker Service
//!
//! Advances the pending deposits of one chain:
//! pending → confirmed | pending → expired
//!
//! # Flow:
//! 1. Page through pending deposits, oldest first
//! 2. Unobserved: look for the largest unclaimed transfer into the address
//! 3. Observed: re-check inclusion (reorgs) and recompute confirmations
//! 4. Confirm at the chain's threshold, expire past the window
//! 5. One conditional write per changed deposit

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::Arc;

use crate::chain::{confirmations_at, ChainClient, ChainError, IncomingTransfer};
use crate::common::logging::{
    deposit_correlation_id, log_deposit_event, log_operator_alert, LogLevel,
};
use crate::storage::{LedgerStore, StorageError, WriteOutcome};
use crate::types::{format_amount, Chain, Deposit, DepositStatus, Transaction};
use crate::worker::{CycleReport, Worker, WorkerError, WorkerId, WorkerRole};

/// Tracker settings for one chain
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub min_confirmations: u64,
    pub page_size: usize,
    /// Age after which a deposit without a qualifying payment expires
    pub expiry: Duration,
}

/// Result of a tracker cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TrackerCycle {
    pub examined: usize,
    pub observed: usize,
    pub partial: usize,
    pub progressed: usize,
    pub confirmed: usize,
    pub expired: usize,
    /// Writes that matched no row
    pub skipped: usize,
    pub alerts: usize,
}

impl TrackerCycle {
    pub fn has_activity(&self) -> bool {
        self.observed > 0
            || self.progressed > 0
            || self.confirmed > 0
            || self.expired > 0
            || self.skipped > 0
            || self.alerts > 0
    }
}

impl fmt::Display for TrackerCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tracker: examined={} observed={} partial={} progressed={} confirmed={} expired={} skipped={} alerts={}",
            self.examined,
            self.observed,
            self.partial,
            self.progressed,
            self.confirmed,
            self.expired,
            self.skipped,
            self.alerts
        )
    }
}

/// What a cycle decided for one deposit before writing
struct Evaluation {
    next: Deposit,
    payer: Option<String>,
    newly_observed: bool,
}

/// Confirmation tracker for one chain
pub struct ConfirmationTracker {
    chain: Chain,
    store: Arc<dyn LedgerStore>,
    client: Arc<dyn ChainClient>,
    settings: TrackerSettings,
}

impl ConfirmationTracker {
    pub fn new(
        chain: Chain,
        store: Arc<dyn LedgerStore>,
        client: Arc<dyn ChainClient>,
        settings: TrackerSettings,
    ) -> Self {
        Self {
            chain,
            store,
            client,
            settings,
        }
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    /// Run a single processing cycle
    pub async fn process_cycle(&self) -> Result<TrackerCycle, WorkerError> {
        let mut report = TrackerCycle::default();
        let pending = self
            .store
            .get_pending_deposits(self.chain, self.settings.page_size)
            .await?;

        let now = Utc::now();
        // Fetched at most once per cycle, on first need
        let mut height = None;

        for stored in pending {
            report.examined += 1;
            let Some(evaluation) = self
                .evaluate(&stored, now, &mut height, &mut report)
                .await?
            else {
                continue;
            };
            if evaluation.next == stored {
                continue;
            }
            self.apply(&stored, evaluation, &mut report).await?;
        }

        Ok(report)
    }

    async fn current_height(&self, cached: &mut Option<u64>) -> Result<u64, ChainError> {
        if let Some(height) = *cached {
            return Ok(height);
        }
        let height = self.client.get_current_height().await?;
        *cached = Some(height);
        Ok(height)
    }

    /// Decide the successor of `stored`; `None` leaves it untouched this cycle
    async fn evaluate(
        &self,
        stored: &Deposit,
        now: DateTime<Utc>,
        height: &mut Option<u64>,
        report: &mut TrackerCycle,
    ) -> Result<Option<Evaluation>, WorkerError> {
        let mut next = stored.clone();
        let mut payer = None;
        let mut newly_observed = false;
        let mut recomputed = None;

        match (&stored.tx_hash, stored.block_number) {
            (Some(tx_hash), Some(stored_block)) => {
                let Some(status) = self.client.get_transaction_status(tx_hash).await? else {
                    self.alert(stored, "deposit_tx_missing", "transaction no longer found on chain");
                    report.alerts += 1;
                    return Ok(None);
                };
                if !status.succeeded {
                    self.alert(stored, "deposit_tx_reverted", "observed transaction reverted");
                    report.alerts += 1;
                    return Ok(None);
                }
                if status.block_number < stored_block {
                    self.alert(stored, "deposit_block_regressed", "transaction reported in an earlier block");
                    report.alerts += 1;
                    return Ok(None);
                }
                if status.block_number > stored_block {
                    log_operator_alert(
                        "deposit_reincluded",
                        LogLevel::Warn,
                        Some(&deposit_correlation_id(stored)),
                        serde_json::json!({
                            "tx_hash": tx_hash,
                            "previous_block": stored_block,
                            "block": status.block_number,
                        }),
                    );
                    report.alerts += 1;
                    next.advance_block(status.block_number);
                }

                let tip = self.current_height(height).await?;
                let count = confirmations_at(tip, status.block_number);
                next.raise_confirmations(count);
                recomputed = Some(count);
            }
            _ => {
                if let Some(transfer) = self.find_transfer(stored).await? {
                    let tip = self.current_height(height).await?;
                    let count = confirmations_at(tip, transfer.block_number);

                    next.record_observation(transfer.tx_hash, transfer.block_number, transfer.amount);
                    next.raise_confirmations(count);
                    payer = Some(transfer.from_address);
                    newly_observed = true;
                    recomputed = Some(count);
                }
            }
        }

        if let Some(count) = recomputed {
            if next.is_fully_paid() && count >= self.settings.min_confirmations {
                next.mark_confirmed(now);
            }
        }

        if next.is_past_expiry(now, self.settings.expiry) {
            next.mark_expired();
        }

        Ok(Some(Evaluation {
            next,
            payer,
            newly_observed,
        }))
    }

    /// Largest transfer into the address not already claimed by another deposit
    async fn find_transfer(&self, deposit: &Deposit) -> Result<Option<IncomingTransfer>, WorkerError> {
        let mut transfers = self.client.get_incoming_transactions(&deposit.address).await?;
        transfers.sort_by(|a, b| b.amount.cmp(&a.amount).then(a.block_number.cmp(&b.block_number)));

        for transfer in transfers {
            let claimed = self
                .store
                .get_deposit_by_tx_hash(self.chain, &transfer.tx_hash)
                .await?;
            if claimed.map_or(true, |other| other.id == deposit.id) {
                return Ok(Some(transfer));
            }
        }
        Ok(None)
    }

    async fn apply(
        &self,
        stored: &Deposit,
        evaluation: Evaluation,
        report: &mut TrackerCycle,
    ) -> Result<(), WorkerError> {
        let Evaluation {
            next,
            payer,
            newly_observed,
        } = evaluation;

        match self.store.update_deposit(&next).await {
            Ok(WriteOutcome::Applied) => {}
            Ok(WriteOutcome::NotFound) => {
                tracing::warn!(
                    chain = %self.chain,
                    deposit_id = next.id,
                    "Deposit update matched no row, skipping"
                );
                report.skipped += 1;
                return Ok(());
            }
            Err(StorageError::Duplicate(detail)) => {
                self.alert(&next, "deposit_tx_already_claimed", &detail);
                report.alerts += 1;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        if newly_observed {
            report.observed += 1;
            log_deposit_event("deposit_observed", &next);
            if next.is_partial() {
                report.partial += 1;
                log_operator_alert(
                    "partial_payment",
                    LogLevel::Warn,
                    Some(&deposit_correlation_id(&next)),
                    serde_json::json!({
                        "address": next.address,
                        "expected_amount": format_amount(next.expected_amount),
                        "received_amount": next.received_amount.map(format_amount),
                        "tx_hash": next.tx_hash,
                    }),
                );
            }
        }

        match next.status {
            DepositStatus::Confirmed => {
                report.confirmed += 1;
                log_deposit_event("deposit_confirmed", &next);
            }
            DepositStatus::Expired => {
                report.expired += 1;
                log_deposit_event("deposit_expired", &next);
            }
            DepositStatus::Pending => {
                if !newly_observed && next.confirmations != stored.confirmations {
                    report.progressed += 1;
                }
            }
        }

        if let Some(tx) = Transaction::from_deposit(&next, payer.as_deref()) {
            self.store.record_transaction(&tx).await?;
        }

        Ok(())
    }

    fn alert(&self, deposit: &Deposit, alert: &str, reason: &str) {
        log_operator_alert(
            alert,
            LogLevel::Warn,
            Some(&deposit_correlation_id(deposit)),
            serde_json::json!({
                "chain": self.chain,
                "address": deposit.address,
                "tx_hash": deposit.tx_hash,
                "block_number": deposit.block_number,
                "reason": reason,
            }),
        );
    }
}

#[async_trait]
impl Worker for ConfirmationTracker {
    fn id(&self) -> WorkerId {
        WorkerId::new(self.chain, WorkerRole::Tracker)
    }

    async fn run_cycle(&mut self) -> Result<CycleReport, WorkerError> {
        self.process_cycle().await.map(CycleReport::Tracker)
    }
}
