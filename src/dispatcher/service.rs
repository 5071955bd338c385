//! Withdrawal Dispatcher Service
//!
//! Pays out the pending withdrawals of one chain from its hot wallet and
//! follows the broadcast transactions to a terminal state.
//!
//! Each cycle runs three passes:
//! 1. In-flight: settle broadcasts the ledger does not reflect yet. An
//!    accepted broadcast whose write failed is written again; a broadcast
//!    with an unknown outcome is looked up by its local hash and otherwise
//!    resent byte for byte. Neither is ever signed again.
//! 2. Dispatch: oldest pending first, funded from the cached hot-wallet
//!    balance; the first withdrawal that cannot be covered stops the pass.
//! 3. Sent: recompute confirmations of broadcast withdrawals, confirm at the
//!    threshold, fail on a reverted receipt.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::chain::{BroadcastOutcome, ChainClient, ChainError, SignedTransaction};
use crate::common::logging::{
    log_operator_alert, log_withdrawal_event, withdrawal_correlation_id, LogLevel,
};
use crate::signer::WithdrawalSigner;
use crate::storage::{LedgerStore, WriteOutcome};
use crate::types::{format_amount, Chain, Transaction, Withdrawal, WithdrawalStatus};
use crate::worker::{CycleReport, Worker, WorkerError, WorkerId, WorkerRole};

/// Dispatcher settings for one chain
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub min_confirmations: u64,
    pub batch_size: usize,
    /// Consecutive polls a sent transaction may be missing before an alert
    pub sent_not_found_cycles: u32,
}

/// Result of a dispatcher cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchCycle {
    pub examined: usize,
    pub sent: usize,
    pub rejected: usize,
    /// Left pending because the hot wallet could not cover them
    pub deferred: usize,
    /// Broadcast but not yet reflected in the ledger
    pub in_flight: usize,
    pub progressed: usize,
    pub confirmed: usize,
    pub reverted: usize,
    pub skipped: usize,
    pub alerts: usize,
}

impl DispatchCycle {
    pub fn has_activity(&self) -> bool {
        self.sent > 0
            || self.rejected > 0
            || self.deferred > 0
            || self.in_flight > 0
            || self.progressed > 0
            || self.confirmed > 0
            || self.reverted > 0
            || self.skipped > 0
            || self.alerts > 0
    }
}

impl fmt::Display for DispatchCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dispatcher: examined={} sent={} rejected={} deferred={} in_flight={} progressed={} confirmed={} reverted={} skipped={} alerts={}",
            self.examined,
            self.sent,
            self.rejected,
            self.deferred,
            self.in_flight,
            self.progressed,
            self.confirmed,
            self.reverted,
            self.skipped,
            self.alerts
        )
    }
}

/// A broadcast the ledger does not reflect yet
#[derive(Debug, Clone)]
enum InFlight {
    /// Accepted by the node; the pending → sent write has not landed
    Unrecorded(Withdrawal),
    /// Outcome unknown; only these exact bytes may go out again
    Uncertain {
        withdrawal: Withdrawal,
        signed: SignedTransaction,
        resends: u32,
    },
}

impl InFlight {
    fn debit(&self) -> Decimal {
        match self {
            InFlight::Unrecorded(w) => w.total_debit(),
            InFlight::Uncertain { withdrawal, .. } => withdrawal.total_debit(),
        }
    }
}

/// Node replies to a resend meaning it already has the transaction
fn already_submitted(reason: &str) -> bool {
    let reason = reason.to_lowercase();
    ["already known", "known transaction", "nonce too low"]
        .iter()
        .any(|marker| reason.contains(marker))
}

/// Withdrawal dispatcher for one chain
pub struct WithdrawalDispatcher {
    chain: Chain,
    store: Arc<dyn LedgerStore>,
    client: Arc<dyn ChainClient>,
    signer: Arc<dyn WithdrawalSigner>,
    settings: DispatcherSettings,
    /// Withdrawal id -> consecutive polls without a receipt
    missing: HashMap<i64, u32>,
    /// Withdrawal id -> broadcast awaiting its ledger write
    in_flight: BTreeMap<i64, InFlight>,
}

impl WithdrawalDispatcher {
    pub fn new(
        chain: Chain,
        store: Arc<dyn LedgerStore>,
        client: Arc<dyn ChainClient>,
        signer: Arc<dyn WithdrawalSigner>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            chain,
            store,
            client,
            signer,
            settings,
            missing: HashMap::new(),
            in_flight: BTreeMap::new(),
        }
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    /// Run a single processing cycle
    pub async fn process_cycle(&mut self) -> Result<DispatchCycle, WorkerError> {
        let mut report = DispatchCycle::default();
        // Funds that have left, or may have left, before the cached balance knows it
        let committed: Decimal = self.in_flight.values().map(InFlight::debit).sum();

        self.settle_in_flight(&mut report).await?;
        self.dispatch_pending(committed, &mut report).await?;
        self.track_sent(&mut report).await?;
        report.in_flight = self.in_flight.len();
        Ok(report)
    }

    /// Resolve broadcasts left over from earlier cycles
    async fn settle_in_flight(&mut self, report: &mut DispatchCycle) -> Result<(), WorkerError> {
        let ids: Vec<i64> = self.in_flight.keys().copied().collect();

        for id in ids {
            let Some(entry) = self.in_flight.remove(&id) else {
                continue;
            };
            match entry {
                InFlight::Unrecorded(next) => self.record_sent(next, report).await?,
                InFlight::Uncertain {
                    withdrawal,
                    signed,
                    resends,
                } => {
                    self.resolve_uncertain(withdrawal, signed, resends, report)
                        .await?
                }
            }
        }

        Ok(())
    }

    async fn resolve_uncertain(
        &mut self,
        withdrawal: Withdrawal,
        signed: SignedTransaction,
        resends: u32,
        report: &mut DispatchCycle,
    ) -> Result<(), WorkerError> {
        if let Some(local_hash) = signed.local_hash() {
            match self.client.get_transaction_status(&local_hash).await {
                Ok(Some(_)) => {
                    tracing::info!(
                        chain = %self.chain,
                        withdrawal_id = withdrawal.id,
                        tx_hash = %local_hash,
                        "Broadcast with unknown outcome found on chain"
                    );
                    let mut next = withdrawal;
                    next.mark_sent(local_hash, Utc::now());
                    return self.record_sent(next, report).await;
                }
                Ok(None) => {}
                Err(e) => {
                    self.hold_uncertain(withdrawal, signed, resends);
                    return Err(e.into());
                }
            }
        }

        let resends = resends + 1;
        match self.client.broadcast(&signed).await {
            Ok(BroadcastOutcome::Rejected(reason)) if already_submitted(&reason) => {
                if resends == self.settings.sent_not_found_cycles {
                    log_operator_alert(
                        "withdrawal_broadcast_unresolved",
                        LogLevel::Error,
                        Some(&withdrawal_correlation_id(&withdrawal)),
                        serde_json::json!({
                            "chain": self.chain,
                            "local_hash": signed.local_hash(),
                            "resends": resends,
                            "reason": reason,
                        }),
                    );
                    report.alerts += 1;
                }
                self.hold_uncertain(withdrawal, signed, resends);
                Ok(())
            }
            Ok(outcome) => self.apply_outcome(&withdrawal, outcome, report).await,
            Err(e) => {
                self.alert_uncertain(&withdrawal, &signed, &e);
                report.alerts += 1;
                self.hold_uncertain(withdrawal, signed, resends);
                Err(e.into())
            }
        }
    }

    /// Dispatch pass over pending withdrawals, in creation order
    async fn dispatch_pending(
        &mut self,
        committed: Decimal,
        report: &mut DispatchCycle,
    ) -> Result<(), WorkerError> {
        let pending: Vec<Withdrawal> = self
            .store
            .get_pending_withdrawals(self.chain, self.settings.batch_size)
            .await?
            .into_iter()
            .filter(|w| !self.in_flight.contains_key(&w.id))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let Some(wallet) = self.store.get_hot_wallet(self.chain).await? else {
            log_operator_alert(
                "hot_wallet_missing",
                LogLevel::Warn,
                None,
                serde_json::json!({ "chain": self.chain, "pending": pending.len() }),
            );
            report.alerts += 1;
            return Ok(());
        };

        // Cached balance less what is in flight and what this cycle paid out
        let mut available = wallet.balance - committed;

        for withdrawal in pending {
            report.examined += 1;
            let debit = withdrawal.total_debit();

            if available < debit {
                log_operator_alert(
                    "hot_wallet_underfunded",
                    LogLevel::Warn,
                    Some(&withdrawal_correlation_id(&withdrawal)),
                    serde_json::json!({
                        "chain": self.chain,
                        "required": format_amount(debit),
                        "available": format_amount(available),
                        "cached_balance": format_amount(wallet.balance),
                        "hot_wallet": wallet.address,
                    }),
                );
                report.deferred += 1;
                report.alerts += 1;
                break;
            }

            let signed = self.signer.sign(&withdrawal, &wallet).await?;

            let outcome = match self.client.broadcast(&signed).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // The node may hold it; from here on only these bytes go out
                    self.alert_uncertain(&withdrawal, &signed, &e);
                    report.alerts += 1;
                    self.hold_uncertain(withdrawal, signed, 0);
                    return Err(e.into());
                }
            };

            if matches!(outcome, BroadcastOutcome::Accepted(_)) {
                // Funds have left regardless of what the ledger write does
                available -= debit;
            }
            self.apply_outcome(&withdrawal, outcome, report).await?;
        }

        Ok(())
    }

    async fn apply_outcome(
        &mut self,
        withdrawal: &Withdrawal,
        outcome: BroadcastOutcome,
        report: &mut DispatchCycle,
    ) -> Result<(), WorkerError> {
        let mut next = withdrawal.clone();
        match outcome {
            BroadcastOutcome::Accepted(tx_hash) => {
                next.mark_sent(tx_hash, Utc::now());
                self.record_sent(next, report).await
            }
            BroadcastOutcome::Rejected(reason) => {
                next.mark_failed(reason);
                match self.store.update_withdrawal(&next).await? {
                    WriteOutcome::Applied => {
                        report.rejected += 1;
                        log_withdrawal_event("withdrawal_rejected", &next, false);
                    }
                    WriteOutcome::NotFound => {
                        tracing::warn!(
                            chain = %self.chain,
                            withdrawal_id = next.id,
                            "Withdrawal rejection matched no row, skipping"
                        );
                        report.skipped += 1;
                    }
                }
                Ok(())
            }
        }
    }

    /// Write pending → sent for an accepted broadcast.
    ///
    /// A failed write keeps the withdrawal in flight, so the next cycle
    /// retries the write instead of broadcasting again.
    async fn record_sent(
        &mut self,
        next: Withdrawal,
        report: &mut DispatchCycle,
    ) -> Result<(), WorkerError> {
        match self.store.update_withdrawal(&next).await {
            Ok(WriteOutcome::Applied) => {
                report.sent += 1;
                log_withdrawal_event("withdrawal_sent", &next, true);
                self.record(&next).await
            }
            Ok(WriteOutcome::NotFound) => {
                self.alert_unrecorded(&next, "update matched no row");
                report.alerts += 1;
                Ok(())
            }
            Err(e) => {
                self.alert_unrecorded(&next, &e.to_string());
                report.alerts += 1;
                self.in_flight.insert(next.id, InFlight::Unrecorded(next));
                Err(e.into())
            }
        }
    }

    fn hold_uncertain(&mut self, withdrawal: Withdrawal, signed: SignedTransaction, resends: u32) {
        self.in_flight.insert(
            withdrawal.id,
            InFlight::Uncertain {
                withdrawal,
                signed,
                resends,
            },
        );
    }

    /// Follow broadcast withdrawals to confirmed or failed
    async fn track_sent(&mut self, report: &mut DispatchCycle) -> Result<(), WorkerError> {
        let sent = self
            .store
            .get_withdrawals_by_status(self.chain, WithdrawalStatus::Sent, self.settings.batch_size)
            .await?;

        let live: HashSet<i64> = sent.iter().map(|w| w.id).collect();
        self.missing.retain(|id, _| live.contains(id));

        for withdrawal in sent {
            let Some(tx_hash) = withdrawal.tx_hash.clone() else {
                continue;
            };

            let Some(status) = self.client.get_transaction_status(&tx_hash).await? else {
                let polls = self.missing.entry(withdrawal.id).or_insert(0);
                *polls += 1;
                if *polls == self.settings.sent_not_found_cycles {
                    log_operator_alert(
                        "withdrawal_tx_missing",
                        LogLevel::Error,
                        Some(&withdrawal_correlation_id(&withdrawal)),
                        serde_json::json!({
                            "tx_hash": tx_hash,
                            "polls": *polls,
                            "sent_at": withdrawal.sent_at,
                        }),
                    );
                    report.alerts += 1;
                }
                continue;
            };
            self.missing.remove(&withdrawal.id);

            if let Some(stored_block) = withdrawal.block_number {
                if status.block_number < stored_block {
                    self.alert_block_change(
                        &withdrawal,
                        "withdrawal_block_regressed",
                        stored_block,
                        status.block_number,
                    );
                    report.alerts += 1;
                    continue;
                }
                if status.block_number > stored_block {
                    self.alert_block_change(
                        &withdrawal,
                        "withdrawal_reincluded",
                        stored_block,
                        status.block_number,
                    );
                    report.alerts += 1;
                }
            }

            let mut next = withdrawal.clone();
            next.advance_block(status.block_number);
            next.raise_confirmations(status.confirmations);
            if !status.succeeded {
                next.mark_failed("transaction reverted".to_string());
            } else if status.confirmations >= self.settings.min_confirmations {
                // Decided on the recomputed count, not the held one
                next.mark_confirmed(Utc::now());
            }

            if next == withdrawal {
                continue;
            }

            match self.store.update_withdrawal(&next).await? {
                WriteOutcome::Applied => {}
                WriteOutcome::NotFound => {
                    tracing::warn!(
                        chain = %self.chain,
                        withdrawal_id = next.id,
                        "Withdrawal update matched no row, skipping"
                    );
                    report.skipped += 1;
                    continue;
                }
            }

            match next.status {
                WithdrawalStatus::Confirmed => {
                    report.confirmed += 1;
                    log_withdrawal_event("withdrawal_confirmed", &next, true);
                }
                WithdrawalStatus::Failed => {
                    report.reverted += 1;
                    log_withdrawal_event("withdrawal_reverted", &next, false);
                }
                _ => report.progressed += 1,
            }
            self.record(&next).await?;
        }

        Ok(())
    }

    async fn record(&self, withdrawal: &Withdrawal) -> Result<(), WorkerError> {
        if let Some(tx) = Transaction::from_withdrawal(withdrawal) {
            self.store.record_transaction(&tx).await?;
        }
        Ok(())
    }

    fn alert_unrecorded(&self, withdrawal: &Withdrawal, reason: &str) {
        log_operator_alert(
            "withdrawal_sent_unrecorded",
            LogLevel::Error,
            Some(&withdrawal_correlation_id(withdrawal)),
            serde_json::json!({
                "chain": self.chain,
                "tx_hash": withdrawal.tx_hash,
                "reason": reason,
            }),
        );
    }

    fn alert_uncertain(&self, withdrawal: &Withdrawal, signed: &SignedTransaction, error: &ChainError) {
        log_operator_alert(
            "withdrawal_broadcast_uncertain",
            LogLevel::Warn,
            Some(&withdrawal_correlation_id(withdrawal)),
            serde_json::json!({
                "chain": self.chain,
                "local_hash": signed.local_hash(),
                "error": error.to_string(),
            }),
        );
    }

    fn alert_block_change(&self, withdrawal: &Withdrawal, alert: &str, previous: u64, block: u64) {
        log_operator_alert(
            alert,
            LogLevel::Warn,
            Some(&withdrawal_correlation_id(withdrawal)),
            serde_json::json!({
                "chain": self.chain,
                "tx_hash": withdrawal.tx_hash,
                "previous_block": previous,
                "block": block,
            }),
        );
    }
}

#[async_trait]
impl Worker for WithdrawalDispatcher {
    fn id(&self) -> WorkerId {
        WorkerId::new(self.chain, WorkerRole::Dispatcher)
    }

    async fn run_cycle(&mut self) -> Result<CycleReport, WorkerError> {
        self.process_cycle().await.map(CycleReport::Dispatcher)
    }
}
