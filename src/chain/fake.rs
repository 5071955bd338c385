//! Scriptable in-process chain
//!
//! Used by scenario tests and for running the workers without a node.
//! Heights, transfers, receipts, balances and broadcast responses are set
//! by the caller; broadcasts are recorded for later assertions.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{
    confirmations_at, BroadcastOutcome, ChainClient, ChainError, IncomingTransfer,
    SignedTransaction, TxStatus,
};

#[derive(Default)]
struct FakeState {
    height: u64,
    incoming: HashMap<String, Vec<IncomingTransfer>>,
    // tx hash -> (block, succeeded)
    receipts: HashMap<String, (u64, bool)>,
    balances: HashMap<String, Decimal>,
    broadcast_script: VecDeque<BroadcastOutcome>,
    broadcasts: Vec<SignedTransaction>,
    failures_remaining: u32,
    lost_responses: u32,
}

impl FakeState {
    fn take_failure(&mut self) -> Result<(), ChainError> {
        if self.failures_remaining > 0 {
            self.failures_remaining -= 1;
            return Err(ChainError::Timeout);
        }
        Ok(())
    }
}

/// Chain client backed by caller-provided state
#[derive(Clone, Default)]
pub struct FakeChainClient {
    state: Arc<Mutex<FakeState>>,
}

impl FakeChainClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_height(&self, height: u64) {
        self.state.lock().await.height = height;
    }

    /// Add a transfer into `to_address`; it also becomes a successful receipt
    pub async fn add_incoming(&self, to_address: &str, transfer: IncomingTransfer) {
        let mut state = self.state.lock().await;
        state
            .receipts
            .insert(transfer.tx_hash.clone(), (transfer.block_number, true));
        state
            .incoming
            .entry(to_address.to_string())
            .or_default()
            .push(transfer);
    }

    /// Place (or move) a transaction at `block_number`
    pub async fn set_receipt(&self, tx_hash: &str, block_number: u64, succeeded: bool) {
        self.state
            .lock()
            .await
            .receipts
            .insert(tx_hash.to_string(), (block_number, succeeded));
    }

    /// Drop a transaction from the chain, as a reorg would
    pub async fn remove_receipt(&self, tx_hash: &str) {
        self.state.lock().await.receipts.remove(tx_hash);
    }

    pub async fn set_balance(&self, address: &str, balance: Decimal) {
        self.state
            .lock()
            .await
            .balances
            .insert(address.to_string(), balance);
    }

    /// Queue the response to the next broadcast; unscripted broadcasts are accepted
    pub async fn push_broadcast_outcome(&self, outcome: BroadcastOutcome) {
        self.state.lock().await.broadcast_script.push_back(outcome);
    }

    /// Fail the next `count` calls with a timeout
    pub async fn fail_next_calls(&self, count: u32) {
        self.state.lock().await.failures_remaining = count;
    }

    /// The next `count` broadcasts reach the node but the caller sees a timeout
    pub async fn lose_next_broadcast_responses(&self, count: u32) {
        self.state.lock().await.lost_responses = count;
    }

    /// Transactions submitted so far
    pub async fn broadcasts(&self) -> Vec<SignedTransaction> {
        self.state.lock().await.broadcasts.clone()
    }
}

#[async_trait]
impl ChainClient for FakeChainClient {
    async fn get_current_height(&self) -> Result<u64, ChainError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        Ok(state.height)
    }

    async fn get_incoming_transactions(
        &self,
        address: &str,
    ) -> Result<Vec<IncomingTransfer>, ChainError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        let height = state.height;
        Ok(state
            .incoming
            .get(address)
            .map(|transfers| {
                transfers
                    .iter()
                    .filter(|t| t.block_number <= height)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_transaction_status(&self, tx_hash: &str) -> Result<Option<TxStatus>, ChainError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        Ok(state
            .receipts
            .get(tx_hash)
            .map(|&(block_number, succeeded)| TxStatus {
                block_number,
                confirmations: confirmations_at(state.height, block_number),
                succeeded,
            }))
    }

    async fn get_balance(&self, address: &str) -> Result<Decimal, ChainError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        Ok(state.balances.get(address).copied().unwrap_or_default())
    }

    async fn broadcast(&self, tx: &SignedTransaction) -> Result<BroadcastOutcome, ChainError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        state.broadcasts.push(tx.clone());

        let sequence = state.broadcasts.len();
        let outcome = state
            .broadcast_script
            .pop_front()
            .unwrap_or_else(|| BroadcastOutcome::Accepted(format!("0xfake{:04}", sequence)));
        if state.lost_responses > 0 {
            state.lost_responses -= 1;
            return Err(ChainError::Timeout);
        }
        Ok(outcome)
    }
}
