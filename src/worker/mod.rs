//! Worker Runtime
//!
//! Every background component is a [`Worker`]: one instance per
//! (chain, role), driven by [`run_worker`] on its own tokio task.
//!
//! A cycle always runs to completion. Only the wait between cycles is raced
//! against shutdown, so a stop request never interrupts a half-applied pass.

pub mod backoff;
pub mod shutdown;

use async_trait::async_trait;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::chain::ChainError;
use crate::common::logging::{log_cycle_event, log_worker_event};
use crate::deposit_tracker::TrackerCycle;
use crate::dispatcher::DispatchCycle;
use crate::reconciler::ReconcileCycle;
use crate::signer::SignerError;
use crate::storage::StorageError;
use crate::types::Chain;

pub use backoff::{calculate_backoff, BackoffPolicy};
pub use shutdown::{Shutdown, ShutdownSignal};

/// What a worker does for its chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkerRole {
    Tracker,
    Dispatcher,
    Reconciler,
}

impl WorkerRole {
    pub const ALL: [WorkerRole; 3] = [
        WorkerRole::Tracker,
        WorkerRole::Dispatcher,
        WorkerRole::Reconciler,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerRole::Tracker => "tracker",
            WorkerRole::Dispatcher => "dispatcher",
            WorkerRole::Reconciler => "reconciler",
        }
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a worker; unique within a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId {
    pub chain: Chain,
    pub role: WorkerRole,
}

impl WorkerId {
    pub fn new(chain: Chain, role: WorkerRole) -> Self {
        Self { chain, role }
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chain, self.role)
    }
}

/// Worker errors
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    #[error("chain: {0}")]
    Chain(#[from] ChainError),

    #[error("signer: {0}")]
    Signer(#[from] SignerError),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl WorkerError {
    /// Transient errors abandon the cycle; anything else stops the worker
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Storage(e) => e.is_retryable(),
            WorkerError::Chain(e) => e.is_retryable(),
            WorkerError::Signer(e) => e.is_retryable(),
            WorkerError::Fatal(_) => false,
        }
    }
}

/// Outcome of one completed cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleReport {
    Tracker(TrackerCycle),
    Dispatcher(DispatchCycle),
    Reconciler(ReconcileCycle),
}

impl CycleReport {
    pub fn has_activity(&self) -> bool {
        match self {
            CycleReport::Tracker(r) => r.has_activity(),
            CycleReport::Dispatcher(r) => r.has_activity(),
            CycleReport::Reconciler(r) => r.has_activity(),
        }
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleReport::Tracker(r) => r.fmt(f),
            CycleReport::Dispatcher(r) => r.fmt(f),
            CycleReport::Reconciler(r) => r.fmt(f),
        }
    }
}

/// A periodic per-chain job
#[async_trait]
pub trait Worker: Send {
    fn id(&self) -> WorkerId;

    /// Run one full pass. Must leave the ledger consistent on every return.
    async fn run_cycle(&mut self) -> Result<CycleReport, WorkerError>;
}

/// Drive `worker` until shutdown or a non-retryable error.
///
/// Transient failures are retried after an exponential backoff; the
/// backoff resets after the next successful cycle.
pub async fn run_worker(
    mut worker: Box<dyn Worker>,
    interval: Duration,
    retry: BackoffPolicy,
    mut shutdown: ShutdownSignal,
) -> Result<(), WorkerError> {
    let id = worker.id().to_string();
    log_worker_event("worker_started", &id, None);

    let mut consecutive_failures: u32 = 0;

    loop {
        if shutdown.is_triggered() {
            break;
        }

        let started = Instant::now();
        let delay = match worker.run_cycle().await {
            Ok(report) => {
                consecutive_failures = 0;
                let duration_ms = started.elapsed().as_millis() as u64;
                if report.has_activity() {
                    log_cycle_event(&id, &report.to_string(), duration_ms);
                } else {
                    tracing::debug!(worker = %id, duration_ms, "Idle cycle");
                }
                interval
            }
            Err(e) if e.is_retryable() => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                let delay = retry.delay(consecutive_failures);
                tracing::warn!(
                    worker = %id,
                    error = %e,
                    attempt = consecutive_failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "Cycle abandoned, will retry"
                );
                delay
            }
            Err(e) => {
                log_worker_event("worker_failed", &id, Some(&e.to_string()));
                return Err(e);
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.recv() => break,
        }
    }

    log_worker_event("worker_stopped", &id, None);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::ReconcileCycle;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Fails with the scripted errors, then succeeds
    struct ScriptedWorker {
        cycles: Arc<AtomicU32>,
        script: Vec<Option<WorkerError>>,
    }

    #[async_trait]
    impl Worker for ScriptedWorker {
        fn id(&self) -> WorkerId {
            WorkerId::new(Chain::Ethereum, WorkerRole::Reconciler)
        }

        async fn run_cycle(&mut self) -> Result<CycleReport, WorkerError> {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            if !self.script.is_empty() {
                if let Some(err) = self.script.remove(0) {
                    return Err(err);
                }
            }
            Ok(CycleReport::Reconciler(ReconcileCycle::default()))
        }
    }

    #[test]
    fn test_worker_id_display() {
        let id = WorkerId::new(Chain::Polygon, WorkerRole::Dispatcher);
        assert_eq!(id.to_string(), "polygon/dispatcher");
    }

    #[test]
    fn test_error_classification() {
        assert!(WorkerError::Chain(ChainError::Timeout).is_retryable());
        assert!(WorkerError::Storage(StorageError::Connection("busy".to_string())).is_retryable());
        assert!(!WorkerError::Storage(StorageError::InvalidData("bad row".to_string())).is_retryable());
        assert!(!WorkerError::Fatal("chain id mismatch".to_string()).is_retryable());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let cycles = Arc::new(AtomicU32::new(0));
        let worker = ScriptedWorker {
            cycles: cycles.clone(),
            script: vec![Some(WorkerError::Chain(ChainError::Timeout)), None],
        };
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(run_worker(
            Box::new(worker),
            Duration::from_millis(5),
            BackoffPolicy::new(1, 5),
            shutdown.subscribe(),
        ));

        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown.trigger();
        let result = handle.await.unwrap();

        assert!(result.is_ok());
        assert!(cycles.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_worker() {
        let cycles = Arc::new(AtomicU32::new(0));
        let worker = ScriptedWorker {
            cycles: cycles.clone(),
            script: vec![Some(WorkerError::Fatal("boom".to_string()))],
        };

        let result = run_worker(
            Box::new(worker),
            Duration::from_millis(5),
            BackoffPolicy::new(1, 5),
            Shutdown::new().subscribe(),
        )
        .await;

        assert!(matches!(result, Err(WorkerError::Fatal(_))));
        assert_eq!(cycles.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_before_start_runs_nothing() {
        let cycles = Arc::new(AtomicU32::new(0));
        let worker = ScriptedWorker {
            cycles: cycles.clone(),
            script: vec![],
        };
        let shutdown = Shutdown::new();
        shutdown.trigger();

        run_worker(
            Box::new(worker),
            Duration::from_secs(60),
            BackoffPolicy::new(1, 5),
            shutdown.subscribe(),
        )
        .await
        .unwrap();

        assert_eq!(cycles.load(Ordering::SeqCst), 0);
    }
}
