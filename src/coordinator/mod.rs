//! Coordinator
//!
//! Runs every registered worker on its own task and supervises it. A worker
//! that stops with an unrecoverable error is rebuilt and restarted after a
//! backoff. When a worker runs out of restarts the coordinator raises a
//! fatal alert, stops the others and returns an error.

pub mod registry;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;

use crate::chain::ChainClient;
use crate::common::config::{ChainConfig, ConfigError, WorkerConfig};
use crate::common::logging::{log_operator_alert, log_worker_event, LogLevel};
use crate::deposit_tracker::{ConfirmationTracker, TrackerSettings};
use crate::dispatcher::{DispatcherSettings, WithdrawalDispatcher};
use crate::reconciler::HotWalletReconciler;
use crate::signer::WithdrawalSigner;
use crate::storage::LedgerStore;
use crate::worker::{run_worker, BackoffPolicy, Shutdown, WorkerId, WorkerRole};

pub use registry::{WorkerRegistry, WorkerSpec};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("worker {0} registered twice")]
    DuplicateWorker(WorkerId),

    #[error("no worker registered for {0}")]
    MissingWorker(WorkerId),

    #[error("no workers registered")]
    NoWorkers,

    #[error("worker {worker} gave up after {restarts} restarts: {last_error}")]
    RestartBudgetExhausted {
        worker: WorkerId,
        restarts: u32,
        last_error: String,
    },

    #[error("supervisor task failed: {0}")]
    Supervisor(String),
}

/// Restart budget per worker
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub backoff: BackoffPolicy,
}

pub struct Coordinator {
    registry: WorkerRegistry,
    retry: BackoffPolicy,
    restart: RestartPolicy,
    shutdown: Shutdown,
}

impl Coordinator {
    /// `retry` paces retries of failed cycles inside a worker; `restart`
    /// governs rebuilding a worker that stopped.
    pub fn new(registry: WorkerRegistry, retry: BackoffPolicy, restart: RestartPolicy) -> Self {
        Self {
            registry,
            retry,
            restart,
            shutdown: Shutdown::new(),
        }
    }

    /// Handle for requesting a graceful stop
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Run until shutdown or until a worker exhausts its restart budget.
    pub async fn run(self) -> Result<(), CoordinatorError> {
        if self.registry.is_empty() {
            return Err(CoordinatorError::NoWorkers);
        }

        tracing::info!(workers = self.registry.len(), "Starting workers");

        let mut tasks = JoinSet::new();
        for spec in self.registry.into_specs() {
            tasks.spawn(supervise(
                spec,
                self.retry,
                self.restart,
                self.shutdown.clone(),
            ));
        }

        let mut outcome = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| CoordinatorError::Supervisor(e.to_string()));
            if let Err(e) = result.and_then(|r| r) {
                if outcome.is_ok() {
                    tracing::error!(error = %e, "Stopping all workers");
                    self.shutdown.trigger();
                    outcome = Err(e);
                }
            }
        }

        tracing::info!("All workers stopped");
        outcome
    }
}

impl RestartPolicy {
    pub fn from_config(workers: &WorkerConfig) -> Self {
        Self {
            max_restarts: workers.max_restarts,
            backoff: BackoffPolicy::new(
                workers.restart_backoff_base_ms,
                workers.restart_backoff_max_ms,
            ),
        }
    }
}

/// Tracker, dispatcher and reconciler specs for one chain
pub fn chain_workers(
    chain: &ChainConfig,
    workers: &WorkerConfig,
    store: Arc<dyn LedgerStore>,
    client: Arc<dyn ChainClient>,
    signer: Arc<dyn WithdrawalSigner>,
) -> Result<Vec<WorkerSpec>, ConfigError> {
    let expiry = chrono::Duration::from_std(workers.deposit_expiry)
        .map_err(|e| ConfigError::InvalidValue("DEPOSIT_EXPIRY_SECS".to_string(), e.to_string()))?;
    let id = chain.chain;

    let tracker_settings = TrackerSettings {
        min_confirmations: chain.min_confirmations,
        page_size: workers.deposit_page_size,
        expiry,
    };
    let dispatcher_settings = DispatcherSettings {
        min_confirmations: chain.min_confirmations,
        batch_size: workers.withdrawal_batch_size,
        sent_not_found_cycles: workers.sent_not_found_cycles,
    };

    let tracker = {
        let (store, client) = (store.clone(), client.clone());
        WorkerSpec::new(
            WorkerId::new(id, WorkerRole::Tracker),
            workers.tracker_interval,
            move || {
                Box::new(ConfirmationTracker::new(
                    id,
                    store.clone(),
                    client.clone(),
                    tracker_settings.clone(),
                ))
            },
        )
    };

    let dispatcher = {
        let (store, client) = (store.clone(), client.clone());
        WorkerSpec::new(
            WorkerId::new(id, WorkerRole::Dispatcher),
            workers.dispatcher_interval,
            move || {
                Box::new(WithdrawalDispatcher::new(
                    id,
                    store.clone(),
                    client.clone(),
                    signer.clone(),
                    dispatcher_settings.clone(),
                ))
            },
        )
    };

    let reconciler = WorkerSpec::new(
        WorkerId::new(id, WorkerRole::Reconciler),
        workers.reconciler_interval,
        move || Box::new(HotWalletReconciler::new(id, store.clone(), client.clone())),
    );

    Ok(vec![tracker, dispatcher, reconciler])
}

/// Keep one worker alive within its restart budget
async fn supervise(
    spec: WorkerSpec,
    retry: BackoffPolicy,
    restart: RestartPolicy,
    shutdown: Shutdown,
) -> Result<(), CoordinatorError> {
    let id = spec.id;
    let name = id.to_string();
    let mut signal = shutdown.subscribe();
    let mut restarts: u32 = 0;

    loop {
        let worker = spec.build();
        let task = tokio::spawn(run_worker(worker, spec.interval, retry, shutdown.subscribe()));

        let last_error = match task.await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(e) if e.is_panic() => format!("worker panicked: {}", e),
            Err(e) => e.to_string(),
        };

        if shutdown.is_triggered() {
            return Ok(());
        }

        if restarts >= restart.max_restarts {
            log_operator_alert(
                "worker_restart_budget_exhausted",
                LogLevel::Error,
                Some(&name),
                serde_json::json!({
                    "worker": name,
                    "restarts": restarts,
                    "last_error": last_error,
                }),
            );
            return Err(CoordinatorError::RestartBudgetExhausted {
                worker: id,
                restarts,
                last_error,
            });
        }

        restarts += 1;
        let delay = restart.backoff.delay(restarts);
        log_worker_event("worker_restarting", &name, Some(&last_error));
        tracing::warn!(
            worker = %name,
            restart = restarts,
            max_restarts = restart.max_restarts,
            delay_ms = delay.as_millis() as u64,
            "Restarting worker"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = signal.recv() => return Ok(()),
        }
    }
}

/// Resolve on Ctrl-C or, on unix, SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}

/// Grace period main waits for workers after a shutdown request
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::ReconcileCycle;
    use crate::types::Chain;
    use crate::worker::{CycleReport, Worker, WorkerError, WorkerRole};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Fails fatally on its first cycle, every instance
    struct BrokenWorker {
        id: WorkerId,
    }

    #[async_trait]
    impl Worker for BrokenWorker {
        fn id(&self) -> WorkerId {
            self.id
        }

        async fn run_cycle(&mut self) -> Result<CycleReport, WorkerError> {
            Err(WorkerError::Fatal("chain id mismatch".to_string()))
        }
    }

    /// Fatal once, healthy after being rebuilt
    struct FlakyWorker {
        id: WorkerId,
        first_instance: bool,
        cycles: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Worker for FlakyWorker {
        fn id(&self) -> WorkerId {
            self.id
        }

        async fn run_cycle(&mut self) -> Result<CycleReport, WorkerError> {
            if self.first_instance {
                return Err(WorkerError::Fatal("corrupt state".to_string()));
            }
            self.cycles.fetch_add(1, Ordering::SeqCst);
            Ok(CycleReport::Reconciler(ReconcileCycle::default()))
        }
    }

    fn fast_restart(max_restarts: u32) -> RestartPolicy {
        RestartPolicy {
            max_restarts,
            backoff: BackoffPolicy::new(1, 2),
        }
    }

    #[tokio::test]
    async fn test_exhausted_budget_is_fatal() {
        let builds = Arc::new(AtomicU32::new(0));
        let id = WorkerId::new(Chain::Ethereum, WorkerRole::Tracker);
        let counter = builds.clone();

        let mut registry = WorkerRegistry::new();
        registry
            .register(WorkerSpec::new(id, Duration::from_millis(5), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::new(BrokenWorker { id })
            }))
            .unwrap();

        let coordinator = Coordinator::new(registry, BackoffPolicy::new(1, 2), fast_restart(2));
        let err = coordinator.run().await.unwrap_err();

        match err {
            CoordinatorError::RestartBudgetExhausted { worker, restarts, .. } => {
                assert_eq!(worker, id);
                assert_eq!(restarts, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        // initial run plus two restarts
        assert_eq!(builds.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_restarted_worker_recovers() {
        let builds = Arc::new(AtomicU32::new(0));
        let cycles = Arc::new(AtomicU32::new(0));
        let id = WorkerId::new(Chain::Polygon, WorkerRole::Dispatcher);

        let mut registry = WorkerRegistry::new();
        let (b, c) = (builds.clone(), cycles.clone());
        registry
            .register(WorkerSpec::new(id, Duration::from_millis(5), move || {
                let first_instance = b.fetch_add(1, Ordering::SeqCst) == 0;
                Box::new(FlakyWorker {
                    id,
                    first_instance,
                    cycles: c.clone(),
                })
            }))
            .unwrap();

        let coordinator = Coordinator::new(registry, BackoffPolicy::new(1, 2), fast_restart(3));
        let shutdown = coordinator.shutdown_handle();
        let handle = tokio::spawn(coordinator.run());

        tokio::time::sleep(Duration::from_millis(80)).await;
        shutdown.trigger();
        handle.await.unwrap().unwrap();

        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert!(cycles.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_fatal_worker_stops_healthy_ones() {
        let healthy_cycles = Arc::new(AtomicU32::new(0));
        // returning at all means the healthy worker was drained too
        let broken = WorkerId::new(Chain::Bsc, WorkerRole::Reconciler);
        let healthy = WorkerId::new(Chain::Bsc, WorkerRole::Tracker);

        let mut registry = WorkerRegistry::new();
        registry
            .register(WorkerSpec::new(broken, Duration::from_millis(5), move || {
                Box::new(BrokenWorker { id: broken })
            }))
            .unwrap();
        let c = healthy_cycles.clone();
        registry
            .register(WorkerSpec::new(healthy, Duration::from_millis(5), move || {
                Box::new(FlakyWorker {
                    id: healthy,
                    first_instance: false,
                    cycles: c.clone(),
                })
            }))
            .unwrap();

        let coordinator = Coordinator::new(registry, BackoffPolicy::new(1, 2), fast_restart(0));
        let result = tokio::time::timeout(Duration::from_secs(2), coordinator.run())
            .await
            .unwrap();

        assert!(matches!(
            result,
            Err(CoordinatorError::RestartBudgetExhausted { restarts: 0, .. })
        ));
    }

    #[test]
    fn test_chain_workers_cover_every_role() {
        use crate::chain::FakeChainClient;
        use crate::signer::MockWithdrawalSigner;
        use crate::storage::MemoryLedgerStore;

        let chain = ChainConfig {
            chain: Chain::Arbitrum,
            rpc_url: "http://localhost:8545".to_string(),
            chain_id: 42161,
            min_confirmations: 20,
        };
        let specs = chain_workers(
            &chain,
            &WorkerConfig::default(),
            Arc::new(MemoryLedgerStore::new()),
            Arc::new(FakeChainClient::new()),
            Arc::new(MockWithdrawalSigner::new()),
        )
        .unwrap();

        let mut registry = WorkerRegistry::new();
        for spec in specs {
            assert_eq!(spec.build().id(), spec.id);
            registry.register(spec).unwrap();
        }
        registry.ensure_complete([Chain::Arbitrum].iter()).unwrap();
    }

    #[tokio::test]
    async fn test_empty_registry_refused() {
        let coordinator = Coordinator::new(
            WorkerRegistry::new(),
            BackoffPolicy::new(1, 2),
            fast_restart(1),
        );
        assert!(matches!(coordinator.run().await, Err(CoordinatorError::NoWorkers)));
    }
}
