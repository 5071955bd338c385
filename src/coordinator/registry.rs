//! Worker registry: exactly one worker per (chain, role).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::CoordinatorError;
use crate::types::Chain;
use crate::worker::{Worker, WorkerId, WorkerRole};

type WorkerFactory = Arc<dyn Fn() -> Box<dyn Worker> + Send + Sync>;

/// How to build (and rebuild) one worker
#[derive(Clone)]
pub struct WorkerSpec {
    pub id: WorkerId,
    pub interval: Duration,
    factory: WorkerFactory,
}

impl WorkerSpec {
    pub fn new<F>(id: WorkerId, interval: Duration, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Worker> + Send + Sync + 'static,
    {
        Self {
            id,
            interval,
            factory: Arc::new(factory),
        }
    }

    /// Fresh instance; a restarted worker starts without in-memory state
    pub fn build(&self) -> Box<dyn Worker> {
        (self.factory)()
    }
}

impl fmt::Debug for WorkerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSpec")
            .field("id", &self.id)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    specs: BTreeMap<WorkerId, WorkerSpec>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker. A second worker for the same (chain, role) is
    /// refused, since two writers per chain and role would race.
    pub fn register(&mut self, spec: WorkerSpec) -> Result<(), CoordinatorError> {
        if self.specs.contains_key(&spec.id) {
            return Err(CoordinatorError::DuplicateWorker(spec.id));
        }
        self.specs.insert(spec.id, spec);
        Ok(())
    }

    /// Every chain has a tracker, a dispatcher and a reconciler
    pub fn ensure_complete<'a>(
        &self,
        chains: impl IntoIterator<Item = &'a Chain>,
    ) -> Result<(), CoordinatorError> {
        for chain in chains {
            for role in WorkerRole::ALL {
                let id = WorkerId::new(*chain, role);
                if !self.specs.contains_key(&id) {
                    return Err(CoordinatorError::MissingWorker(id));
                }
            }
        }
        Ok(())
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.specs.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub(crate) fn into_specs(self) -> impl Iterator<Item = WorkerSpec> {
        self.specs.into_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::ReconcileCycle;
    use crate::worker::{CycleReport, WorkerError};
    use async_trait::async_trait;

    struct IdleWorker(WorkerId);

    #[async_trait]
    impl Worker for IdleWorker {
        fn id(&self) -> WorkerId {
            self.0
        }

        async fn run_cycle(&mut self) -> Result<CycleReport, WorkerError> {
            Ok(CycleReport::Reconciler(ReconcileCycle::default()))
        }
    }

    fn spec(chain: Chain, role: WorkerRole) -> WorkerSpec {
        let id = WorkerId::new(chain, role);
        WorkerSpec::new(id, Duration::from_secs(1), move || Box::new(IdleWorker(id)))
    }

    #[test]
    fn test_duplicate_worker_rejected() {
        let mut registry = WorkerRegistry::new();
        registry
            .register(spec(Chain::Ethereum, WorkerRole::Dispatcher))
            .unwrap();

        let err = registry
            .register(spec(Chain::Ethereum, WorkerRole::Dispatcher))
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::DuplicateWorker(id) if id.role == WorkerRole::Dispatcher));

        // Same role on another chain is fine
        registry
            .register(spec(Chain::Polygon, WorkerRole::Dispatcher))
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_missing_role_detected() {
        let mut registry = WorkerRegistry::new();
        registry.register(spec(Chain::Bsc, WorkerRole::Tracker)).unwrap();
        registry.register(spec(Chain::Bsc, WorkerRole::Dispatcher)).unwrap();

        let err = registry.ensure_complete([Chain::Bsc].iter()).unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::MissingWorker(id) if id == WorkerId::new(Chain::Bsc, WorkerRole::Reconciler)
        ));

        registry.register(spec(Chain::Bsc, WorkerRole::Reconciler)).unwrap();
        registry.ensure_complete([Chain::Bsc].iter()).unwrap();
    }

    #[test]
    fn test_build_returns_fresh_worker() {
        let spec = spec(Chain::Ethereum, WorkerRole::Tracker);
        assert_eq!(spec.build().id(), spec.id);
    }
}
