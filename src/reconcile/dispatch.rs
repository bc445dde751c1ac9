//! Routing of reconcile triggers to per-environment workers.
//!
//! The dispatcher lazily spawns one worker per environment and delivers
//! pokes to it. Workers for destroyed environments retire themselves; the
//! dispatcher respawns on the next poke if the environment comes back
//! under the same identity.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ReconcileConfig;
use crate::driver::InfrastructureDriver;
use crate::types::EnvironmentId;

use super::engine::ReconcileEngine;
use super::worker::{spawn_worker, WorkerHandle};

/// Fans reconcile triggers out to per-environment workers under a global
/// concurrency budget.
pub struct ReconcileDispatcher<D> {
    engine: Arc<ReconcileEngine<D>>,
    budget: Arc<Semaphore>,
    cancel: CancellationToken,
    workers: RwLock<HashMap<EnvironmentId, WorkerHandle>>,
}

impl<D: InfrastructureDriver + 'static> ReconcileDispatcher<D> {
    pub fn new(engine: Arc<ReconcileEngine<D>>, config: &ReconcileConfig) -> Self {
        ReconcileDispatcher {
            engine,
            budget: Arc::new(Semaphore::new(config.worker_budget)),
            cancel: CancellationToken::new(),
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Requests a reconciliation pass for an environment.
    ///
    /// Never blocks on the pass itself. Pokes to an already-busy worker
    /// coalesce.
    pub fn notify(&self, id: &EnvironmentId) {
        if let Some(handle) = self.read_workers().get(id) {
            match handle.tx.try_send(()) {
                Ok(()) => return,
                // A pass is already queued; it will see the latest state.
                Err(tokio::sync::mpsc::error::TrySendError::Full(())) => return,
                // Worker retired; fall through and respawn.
                Err(tokio::sync::mpsc::error::TrySendError::Closed(())) => {}
            }
        }
        self.spawn_and_poke(id);
    }

    fn spawn_and_poke(&self, id: &EnvironmentId) {
        let mut workers = self.write_workers();
        let retired = {
            let handle = workers.entry(id.clone()).or_insert_with(|| {
                debug!(environment = %id, "Spawning reconcile worker");
                spawn_worker(
                    Arc::clone(&self.engine),
                    Arc::clone(&self.budget),
                    self.cancel.child_token(),
                    id.clone(),
                )
            });
            // A full channel means a pass is already queued, which is fine;
            // a closed one means the entry is a retired worker.
            handle.tx.try_send(()).is_err() && handle.tx.is_closed()
        };
        if retired {
            let fresh = spawn_worker(
                Arc::clone(&self.engine),
                Arc::clone(&self.budget),
                self.cancel.child_token(),
                id.clone(),
            );
            let _ = fresh.tx.try_send(());
            workers.insert(id.clone(), fresh);
        }
    }

    /// Pokes every worker-worthy environment; used after recovery and by
    /// the periodic sweep.
    pub fn notify_all<I>(&self, ids: I)
    where
        I: IntoIterator<Item = EnvironmentId>,
    {
        for id in ids {
            self.notify(&id);
        }
    }

    /// Stops all workers and waits for in-flight passes to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<WorkerHandle> = {
            let mut workers = self.write_workers();
            workers.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.task.await;
        }
    }

    fn read_workers(&self) -> RwLockReadGuard<'_, HashMap<EnvironmentId, WorkerHandle>> {
        self.workers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_workers(&self) -> RwLockWriteGuard<'_, HashMap<EnvironmentId, WorkerHandle>> {
        self.workers.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NamingConfig, RoutingConfig};
    use crate::identity::IdentityResolver;
    use crate::routing::RoutingAllocator;
    use crate::store::StateStore;
    use crate::test_utils::FakeDriver;
    use crate::types::{
        ArtifactRef, BranchId, DesiredStateEntry, Generation, IntentAction, LifecycleState,
        OwnerId, SourceEvent,
    };
    use std::time::Duration;

    fn dispatcher() -> (
        Arc<StateStore>,
        Arc<FakeDriver>,
        ReconcileDispatcher<FakeDriver>,
    ) {
        let store = Arc::new(StateStore::new());
        let allocator = Arc::new(RoutingAllocator::new(RoutingConfig::default()));
        let driver = Arc::new(FakeDriver::new());
        let config = ReconcileConfig {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            ..ReconcileConfig::default()
        };
        let engine = Arc::new(ReconcileEngine::new(
            Arc::clone(&store),
            Arc::clone(&allocator),
            Arc::clone(&driver),
            IdentityResolver::new(NamingConfig::default()),
            config.clone(),
            true,
        ));
        let dispatcher = ReconcileDispatcher::new(engine, &config);
        (store, driver, dispatcher)
    }

    fn push(store: &StateStore, owner: &str, branch: &str, generation: u64) -> crate::types::EnvironmentId {
        let resolver = IdentityResolver::new(NamingConfig::default());
        let entry = DesiredStateEntry::new(
            OwnerId::new(owner),
            BranchId::new(branch),
            IntentAction::Create {
                artifact: ArtifactRef::new("app:1"),
            },
            Generation(generation),
            SourceEvent::BranchPush,
        );
        store
            .apply(&entry, &resolver)
            .unwrap()
            .environment_id()
            .unwrap()
            .clone()
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn notify_provisions_in_the_background() {
        let (store, _driver, dispatcher) = dispatcher();
        let id = push(&store, "d1", "f1", 1);

        dispatcher.notify(&id);
        wait_for(|| {
            store
                .get(&id)
                .map(|env| env.lifecycle == LifecycleState::Running)
                .unwrap_or(false)
        })
        .await;
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_environments_all_converge() {
        let (store, _driver, dispatcher) = dispatcher();
        let ids: Vec<_> = (0..10)
            .map(|i| push(&store, "dev", &format!("branch-{i}"), 1))
            .collect();

        dispatcher.notify_all(ids.iter().cloned());
        wait_for(|| {
            ids.iter().all(|id| {
                store
                    .get(id)
                    .map(|env| env.lifecycle == LifecycleState::Running)
                    .unwrap_or(false)
            })
        })
        .await;
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_quiesces() {
        let (store, _driver, dispatcher) = dispatcher();
        let id = push(&store, "d1", "f1", 1);
        dispatcher.notify(&id);
        dispatcher.shutdown().await;
        dispatcher.shutdown().await;
    }
}
