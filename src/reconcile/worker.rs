//! Per-environment reconciliation workers.
//!
//! Every environment gets its own worker task with a small poke channel.
//! All reconciliation passes for one environment run on its worker, which
//! serializes them without any per-environment locking. The channel
//! coalesces: a poke arriving while one is already queued is dropped,
//! because the queued pass will observe the latest desired state anyway.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::driver::InfrastructureDriver;
use crate::types::EnvironmentId;

use super::engine::{ReconcileEngine, ReconcileOutcome};

/// Capacity 1 gives at-most-one-pending-pass coalescing.
const POKE_CAPACITY: usize = 1;

/// Handle to a spawned worker, owned by the dispatcher.
pub(crate) struct WorkerHandle {
    pub(crate) tx: mpsc::Sender<()>,
    pub(crate) task: JoinHandle<()>,
}

/// Spawns the worker task for one environment.
pub(crate) fn spawn_worker<D>(
    engine: Arc<ReconcileEngine<D>>,
    budget: Arc<Semaphore>,
    cancel: CancellationToken,
    id: EnvironmentId,
) -> WorkerHandle
where
    D: InfrastructureDriver + 'static,
{
    let (tx, rx) = mpsc::channel(POKE_CAPACITY);
    let task = tokio::spawn(worker_loop(engine, budget, cancel, id, rx));
    WorkerHandle { tx, task }
}

async fn worker_loop<D>(
    engine: Arc<ReconcileEngine<D>>,
    budget: Arc<Semaphore>,
    cancel: CancellationToken,
    id: EnvironmentId,
    mut rx: mpsc::Receiver<()>,
) where
    D: InfrastructureDriver + 'static,
{
    debug!(environment = %id, "Worker started");
    loop {
        let poked = tokio::select! {
            _ = cancel.cancelled() => break,
            message = rx.recv() => message,
        };
        if poked.is_none() {
            break;
        }

        // The budget bounds concurrent passes across all environments.
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = budget.acquire() => permit,
        };
        let _permit = match permit {
            Ok(permit) => permit,
            // Semaphore closed: shutting down.
            Err(_) => break,
        };

        match engine.reconcile(&id).await {
            Ok(ReconcileOutcome::Destroyed) => {
                debug!(environment = %id, "Worker retiring after teardown");
                break;
            }
            Ok(outcome) => {
                debug!(environment = %id, outcome = ?outcome, "Reconcile pass finished");
            }
            Err(error) => {
                warn!(environment = %id, error = %error, "Reconcile pass aborted");
            }
        }
    }
    debug!(environment = %id, "Worker stopped");
}
