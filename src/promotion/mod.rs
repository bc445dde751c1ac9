//! Promotion of branch artifacts into shared integration environments.
//!
//! A promotion composes the artifacts of one or more source environments
//! into a single merged ref and submits it as an ordinary update intent
//! for the target. At most one promotion is in flight per target; further
//! requests queue FIFO up to a configured depth and are refused beyond it.
//! Completion is detected by watching the target converge on the merged
//! ref, at which point the next queued request starts.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::PromotionConfig;
use crate::events::{DesiredStateSource, SourceError};
use crate::store::StateStore;
use crate::types::{
    BranchId, DesiredStateEntry, EnvironmentId, EnvironmentKind, Generation, IntentAction,
    OwnerId, PromotionRecord, PromotionState, SourceEvent,
};

/// How often the completion watcher polls the store.
const WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// How many completed records are kept per target for inspection.
const HISTORY_LIMIT: usize = 50;

/// Errors from promotion requests.
#[derive(Debug, Error)]
pub enum PromotionError {
    /// The per-target queue is full.
    #[error("promotion queue for {owner}/{branch} is full")]
    Busy { owner: OwnerId, branch: BranchId },

    /// A request with no sources is meaningless.
    #[error("promotion request has no sources")]
    NoSources,

    /// A named source has no live environment.
    #[error("no live environment for source {owner}/{branch}")]
    UnknownSource { owner: OwnerId, branch: BranchId },

    #[error(transparent)]
    Source(#[from] SourceError),
}

/// One promotion request as submitted by an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionRequest {
    /// Who asked; recorded on the resulting intent.
    pub requester: String,

    /// Source pairs whose artifacts are merged, in this order.
    pub sources: Vec<(OwnerId, BranchId)>,

    /// The integration environment's pair.
    pub target: (OwnerId, BranchId),
}

/// Where a request ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestDisposition {
    /// The composed intent was submitted immediately.
    Started(PromotionRecord),

    /// Queued behind the in-flight promotion; position is 1-based.
    Queued { position: usize },
}

/// A request whose record was built at submission time, waiting its turn.
///
/// Artifacts are captured when the request arrives, so later pushes to a
/// source branch do not change what a queued promotion rolls out.
#[derive(Debug, Clone)]
struct QueuedPromotion {
    record: PromotionRecord,
    requester: String,
    target: (OwnerId, BranchId),
}

#[derive(Debug, Default)]
struct TargetQueue {
    in_flight: Option<PromotionRecord>,
    pending: VecDeque<QueuedPromotion>,
    history: VecDeque<PromotionRecord>,
}

/// Point-in-time view of one target's promotion state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetStatus {
    pub in_flight: Option<PromotionRecord>,
    pub queued: usize,
    pub history: Vec<PromotionRecord>,
}

/// Serializes promotions per integration target.
pub struct PromotionCoordinator {
    store: Arc<StateStore>,
    source: Arc<DesiredStateSource>,
    config: PromotionConfig,
    targets: Mutex<HashMap<(OwnerId, BranchId), TargetQueue>>,
}

impl PromotionCoordinator {
    pub fn new(
        store: Arc<StateStore>,
        source: Arc<DesiredStateSource>,
        config: PromotionConfig,
    ) -> Self {
        PromotionCoordinator {
            store,
            source,
            config,
            targets: Mutex::new(HashMap::new()),
        }
    }

    /// Submits a promotion request.
    pub fn request(&self, request: PromotionRequest) -> Result<RequestDisposition, PromotionError> {
        if request.sources.is_empty() {
            return Err(PromotionError::NoSources);
        }
        let record = self.build_record(&request)?;

        let mut targets = self.lock_targets();
        let queue = targets.entry(request.target.clone()).or_default();

        if queue.in_flight.is_none() {
            self.submit_intent(&request.target, &request.requester, &record)?;
            queue.in_flight = Some(record.clone());
            return Ok(RequestDisposition::Started(record));
        }

        if queue.pending.len() >= self.config.max_queue_depth {
            return Err(PromotionError::Busy {
                owner: request.target.0,
                branch: request.target.1,
            });
        }
        queue.pending.push_back(QueuedPromotion {
            record,
            requester: request.requester,
            target: request.target,
        });
        Ok(RequestDisposition::Queued {
            position: queue.pending.len(),
        })
    }

    /// Marks the in-flight promotion for a target complete and starts the
    /// next queued one, if any. Returns the completed record.
    pub fn complete(&self, target: &(OwnerId, BranchId)) -> Option<PromotionRecord> {
        let mut targets = self.lock_targets();
        let queue = targets.get_mut(target)?;
        let mut record = queue.in_flight.take()?;
        record.complete();
        info!(
            target = %record.target,
            merged_ref = %record.merged_ref,
            "Promotion complete"
        );
        queue.history.push_front(record.clone());
        queue.history.truncate(HISTORY_LIMIT);

        while let Some(mut next) = queue.pending.pop_front() {
            match self.submit_intent(&next.target, &next.requester, &next.record) {
                Ok(()) => {
                    queue.in_flight = Some(next.record);
                    break;
                }
                Err(error) => {
                    // The requester was told "queued"; the failure has to
                    // stay visible through the status endpoint.
                    warn!(error = %error, "Queued promotion failed to start");
                    next.record.fail();
                    queue.history.push_front(next.record);
                    queue.history.truncate(HISTORY_LIMIT);
                }
            }
        }
        Some(record)
    }

    /// Current state of one target's queue.
    pub fn status(&self, target: &(OwnerId, BranchId)) -> TargetStatus {
        let targets = self.lock_targets();
        match targets.get(target) {
            Some(queue) => TargetStatus {
                in_flight: queue.in_flight.clone(),
                queued: queue.pending.len(),
                history: queue.history.iter().cloned().collect(),
            },
            None => TargetStatus {
                in_flight: None,
                queued: 0,
                history: Vec::new(),
            },
        }
    }

    /// Watches in-flight promotions and completes them once their target
    /// converges on the merged ref. Runs until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(WATCH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for target in self.converged_targets() {
                        self.complete(&target);
                    }
                }
            }
        }
    }

    fn converged_targets(&self) -> Vec<(OwnerId, BranchId)> {
        let targets = self.lock_targets();
        targets
            .iter()
            .filter_map(|(pair, queue)| {
                let record = queue.in_flight.as_ref()?;
                let env = self.store.live_for_pair(&pair.0, &pair.1)?;
                let done = env.is_converged() && env.desired_artifact == record.merged_ref;
                done.then(|| pair.clone())
            })
            .collect()
    }

    /// Captures source artifacts and identities for a request.
    fn build_record(&self, request: &PromotionRequest) -> Result<PromotionRecord, PromotionError> {
        let mut ids = Vec::with_capacity(request.sources.len());
        let mut artifacts = Vec::with_capacity(request.sources.len());
        for (owner, branch) in &request.sources {
            let env = self.store.live_for_pair(owner, branch).ok_or_else(|| {
                PromotionError::UnknownSource {
                    owner: owner.clone(),
                    branch: branch.clone(),
                }
            })?;
            ids.push(env.id);
            artifacts.push(env.desired_artifact);
        }

        let target_id = self
            .store
            .live_for_pair(&request.target.0, &request.target.1)
            .map(|env| env.id)
            // The composed intent creates the target if it does not exist
            // yet; until then the record carries the pair's plain join.
            .unwrap_or_else(|| {
                EnvironmentId::new(format!("{}-{}", request.target.0, request.target.1))
            });

        Ok(PromotionRecord::new(ids, target_id, artifacts))
    }

    /// Submits the composed update intent for a record.
    ///
    /// The generation is allocated atomically with the apply, so a branch
    /// push for the target pair landing alongside the promotion cannot
    /// render the composed intent stale.
    fn submit_intent(
        &self,
        target: &(OwnerId, BranchId),
        requester: &str,
        record: &PromotionRecord,
    ) -> Result<(), PromotionError> {
        let entry = DesiredStateEntry::new(
            target.0.clone(),
            target.1.clone(),
            IntentAction::Update {
                artifact: record.merged_ref.clone(),
            },
            Generation::default(),
            SourceEvent::ManualRequest {
                requester: requester.to_string(),
            },
        )
        .with_kind(EnvironmentKind::Integration);
        self.source.submit_with_next_generation(entry)?;

        info!(
            target = %record.target,
            sources = record.sources.len(),
            merged_ref = %record.merged_ref,
            "Promotion started"
        );
        debug_assert_eq!(record.state, PromotionState::InFlight);
        Ok(())
    }

    fn lock_targets(&self) -> MutexGuard<'_, HashMap<(OwnerId, BranchId), TargetQueue>> {
        self.targets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NamingConfig;
    use crate::identity::IdentityResolver;
    use crate::types::{ArtifactRef, Generation};

    fn setup(max_queue_depth: usize) -> (Arc<StateStore>, PromotionCoordinator) {
        let store = Arc::new(StateStore::new());
        let (source, _rx) = DesiredStateSource::new(
            Arc::clone(&store),
            IdentityResolver::new(NamingConfig::default()),
        );
        let coordinator = PromotionCoordinator::new(
            Arc::clone(&store),
            Arc::new(source),
            PromotionConfig { max_queue_depth },
        );
        (store, coordinator)
    }

    fn push(store: &StateStore, owner: &str, branch: &str, artifact: &str) {
        let resolver = IdentityResolver::new(NamingConfig::default());
        let entry = DesiredStateEntry::new(
            OwnerId::new(owner),
            BranchId::new(branch),
            IntentAction::Create {
                artifact: ArtifactRef::new(artifact),
            },
            Generation(1),
            SourceEvent::BranchPush,
        );
        store.apply(&entry, &resolver).unwrap();
    }

    fn request(sources: &[(&str, &str)], target: (&str, &str)) -> PromotionRequest {
        PromotionRequest {
            requester: "release-bot".into(),
            sources: sources
                .iter()
                .map(|(o, b)| (OwnerId::new(*o), BranchId::new(*b)))
                .collect(),
            target: (OwnerId::new(target.0), BranchId::new(target.1)),
        }
    }

    #[test]
    fn merged_ref_preserves_request_order() {
        let (store, coordinator) = setup(4);
        push(&store, "d1", "f1", "app:1");
        push(&store, "d2", "f3", "app:2");

        let disposition = coordinator
            .request(request(&[("d2", "f3"), ("d1", "f1")], ("team", "integration")))
            .unwrap();
        match disposition {
            RequestDisposition::Started(record) => {
                assert_eq!(record.merged_ref, ArtifactRef::new("app:2+app:1"));
            }
            other => panic!("expected start, got {other:?}"),
        }
    }

    #[test]
    fn promotion_submits_update_intent_to_target() {
        let (store, coordinator) = setup(4);
        push(&store, "d1", "f1", "app:1");

        coordinator
            .request(request(&[("d1", "f1")], ("team", "integration")))
            .unwrap();

        let target = store
            .live_for_pair(&OwnerId::new("team"), &BranchId::new("integration"))
            .unwrap();
        assert_eq!(target.kind, EnvironmentKind::Integration);
        assert_eq!(target.desired_artifact, ArtifactRef::new("app:1"));
    }

    #[test]
    fn second_request_queues_fifo() {
        let (store, coordinator) = setup(4);
        push(&store, "d1", "f1", "app:1");
        push(&store, "d2", "f3", "app:2");
        let target = ("team", "integration");

        let first = coordinator
            .request(request(&[("d1", "f1")], target))
            .unwrap();
        assert!(matches!(first, RequestDisposition::Started(_)));

        let second = coordinator
            .request(request(&[("d2", "f3")], target))
            .unwrap();
        assert_eq!(second, RequestDisposition::Queued { position: 1 });

        // Completing the first starts the second, in order.
        let pair = (OwnerId::new("team"), BranchId::new("integration"));
        let completed = coordinator.complete(&pair).unwrap();
        assert_eq!(completed.state, PromotionState::Completed);

        let status = coordinator.status(&pair);
        let in_flight = status.in_flight.unwrap();
        assert_eq!(in_flight.merged_ref, ArtifactRef::new("app:2"));
        assert_eq!(status.queued, 0);
        assert_eq!(status.history.len(), 1);
    }

    #[test]
    fn queue_overflow_is_refused() {
        let (store, coordinator) = setup(1);
        push(&store, "d1", "f1", "app:1");
        let target = ("team", "integration");

        coordinator.request(request(&[("d1", "f1")], target)).unwrap();
        coordinator.request(request(&[("d1", "f1")], target)).unwrap();
        let refused = coordinator.request(request(&[("d1", "f1")], target));
        assert!(matches!(refused, Err(PromotionError::Busy { .. })));
    }

    #[test]
    fn unknown_source_is_rejected() {
        let (_store, coordinator) = setup(4);
        let result = coordinator.request(request(&[("ghost", "branch")], ("team", "integration")));
        assert!(matches!(result, Err(PromotionError::UnknownSource { .. })));
    }

    #[test]
    fn empty_sources_are_rejected() {
        let (_store, coordinator) = setup(4);
        let result = coordinator.request(request(&[], ("team", "integration")));
        assert!(matches!(result, Err(PromotionError::NoSources)));
    }

    #[test]
    fn source_artifacts_are_captured_at_request_time() {
        let (store, coordinator) = setup(4);
        push(&store, "d1", "f1", "app:1");
        push(&store, "d2", "f3", "app:2");
        let target = ("team", "integration");

        coordinator.request(request(&[("d1", "f1")], target)).unwrap();
        coordinator.request(request(&[("d2", "f3")], target)).unwrap();

        // The source branch moves on while its promotion sits queued.
        let resolver = IdentityResolver::new(NamingConfig::default());
        let entry = DesiredStateEntry::new(
            OwnerId::new("d2"),
            BranchId::new("f3"),
            IntentAction::Update {
                artifact: ArtifactRef::new("app:99"),
            },
            Generation(2),
            SourceEvent::BranchPush,
        );
        store.apply(&entry, &resolver).unwrap();

        let pair = (OwnerId::new("team"), BranchId::new("integration"));
        coordinator.complete(&pair);
        let started = coordinator.status(&pair).in_flight.unwrap();
        assert_eq!(started.merged_ref, ArtifactRef::new("app:2"));
    }

    #[test]
    fn failed_queued_promotion_lands_in_history() {
        use crate::store::PersistedState;
        use crate::types::{Environment, LifecycleState};

        // A target whose owner cannot survive identity resolution; the
        // seeded environment is reachable only while it stays live.
        let target_env = Environment::new(
            EnvironmentId::new("team-x"),
            OwnerId::new("---"),
            BranchId::new("x"),
            EnvironmentKind::Integration,
            ArtifactRef::new("app:0"),
            Generation(1),
        );
        let store = Arc::new(StateStore::from_snapshot(PersistedState::new(
            vec![target_env],
            Vec::new(),
        )));
        let (source, _rx) = DesiredStateSource::new(
            Arc::clone(&store),
            IdentityResolver::new(NamingConfig::default()),
        );
        let coordinator = PromotionCoordinator::new(
            Arc::clone(&store),
            Arc::new(source),
            PromotionConfig { max_queue_depth: 4 },
        );
        push(&store, "d1", "f1", "app:1");

        let target = ("---", "x");
        let first = coordinator.request(request(&[("d1", "f1")], target)).unwrap();
        assert!(matches!(first, RequestDisposition::Started(_)));
        let second = coordinator.request(request(&[("d1", "f1")], target)).unwrap();
        assert!(matches!(second, RequestDisposition::Queued { .. }));

        // The target disappears while the second request waits its turn;
        // re-creating it would need identity resolution, which the owner
        // cannot pass.
        store.update(&EnvironmentId::new("team-x"), |env| {
            env.lifecycle = LifecycleState::Destroyed;
        });

        let pair = (OwnerId::new("---"), BranchId::new("x"));
        coordinator.complete(&pair).unwrap();

        // The queued promotion could not start; its failure is on record
        // rather than silently dropped.
        let status = coordinator.status(&pair);
        assert!(status.in_flight.is_none());
        assert_eq!(status.queued, 0);
        assert_eq!(status.history.len(), 2);
        assert_eq!(status.history[0].state, PromotionState::Failed);
        assert_eq!(status.history[1].state, PromotionState::Completed);
    }

    #[test]
    fn independent_targets_promote_concurrently() {
        let (store, coordinator) = setup(4);
        push(&store, "d1", "f1", "app:1");

        let a = coordinator
            .request(request(&[("d1", "f1")], ("team-a", "integration")))
            .unwrap();
        let b = coordinator
            .request(request(&[("d1", "f1")], ("team-b", "integration")))
            .unwrap();
        assert!(matches!(a, RequestDisposition::Started(_)));
        assert!(matches!(b, RequestDisposition::Started(_)));
    }
}
