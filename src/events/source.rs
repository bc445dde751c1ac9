//! The desired-state source: the single gate through which every intent
//! reaches the store.
//!
//! Webhook events, operator requests, the garbage collector's sweep and
//! the promotion coordinator all submit through [`DesiredStateSource`].
//! It applies the intent to the store (which handles generation staleness
//! atomically) and pokes the reconciler for the affected environment via
//! a trigger channel that the dispatcher consumes.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::identity::IdentityResolver;
use crate::store::{ApplyOutcome, StateStore, StoreError};
use crate::types::{
    BranchId, DesiredStateEntry, EnvironmentId, EnvironmentKind, Generation, IntentAction, OwnerId,
    SourceEvent,
};

/// Errors from intent submission.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A manual request for an ephemeral environment the requester does
    /// not own. Shared integration environments are open to everyone.
    #[error("requester {requester} does not own environments for {owner}")]
    OwnershipDenied { requester: String, owner: OwnerId },
}

/// Applies normalized intents and triggers reconciliation.
pub struct DesiredStateSource {
    store: Arc<StateStore>,
    resolver: IdentityResolver,
    triggers: mpsc::UnboundedSender<EnvironmentId>,
}

impl DesiredStateSource {
    /// Creates the source and the trigger stream the dispatcher drains.
    pub fn new(
        store: Arc<StateStore>,
        resolver: IdentityResolver,
    ) -> (Self, mpsc::UnboundedReceiver<EnvironmentId>) {
        let (triggers, rx) = mpsc::unbounded_channel();
        (
            DesiredStateSource {
                store,
                resolver,
                triggers,
            },
            rx,
        )
    }

    /// Submits one intent: ownership check, store apply, reconcile poke.
    ///
    /// Stale intents are discarded here and reported as such, not errors.
    pub fn submit(&self, entry: DesiredStateEntry) -> Result<ApplyOutcome, SourceError> {
        self.check_ownership(&entry)?;
        let outcome = self.store.apply(&entry, &self.resolver)?;
        Ok(self.finish(&entry, outcome))
    }

    /// Submits an intent carrying the pair's next generation, allocated
    /// atomically with the apply. Internally-composed intents use this so
    /// a concurrent intake for the same pair cannot make them stale.
    pub fn submit_with_next_generation(
        &self,
        mut entry: DesiredStateEntry,
    ) -> Result<ApplyOutcome, SourceError> {
        self.check_ownership(&entry)?;
        let outcome = self.store.apply_with_next_generation(&mut entry, &self.resolver)?;
        Ok(self.finish(&entry, outcome))
    }

    /// Convenience for internally-originated destroy intents.
    pub fn submit_destroy(
        &self,
        owner: OwnerId,
        branch: BranchId,
        source: SourceEvent,
    ) -> Result<ApplyOutcome, SourceError> {
        self.submit_with_next_generation(DesiredStateEntry::new(
            owner,
            branch,
            IntentAction::Destroy,
            Generation::default(),
            source,
        ))
    }

    fn check_ownership(&self, entry: &DesiredStateEntry) -> Result<(), SourceError> {
        if let SourceEvent::ManualRequest { requester } = &entry.source {
            let shared = entry.kind != EnvironmentKind::Ephemeral;
            if !shared && requester != entry.owner.as_str() {
                return Err(SourceError::OwnershipDenied {
                    requester: requester.clone(),
                    owner: entry.owner.clone(),
                });
            }
        }
        Ok(())
    }

    fn finish(&self, entry: &DesiredStateEntry, outcome: ApplyOutcome) -> ApplyOutcome {
        info!(
            owner = %entry.owner,
            branch = %entry.branch,
            action = entry.action.name(),
            source = entry.source.name(),
            generation = %entry.generation,
            outcome = ?outcome,
            "Intent applied"
        );

        if let Some(id) = outcome.environment_id() {
            // The dispatcher may already be gone during shutdown.
            if self.triggers.send(id.clone()).is_err() {
                debug!(environment = %id, "Trigger channel closed, skipping poke");
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NamingConfig;
    use crate::types::ArtifactRef;

    fn source() -> (Arc<StateStore>, DesiredStateSource, mpsc::UnboundedReceiver<EnvironmentId>) {
        let store = Arc::new(StateStore::new());
        let (source, rx) =
            DesiredStateSource::new(Arc::clone(&store), IdentityResolver::new(NamingConfig::default()));
        (store, source, rx)
    }

    fn push(owner: &str, branch: &str, generation: u64) -> DesiredStateEntry {
        DesiredStateEntry::new(
            OwnerId::new(owner),
            BranchId::new(branch),
            IntentAction::Create {
                artifact: ArtifactRef::new("app:1"),
            },
            Generation(generation),
            SourceEvent::BranchPush,
        )
    }

    #[test]
    fn accepted_intent_emits_trigger() {
        let (_store, source, mut rx) = source();
        let outcome = source.submit(push("d1", "f1", 1)).unwrap();
        let id = outcome.environment_id().unwrap().clone();
        assert_eq!(rx.try_recv().unwrap(), id);
    }

    #[test]
    fn stale_intent_emits_no_trigger() {
        let (_store, source, mut rx) = source();
        source.submit(push("d1", "f1", 5)).unwrap();
        rx.try_recv().unwrap();

        let outcome = source.submit(push("d1", "f1", 3)).unwrap();
        assert_eq!(outcome, ApplyOutcome::Stale);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn manual_request_for_foreign_ephemeral_is_denied() {
        let (_store, source, _rx) = source();
        let mut entry = push("d1", "f1", 1);
        entry.source = SourceEvent::ManualRequest {
            requester: "mallory".into(),
        };
        match source.submit(entry) {
            Err(SourceError::OwnershipDenied { requester, owner }) => {
                assert_eq!(requester, "mallory");
                assert_eq!(owner, OwnerId::new("d1"));
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn manual_request_for_own_environment_is_accepted() {
        let (_store, source, _rx) = source();
        let mut entry = push("d1", "f1", 1);
        entry.source = SourceEvent::ManualRequest {
            requester: "d1".into(),
        };
        assert!(matches!(source.submit(entry), Ok(ApplyOutcome::Created(_))));
    }

    #[test]
    fn manual_request_for_integration_environment_is_open() {
        let (_store, source, _rx) = source();
        let mut entry = push("team", "main", 1).with_kind(EnvironmentKind::Integration);
        entry.source = SourceEvent::ManualRequest {
            requester: "d1".into(),
        };
        assert!(matches!(source.submit(entry), Ok(ApplyOutcome::Created(_))));
    }

    #[test]
    fn next_generation_submission_outruns_high_water() {
        let (store, source, _rx) = source();
        source.submit(push("d1", "f1", 5)).unwrap();

        let entry = DesiredStateEntry::new(
            OwnerId::new("d1"),
            BranchId::new("f1"),
            IntentAction::Update {
                artifact: ArtifactRef::new("app:2"),
            },
            Generation::default(),
            SourceEvent::SweepTick,
        );
        let outcome = source.submit_with_next_generation(entry).unwrap();
        assert!(matches!(outcome, ApplyOutcome::Updated(_)));
        let env = store.get(outcome.environment_id().unwrap()).unwrap();
        assert_eq!(env.generation, Generation(6));
        assert_eq!(env.desired_artifact, ArtifactRef::new("app:2"));
    }

    #[test]
    fn submit_destroy_uses_next_generation() {
        let (store, source, _rx) = source();
        source.submit(push("d1", "f1", 7)).unwrap();

        let outcome = source
            .submit_destroy(OwnerId::new("d1"), BranchId::new("f1"), SourceEvent::SweepTick)
            .unwrap();
        assert!(matches!(outcome, ApplyOutcome::DestroyRequested(_)));
        let env = store
            .get(outcome.environment_id().unwrap())
            .unwrap();
        assert_eq!(env.generation, Generation(8));
    }
}
