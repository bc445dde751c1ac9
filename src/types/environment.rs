//! The environment entity and its lifecycle state machine.
//!
//! An environment is one owner/branch-scoped deployment unit. Its lifecycle
//! proceeds strictly through the states below; the reconciler is the only
//! component that advances it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ids::{ArtifactRef, BranchId, EnvironmentId, Generation, OwnerId, RoutingKey};

/// What role an environment plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentKind {
    /// Per-branch preview environment, reclaimed when idle.
    Ephemeral,

    /// Shared integration environment, promotion target.
    Integration,

    /// Long-lived environment exempt from reclamation.
    Stable,
}

/// Lifecycle state of an environment.
///
/// Transitions are validated by [`LifecycleState::can_transition_to`];
/// no state is ever skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Intent accepted, no substrate resources yet.
    Pending,

    /// Routing key reserved, creation steps in flight.
    Provisioning,

    /// All creation steps confirmed.
    Running,

    /// New artifact ref being rolled out; routing untouched.
    Updating,

    /// Teardown in flight.
    Draining,

    /// Terminal. Routing key returned to the pool on entry.
    Destroyed,

    /// A step failed beyond its retry budget. Retryable by a fresh intent.
    Failed,
}

impl LifecycleState {
    /// Returns true for states with no further reconciler-driven progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Destroyed)
    }

    /// Returns true while a multi-step substrate mutation is in flight.
    ///
    /// The garbage collector must never target an environment in one of
    /// these states.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, LifecycleState::Provisioning | LifecycleState::Draining)
    }

    /// Validates a single lifecycle transition.
    ///
    /// Valid transitions:
    /// - Pending -> Provisioning | Draining (destroyed before first provision)
    /// - Provisioning -> Running | Failed
    /// - Running -> Updating | Draining
    /// - Updating -> Running | Draining | Failed
    /// - Draining -> Destroyed | Failed
    /// - Failed -> Provisioning | Draining (retry paths)
    pub fn can_transition_to(&self, target: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, target),
            (Pending, Provisioning)
                | (Pending, Draining)
                | (Provisioning, Running)
                | (Provisioning, Failed)
                | (Running, Updating)
                | (Running, Draining)
                | (Updating, Running)
                | (Updating, Draining)
                | (Updating, Failed)
                | (Draining, Destroyed)
                | (Draining, Failed)
                | (Failed, Provisioning)
                | (Failed, Draining)
        )
    }

    /// Returns the state name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Provisioning => "provisioning",
            LifecycleState::Running => "running",
            LifecycleState::Updating => "updating",
            LifecycleState::Draining => "draining",
            LifecycleState::Destroyed => "destroyed",
            LifecycleState::Failed => "failed",
        }
    }
}

/// Error returned when a lifecycle transition is invalid.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid lifecycle transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

/// Opaque substrate handles owned by exactly one environment.
///
/// Handles are deleted in a fixed safe order (routing rule, then workload)
/// before the owning environment reaches `Destroyed`. Never shared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfrastructureRecord {
    /// Revision registered for the currently observed artifact.
    pub revision: Option<String>,

    /// Running workload/service handle.
    pub workload: Option<String>,

    /// Routing rule handle binding the routing key to the workload.
    pub routing_rule: Option<String>,

    /// Log sink handle; may outlive teardown per retention policy.
    pub log_sink: Option<String>,

    /// Artifact ref the handles above were created for.
    pub artifact: Option<ArtifactRef>,
}

impl InfrastructureRecord {
    /// True when no substrate resource (other than a retained log sink)
    /// remains.
    pub fn is_torn_down(&self) -> bool {
        self.revision.is_none() && self.workload.is_none() && self.routing_rule.is_none()
    }
}

/// The error recorded when an environment lands in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentFailure {
    /// Stable error category ("transient_exhausted", "conflict", ...).
    pub kind: String,

    /// Human-readable message for operator inspection.
    pub message: String,

    /// Which provisioning/teardown step failed, if known.
    pub failed_step: Option<String>,

    /// When the failure was recorded.
    pub at: DateTime<Utc>,
}

impl EnvironmentFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        EnvironmentFailure {
            kind: kind.into(),
            message: message.into(),
            failed_step: None,
            at: Utc::now(),
        }
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.failed_step = Some(step.into());
        self
    }
}

/// One owner/branch-scoped deployment unit managed by the orchestrator.
///
/// IMPORTANT: `id` is stable for the environment's lifetime. At most one
/// non-terminal environment exists per `(owner, branch)` pair; the state
/// store enforces this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    /// Canonical identity derived from `(owner, branch)`.
    pub id: EnvironmentId,

    pub owner: OwnerId,
    pub branch: BranchId,
    pub kind: EnvironmentKind,

    pub lifecycle: LifecycleState,

    /// Artifact the environment should converge to.
    pub desired_artifact: ArtifactRef,

    /// Generation of the last intent applied to the desired state.
    pub generation: Generation,

    /// Unique routing token; None until provisioning reserves one.
    pub routing_key: Option<RoutingKey>,

    pub created_at: DateTime<Utc>,

    /// Updated on every matching event (push, manual ping). The garbage
    /// collector keys its idle decision off this.
    pub last_activity_at: DateTime<Utc>,

    /// Access-scoping tags. A configured marker tag exempts the
    /// environment from garbage collection.
    pub owner_tags: BTreeMap<String, String>,

    /// Last-known substrate configuration, absent before first provision.
    pub observed: Option<InfrastructureRecord>,

    /// Teardown requested; reconciled as a drain regardless of artifact.
    pub destroy_requested: bool,

    /// Populated when `lifecycle` is `Failed`.
    pub failure: Option<EnvironmentFailure>,

    /// Automatic retries consumed from the current `Failed` state.
    pub retry_count: u32,
}

impl Environment {
    /// Creates a pending environment for an accepted `create` intent.
    pub fn new(
        id: EnvironmentId,
        owner: OwnerId,
        branch: BranchId,
        kind: EnvironmentKind,
        desired_artifact: ArtifactRef,
        generation: Generation,
    ) -> Self {
        let now = Utc::now();
        Environment {
            id,
            owner,
            branch,
            kind,
            lifecycle: LifecycleState::Pending,
            desired_artifact,
            generation,
            routing_key: None,
            created_at: now,
            last_activity_at: now,
            owner_tags: BTreeMap::new(),
            observed: None,
            destroy_requested: false,
            failure: None,
            retry_count: 0,
        }
    }

    /// Advances the lifecycle, rejecting skipped states.
    pub fn transition_to(&mut self, target: LifecycleState) -> Result<(), InvalidTransition> {
        if !self.lifecycle.can_transition_to(target) {
            return Err(InvalidTransition {
                from: self.lifecycle,
                to: target,
            });
        }
        self.lifecycle = target;
        Ok(())
    }

    /// Records a terminal-unless-retried failure.
    pub fn fail(&mut self, failure: EnvironmentFailure) {
        self.lifecycle = LifecycleState::Failed;
        self.failure = Some(failure);
    }

    /// Refreshes the activity timestamp.
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// True once the environment has reached its terminal state.
    pub fn is_terminal(&self) -> bool {
        self.lifecycle.is_terminal()
    }

    /// Observed state matches desired state: nothing for the reconciler
    /// to do.
    pub fn is_converged(&self) -> bool {
        if self.destroy_requested {
            return self.lifecycle == LifecycleState::Destroyed;
        }
        match (&self.observed, self.lifecycle) {
            (Some(observed), LifecycleState::Running) => {
                observed.artifact.as_ref() == Some(&self.desired_artifact)
            }
            _ => false,
        }
    }
}
