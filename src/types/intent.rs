//! Desired-state intents.
//!
//! Every external event is normalized into a `DesiredStateEntry` before it
//! can mutate the state store. Intents carry a per-pair generation so that
//! out-of-order delivery can be detected and discarded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::environment::EnvironmentKind;
use super::ids::{ArtifactRef, BranchId, Generation, OwnerId};

/// What the intent asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum IntentAction {
    /// Bring an environment into existence for this artifact.
    Create { artifact: ArtifactRef },

    /// Roll the environment to a new artifact; routing untouched.
    Update { artifact: ArtifactRef },

    /// Tear the environment down.
    Destroy,
}

impl IntentAction {
    /// Returns the action name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            IntentAction::Create { .. } => "create",
            IntentAction::Update { .. } => "update",
            IntentAction::Destroy => "destroy",
        }
    }

    /// The artifact carried by create/update intents.
    pub fn artifact(&self) -> Option<&ArtifactRef> {
        match self {
            IntentAction::Create { artifact } | IntentAction::Update { artifact } => Some(artifact),
            IntentAction::Destroy => None,
        }
    }
}

/// Where an intent originated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SourceEvent {
    /// A branch was pushed.
    BranchPush,

    /// A branch was deleted or merged.
    BranchRemoved,

    /// An operator asked for it explicitly. The requester was already
    /// checked against the environment's owner at normalization time.
    ManualRequest { requester: String },

    /// The garbage collector's scheduled sweep decided the environment
    /// is idle.
    SweepTick,
}

impl SourceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SourceEvent::BranchPush => "branch_push",
            SourceEvent::BranchRemoved => "branch_removed",
            SourceEvent::ManualRequest { .. } => "manual_request",
            SourceEvent::SweepTick => "sweep_tick",
        }
    }
}

/// A normalized desired-state mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredStateEntry {
    pub owner: OwnerId,
    pub branch: BranchId,
    pub action: IntentAction,

    /// Monotonically increasing per `(owner, branch)`; lower-than-recorded
    /// generations are discarded as stale.
    pub generation: Generation,

    pub source: SourceEvent,
    pub timestamp: DateTime<Utc>,

    /// Kind assigned when the intent creates a new environment; ignored
    /// for updates of existing ones.
    #[serde(default = "default_kind")]
    pub kind: EnvironmentKind,
}

fn default_kind() -> EnvironmentKind {
    EnvironmentKind::Ephemeral
}

impl DesiredStateEntry {
    pub fn new(
        owner: OwnerId,
        branch: BranchId,
        action: IntentAction,
        generation: Generation,
        source: SourceEvent,
    ) -> Self {
        DesiredStateEntry {
            owner,
            branch,
            action,
            generation,
            source,
            timestamp: Utc::now(),
            kind: EnvironmentKind::Ephemeral,
        }
    }

    pub fn with_kind(mut self, kind: EnvironmentKind) -> Self {
        self.kind = kind;
        self
    }
}
