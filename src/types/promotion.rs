//! Promotion records.
//!
//! A promotion merges one or more ephemeral environments' artifacts into a
//! shared integration environment. At most one record is in flight per
//! target at a time; the coordinator enforces that.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ArtifactRef, EnvironmentId};

/// Progress of a promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionState {
    /// The composed update intent has been submitted; reconciliation of
    /// the target is pending or underway.
    InFlight,

    /// The target converged on the merged artifact.
    Completed,

    /// The composed intent could not be submitted when the promotion's
    /// turn came; the merge never reached the target.
    Failed,
}

/// Links a set of source environments to one integration target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionRecord {
    /// Source environments whose artifacts were merged, in request order.
    pub sources: Vec<EnvironmentId>,

    /// The integration environment receiving the merge.
    pub target: EnvironmentId,

    /// The artifact refs that were merged, aligned with `sources`.
    pub merged_artifacts: Vec<ArtifactRef>,

    /// Composite ref submitted as the target's desired artifact.
    pub merged_ref: ArtifactRef,

    pub state: PromotionState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PromotionRecord {
    pub fn new(
        sources: Vec<EnvironmentId>,
        target: EnvironmentId,
        merged_artifacts: Vec<ArtifactRef>,
    ) -> Self {
        let merged_ref = ArtifactRef::merged(&merged_artifacts);
        PromotionRecord {
            sources,
            target,
            merged_artifacts,
            merged_ref,
            state: PromotionState::InFlight,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Marks the promotion finished.
    pub fn complete(&mut self) {
        self.state = PromotionState::Completed;
        self.completed_at = Some(Utc::now());
    }

    /// Marks the promotion as never having started.
    pub fn fail(&mut self) {
        self.state = PromotionState::Failed;
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_is_in_flight() {
        let record = PromotionRecord::new(
            vec![EnvironmentId::new("d1-f1"), EnvironmentId::new("d2-f3")],
            EnvironmentId::new("integration"),
            vec![ArtifactRef::new("a:1"), ArtifactRef::new("b:2")],
        );
        assert_eq!(record.state, PromotionState::InFlight);
        assert_eq!(record.merged_ref, ArtifactRef::new("a:1+b:2"));
        assert!(record.completed_at.is_none());
    }

    #[test]
    fn complete_sets_state_and_timestamp() {
        let mut record = PromotionRecord::new(
            vec![EnvironmentId::new("d1-f1")],
            EnvironmentId::new("integration"),
            vec![ArtifactRef::new("a:1")],
        );
        record.complete();
        assert_eq!(record.state, PromotionState::Completed);
        assert!(record.completed_at.is_some());
    }
}
