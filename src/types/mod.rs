//! Core domain types for the orchestrator.

pub mod environment;
pub mod ids;
pub mod intent;
pub mod promotion;

pub use environment::{
    Environment, EnvironmentFailure, EnvironmentKind, InfrastructureRecord, InvalidTransition,
    LifecycleState,
};
pub use ids::{ArtifactRef, BranchId, EnvironmentId, Generation, OwnerId, RoutingKey};
pub use intent::{DesiredStateEntry, IntentAction, SourceEvent};
pub use promotion::{PromotionRecord, PromotionState};
