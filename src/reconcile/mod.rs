//! The reconciler: converges each environment's observed substrate state
//! toward its desired state, one environment at a time.

pub mod dispatch;
pub mod engine;
pub mod plan;
pub mod worker;

pub use dispatch::ReconcileDispatcher;
pub use engine::{ReconcileEngine, ReconcileError, ReconcileOutcome};
pub use plan::{plan, PlanKind, ReconcilePlan, ReconcileStep};
