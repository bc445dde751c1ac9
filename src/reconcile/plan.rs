//! Pure reconciliation planning.
//!
//! The planner computes a minimal ordered step list from an environment's
//! desired and observed state. It never touches the substrate, the
//! allocator, or the store, which makes the idempotence property directly
//! testable: a converged environment yields an empty plan.

use crate::types::{Environment, LifecycleState};

/// One step of a reconciliation plan.
///
/// Routing-key steps are local (allocator) operations; the rest map 1:1
/// onto driver operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileStep {
    AllocateRoutingKey,
    RegisterRevision,
    CreateWorkload,
    CreateRoutingRule,
    EnsureLogSink,
    DeleteRoutingRule,
    DeleteWorkload,
    DeleteLogSink,
    ReleaseRoutingKey,
}

impl ReconcileStep {
    /// Stable step name for structured logging.
    pub fn name(&self) -> &'static str {
        match self {
            ReconcileStep::AllocateRoutingKey => "allocate_routing_key",
            ReconcileStep::RegisterRevision => "register_revision",
            ReconcileStep::CreateWorkload => "create_workload",
            ReconcileStep::CreateRoutingRule => "create_routing_rule",
            ReconcileStep::EnsureLogSink => "ensure_log_sink",
            ReconcileStep::DeleteRoutingRule => "delete_routing_rule",
            ReconcileStep::DeleteWorkload => "delete_workload",
            ReconcileStep::DeleteLogSink => "delete_log_sink",
            ReconcileStep::ReleaseRoutingKey => "release_routing_key",
        }
    }
}

/// What kind of convergence the plan performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    /// Nothing to do; observed equals desired.
    Converged,

    /// Full creation sequence (or resumption of one).
    Provision,

    /// Artifact rollout; routing key and rule untouched.
    Update,

    /// Teardown in the fixed safe order.
    Teardown,
}

/// An ordered action plan for one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub kind: PlanKind,
    pub steps: Vec<ReconcileStep>,
}

impl ReconcilePlan {
    fn converged() -> Self {
        ReconcilePlan {
            kind: PlanKind::Converged,
            steps: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Computes the minimal ordered plan for an environment.
///
/// `retain_log_sinks` governs whether teardown deletes the log sink or
/// leaves it for audit.
pub fn plan(env: &Environment, retain_log_sinks: bool) -> ReconcilePlan {
    if env.lifecycle == LifecycleState::Destroyed {
        return ReconcilePlan::converged();
    }

    if env.destroy_requested {
        return teardown_plan(env, retain_log_sinks);
    }

    if env.is_converged() {
        return ReconcilePlan::converged();
    }

    let observed = env.observed.clone().unwrap_or_default();
    let routed = observed.routing_rule.is_some() && env.routing_key.is_some();

    // A routed workload that only differs in artifact is an in-place
    // update; anything less complete resumes the provisioning sequence.
    if routed && observed.workload.is_some() {
        return ReconcilePlan {
            kind: PlanKind::Update,
            steps: vec![ReconcileStep::RegisterRevision, ReconcileStep::CreateWorkload],
        };
    }

    let mut steps = Vec::new();
    if env.routing_key.is_none() {
        steps.push(ReconcileStep::AllocateRoutingKey);
    }
    if observed.revision.is_none() || observed.artifact.as_ref() != Some(&env.desired_artifact) {
        steps.push(ReconcileStep::RegisterRevision);
    }
    steps.push(ReconcileStep::CreateWorkload);
    if observed.routing_rule.is_none() {
        steps.push(ReconcileStep::CreateRoutingRule);
    }
    if observed.log_sink.is_none() {
        steps.push(ReconcileStep::EnsureLogSink);
    }
    ReconcilePlan {
        kind: PlanKind::Provision,
        steps,
    }
}

/// Teardown order is strict: routing rule first (stop traffic), then the
/// workload, then the key back to the pool; the log sink last, and only
/// when retention does not keep it.
fn teardown_plan(env: &Environment, retain_log_sinks: bool) -> ReconcilePlan {
    let observed = env.observed.clone().unwrap_or_default();
    let mut steps = Vec::new();

    if observed.routing_rule.is_some() {
        steps.push(ReconcileStep::DeleteRoutingRule);
    }
    if observed.workload.is_some() {
        steps.push(ReconcileStep::DeleteWorkload);
    }
    if env.routing_key.is_some() {
        steps.push(ReconcileStep::ReleaseRoutingKey);
    }
    if observed.log_sink.is_some() && !retain_log_sinks {
        steps.push(ReconcileStep::DeleteLogSink);
    }

    ReconcilePlan {
        kind: PlanKind::Teardown,
        steps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        ArtifactRef, BranchId, Environment, EnvironmentId, EnvironmentKind, Generation,
        InfrastructureRecord, OwnerId, RoutingKey,
    };

    fn fresh_env() -> Environment {
        Environment::new(
            EnvironmentId::new("d1-f1"),
            OwnerId::new("d1"),
            BranchId::new("f1"),
            EnvironmentKind::Ephemeral,
            ArtifactRef::new("app:1"),
            Generation(1),
        )
    }

    fn running_env() -> Environment {
        let mut env = fresh_env();
        env.lifecycle = LifecycleState::Running;
        env.routing_key = Some(RoutingKey(100));
        env.observed = Some(InfrastructureRecord {
            revision: Some("rev/1".into()),
            workload: Some("wl/1".into()),
            routing_rule: Some("rule/1".into()),
            log_sink: Some("logs/1".into()),
            artifact: Some(ArtifactRef::new("app:1")),
        });
        env
    }

    #[test]
    fn fresh_environment_plans_full_provision() {
        let plan = plan(&fresh_env(), true);
        assert_eq!(plan.kind, PlanKind::Provision);
        assert_eq!(
            plan.steps,
            vec![
                ReconcileStep::AllocateRoutingKey,
                ReconcileStep::RegisterRevision,
                ReconcileStep::CreateWorkload,
                ReconcileStep::CreateRoutingRule,
                ReconcileStep::EnsureLogSink,
            ]
        );
    }

    #[test]
    fn converged_environment_plans_nothing() {
        let plan = plan(&running_env(), true);
        assert_eq!(plan.kind, PlanKind::Converged);
        assert!(plan.is_empty());
    }

    #[test]
    fn artifact_change_plans_update_without_routing() {
        let mut env = running_env();
        env.desired_artifact = ArtifactRef::new("app:2");
        let plan = plan(&env, true);
        assert_eq!(plan.kind, PlanKind::Update);
        assert_eq!(
            plan.steps,
            vec![ReconcileStep::RegisterRevision, ReconcileStep::CreateWorkload]
        );
        assert!(!plan.steps.contains(&ReconcileStep::CreateRoutingRule));
        assert!(!plan.steps.contains(&ReconcileStep::ReleaseRoutingKey));
    }

    #[test]
    fn destroy_plans_teardown_in_safe_order() {
        let mut env = running_env();
        env.destroy_requested = true;
        let plan = plan(&env, true);
        assert_eq!(plan.kind, PlanKind::Teardown);
        assert_eq!(
            plan.steps,
            vec![
                ReconcileStep::DeleteRoutingRule,
                ReconcileStep::DeleteWorkload,
                ReconcileStep::ReleaseRoutingKey,
            ]
        );
    }

    #[test]
    fn teardown_deletes_log_sink_when_not_retained() {
        let mut env = running_env();
        env.destroy_requested = true;
        let plan = plan(&env, false);
        assert_eq!(
            plan.steps.last(),
            Some(&ReconcileStep::DeleteLogSink)
        );
    }

    #[test]
    fn destroy_of_pending_environment_is_empty_teardown() {
        let mut env = fresh_env();
        env.destroy_requested = true;
        let plan = plan(&env, true);
        assert_eq!(plan.kind, PlanKind::Teardown);
        assert!(plan.is_empty());
    }

    #[test]
    fn partially_provisioned_environment_resumes_missing_steps() {
        // Crash after workload creation: rule and sink missing.
        let mut env = fresh_env();
        env.lifecycle = LifecycleState::Failed;
        env.routing_key = Some(RoutingKey(100));
        env.observed = Some(InfrastructureRecord {
            revision: Some("rev/1".into()),
            workload: Some("wl/1".into()),
            routing_rule: None,
            log_sink: None,
            artifact: Some(ArtifactRef::new("app:1")),
        });

        let plan = plan(&env, true);
        assert_eq!(plan.kind, PlanKind::Provision);
        assert_eq!(
            plan.steps,
            vec![
                ReconcileStep::CreateWorkload,
                ReconcileStep::CreateRoutingRule,
                ReconcileStep::EnsureLogSink,
            ]
        );
    }

    #[test]
    fn destroyed_environment_plans_nothing() {
        let mut env = running_env();
        env.lifecycle = LifecycleState::Destroyed;
        env.destroy_requested = true;
        let plan = plan(&env, true);
        assert!(plan.is_empty());
        assert_eq!(plan.kind, PlanKind::Converged);
    }
}
