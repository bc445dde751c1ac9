//! Plan execution against the infrastructure driver.
//!
//! The engine owns the side-effecting half of reconciliation: it loads the
//! environment's record, asks the planner for steps, and executes them in
//! order with per-step retry and a driver timeout. Observed handles are
//! persisted to the store after every confirmed step, so a crash resumes
//! from the last confirmed step rather than from scratch.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::ReconcileConfig;
use crate::driver::retry::{retry_with_backoff, RetryConfig, RetryOutcome};
use crate::driver::{
    Applied, DriverError, DriverOp, DriverResponse, InfrastructureDriver, ResourceSpec,
    RevisionHandle, RuleHandle, WorkloadHandle,
};
use crate::identity::IdentityResolver;
use crate::routing::{AllocationError, RoutingAllocator};
use crate::store::{StateStore, StoreError};
use crate::types::{
    Environment, EnvironmentFailure, EnvironmentId, InfrastructureRecord, InvalidTransition,
    LifecycleState, RoutingKey,
};

use super::plan::{plan, PlanKind, ReconcileStep};

/// Errors that indicate broken invariants rather than substrate trouble.
///
/// Substrate failures do not surface here; they are recorded on the
/// environment as a `Failed` lifecycle state.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("unknown environment {0}")]
    UnknownEnvironment(EnvironmentId),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    /// A step ran without the handle a previous step should have produced.
    #[error("inconsistent environment record: missing {0}")]
    MissingHandle(&'static str),
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing to do; no driver call was made.
    Converged,

    /// The environment reached `Running` from a non-running state.
    Provisioned,

    /// A new artifact was rolled out to an already-routed environment.
    Updated,

    /// Teardown completed; the environment is `Destroyed`.
    Destroyed,

    /// A step failed beyond its budget; the environment is `Failed`.
    Failed,

    /// A failed environment's automatic retry budget is exhausted; left
    /// untouched for operator intervention.
    Skipped,
}

struct StepFailure {
    step: ReconcileStep,
    error: DriverError,
}

/// Drives one environment toward its desired state.
pub struct ReconcileEngine<D> {
    store: Arc<StateStore>,
    allocator: Arc<RoutingAllocator>,
    driver: Arc<D>,
    resolver: IdentityResolver,
    config: ReconcileConfig,
    retain_log_sinks: bool,
}

impl<D: InfrastructureDriver> ReconcileEngine<D> {
    pub fn new(
        store: Arc<StateStore>,
        allocator: Arc<RoutingAllocator>,
        driver: Arc<D>,
        resolver: IdentityResolver,
        config: ReconcileConfig,
        retain_log_sinks: bool,
    ) -> Self {
        ReconcileEngine {
            store,
            allocator,
            driver,
            resolver,
            config,
            retain_log_sinks,
        }
    }

    /// Runs one reconciliation pass for an environment.
    ///
    /// Idempotent: a converged environment results in zero driver calls.
    pub async fn reconcile(&self, id: &EnvironmentId) -> Result<ReconcileOutcome, ReconcileError> {
        let env = self
            .store
            .get(id)
            .ok_or_else(|| ReconcileError::UnknownEnvironment(id.clone()))?;

        if env.is_terminal() {
            return Ok(ReconcileOutcome::Converged);
        }

        if env.lifecycle == LifecycleState::Failed
            && env.retry_count >= self.config.max_failed_retries
        {
            warn!(
                environment = %id,
                retry_count = env.retry_count,
                "Retry budget exhausted, awaiting operator intervention"
            );
            return Ok(ReconcileOutcome::Skipped);
        }

        let plan = plan(&env, self.retain_log_sinks);
        match plan.kind {
            PlanKind::Converged => Ok(ReconcileOutcome::Converged),
            PlanKind::Teardown => self.run_teardown(&env, &plan.steps).await,
            PlanKind::Provision => self.run_provision(&env, &plan.steps, true).await,
            PlanKind::Update => self.run_update(&env).await,
        }
    }

    async fn run_provision(
        &self,
        env: &Environment,
        steps: &[ReconcileStep],
        allow_rederive: bool,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if env.lifecycle != LifecycleState::Provisioning {
            self.persist_transition(&env.id, LifecycleState::Provisioning)?;
        }

        let mut record = env.observed.clone().unwrap_or_default();
        let mut routing_key = env.routing_key;
        let mut created_this_pass: Vec<ReconcileStep> = Vec::new();

        for step in steps {
            let result = self
                .run_provision_step(env, *step, &mut record, &mut routing_key)
                .await?;
            if let Err(error) = result {
                self.rollback_provision(env, &mut record, &mut routing_key, &created_this_pass)
                    .await;
                if allow_rederive && matches!(error, DriverError::Conflict(_)) {
                    if let Some(outcome) =
                        self.retry_under_fresh_identity(env, &record, routing_key).await?
                    {
                        return Ok(outcome);
                    }
                }
                return self.record_failure(&env.id, *step, error, record, routing_key);
            }
            created_this_pass.push(*step);
            self.persist_observed(&env.id, &record, routing_key);
        }

        record.artifact = Some(env.desired_artifact.clone());
        self.persist_observed(&env.id, &record, routing_key);
        self.persist_transition(&env.id, LifecycleState::Running)?;
        self.store.update(&env.id, |env| {
            env.failure = None;
            env.retry_count = 0;
            env.touch();
        });
        info!(environment = %env.id, artifact = %env.desired_artifact, "Environment running");
        Ok(ReconcileOutcome::Provisioned)
    }

    /// Executes one provisioning step. The outer `Result` carries broken
    /// invariants; the inner one carries substrate failures.
    async fn run_provision_step(
        &self,
        env: &Environment,
        step: ReconcileStep,
        record: &mut InfrastructureRecord,
        routing_key: &mut Option<RoutingKey>,
    ) -> Result<Result<(), DriverError>, ReconcileError> {
        match step {
            ReconcileStep::AllocateRoutingKey => {
                *routing_key = Some(self.allocator.allocate(&env.id)?);
                Ok(Ok(()))
            }
            ReconcileStep::RegisterRevision => {
                let op = DriverOp::RegisterRevision {
                    environment: env.id.clone(),
                    artifact: env.desired_artifact.clone(),
                };
                Ok(self.call_driver(&env.id, step, op).await.map(|applied| {
                    if let DriverResponse::Revision(handle) = applied.into_response() {
                        record.revision = Some(handle.0);
                    }
                }))
            }
            ReconcileStep::CreateWorkload => {
                let revision = record
                    .revision
                    .clone()
                    .ok_or(ReconcileError::MissingHandle("revision"))?;
                let op = DriverOp::CreateOrUpdateWorkload {
                    environment: env.id.clone(),
                    revision: RevisionHandle(revision),
                    spec: ResourceSpec::default(),
                };
                Ok(self.call_driver(&env.id, step, op).await.map(|applied| {
                    if let DriverResponse::Workload(handle) = applied.into_response() {
                        record.workload = Some(handle.0);
                    }
                }))
            }
            ReconcileStep::CreateRoutingRule => {
                let key = routing_key.ok_or(ReconcileError::MissingHandle("routing key"))?;
                let workload = record
                    .workload
                    .clone()
                    .ok_or(ReconcileError::MissingHandle("workload"))?;
                let op = DriverOp::CreateRoutingRule {
                    environment: env.id.clone(),
                    key,
                    workload: WorkloadHandle(workload),
                };
                Ok(self.call_driver(&env.id, step, op).await.map(|applied| {
                    if let DriverResponse::Rule(handle) = applied.into_response() {
                        record.routing_rule = Some(handle.0);
                    }
                }))
            }
            ReconcileStep::EnsureLogSink => {
                let op = DriverOp::EnsureLogSink {
                    environment: env.id.clone(),
                };
                Ok(self.call_driver(&env.id, step, op).await.map(|applied| {
                    if let DriverResponse::LogSink(handle) = applied.into_response() {
                        record.log_sink = Some(handle.0);
                    }
                }))
            }
            _ => Err(ReconcileError::MissingHandle("provision step")),
        }
    }

    /// Best-effort rollback of resources created during a failed
    /// provisioning pass, in reverse creation order. Deletion failures
    /// leave the handle on the record so nothing becomes unreachable.
    async fn rollback_provision(
        &self,
        env: &Environment,
        record: &mut InfrastructureRecord,
        routing_key: &mut Option<RoutingKey>,
        created_this_pass: &[ReconcileStep],
    ) {
        if created_this_pass.contains(&ReconcileStep::CreateRoutingRule) {
            if let Some(rule) = record.routing_rule.clone() {
                let op = DriverOp::DeleteRoutingRule {
                    rule: RuleHandle(rule),
                };
                match self.call_driver(&env.id, ReconcileStep::DeleteRoutingRule, op).await {
                    Ok(_) => record.routing_rule = None,
                    Err(error) => {
                        warn!(environment = %env.id, error = %error, "Rollback left routing rule behind")
                    }
                }
            }
        }

        if created_this_pass.contains(&ReconcileStep::CreateWorkload) {
            if let Some(workload) = record.workload.clone() {
                let op = DriverOp::DeleteWorkload {
                    workload: WorkloadHandle(workload),
                };
                match self.call_driver(&env.id, ReconcileStep::DeleteWorkload, op).await {
                    Ok(_) => record.workload = None,
                    Err(error) => {
                        warn!(environment = %env.id, error = %error, "Rollback left workload behind")
                    }
                }
            }
        }

        if created_this_pass.contains(&ReconcileStep::AllocateRoutingKey) {
            if let Some(key) = routing_key.take() {
                self.release_key(&env.id, key);
            }
        }
    }

    /// Moves the environment to a re-derived identity after the substrate
    /// reported a name conflict, then provisions once more under the new
    /// name. Runs after rollback, so no resources from the failed pass are
    /// left behind under the old identity.
    ///
    /// `None` means re-derivation itself failed and the original conflict
    /// should be recorded as the failure.
    async fn retry_under_fresh_identity(
        &self,
        env: &Environment,
        record: &InfrastructureRecord,
        routing_key: Option<RoutingKey>,
    ) -> Result<Option<ReconcileOutcome>, ReconcileError> {
        let new_id = match self.store.rederive_identity(&env.id, &self.resolver) {
            Ok(Some(new_id)) => new_id,
            Ok(None) => return Err(ReconcileError::UnknownEnvironment(env.id.clone())),
            Err(StoreError::Identity(error)) => {
                warn!(environment = %env.id, error = %error, "Identity re-derivation failed");
                return Ok(None);
            }
        };
        self.persist_observed(&new_id, record, routing_key);
        let renamed = self
            .store
            .get(&new_id)
            .ok_or_else(|| ReconcileError::UnknownEnvironment(new_id.clone()))?;
        let plan = plan(&renamed, self.retain_log_sinks);
        // A second conflict under the re-derived name fails fast.
        Box::pin(self.run_provision(&renamed, &plan.steps, false))
            .await
            .map(Some)
    }

    async fn run_update(&self, env: &Environment) -> Result<ReconcileOutcome, ReconcileError> {
        // A failed rollout retries through the provisioning retry path;
        // a running environment updates in place.
        let transitioning = if env.lifecycle == LifecycleState::Failed {
            LifecycleState::Provisioning
        } else {
            LifecycleState::Updating
        };
        if env.lifecycle != transitioning {
            self.persist_transition(&env.id, transitioning)?;
        }

        let mut record = env.observed.clone().unwrap_or_default();

        let register = DriverOp::RegisterRevision {
            environment: env.id.clone(),
            artifact: env.desired_artifact.clone(),
        };
        match self
            .call_driver(&env.id, ReconcileStep::RegisterRevision, register)
            .await
        {
            Ok(applied) => {
                if let DriverResponse::Revision(handle) = applied.into_response() {
                    record.revision = Some(handle.0);
                }
            }
            Err(error) => {
                return self.record_failure(
                    &env.id,
                    ReconcileStep::RegisterRevision,
                    error,
                    record,
                    env.routing_key,
                )
            }
        }
        self.persist_observed(&env.id, &record, env.routing_key);

        let revision = record
            .revision
            .clone()
            .ok_or(ReconcileError::MissingHandle("revision"))?;
        let rollout = DriverOp::CreateOrUpdateWorkload {
            environment: env.id.clone(),
            revision: RevisionHandle(revision),
            spec: ResourceSpec::default(),
        };
        match self
            .call_driver(&env.id, ReconcileStep::CreateWorkload, rollout)
            .await
        {
            Ok(applied) => {
                if let DriverResponse::Workload(handle) = applied.into_response() {
                    record.workload = Some(handle.0);
                }
            }
            Err(error) => {
                // Routing stays bound to the old workload; no rollback.
                return self.record_failure(
                    &env.id,
                    ReconcileStep::CreateWorkload,
                    error,
                    record,
                    env.routing_key,
                );
            }
        }

        record.artifact = Some(env.desired_artifact.clone());
        self.persist_observed(&env.id, &record, env.routing_key);
        self.persist_transition(&env.id, LifecycleState::Running)?;
        self.store.update(&env.id, |env| {
            env.failure = None;
            env.retry_count = 0;
            env.touch();
        });
        info!(environment = %env.id, artifact = %env.desired_artifact, "Rollout complete");
        Ok(ReconcileOutcome::Updated)
    }

    async fn run_teardown(
        &self,
        env: &Environment,
        steps: &[ReconcileStep],
    ) -> Result<ReconcileOutcome, ReconcileError> {
        // An interrupted provision drains via Failed; everything else
        // drains directly.
        if env.lifecycle == LifecycleState::Provisioning {
            self.persist_transition(&env.id, LifecycleState::Failed)?;
        }
        if env.lifecycle != LifecycleState::Draining {
            self.persist_transition(&env.id, LifecycleState::Draining)?;
        }

        let mut record = env.observed.clone().unwrap_or_default();
        let mut routing_key = env.routing_key;

        for step in steps {
            let result = match step {
                ReconcileStep::DeleteRoutingRule => {
                    let rule = record
                        .routing_rule
                        .clone()
                        .ok_or(ReconcileError::MissingHandle("routing rule"))?;
                    let op = DriverOp::DeleteRoutingRule {
                        rule: RuleHandle(rule),
                    };
                    self.call_driver(&env.id, *step, op)
                        .await
                        .map(|_| record.routing_rule = None)
                }
                ReconcileStep::DeleteWorkload => {
                    let workload = record
                        .workload
                        .clone()
                        .ok_or(ReconcileError::MissingHandle("workload"))?;
                    let op = DriverOp::DeleteWorkload {
                        workload: WorkloadHandle(workload),
                    };
                    self.call_driver(&env.id, *step, op).await.map(|_| {
                        record.workload = None;
                        record.revision = None;
                    })
                }
                ReconcileStep::ReleaseRoutingKey => {
                    // Only reached once the routing rule is confirmed gone.
                    if let Some(key) = routing_key.take() {
                        self.release_key(&env.id, key);
                    }
                    Ok(())
                }
                ReconcileStep::DeleteLogSink => {
                    let sink = record
                        .log_sink
                        .clone()
                        .ok_or(ReconcileError::MissingHandle("log sink"))?;
                    let op = DriverOp::DeleteLogSink {
                        sink: crate::driver::LogSinkHandle(sink),
                    };
                    self.call_driver(&env.id, *step, op)
                        .await
                        .map(|_| record.log_sink = None)
                }
                _ => return Err(ReconcileError::MissingHandle("teardown step")),
            };

            if let Err(error) = result {
                return self.record_failure(&env.id, *step, error, record, routing_key);
            }
            self.persist_observed(&env.id, &record, routing_key);
        }

        self.persist_observed(&env.id, &record, routing_key);

        // An accepted create/update may have landed while the teardown
        // steps ran. The destroy flag and the terminal transition are
        // checked in one store critical section, so such an intent is
        // never lost to a pass that was already draining.
        let superseded = self
            .store
            .update(&env.id, |env| -> Result<bool, InvalidTransition> {
                if env.destroy_requested {
                    env.transition_to(LifecycleState::Destroyed)?;
                    env.touch();
                    Ok(false)
                } else {
                    env.transition_to(LifecycleState::Failed)?;
                    env.touch();
                    Ok(true)
                }
            })
            .ok_or_else(|| ReconcileError::UnknownEnvironment(env.id.clone()))??;

        if superseded {
            info!(environment = %env.id, "Teardown superseded by a fresh intent, re-provisioning");
            let revived = self
                .store
                .get(&env.id)
                .ok_or_else(|| ReconcileError::UnknownEnvironment(env.id.clone()))?;
            let plan = plan(&revived, self.retain_log_sinks);
            return match plan.kind {
                PlanKind::Provision => self.run_provision(&revived, &plan.steps, true).await,
                _ => Ok(ReconcileOutcome::Converged),
            };
        }

        info!(environment = %env.id, "Environment destroyed");
        Ok(ReconcileOutcome::Destroyed)
    }

    /// One driver call with bounded retries. Each attempt is capped by the
    /// driver timeout; a timeout counts as a transient outcome. Every
    /// attempt emits a structured record.
    async fn call_driver(
        &self,
        id: &EnvironmentId,
        step: ReconcileStep,
        op: DriverOp,
    ) -> Result<Applied, DriverError> {
        let retry = RetryConfig::from(&self.config);
        let timeout = self.config.driver_timeout;
        let driver = &self.driver;

        let outcome = retry_with_backoff(retry, |attempt| {
            let op = op.clone();
            async move {
                let started = Instant::now();
                let result = match tokio::time::timeout(timeout, driver.execute(op)).await {
                    Ok(result) => result,
                    Err(_) => Err(DriverError::Transient(format!(
                        "driver call timed out after {timeout:?}"
                    ))),
                };
                let duration_ms = started.elapsed().as_millis() as u64;
                match &result {
                    Ok(applied) => info!(
                        environment = %id,
                        action = step.name(),
                        outcome = applied.outcome(),
                        duration_ms,
                        attempt,
                        "Driver step"
                    ),
                    Err(error) => warn!(
                        environment = %id,
                        action = step.name(),
                        outcome = error.outcome(),
                        duration_ms,
                        attempt,
                        error = %error,
                        "Driver step failed"
                    ),
                }
                result
            }
        })
        .await;

        match outcome {
            RetryOutcome::Success { applied, .. } => Ok(applied),
            RetryOutcome::Exhausted { last_error, .. } => Err(last_error),
            RetryOutcome::Fatal { error, .. } => Err(error),
        }
    }

    fn record_failure(
        &self,
        id: &EnvironmentId,
        step: ReconcileStep,
        error: DriverError,
        record: InfrastructureRecord,
        routing_key: Option<RoutingKey>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let failure =
            EnvironmentFailure::new(error.outcome(), error.to_string()).with_step(step.name());
        self.store
            .update(id, |env| {
                env.observed = Some(record);
                env.routing_key = routing_key;
                env.retry_count += 1;
                env.fail(failure);
            })
            .ok_or_else(|| ReconcileError::UnknownEnvironment(id.clone()))?;
        Ok(ReconcileOutcome::Failed)
    }

    fn persist_observed(
        &self,
        id: &EnvironmentId,
        record: &InfrastructureRecord,
        routing_key: Option<RoutingKey>,
    ) {
        self.store.update(id, |env| {
            env.observed = Some(record.clone());
            env.routing_key = routing_key;
        });
    }

    fn persist_transition(
        &self,
        id: &EnvironmentId,
        target: LifecycleState,
    ) -> Result<(), ReconcileError> {
        let from = self
            .store
            .update(id, |env| {
                let from = env.lifecycle;
                env.transition_to(target).map(|()| from)
            })
            .ok_or_else(|| ReconcileError::UnknownEnvironment(id.clone()))??;
        info!(environment = %id, from = from.name(), to = target.name(), "Lifecycle transition");
        Ok(())
    }

    fn release_key(&self, id: &EnvironmentId, key: RoutingKey) {
        match self.allocator.release(key) {
            Ok(()) => {}
            // Recovery can leave the allocator unaware of the key; the
            // pool is already consistent in that case.
            Err(AllocationError::NotAllocated(_)) => {
                warn!(environment = %id, key = %key, "Released key the allocator did not hold")
            }
            Err(error) => warn!(environment = %id, key = %key, error = %error, "Key release failed"),
        }
        self.store.update(id, |env| env.routing_key = None);
    }
}
