//! The infrastructure driver boundary.
//!
//! The orchestrator never talks to the compute/routing/registry substrate
//! directly. It issues abstract operations-as-data through the
//! [`InfrastructureDriver`] trait and trusts the implementation to fulfil
//! them. Every operation is idempotent on the substrate side and reports
//! one of five outcomes: ok, already satisfied, conflict, transient
//! failure, permanent failure.
//!
//! The trait-based seam enables mock drivers for testing and logging
//! drivers for dry runs.

pub mod retry;

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ArtifactRef, EnvironmentId, RoutingKey};

/// Opaque handle to a registered revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionHandle(pub String);

/// Opaque handle to a running workload/service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadHandle(pub String);

/// Opaque handle to a routing rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleHandle(pub String);

/// Opaque handle to a log sink.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogSinkHandle(pub String);

/// Resource sizing passed through to the substrate unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu_milli: u32,
    pub memory_mib: u32,
    pub replicas: u32,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        ResourceSpec {
            cpu_milli: 500,
            memory_mib: 512,
            replicas: 1,
        }
    }
}

/// One abstract substrate operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DriverOp {
    RegisterRevision {
        environment: EnvironmentId,
        artifact: ArtifactRef,
    },
    CreateOrUpdateWorkload {
        environment: EnvironmentId,
        revision: RevisionHandle,
        spec: ResourceSpec,
    },
    DeleteWorkload {
        workload: WorkloadHandle,
    },
    CreateRoutingRule {
        environment: EnvironmentId,
        key: RoutingKey,
        workload: WorkloadHandle,
    },
    DeleteRoutingRule {
        rule: RuleHandle,
    },
    EnsureLogSink {
        environment: EnvironmentId,
    },
    DeleteLogSink {
        sink: LogSinkHandle,
    },
}

impl DriverOp {
    /// Stable operation name for structured logging.
    pub fn name(&self) -> &'static str {
        match self {
            DriverOp::RegisterRevision { .. } => "register_revision",
            DriverOp::CreateOrUpdateWorkload { .. } => "create_or_update_workload",
            DriverOp::DeleteWorkload { .. } => "delete_workload",
            DriverOp::CreateRoutingRule { .. } => "create_routing_rule",
            DriverOp::DeleteRoutingRule { .. } => "delete_routing_rule",
            DriverOp::EnsureLogSink { .. } => "ensure_log_sink",
            DriverOp::DeleteLogSink { .. } => "delete_log_sink",
        }
    }
}

/// Successful response payloads, matched to the operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverResponse {
    Revision(RevisionHandle),
    Workload(WorkloadHandle),
    Rule(RuleHandle),
    LogSink(LogSinkHandle),
    Deleted,
}

/// Success flavor: freshly applied vs. found already in place.
///
/// `AlreadySatisfied` is what makes re-running a plan after a crash safe;
/// the reconciler treats both as success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Ok(DriverResponse),
    AlreadySatisfied(DriverResponse),
}

impl Applied {
    pub fn response(&self) -> &DriverResponse {
        match self {
            Applied::Ok(r) | Applied::AlreadySatisfied(r) => r,
        }
    }

    pub fn into_response(self) -> DriverResponse {
        match self {
            Applied::Ok(r) | Applied::AlreadySatisfied(r) => r,
        }
    }

    /// Outcome label for structured logging.
    pub fn outcome(&self) -> &'static str {
        match self {
            Applied::Ok(_) => "ok",
            Applied::AlreadySatisfied(_) => "already_satisfied",
        }
    }
}

/// Failure outcomes from the substrate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// Network/timeout/rate-limit; retried with backoff.
    #[error("transient infrastructure failure: {0}")]
    Transient(String),

    /// Name or key already in use by something the store did not expect.
    #[error("substrate conflict: {0}")]
    Conflict(String),

    /// The substrate rejected the operation outright.
    #[error("permanent infrastructure failure: {0}")]
    Permanent(String),
}

impl DriverError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::Transient(_))
    }

    /// Outcome label for structured logging.
    pub fn outcome(&self) -> &'static str {
        match self {
            DriverError::Transient(_) => "transient_failure",
            DriverError::Conflict(_) => "conflict",
            DriverError::Permanent(_) => "permanent_failure",
        }
    }
}

/// Result of a single driver call.
pub type DriverResult = Result<Applied, DriverError>;

/// Executes abstract operations against the actual substrate.
///
/// All operations must be idempotent: re-issuing a call after a crash must
/// yield `AlreadySatisfied` rather than a duplicate resource.
pub trait InfrastructureDriver: Send + Sync {
    /// Execute one operation and report its outcome.
    fn execute(&self, op: DriverOp) -> impl Future<Output = DriverResult> + Send;
}

/// Driver that logs operations and reports success without touching any
/// substrate. Used for dry runs and as a wiring default in tests.
#[derive(Debug, Clone, Default)]
pub struct LoggingDriver;

impl InfrastructureDriver for LoggingDriver {
    async fn execute(&self, op: DriverOp) -> DriverResult {
        tracing::info!(op = op.name(), detail = ?op, "dry-run driver call");
        let response = match &op {
            DriverOp::RegisterRevision { environment, artifact } => {
                DriverResponse::Revision(RevisionHandle(format!("rev/{environment}/{artifact}")))
            }
            DriverOp::CreateOrUpdateWorkload { environment, .. } => {
                DriverResponse::Workload(WorkloadHandle(format!("wl/{environment}")))
            }
            DriverOp::CreateRoutingRule { environment, key, .. } => {
                DriverResponse::Rule(RuleHandle(format!("rule/{environment}/{key}")))
            }
            DriverOp::EnsureLogSink { environment } => {
                DriverResponse::LogSink(LogSinkHandle(format!("logs/{environment}")))
            }
            DriverOp::DeleteWorkload { .. }
            | DriverOp::DeleteRoutingRule { .. }
            | DriverOp::DeleteLogSink { .. } => DriverResponse::Deleted,
        };
        Ok(Applied::Ok(response))
    }
}
