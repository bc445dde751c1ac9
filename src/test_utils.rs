//! Shared test doubles.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::driver::{
    Applied, DriverError, DriverOp, DriverResponse, DriverResult, InfrastructureDriver,
    LogSinkHandle, RevisionHandle, RuleHandle, WorkloadHandle,
};

/// Scriptable in-memory driver that records every call.
///
/// Failures are queued per operation name and consumed in order; once the
/// queue for an operation is empty, calls succeed with fabricated handles.
#[derive(Debug, Default)]
pub(crate) struct FakeDriver {
    calls: Mutex<Vec<DriverOp>>,
    failures: Mutex<HashMap<&'static str, VecDeque<DriverError>>>,
}

impl FakeDriver {
    pub(crate) fn new() -> Self {
        FakeDriver::default()
    }

    /// Queues a failure for the next call of the named operation.
    pub(crate) fn fail_next(&self, op: &'static str, error: DriverError) {
        self.failures
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .push_back(error);
    }

    pub(crate) fn call_names(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().iter().map(DriverOp::name).collect()
    }

    pub(crate) fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl InfrastructureDriver for FakeDriver {
    async fn execute(&self, op: DriverOp) -> DriverResult {
        self.calls.lock().unwrap().push(op.clone());

        if let Some(queue) = self.failures.lock().unwrap().get_mut(op.name()) {
            if let Some(error) = queue.pop_front() {
                return Err(error);
            }
        }

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
