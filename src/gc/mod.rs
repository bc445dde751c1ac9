//! Idle-environment reclamation.
//!
//! The collector sweeps on a fixed interval and emits ordinary destroy
//! intents for ephemeral environments that have been inactive past the
//! idle threshold. Reclamation goes through the same desired-state source
//! as every other intent, so generation ordering and reconciler
//! serialization apply unchanged.
//!
//! Exemptions, checked in this order: non-ephemeral kinds, the configured
//! exclusion tag, environments already being destroyed, and environments
//! mid-transition (provisioning or draining).

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::GcConfig;
use crate::events::{DesiredStateSource, SourceError};
use crate::store::StateStore;
use crate::types::{Environment, EnvironmentId, EnvironmentKind, SourceEvent};

/// Outcome of one sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Environments examined.
    pub examined: usize,

    /// Destroy intents emitted (or, in dry-run mode, that would have
    /// been).
    pub reclaimed: Vec<EnvironmentId>,

    /// Idle candidates skipped by an exemption.
    pub exempt: usize,
}

/// Reclaims idle ephemeral environments.
pub struct GarbageCollector {
    store: Arc<StateStore>,
    source: Arc<DesiredStateSource>,
    config: GcConfig,
}

impl GarbageCollector {
    pub fn new(store: Arc<StateStore>, source: Arc<DesiredStateSource>, config: GcConfig) -> Self {
        GarbageCollector {
            store,
            source,
            config,
        }
    }

    /// Runs the sweep loop until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.sweep();
                    info!(
                        examined = report.examined,
                        reclaimed = report.reclaimed.len(),
                        exempt = report.exempt,
                        dry_run = self.config.dry_run,
                        "Sweep finished"
                    );
                }
            }
        }
    }

    /// One pass over the store.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let cutoff = Utc::now()
            - TimeDelta::from_std(self.config.idle_threshold)
                .unwrap_or_else(|_| TimeDelta::try_hours(48).unwrap_or(TimeDelta::zero()));

        for env in self.store.list() {
            if env.is_terminal() || env.destroy_requested {
                continue;
            }
            report.examined += 1;

            if env.last_activity_at >= cutoff {
                continue;
            }
            if let Some(reason) = self.exemption(&env) {
                info!(environment = %env.id, reason, "Idle environment exempt from reclamation");
                report.exempt += 1;
                continue;
            }

            if self.config.dry_run {
                info!(
                    environment = %env.id,
                    idle_since = %env.last_activity_at,
                    "Dry run: would reclaim"
                );
                report.reclaimed.push(env.id);
                continue;
            }

            match self
                .source
                .submit_destroy(env.owner.clone(), env.branch.clone(), SourceEvent::SweepTick)
            {
                Ok(_) => {
                    info!(environment = %env.id, idle_since = %env.last_activity_at, "Reclaiming idle environment");
                    report.reclaimed.push(env.id);
                }
                Err(SourceError::Store(error)) => {
                    warn!(environment = %env.id, error = %error, "Reclamation intent rejected");
                }
                Err(error) => {
                    warn!(environment = %env.id, error = %error, "Reclamation intent denied");
                }
            }
        }

        report
    }

    fn exemption(&self, env: &Environment) -> Option<&'static str> {
        if env.kind != EnvironmentKind::Ephemeral {
            return Some("non-ephemeral kind");
        }
        if env.owner_tags.contains_key(&self.config.exclusion_tag) {
            return Some("exclusion tag");
        }
        if env.lifecycle.is_transitioning() {
            return Some("transition in flight");
        }
        None
    }
}
