//! The state store: single source of truth for desired and observed state.
//!
//! Every known environment lives here. All mutations of a given
//! environment's record are funnelled through its per-identity reconciler
//! worker; the store itself only guards its maps with one mutex and keeps
//! the structural invariants:
//!
//! 1. At most one non-terminal environment per `(owner, branch)` pair.
//! 2. Per-pair generations are a strictly increasing high-water mark;
//!    stale intents are rejected here, atomically with the lookup.
//!
//! Destroyed environments are retained for an audit window and pruned
//! afterwards.

pub mod snapshot;

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{TimeDelta, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::identity::{IdentityError, IdentityResolver};
use crate::types::{
    BranchId, DesiredStateEntry, Environment, EnvironmentId, Generation, IntentAction, OwnerId,
    RoutingKey,
};

pub use snapshot::{load_snapshot, save_snapshot_atomic, PersistedState, SnapshotError};

/// Errors from applying intents.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Identity derivation failed; the intent is surfaced, not dropped.
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// What applying an intent did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new environment was created in `Pending`.
    Created(EnvironmentId),

    /// An existing environment's desired artifact changed.
    Updated(EnvironmentId),

    /// Teardown was requested for an existing environment.
    DestroyRequested(EnvironmentId),

    /// The intent's generation was at or below the recorded high-water
    /// mark and was discarded.
    Stale,

    /// Destroy for a pair with no live environment; nothing to do.
    NoOp,
}

impl ApplyOutcome {
    /// The environment the reconciler should now look at, if any.
    pub fn environment_id(&self) -> Option<&EnvironmentId> {
        match self {
            ApplyOutcome::Created(id)
            | ApplyOutcome::Updated(id)
            | ApplyOutcome::DestroyRequested(id) => Some(id),
            ApplyOutcome::Stale | ApplyOutcome::NoOp => None,
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    environments: HashMap<EnvironmentId, Environment>,

    /// Non-terminal environment per pair. Entries are removed when the
    /// environment reaches `Destroyed`.
    live_by_pair: HashMap<(OwnerId, BranchId), EnvironmentId>,

    /// Highest generation accepted per pair.
    generations: HashMap<(OwnerId, BranchId), Generation>,
}

/// Durable record of every known environment.
#[derive(Debug, Default)]
pub struct StateStore {
    state: Mutex<StoreState>,
}

impl StateStore {
    pub fn new() -> Self {
        StateStore::default()
    }

    /// Restores a store from a loaded snapshot.
    pub fn from_snapshot(snapshot: PersistedState) -> Self {
        let mut state = StoreState {
            environments: HashMap::new(),
            live_by_pair: HashMap::new(),
            generations: snapshot
                .generations
                .into_iter()
                .map(|(pair, generation)| ((pair.owner, pair.branch), generation))
                .collect(),
        };
        for env in snapshot.environments {
            if !env.is_terminal() {
                state
                    .live_by_pair
                    .insert((env.owner.clone(), env.branch.clone()), env.id.clone());
            }
            state.environments.insert(env.id.clone(), env);
        }
        StateStore {
            state: Mutex::new(state),
        }
    }

    /// Captures the store for snapshot persistence.
    pub fn to_snapshot(&self) -> PersistedState {
        let state = self.lock();
        PersistedState::new(
            state.environments.values().cloned().collect(),
            state
                .generations
                .iter()
                .map(|((owner, branch), generation)| {
                    (snapshot::PairKey::new(owner.clone(), branch.clone()), *generation)
                })
                .collect(),
        )
    }

    /// Applies a desired-state intent.
    ///
    /// Stale generations are discarded atomically with the high-water
    /// check. A `create` for a pair that already has a live environment
    /// becomes an update (never a duplicate create); an `update` for a
    /// pair with none becomes a create.
    pub fn apply(
        &self,
        entry: &DesiredStateEntry,
        resolver: &IdentityResolver,
    ) -> Result<ApplyOutcome, StoreError> {
        let mut state = self.lock();
        Self::apply_locked(&mut state, entry, resolver)
    }

    /// Allocates the pair's next generation and applies the intent under
    /// one lock. Intents composed from internal state (garbage collector,
    /// promotion coordinator) go through here, so a concurrent intake for
    /// the same pair can never make them stale.
    ///
    /// The entry's generation is overwritten with the allocated one.
    pub fn apply_with_next_generation(
        &self,
        entry: &mut DesiredStateEntry,
        resolver: &IdentityResolver,
    ) -> Result<ApplyOutcome, StoreError> {
        let mut state = self.lock();
        let pair = (entry.owner.clone(), entry.branch.clone());
        entry.generation = state
            .generations
            .get(&pair)
            .copied()
            .unwrap_or_default()
            .next();
        Self::apply_locked(&mut state, entry, resolver)
    }

    fn apply_locked(
        state: &mut StoreState,
        entry: &DesiredStateEntry,
        resolver: &IdentityResolver,
    ) -> Result<ApplyOutcome, StoreError> {
        let pair = (entry.owner.clone(), entry.branch.clone());

        if let Some(high_water) = state.generations.get(&pair) {
            if entry.generation <= *high_water {
                debug!(
                    owner = %entry.owner,
                    branch = %entry.branch,
                    generation = %entry.generation,
                    high_water = %high_water,
                    "Discarding stale intent"
                );
                return Ok(ApplyOutcome::Stale);
            }
        }

        let live = state
            .live_by_pair
            .get(&pair)
            .filter(|id| state.environments.contains_key(id))
            .cloned();
        let outcome = match (&entry.action, live) {
            (IntentAction::Create { artifact } | IntentAction::Update { artifact }, Some(id)) => {
                if let Some(env) = state.environments.get_mut(&id) {
                    env.desired_artifact = artifact.clone();
                    env.generation = entry.generation;
                    env.destroy_requested = false;
                    // A fresh intent grants a fresh automatic retry budget.
                    env.retry_count = 0;
                    env.touch();
                }
                ApplyOutcome::Updated(id)
            }
            (IntentAction::Create { artifact } | IntentAction::Update { artifact }, None) => {
                let id = resolver.resolve(&entry.owner, &entry.branch, |candidate| {
                    state
                        .environments
                        .get(candidate)
                        .filter(|env| !env.is_terminal())
                        .map(|env| (env.owner.clone(), env.branch.clone()))
                })?;
                let env = Environment::new(
                    id.clone(),
                    entry.owner.clone(),
                    entry.branch.clone(),
                    entry.kind,
                    artifact.clone(),
                    entry.generation,
                );
                info!(environment = %id, owner = %entry.owner, branch = %entry.branch, "Created environment");
                state.environments.insert(id.clone(), env);
                state.live_by_pair.insert(pair.clone(), id.clone());
                ApplyOutcome::Created(id)
            }
            (IntentAction::Destroy, Some(id)) => {
                if let Some(env) = state.environments.get_mut(&id) {
                    env.destroy_requested = true;
                    env.generation = entry.generation;
                    env.retry_count = 0;
                }
                ApplyOutcome::DestroyRequested(id)
            }
            (IntentAction::Destroy, None) => ApplyOutcome::NoOp,
        };

        state.generations.insert(pair, entry.generation);
        Ok(outcome)
    }

    /// Returns a copy of an environment's record.
    pub fn get(&self, id: &EnvironmentId) -> Option<Environment> {
        self.lock().environments.get(id).cloned()
    }

    /// The live (non-terminal) environment for a pair, if any.
    pub fn live_for_pair(&self, owner: &OwnerId, branch: &BranchId) -> Option<Environment> {
        let state = self.lock();
        let id = state
            .live_by_pair
            .get(&(owner.clone(), branch.clone()))?
            .clone();
        state.environments.get(&id).cloned()
    }

    /// Copies of all environment records.
    pub fn list(&self) -> Vec<Environment> {
        let mut envs: Vec<_> = self.lock().environments.values().cloned().collect();
        envs.sort_by(|a, b| a.id.cmp(&b.id));
        envs
    }

    /// Mutates one environment's record under the store lock.
    ///
    /// The reconciler uses this to persist lifecycle/observed changes; it
    /// maintains the live-pair index when the environment terminates.
    pub fn update<F, T>(&self, id: &EnvironmentId, f: F) -> Option<T>
    where
        F: FnOnce(&mut Environment) -> T,
    {
        let mut state = self.lock();
        let env = state.environments.get_mut(id)?;
        let result = f(env);
        if env.is_terminal() {
            let pair = (env.owner.clone(), env.branch.clone());
            if state.live_by_pair.get(&pair) == Some(id) {
                state.live_by_pair.remove(&pair);
            }
        }
        Some(result)
    }

    /// Moves an environment to a fresh hash-suffixed identity after the
    /// substrate reported its current name in use by a resource the store
    /// does not know about.
    ///
    /// Returns the new identity, or `None` when the environment is gone.
    /// The `(owner, branch)` pair, generation high-water mark and the rest
    /// of the record are unchanged.
    pub fn rederive_identity(
        &self,
        id: &EnvironmentId,
        resolver: &IdentityResolver,
    ) -> Result<Option<EnvironmentId>, StoreError> {
        let mut state = self.lock();
        let (owner, branch) = match state.environments.get(id) {
            Some(env) => (env.owner.clone(), env.branch.clone()),
            None => return Ok(None),
        };

        let new_id = resolver.rederive(&owner, &branch, |candidate| {
            state.environments.contains_key(candidate)
        })?;

        let mut env = match state.environments.remove(id) {
            Some(env) => env,
            None => return Ok(None),
        };
        env.id = new_id.clone();
        state.environments.insert(new_id.clone(), env);
        state
            .live_by_pair
            .insert((owner.clone(), branch.clone()), new_id.clone());
        info!(old = %id, new = %new_id, owner = %owner, branch = %branch, "Re-derived environment identity");
        Ok(Some(new_id))
    }

    /// Next unused generation for a pair, for intents originated
    /// internally (garbage collector, promotion coordinator).
    pub fn next_generation(&self, owner: &OwnerId, branch: &BranchId) -> Generation {
        self.lock()
            .generations
            .get(&(owner.clone(), branch.clone()))
            .copied()
            .unwrap_or_default()
            .next()
    }

    /// Routing keys held by non-terminal environments, for allocator
    /// recovery.
    pub fn held_routing_keys(&self) -> Vec<(EnvironmentId, RoutingKey)> {
        self.lock()
            .environments
            .values()
            .filter(|env| !env.is_terminal())
            .filter_map(|env| env.routing_key.map(|key| (env.id.clone(), key)))
            .collect()
    }

    /// Drops destroyed environments older than the retention window.
    ///
    /// Returns the number of records pruned.
    pub fn prune_destroyed(&self, retention: std::time::Duration) -> usize {
        let cutoff = match TimeDelta::from_std(retention)
            .ok()
            .and_then(|delta| Utc::now().checked_sub_signed(delta))
        {
            Some(cutoff) => cutoff,
            // A retention window too large to represent prunes nothing.
            None => return 0,
        };
        let mut state = self.lock();
        let before = state.environments.len();
        state
            .environments
            .retain(|_, env| !(env.is_terminal() && env.last_activity_at < cutoff));
        before - state.environments.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
