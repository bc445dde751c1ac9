//! Routing-key allocation.
//!
//! One shared free list hands out the smallest available key; allocation
//! and release run under a single allocator-wide lock so two concurrent
//! provisioning transitions can never receive the same key. A key is only
//! returned to the pool after the substrate confirms the routing rule's
//! deletion, never speculatively.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

use crate::config::RoutingConfig;
use crate::types::{EnvironmentId, RoutingKey};

/// Errors from key allocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    /// The key space is exhausted. Surfaced to the operator, not retried.
    #[error("routing key space exhausted ({pool_size} keys in use)")]
    Exhausted { pool_size: u32 },

    /// Release of a key that is not currently held.
    #[error("routing key {0} is not allocated")]
    NotAllocated(RoutingKey),
}

#[derive(Debug)]
struct PoolState {
    free: BTreeSet<RoutingKey>,
    held: HashMap<EnvironmentId, RoutingKey>,
}

/// Assigns and reclaims unique routing keys.
#[derive(Debug)]
pub struct RoutingAllocator {
    config: RoutingConfig,
    state: Mutex<PoolState>,
}

impl RoutingAllocator {
    /// Creates an allocator with the full key range free.
    pub fn new(config: RoutingConfig) -> Self {
        let free = (config.first_key..config.first_key + config.pool_size)
            .map(RoutingKey)
            .collect();
        RoutingAllocator {
            config,
            state: Mutex::new(PoolState {
                free,
                held: HashMap::new(),
            }),
        }
    }

    /// Rebuilds the allocator from recovered state, removing keys held by
    /// non-terminal environments from the free pool.
    pub fn recover<I>(config: RoutingConfig, held: I) -> Self
    where
        I: IntoIterator<Item = (EnvironmentId, RoutingKey)>,
    {
        let allocator = RoutingAllocator::new(config);
        {
            let mut state = allocator.lock();
            for (id, key) in held {
                state.free.remove(&key);
                state.held.insert(id, key);
            }
        }
        allocator
    }

    /// Allocates the smallest available key for an environment.
    ///
    /// Idempotent per environment: an environment that already holds a key
    /// gets the same key back, so a re-run provisioning transition does not
    /// leak keys.
    pub fn allocate(&self, environment: &EnvironmentId) -> Result<RoutingKey, AllocationError> {
        let mut state = self.lock();

        if let Some(key) = state.held.get(environment) {
            return Ok(*key);
        }

        let key = match state.free.iter().next().copied() {
            Some(key) => key,
            None => {
                return Err(AllocationError::Exhausted {
                    pool_size: self.config.pool_size,
                })
            }
        };
        state.free.remove(&key);
        state.held.insert(environment.clone(), key);
        debug!(environment = %environment, key = %key, "Allocated routing key");
        Ok(key)
    }

    /// Returns a key to the free pool.
    ///
    /// Only the reconciler calls this, and only after teardown of the
    /// routing rule is confirmed.
    pub fn release(&self, key: RoutingKey) -> Result<(), AllocationError> {
        let mut state = self.lock();

        let owner = state
            .held
            .iter()
            .find(|(_, k)| **k == key)
            .map(|(id, _)| id.clone());
        let owner = owner.ok_or(AllocationError::NotAllocated(key))?;

        state.held.remove(&owner);
        state.free.insert(key);
        debug!(environment = %owner, key = %key, "Released routing key");
        Ok(())
    }

    /// The key currently held by an environment, if any.
    pub fn key_of(&self, environment: &EnvironmentId) -> Option<RoutingKey> {
        self.lock().held.get(environment).copied()
    }

    /// Number of keys currently handed out.
    pub fn allocated_count(&self) -> usize {
        self.lock().held.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
