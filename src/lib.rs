//! previewd - an orchestrator for ephemeral per-branch preview
//! environments.
//!
//! This library provides the core domain types and logic: identity
//! derivation, routing-key allocation, the desired/observed state store,
//! the reconciler, idle-environment reclamation, and promotion into
//! shared integration environments.

pub mod config;
pub mod driver;
pub mod events;
pub mod gc;
pub mod identity;
pub mod promotion;
pub mod reconcile;
pub mod routing;
pub mod server;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;
