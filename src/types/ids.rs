//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of different identifier kinds
//! (e.g., using an OwnerId where a BranchId is expected) and make the
//! code more self-documenting.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The developer or actor on whose behalf an environment exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn new(s: impl Into<String>) -> Self {
        OwnerId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        OwnerId(s.to_string())
    }
}

/// The source branch an environment tracks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchId(pub String);

impl BranchId {
    pub fn new(s: impl Into<String>) -> Self {
        BranchId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BranchId {
    fn from(s: &str) -> Self {
        BranchId(s.to_string())
    }
}

/// The canonical, substrate-safe identity of an environment.
///
/// Derived deterministically from `(OwnerId, BranchId)` by the identity
/// resolver; stable for the lifetime of the environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentId(pub String);

impl EnvironmentId {
    /// Wraps an already-canonical string.
    ///
    /// Note: this does not validate. Canonical ids come from the resolver.
    pub fn new(s: impl Into<String>) -> Self {
        EnvironmentId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EnvironmentId {
    fn from(s: &str) -> Self {
        EnvironmentId(s.to_string())
    }
}

/// A unique routing token (rule priority / path segment index).
///
/// Held by at most one non-terminal environment at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingKey(pub u32);

impl RoutingKey {
    /// Renders the key as the path segment consumed by the routing proxy.
    pub fn path_segment(&self) -> String {
        format!("env-{}", self.0)
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for RoutingKey {
    fn from(n: u32) -> Self {
        RoutingKey(n)
    }
}

/// An opaque reference to a deployable artifact version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(pub String);

impl ArtifactRef {
    pub fn new(s: impl Into<String>) -> Self {
        ArtifactRef(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Composes a merged reference from several source refs, in order.
    ///
    /// Used when promoting multiple environments into one integration target.
    pub fn merged(refs: &[ArtifactRef]) -> Self {
        let joined = refs
            .iter()
            .map(|r| r.as_str())
            .collect::<Vec<_>>()
            .join("+");
        ArtifactRef(joined)
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ArtifactRef {
    fn from(s: &str) -> Self {
        ArtifactRef(s.to_string())
    }
}

/// Monotonic sequence number per `(owner, branch)` pair.
///
/// Used to discard stale intents that arrive out of order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Generation(pub u64);

impl Generation {
    pub fn next(self) -> Generation {
        Generation(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

impl From<u64> for Generation {
    fn from(n: u64) -> Self {
        Generation(n)
    }
}
