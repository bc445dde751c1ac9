//! Canonical identity derivation.
//!
//! An environment's identity is derived from its `(owner, branch)` pair:
//! sanitize, lowercase, truncate, join. Truncation makes canonicalization
//! lossy, so two distinct pairs can collide; when the caller reports that
//! the composed identity already belongs to a different pair, a
//! deterministic sha256-derived suffix is appended (and grown) until the
//! identity is unique. The result always satisfies the substrate's
//! character-set and maximum-length constraints.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::NamingConfig;
use crate::types::{BranchId, EnvironmentId, OwnerId};

/// Errors from identity resolution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    /// Owner or branch contained no usable characters.
    #[error("invalid identity input: {component} is empty after sanitization")]
    InvalidIdentity { component: &'static str },

    /// Even the full hash suffix collided with a distinct pair. This
    /// indicates corrupted state rather than an unlucky input.
    #[error("cannot derive a unique identity for ({owner}, {branch})")]
    Unresolvable { owner: OwnerId, branch: BranchId },
}

/// Suffix lengths tried in order when the bare identity collides.
const SUFFIX_LENGTHS: [usize; 4] = [6, 10, 16, 32];

/// Derives collision-free canonical identities.
///
/// `resolve` is deterministic given the same inputs and the same set of
/// already-taken identities.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    config: NamingConfig,
}

impl IdentityResolver {
    pub fn new(config: NamingConfig) -> Self {
        IdentityResolver { config }
    }

    /// Resolves `(owner, branch)` to a canonical identity.
    ///
    /// `occupant` reports which pair, if any, currently holds a candidate
    /// identity; the state store supplies it. A candidate held by the same
    /// pair is reused unchanged, so re-resolving an existing environment
    /// is stable.
    pub fn resolve<F>(
        &self,
        owner: &OwnerId,
        branch: &BranchId,
        occupant: F,
    ) -> Result<EnvironmentId, IdentityError>
    where
        F: Fn(&EnvironmentId) -> Option<(OwnerId, BranchId)>,
    {
        let base = self.base(owner, branch)?;

        let bare = EnvironmentId::new(base.clone());
        if self.is_free_or_ours(&bare, owner, branch, &occupant) {
            return Ok(bare);
        }

        // Lossy-truncation collision with a distinct pair: disambiguate
        // with a suffix of the untruncated inputs' hash.
        let digest = pair_digest(owner, branch);
        for len in SUFFIX_LENGTHS {
            let suffix = &digest[..len];
            let budget = self.config.max_name_len.saturating_sub(len + 1);
            let candidate =
                EnvironmentId::new(format!("{}-{}", truncate_trimmed(&base, budget), suffix));
            if self.is_free_or_ours(&candidate, owner, branch, &occupant) {
                return Ok(candidate);
            }
        }

        Err(IdentityError::Unresolvable {
            owner: owner.clone(),
            branch: branch.clone(),
        })
    }

    /// Derives a fresh suffixed identity after the substrate reported the
    /// current one in use by a resource outside the store.
    ///
    /// Skips the bare identity entirely; `taken` reports identities that
    /// must not be handed out (the conflicted one included).
    pub fn rederive<F>(
        &self,
        owner: &OwnerId,
        branch: &BranchId,
        taken: F,
    ) -> Result<EnvironmentId, IdentityError>
    where
        F: Fn(&EnvironmentId) -> bool,
    {
        let base = self.base(owner, branch)?;
        let digest = pair_digest(owner, branch);
        for len in SUFFIX_LENGTHS {
            let suffix = &digest[..len];
            let budget = self.config.max_name_len.saturating_sub(len + 1);
            let candidate =
                EnvironmentId::new(format!("{}-{}", truncate_trimmed(&base, budget), suffix));
            if !taken(&candidate) {
                return Ok(candidate);
            }
        }
        Err(IdentityError::Unresolvable {
            owner: owner.clone(),
            branch: branch.clone(),
        })
    }

    fn base(&self, owner: &OwnerId, branch: &BranchId) -> Result<String, IdentityError> {
        let owner_part = sanitize(owner.as_str())
            .ok_or(IdentityError::InvalidIdentity { component: "owner" })?;
        let branch_part = sanitize(branch.as_str()).ok_or(IdentityError::InvalidIdentity {
            component: "branch",
        })?;

        let owner_part = truncate(&owner_part, self.config.max_component_len);
        let branch_part = truncate(&branch_part, self.config.max_component_len);

        let base = format!("{}-{}", owner_part, branch_part);
        Ok(truncate_trimmed(&base, self.config.max_name_len))
    }

    fn is_free_or_ours<F>(
        &self,
        candidate: &EnvironmentId,
        owner: &OwnerId,
        branch: &BranchId,
        occupant: &F,
    ) -> bool
    where
        F: Fn(&EnvironmentId) -> Option<(OwnerId, BranchId)>,
    {
        match occupant(candidate) {
            None => true,
            Some((o, b)) => &o == owner && &b == branch,
        }
    }
}

/// Lowercases and maps the input onto `[a-z0-9-]`, collapsing runs of
/// disallowed characters into single hyphens. Returns None when nothing
/// usable remains.
fn sanitize(input: &str) -> Option<String> {
    let mut out = String::with_capacity(input.len());
    let mut last_was_sep = true; // suppress leading separators
    for c in input.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('-');
            last_was_sep = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Truncates to at most `max` bytes (input is ASCII by construction).
fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Truncates and strips any trailing hyphen the cut may have exposed.
fn truncate_trimmed(s: &str, max: usize) -> String {
    let mut out = truncate(s, max);
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Hex digest of the untruncated pair, stable across processes.
fn pair_digest(owner: &OwnerId, branch: &BranchId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(owner.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(branch.as_str().as_bytes());
    hex::encode(hasher.finalize())
}
