//! Snapshot persistence for the state store.
//!
//! The store is persisted as a single JSON snapshot, written atomically:
//!
//! 1. Write to `snapshot.json.tmp`
//! 2. fsync the file
//! 3. Rename to `snapshot.json`
//! 4. fsync the directory
//!
//! Readers therefore always see either the old or the new snapshot, never
//! a partial write. Any substrate resource not reachable from a snapshot
//! record is considered orphaned.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{BranchId, Environment, Generation, OwnerId};

/// Current schema version. Increment on breaking changes.
pub const SCHEMA_VERSION: u32 = 1;

/// File name of the snapshot inside the state directory.
pub const SNAPSHOT_FILE: &str = "snapshot.json";

/// Errors from snapshot operations.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("schema version mismatch: expected {expected}, got {got}")]
    SchemaMismatch { expected: u32, got: u32 },
}

/// Serializable `(owner, branch)` pair for the generation map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairKey {
    pub owner: OwnerId,
    pub branch: BranchId,
}

impl PairKey {
    pub fn new(owner: OwnerId, branch: BranchId) -> Self {
        PairKey { owner, branch }
    }
}

/// The persisted shape of the state store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Schema version for forward-compatible migrations.
    pub schema_version: u32,

    /// When this snapshot was written.
    pub snapshot_at: DateTime<Utc>,

    /// Every known environment, terminal ones included (audit window).
    pub environments: Vec<Environment>,

    /// Generation high-water marks per pair. Kept even after an
    /// environment terminates so late out-of-order intents stay stale.
    pub generations: Vec<(PairKey, Generation)>,
}

impl PersistedState {
    pub fn new(environments: Vec<Environment>, generations: Vec<(PairKey, Generation)>) -> Self {
        PersistedState {
            schema_version: SCHEMA_VERSION,
            snapshot_at: Utc::now(),
            environments,
            generations,
        }
    }
}

/// Saves a snapshot atomically.
pub fn save_snapshot_atomic(path: &Path, snapshot: &PersistedState) -> Result<(), SnapshotError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(snapshot)?;

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }

    std::fs::rename(&tmp_path, path)?;

    // fsync the directory so the rename itself is durable.
    if let Some(parent) = path.parent() {
        fsync_dir(parent)?;
    }

    Ok(())
}

/// Loads a snapshot, returning None when the file does not exist.
pub fn load_snapshot(path: &Path) -> Result<Option<PersistedState>, SnapshotError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let snapshot: PersistedState = serde_json::from_slice(&bytes)?;
    if snapshot.schema_version != SCHEMA_VERSION {
        return Err(SnapshotError::SchemaMismatch {
            expected: SCHEMA_VERSION,
            got: snapshot.schema_version,
        });
    }
    Ok(Some(snapshot))
}

#[cfg(unix)]
fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn fsync_dir(_dir: &Path) -> io::Result<()> {
    // Directory fsync is not available; the file fsync already happened.
    Ok(())
}
