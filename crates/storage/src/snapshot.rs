// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Snapshot of the materialized state for crash recovery.
//!
//! A snapshot pins a WAL sequence number: state equals the snapshot
//! plus every WAL entry after `seq`.

use crate::MaterializedState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Current snapshot format version.
pub const CURRENT_SNAPSHOT_VERSION: u32 = 1;

/// Errors from snapshot load/save
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
}

/// A point-in-time copy of the materialized state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    /// WAL sequence number this snapshot covers (inclusive).
    pub seq: u64,
    pub state: MaterializedState,
    pub created_at: DateTime<Utc>,
}

/// Pick a non-clobbering `.bak` path next to `path`.
pub fn rotate_bak_path(path: &Path) -> PathBuf {
    let base = path.with_extension(match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}.bak", ext),
        None => "bak".to_string(),
    });
    if !base.exists() {
        return base;
    }
    for n in 1u32.. {
        let candidate = base.with_extension(format!("bak{}", n));
        if !candidate.exists() {
            return candidate;
        }
    }
    base
}

#[cfg(test)]
#[path = "snapshot_tests.rs"]
mod tests;
