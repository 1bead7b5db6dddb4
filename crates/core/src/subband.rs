// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subband file and group records.
//!
//! One landing file per subband per time segment, named
//! `<ISO-timestamp>_sb<NN>.hdf5`. Files that share a representative
//! timestamp form a group, which becomes one measurement set.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

crate::define_id! {
    /// Group identifier, derived from the cluster-representative timestamp.
    pub struct GroupId;
}

/// Timestamp format used in subband filenames and group ids.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Errors from subband filename parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("filename has no UTF-8 stem: {0}")]
    NotUtf8(PathBuf),
    #[error("unexpected extension (want .hdf5): {0}")]
    BadExtension(String),
    #[error("missing `_sb<NN>` suffix: {0}")]
    MissingSubband(String),
    #[error("bad subband index `{index}` in {name}")]
    BadIndex { name: String, index: String },
    #[error("bad timestamp `{timestamp}` in {name}")]
    BadTimestamp { name: String, timestamp: String },
}

/// Parsed subband filename: `<ISO-timestamp>_sb<NN>.hdf5`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubbandName {
    pub timestamp: DateTime<Utc>,
    pub subband_index: u8,
}

impl SubbandName {
    /// Parse a landing path. Parse failures are reported, never panic;
    /// the caller skips unparsable files.
    pub fn parse(path: &Path) -> Result<Self, ParseError> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ParseError::NotUtf8(path.to_path_buf()))?;

        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        if ext != "hdf5" {
            return Err(ParseError::BadExtension(format!("{}.{}", stem, ext)));
        }

        let (ts_part, sb_part) = stem
            .rsplit_once("_sb")
            .ok_or_else(|| ParseError::MissingSubband(stem.to_string()))?;

        let subband_index: u8 = sb_part.parse().map_err(|_| ParseError::BadIndex {
            name: stem.to_string(),
            index: sb_part.to_string(),
        })?;

        let naive = NaiveDateTime::parse_from_str(ts_part, TIMESTAMP_FORMAT).map_err(|_| {
            ParseError::BadTimestamp {
                name: stem.to_string(),
                timestamp: ts_part.to_string(),
            }
        })?;

        Ok(Self {
            timestamp: naive.and_utc(),
            subband_index,
        })
    }
}

/// Derive the group id from a representative timestamp.
pub fn group_id_for(representative: DateTime<Utc>) -> GroupId {
    GroupId::new(representative.format(TIMESTAMP_FORMAT).to_string())
}

/// Lifecycle of a single landing file.
///
/// A file advances monotonically; once `consumed` its bytes are never
/// read by the pipeline again. `unparsable_late` sits outside the
/// chain: it marks a file that arrived after its group was already
/// resolved and was never included. Terminal from the moment it is
/// recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Seen,
    Stable,
    Grouped,
    Consumed,
    UnparsableLate,
}

impl FileState {
    /// Monotonic ordering rank for state advances.
    fn rank(self) -> u8 {
        match self {
            FileState::Seen => 0,
            FileState::Stable => 1,
            FileState::Grouped => 2,
            FileState::Consumed => 3,
            FileState::UnparsableLate => 4,
        }
    }

    pub fn can_advance_to(self, next: FileState) -> bool {
        // Off-chain marking only happens at registration time, never
        // as an advance of an existing row.
        if matches!(self, FileState::UnparsableLate)
            || matches!(next, FileState::UnparsableLate)
        {
            return false;
        }
        next.rank() > self.rank()
    }
}

crate::tag_display! {
    FileState {
        Seen => "seen",
        Stable => "stable",
        Grouped => "grouped",
        Consumed => "consumed",
        UnparsableLate => "unparsable_late",
    }
}

/// Durable record of one landing file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubbandFile {
    pub path: PathBuf,
    pub mtime_ms: u64,
    pub size: u64,
    pub group_id: GroupId,
    pub subband_index: u8,
    pub state: FileState,
}

/// Status of a subband group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Partial,
    Complete,
    TimedOut,
    Dispatched,
}

crate::tag_display! {
    GroupStatus {
        Partial => "partial",
        Complete => "complete",
        TimedOut => "timed_out",
        Dispatched => "dispatched",
    }
}

/// Durable record of a subband group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubbandGroup {
    pub group_id: GroupId,
    pub expected_subbands: u8,
    /// Indices observed so far; always a subset of `0..expected_subbands`.
    pub observed_subbands: BTreeSet<u8>,
    /// Member file paths in arrival order.
    pub members: Vec<PathBuf>,
    pub first_seen_at_ms: u64,
    pub last_seen_at_ms: u64,
    pub status: GroupStatus,
    /// True once the group may advance to `dispatched` (complete, or
    /// timed out with enough members).
    #[serde(default)]
    pub dispatchable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatched_task_id: Option<crate::task::TaskId>,
}

impl SubbandGroup {
    pub fn new(group_id: GroupId, expected_subbands: u8, now_ms: u64) -> Self {
        Self {
            group_id,
            expected_subbands,
            observed_subbands: BTreeSet::new(),
            members: Vec::new(),
            first_seen_at_ms: now_ms,
            last_seen_at_ms: now_ms,
            status: GroupStatus::Partial,
            dispatchable: false,
            dispatched_task_id: None,
        }
    }

    /// Record an observed member. Out-of-range indices are rejected;
    /// duplicate observations are no-ops.
    pub fn observe(&mut self, index: u8, path: &Path, now_ms: u64) -> bool {
        if index >= self.expected_subbands {
            return false;
        }
        self.last_seen_at_ms = now_ms.max(self.last_seen_at_ms);
        if self.observed_subbands.insert(index) {
            self.members.push(path.to_path_buf());
            true
        } else {
            false
        }
    }

    pub fn is_full(&self) -> bool {
        self.observed_subbands.len() as u8 >= self.expected_subbands
    }
}

#[cfg(test)]
#[path = "subband_tests.rs"]
mod tests;
