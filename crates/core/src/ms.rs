// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-measurement-set lifecycle records.
//!
//! One record per `ms_path`, created on first conversion and retained
//! indefinitely. State transitions follow a fixed DAG; `failed` may
//! fall back to the prior successful state on retry, and `quarantined`
//! is terminal without operator action.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Lifecycle state of a measurement set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsState {
    Registered,
    Converted,
    Calibrated,
    Imaged,
    Mosaicked,
    Failed,
    Quarantined,
}

crate::tag_display! {
    MsState {
        Registered => "registered",
        Converted => "converted",
        Calibrated => "calibrated",
        Imaged => "imaged",
        Mosaicked => "mosaicked",
        Failed => "failed",
        Quarantined => "quarantined",
    }
}

impl MsState {
    /// Next state along the processing chain, if any.
    pub fn next(self) -> Option<MsState> {
        match self {
            MsState::Registered => Some(MsState::Converted),
            MsState::Converted => Some(MsState::Calibrated),
            MsState::Calibrated => Some(MsState::Imaged),
            MsState::Imaged => Some(MsState::Mosaicked),
            MsState::Mosaicked | MsState::Failed | MsState::Quarantined => None,
        }
    }

    /// Pipeline responsible for advancing out of this state, if any.
    pub fn next_pipeline(self) -> Option<&'static str> {
        match self {
            MsState::Registered => Some("conversion"),
            MsState::Converted => Some("calibration"),
            MsState::Calibrated => Some("imaging"),
            MsState::Imaged => Some("mosaic"),
            MsState::Mosaicked | MsState::Failed | MsState::Quarantined => None,
        }
    }

    /// State whose forward move lands on `self`, if any.
    pub fn prior(self) -> Option<MsState> {
        match self {
            MsState::Converted => Some(MsState::Registered),
            MsState::Calibrated => Some(MsState::Converted),
            MsState::Imaged => Some(MsState::Calibrated),
            MsState::Mosaicked => Some(MsState::Imaged),
            MsState::Registered | MsState::Failed | MsState::Quarantined => None,
        }
    }

    /// Whether `self -> to` is a legal transition.
    ///
    /// Legal moves: one step forward along the chain, any non-terminal
    /// state to `failed`, `failed` back to the state it fell from (the
    /// caller checks it matches the recorded prior state), and
    /// `quarantined` back to a healthy state - the release path that
    /// only explicit operator resumption takes.
    pub fn can_transition_to(self, to: MsState) -> bool {
        match (self, to) {
            (MsState::Quarantined, to) => {
                !matches!(to, MsState::Failed | MsState::Quarantined)
            }
            (_, MsState::Quarantined) => true,
            (MsState::Failed, to) => !matches!(to, MsState::Failed),
            (from, MsState::Failed) => !matches!(from, MsState::Failed),
            (from, to) => from.next() == Some(to),
        }
    }
}

/// Durable lifecycle record for one measurement set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsRecord {
    pub ms_path: PathBuf,
    pub state: MsState,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    /// Consecutive failures on the current stage; reset on success.
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Opaque stage checkpoint; produced and consumed by stage code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_ms_path: Option<PathBuf>,
    /// Last successful state before `failed`/`quarantined`; the retry
    /// target for downgrades.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_state: Option<MsState>,
}

impl MsRecord {
    pub fn new(ms_path: PathBuf, now_ms: u64) -> Self {
        Self {
            ms_path,
            state: MsState::Registered,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            retry_count: 0,
            last_error: None,
            checkpoint: None,
            parent_ms_path: None,
            prior_state: None,
        }
    }

    /// State a failed or quarantined record should resume from.
    pub fn resume_state(&self) -> MsState {
        match self.state {
            MsState::Failed | MsState::Quarantined => {
                self.prior_state.unwrap_or(MsState::Registered)
            }
            other => other,
        }
    }
}

/// What to run next for a measurement set, derived from its record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePlan {
    pub ms_path: PathBuf,
    /// State the resumption starts from.
    pub from_state: MsState,
    /// Pipeline to trigger; `None` when the chain is finished.
    pub next_pipeline: Option<String>,
    pub has_checkpoint: bool,
}

#[cfg(test)]
#[path = "ms_tests.rs"]
mod tests;
