// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event types for the ingest and orchestration core.
//!
//! Events are facts about what happened. The durable store appends
//! them to the WAL and derives state from them; the event bus mirrors
//! them to observers. Serializes with `{"type": "task:claimed", ...}`.

use crate::cron::ScheduledTask;
use crate::deadletter::DeadLetterReason;
use crate::ms::{MsRecord, MsState};
use crate::subband::{GroupId, SubbandFile};
use crate::task::{Task, TaskError, TaskId, WorkerId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Events that drive state transitions in the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    // -- ingest --
    #[serde(rename = "file:registered")]
    FileRegistered {
        file: SubbandFile,
        expected_subbands: u8,
        seen_at_ms: u64,
    },

    #[serde(rename = "file:stable")]
    FileStable { path: PathBuf },

    /// A subband arrived after its group was already resolved. The
    /// file is recorded as `unparsable_late` and never processed.
    #[serde(rename = "file:unparsable_late")]
    FileUnparsableLate { file: SubbandFile, at_ms: u64 },

    #[serde(rename = "files:consumed")]
    FilesConsumed { paths: Vec<PathBuf> },

    #[serde(rename = "group:completed")]
    GroupCompleted { group_id: GroupId },

    /// Group hit its deadline. `accepted` means it had enough members
    /// to dispatch anyway.
    #[serde(rename = "group:timed_out")]
    GroupTimedOut { group_id: GroupId, accepted: bool },

    #[serde(rename = "group:dispatched")]
    GroupDispatched { group_id: GroupId, task_id: TaskId },

    // -- tasks --
    #[serde(rename = "task:spawned")]
    TaskSpawned { task: Task },

    #[serde(rename = "task:claimed")]
    TaskClaimed {
        task_id: TaskId,
        worker_id: WorkerId,
        /// Attempt number this claim starts (1-based).
        attempt: u32,
        claimed_at_ms: u64,
        lease_expires_at_ms: u64,
    },

    #[serde(rename = "task:heartbeat")]
    TaskHeartbeat {
        task_id: TaskId,
        lease_expires_at_ms: u64,
    },

    #[serde(rename = "task:completed")]
    TaskCompleted {
        task_id: TaskId,
        result: Value,
        completed_at_ms: u64,
    },

    /// Retryable failure: the task parks in `failed` until `scheduled_at_ms`.
    #[serde(rename = "task:retried")]
    TaskRetried {
        task_id: TaskId,
        error: TaskError,
        scheduled_at_ms: u64,
    },

    #[serde(rename = "task:dead_lettered")]
    TaskDeadLettered {
        task_id: TaskId,
        reason: DeadLetterReason,
        error: TaskError,
        failed_at_ms: u64,
    },

    /// Operator asked a running task to stop; the claimant observes
    /// this through its heartbeat.
    #[serde(rename = "task:cancel_requested")]
    TaskCancelRequested { task_id: TaskId },

    #[serde(rename = "task:cancelled")]
    TaskCancelled { task_id: TaskId, at_ms: u64 },

    // -- cron --
    #[serde(rename = "cron:registered")]
    CronRegistered { entry: ScheduledTask },

    #[serde(rename = "cron:fired")]
    CronFired {
        name: String,
        fired_at_ms: u64,
        next_fire_at_ms: u64,
    },

    #[serde(rename = "cron:toggled")]
    CronToggled { name: String, enabled: bool },

    // -- measurement sets --
    #[serde(rename = "ms:registered")]
    MsRegistered { record: MsRecord },

    #[serde(rename = "ms:transitioned")]
    MsTransitioned {
        ms_path: PathBuf,
        from: MsState,
        to: MsState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checkpoint: Option<Value>,
        at_ms: u64,
    },

    #[serde(rename = "ms:failed")]
    MsFailed {
        ms_path: PathBuf,
        error: String,
        at_ms: u64,
    },

    #[serde(rename = "ms:quarantined")]
    MsQuarantined { ms_path: PathBuf, at_ms: u64 },

    // -- pipeline observability (not persisted) --
    #[serde(rename = "stage:started")]
    StageStarted {
        pipeline: String,
        stage: String,
        task_id: TaskId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ms_path: Option<PathBuf>,
    },

    #[serde(rename = "stage:finished")]
    StageFinished {
        pipeline: String,
        stage: String,
        task_id: TaskId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ms_path: Option<PathBuf>,
        success: bool,
        #[serde(default)]
        skipped: bool,
    },
}

impl Event {
    /// Short one-line summary for log output.
    pub fn log_summary(&self) -> String {
        match self {
            Event::FileRegistered { file, .. } => {
                format!("file:registered {}", file.path.display())
            }
            Event::FileStable { path } => format!("file:stable {}", path.display()),
            Event::FileUnparsableLate { file, .. } => {
                format!(
                    "file:unparsable_late {} group={}",
                    file.path.display(),
                    file.group_id
                )
            }
            Event::FilesConsumed { paths } => format!("files:consumed n={}", paths.len()),
            Event::GroupCompleted { group_id } => format!("group:completed {}", group_id),
            Event::GroupTimedOut { group_id, accepted } => {
                format!("group:timed_out {} accepted={}", group_id, accepted)
            }
            Event::GroupDispatched { group_id, task_id } => {
                format!("group:dispatched {} task={}", group_id, task_id.short(8))
            }
            Event::TaskSpawned { task } => {
                format!("task:spawned {} {}", task.id.short(8), task.task_name)
            }
            Event::TaskClaimed {
                task_id,
                worker_id,
                attempt,
                ..
            } => format!(
                "task:claimed {} by={} attempt={}",
                task_id.short(8),
                worker_id,
                attempt
            ),
            Event::TaskHeartbeat { task_id, .. } => {
                format!("task:heartbeat {}", task_id.short(8))
            }
            Event::TaskCompleted { task_id, .. } => {
                format!("task:completed {}", task_id.short(8))
            }
            Event::TaskRetried { task_id, error, .. } => {
                format!("task:retried {} {}", task_id.short(8), error.code)
            }
            Event::TaskDeadLettered {
                task_id, reason, ..
            } => format!("task:dead_lettered {} reason={}", task_id.short(8), reason),
            Event::TaskCancelRequested { task_id } => {
                format!("task:cancel_requested {}", task_id.short(8))
            }
            Event::TaskCancelled { task_id, .. } => {
                format!("task:cancelled {}", task_id.short(8))
            }
            Event::CronRegistered { entry } => format!("cron:registered {}", entry.name),
            Event::CronFired { name, .. } => format!("cron:fired {}", name),
            Event::CronToggled { name, enabled } => {
                format!("cron:toggled {} enabled={}", name, enabled)
            }
            Event::MsRegistered { record } => {
                format!("ms:registered {}", record.ms_path.display())
            }
            Event::MsTransitioned {
                ms_path, from, to, ..
            } => format!("ms:transitioned {} {}→{}", ms_path.display(), from, to),
            Event::MsFailed { ms_path, .. } => format!("ms:failed {}", ms_path.display()),
            Event::MsQuarantined { ms_path, .. } => {
                format!("ms:quarantined {}", ms_path.display())
            }
            Event::StageStarted {
                pipeline, stage, ..
            } => format!("stage:started {}/{}", pipeline, stage),
            Event::StageFinished {
                pipeline,
                stage,
                success,
                ..
            } => format!("stage:finished {}/{} success={}", pipeline, stage, success),
        }
    }
}

/// Observer hook: the store mirrors every mutation here after the WAL
/// flush. Implementations must never block - a slow subscriber must
/// not stall producers.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &Event);
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
