// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable task rows and claim semantics.
//!
//! A task is one row in the task store. Workers claim tasks under a
//! time-bounded lease; a lease that expires with the task still
//! `running` means the claimant crashed, and the task becomes
//! claimable again (at-least-once semantics, idempotent kernels
//! assumed).

use crate::errors::ErrorCode;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

crate::define_id! {
    /// Unique identifier for a task.
    pub struct TaskId;
}

crate::define_id! {
    /// Identifier of a worker (claimant) within the pool.
    pub struct WorkerId;
}

/// Status of a task through its lifecycle.
///
/// `Failed` is the cooldown parking state of a retryable failure: the
/// task carries a future `scheduled_at_ms` and becomes claimable again
/// once that passes. `Completed`, `DeadLetter`, and `Cancelled` are
/// terminal and immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    DeadLetter,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::DeadLetter | TaskStatus::Cancelled
        )
    }
}

crate::tag_display! {
    TaskStatus {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        DeadLetter => "dead_letter",
        Cancelled => "cancelled",
    }
}

/// One attempt's failure, as recorded on the task row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub code: ErrorCode,
    pub message: String,
}

impl TaskError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A durable task row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub queue: String,
    pub task_name: String,
    /// Opaque structured payload, validated per task_name at claim time.
    pub params: Value,
    pub status: TaskStatus,
    pub priority: i32,
    /// Number of claims so far (a reclaim after lease expiry counts).
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at_ms: u64,
    /// Earliest epoch-ms at which the task is claimable.
    pub scheduled_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<WorkerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<TaskError>,
    /// Every attempt's failure, oldest first (dead-letter history).
    #[serde(default)]
    pub error_history: Vec<TaskError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<TaskId>,
    /// Per-task retry override; queue default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Set by operator cancellation of a running task; observed by the
    /// claimant through its heartbeat.
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl Task {
    /// Whether a worker may claim this task at `now_ms`.
    ///
    /// Claimable states:
    /// - `pending` or `failed` with `scheduled_at_ms <= now`
    /// - `running` with an expired lease (crashed claimant)
    pub fn claimable_at(&self, now_ms: u64) -> bool {
        match self.status {
            TaskStatus::Pending | TaskStatus::Failed => self.scheduled_at_ms <= now_ms,
            TaskStatus::Running => self
                .lease_expires_at_ms
                .is_some_and(|expiry| expiry <= now_ms),
            _ => false,
        }
    }

    /// Whether the given worker currently holds a valid lease.
    pub fn leased_by(&self, worker: &WorkerId, now_ms: u64) -> bool {
        self.status == TaskStatus::Running
            && self.claimed_by.as_ref() == Some(worker)
            && self.lease_expires_at_ms.is_some_and(|expiry| expiry > now_ms)
    }
}

/// Request to insert a new task row.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub queue: String,
    pub task_name: String,
    pub params: Value,
    pub priority: i32,
    /// Delay before the task becomes claimable, in ms after spawn.
    pub delay_ms: u64,
    pub max_attempts: u32,
    pub parent_task_id: Option<TaskId>,
    pub retry: Option<RetryPolicy>,
}

impl SpawnRequest {
    pub fn new(queue: impl Into<String>, task_name: impl Into<String>, params: Value) -> Self {
        Self {
            queue: queue.into(),
            task_name: task_name.into(),
            params,
            priority: 0,
            delay_ms: 0,
            max_attempts: 3,
            parent_task_id: None,
            retry: None,
        }
    }

    crate::setters! {
        set {
            priority: i32,
            delay_ms: u64,
            max_attempts: u32,
        }
        option {
            parent_task_id: TaskId,
            retry: RetryPolicy,
        }
    }
}

crate::builder! {
    pub struct TaskBuilder => Task {
        into {
            id: TaskId = "task-1",
            queue: String = "contimg",
            task_name: String = "convert",
        }
        set {
            params: Value = Value::Null,
            status: TaskStatus = TaskStatus::Pending,
            priority: i32 = 0,
            attempts: u32 = 0,
            max_attempts: u32 = 3,
            created_at_ms: u64 = 1_000_000,
            scheduled_at_ms: u64 = 1_000_000,
            error_history: Vec<TaskError> = Vec::new(),
            cancel_requested: bool = false,
        }
        option {
            claimed_at_ms: u64 = None,
            claimed_by: WorkerId = None,
            lease_expires_at_ms: u64 = None,
            last_error: TaskError = None,
            parent_task_id: TaskId = None,
            retry: RetryPolicy = None,
            result: Value = None,
        }
    }
}

#[cfg(test)]
#[path = "task_tests.rs"]
mod tests;
