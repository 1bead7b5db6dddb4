// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dead-letter entries for tasks that failed unrecoverably.
//!
//! Entries are retained for operator inspection. A replay re-inserts a
//! new task with a fresh id and `attempts = 0`; the dead-letter row is
//! never mutated.

use crate::errors::ErrorCode;
use crate::task::{Task, TaskError, TaskId};
use serde::{Deserialize, Serialize};

/// Why a task was routed to the dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    ExceededRetries,
    PoisonPayload,
    ValidationError,
    ResourceExhaustion,
    Explicit,
}

crate::tag_display! {
    DeadLetterReason {
        ExceededRetries => "exceeded_retries",
        PoisonPayload => "poison_payload",
        ValidationError => "validation_error",
        ResourceExhaustion => "resource_exhaustion",
        Explicit => "explicit",
    }
}

impl DeadLetterReason {
    /// Derive the reason from a task's error history.
    ///
    /// Two or more attempts that failed with an identical code and
    /// message are classed as a poison payload - the params
    /// deterministically reproduce the failure. Otherwise the final
    /// error's code picks the reason.
    pub fn derive(history: &[TaskError]) -> Self {
        if history.len() >= 2 {
            let first = &history[0];
            if history.iter().all(|e| e == first) {
                return DeadLetterReason::PoisonPayload;
            }
        }
        match history.last().map(|e| e.code) {
            Some(ErrorCode::ValidationError) => DeadLetterReason::ValidationError,
            Some(ErrorCode::ResourceExhaustion) => DeadLetterReason::ResourceExhaustion,
            Some(ErrorCode::Cancelled) => DeadLetterReason::Explicit,
            _ => DeadLetterReason::ExceededRetries,
        }
    }
}

/// A dead-lettered task, snapshotted at the moment of terminal failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub task_id: TaskId,
    /// Full task row as it looked when it died.
    pub original_task: Task,
    pub reason: DeadLetterReason,
    pub failed_at_ms: u64,
    /// Per-attempt errors, oldest first.
    pub error_history: Vec<TaskError>,
}

#[cfg(test)]
#[path = "deadletter_tests.rs"]
mod tests;
