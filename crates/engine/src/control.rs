// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Operator control surface.
//!
//! Transport-neutral: a CLI, an RPC layer, or a test harness calls
//! these directly. Everything routes through the store's transactional
//! API, so operator actions obey the same invariants as the runtime.

use crate::EngineError;
use contimg_core::{
    Clock, DeadLetter, MsRecord, MsState, ResumePlan, SpawnRequest, Task, TaskId, TaskStatus,
};
use contimg_storage::{QueueStats, Store};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Operator operations over one queue.
pub struct Control<C: Clock> {
    store: Arc<Store<C>>,
    queue: String,
    max_attempts: u32,
}

impl<C: Clock> Control<C> {
    pub fn new(store: Arc<Store<C>>, queue: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            store,
            queue: queue.into(),
            max_attempts,
        }
    }

    pub fn list_tasks(&self, status: Option<TaskStatus>, limit: usize) -> Vec<Task> {
        self.store.list_tasks(&self.queue, status, limit)
    }

    /// Task by id or unique prefix.
    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.store.get_task(task_id)
    }

    pub fn cancel_task(&self, task_id: &TaskId) -> Result<TaskStatus, EngineError> {
        Ok(self.store.cancel(task_id)?)
    }

    /// Replay a dead-lettered task; returns the fresh task id.
    pub fn retry_dead_letter(&self, task_id: &TaskId) -> Result<TaskId, EngineError> {
        let new_id = self.store.retry_dead_letter(task_id)?;
        info!(original = %task_id.short(8), replay = %new_id.short(8), "dead letter replayed");
        Ok(new_id)
    }

    pub fn list_dead_letters(&self, limit: usize) -> Vec<DeadLetter> {
        self.store.list_dead_letters(&self.queue, limit)
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.store.queue_stats(&self.queue)
    }

    pub fn list_ms_states(&self, state: Option<MsState>, limit: usize) -> Vec<MsRecord> {
        self.store.list_ms(state, limit)
    }

    /// Resume processing of a measurement set.
    ///
    /// Failed and quarantined records first fall back to their prior
    /// successful state (quarantine release is exactly this operator
    /// action), then the next pipeline's trigger task is enqueued.
    pub fn resume_ms(&self, ms_path: &Path) -> Result<TaskId, EngineError> {
        let record = self
            .store
            .ms_record(ms_path)
            .ok_or_else(|| EngineError::NothingToResume(ms_path.to_path_buf()))?;

        if matches!(record.state, MsState::Failed | MsState::Quarantined) {
            self.store
                .transition_ms(ms_path, record.state, record.resume_state(), None)?;
        }

        let plan: ResumePlan = self.store.resume_plan(ms_path)?;
        let Some(pipeline) = plan.next_pipeline else {
            return Err(EngineError::NothingToResume(ms_path.to_path_buf()));
        };

        let params = json!({
            "ms_path": ms_path.display().to_string(),
            "resume": true,
        });
        let request = SpawnRequest::new(self.queue.clone(), pipeline.clone(), params)
            .max_attempts(self.max_attempts);
        let task_id = self.store.spawn(request)?;

        info!(
            ms = %ms_path.display(),
            %pipeline,
            task_id = %task_id.short(8),
            "resumption enqueued"
        );
        Ok(task_id)
    }
}

#[cfg(test)]
#[path = "control_tests.rs"]
mod tests;
