// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Materialized state from WAL replay.

use contimg_core::{
    DeadLetter, Event, FileState, GroupStatus, MsRecord, MsState, ScheduledTask, SubbandFile,
    SubbandGroup, Task, TaskStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Materialized state built from WAL events.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MaterializedState {
    /// task_id → task row
    pub tasks: HashMap<String, Task>,
    /// task_id → dead-letter entry
    #[serde(default)]
    pub dead_letters: HashMap<String, DeadLetter>,
    /// cron name → scheduled task
    #[serde(default)]
    pub scheduled: HashMap<String, ScheduledTask>,
    /// landing path → subband file row
    #[serde(default)]
    pub files: HashMap<PathBuf, SubbandFile>,
    /// group_id → subband group row
    #[serde(default)]
    pub groups: HashMap<String, SubbandGroup>,
    /// ms_path → lifecycle record
    #[serde(default)]
    pub ms_records: HashMap<PathBuf, MsRecord>,
}

impl MaterializedState {
    /// Get a task by ID or unique prefix (like git commit hashes)
    pub fn get_task(&self, id: &str) -> Option<&Task> {
        if let Some(task) = self.tasks.get(id) {
            return Some(task);
        }
        let matches: Vec<_> = self
            .tasks
            .iter()
            .filter(|(k, _)| k.starts_with(id))
            .collect();
        if matches.len() == 1 {
            Some(matches[0].1)
        } else {
            None
        }
    }

    /// Apply an event to derive state changes.
    ///
    /// # Idempotency Requirement
    ///
    /// **All event handlers MUST be idempotent.** Applying the same
    /// event twice must produce the same state as applying it once -
    /// events are re-applied during replay after a crash that landed
    /// between WAL flush and snapshot.
    ///
    /// Guidelines:
    /// - Use assignment (`=`) instead of mutation (`+=`, `-=`)
    /// - Guard inserts with existence checks
    /// - Guard increments and pushes with status transitions
    pub fn apply_event(&mut self, event: &Event) {
        match event {
            // -- ingest --
            Event::FileRegistered {
                file,
                expected_subbands,
                seen_at_ms,
            } => {
                match self.files.get_mut(&file.path) {
                    None => {
                        self.files.insert(file.path.clone(), file.clone());
                    }
                    Some(existing) => {
                        // A rewritten landing file may only refresh
                        // attributes while still in `seen`.
                        if existing.state == FileState::Seen && file.mtime_ms > existing.mtime_ms {
                            existing.mtime_ms = file.mtime_ms;
                            existing.size = file.size;
                        }
                    }
                }

                let group = self
                    .groups
                    .entry(file.group_id.as_str().to_string())
                    .or_insert_with(|| {
                        SubbandGroup::new(file.group_id.clone(), *expected_subbands, *seen_at_ms)
                    });
                group.observe(file.subband_index, &file.path, *seen_at_ms);
            }

            Event::FileStable { path } => {
                if let Some(file) = self.files.get_mut(path) {
                    if file.state == FileState::Seen {
                        file.state = FileState::Stable;
                    }
                }
            }

            Event::FileUnparsableLate { file, .. } => {
                // Never clobber a row that already made it into a
                // group; the late mark is for strangers only.
                if !self.files.contains_key(&file.path) {
                    self.files.insert(file.path.clone(), file.clone());
                }
            }

            Event::FilesConsumed { paths } => {
                for path in paths {
                    if let Some(file) = self.files.get_mut(path) {
                        if file.state.can_advance_to(FileState::Consumed) {
                            file.state = FileState::Consumed;
                        }
                    }
                }
            }

            Event::GroupCompleted { group_id } => {
                if let Some(group) = self.groups.get_mut(group_id.as_str()) {
                    if group.status == GroupStatus::Partial {
                        group.status = GroupStatus::Complete;
                    }
                    group.dispatchable = true;
                    Self::advance_members(&mut self.files, &group.members);
                }
            }

            Event::GroupTimedOut { group_id, accepted } => {
                if let Some(group) = self.groups.get_mut(group_id.as_str()) {
                    if group.status == GroupStatus::Partial {
                        group.status = GroupStatus::TimedOut;
                        group.dispatchable = *accepted;
                    }
                    if *accepted {
                        Self::advance_members(&mut self.files, &group.members);
                    }
                }
            }

            Event::GroupDispatched { group_id, task_id } => {
                if let Some(group) = self.groups.get_mut(group_id.as_str()) {
                    group.status = GroupStatus::Dispatched;
                    group.dispatched_task_id = Some(task_id.clone());
                }
            }

            // -- tasks --
            Event::TaskSpawned { task } => {
                if !self.tasks.contains_key(task.id.as_str()) {
                    self.tasks.insert(task.id.as_str().to_string(), task.clone());
                }
            }

            Event::TaskClaimed {
                task_id,
                worker_id,
                attempt,
                claimed_at_ms,
                lease_expires_at_ms,
            } => {
                if let Some(task) = self.tasks.get_mut(task_id.as_str()) {
                    task.status = TaskStatus::Running;
                    task.claimed_by = Some(worker_id.clone());
                    task.claimed_at_ms = Some(*claimed_at_ms);
                    task.lease_expires_at_ms = Some(*lease_expires_at_ms);
                    // Assignment, not increment: replay-safe.
                    task.attempts = *attempt;
                }
            }

            Event::TaskHeartbeat {
                task_id,
                lease_expires_at_ms,
            } => {
                if let Some(task) = self.tasks.get_mut(task_id.as_str()) {
                    if task.status == TaskStatus::Running {
                        task.lease_expires_at_ms = Some(*lease_expires_at_ms);
                    }
                }
            }

            Event::TaskCompleted {
                task_id, result, ..
            } => {
                if let Some(task) = self.tasks.get_mut(task_id.as_str()) {
                    task.status = TaskStatus::Completed;
                    task.result = Some(result.clone());
                    task.lease_expires_at_ms = None;
                }
            }

            Event::TaskRetried {
                task_id,
                error,
                scheduled_at_ms,
            } => {
                if let Some(task) = self.tasks.get_mut(task_id.as_str()) {
                    // Push guarded by the status transition so a
                    // replayed event cannot duplicate history.
                    if task.status != TaskStatus::Failed {
                        task.error_history.push(error.clone());
                    }
                    task.status = TaskStatus::Failed;
                    task.last_error = Some(error.clone());
                    task.scheduled_at_ms = *scheduled_at_ms;
                    task.claimed_by = None;
                    task.claimed_at_ms = None;
                    task.lease_expires_at_ms = None;
                }
            }

            Event::TaskDeadLettered {
                task_id,
                reason,
                error,
                failed_at_ms,
            } => {
                if let Some(task) = self.tasks.get_mut(task_id.as_str()) {
                    if task.status != TaskStatus::DeadLetter {
                        task.error_history.push(error.clone());
                    }
                    task.status = TaskStatus::DeadLetter;
                    task.last_error = Some(error.clone());
                    task.lease_expires_at_ms = None;
                }
                if !self.dead_letters.contains_key(task_id.as_str()) {
                    if let Some(task) = self.tasks.get(task_id.as_str()) {
                        self.dead_letters.insert(
                            task_id.as_str().to_string(),
                            DeadLetter {
                                task_id: task_id.clone(),
                                original_task: task.clone(),
                                reason: *reason,
                                failed_at_ms: *failed_at_ms,
                                error_history: task.error_history.clone(),
                            },
                        );
                    }
                }
            }

            Event::TaskCancelRequested { task_id } => {
                if let Some(task) = self.tasks.get_mut(task_id.as_str()) {
                    if !task.status.is_terminal() {
                        task.cancel_requested = true;
                    }
                }
            }

            Event::TaskCancelled { task_id, .. } => {
                if let Some(task) = self.tasks.get_mut(task_id.as_str()) {
                    task.status = TaskStatus::Cancelled;
                    task.lease_expires_at_ms = None;
                }
            }

            // -- cron --
            Event::CronRegistered { entry } => {
                match self.scheduled.get_mut(&entry.name) {
                    None => {
                        self.scheduled.insert(entry.name.clone(), entry.clone());
                    }
                    Some(existing) => {
                        // Re-registration updates the definition but
                        // preserves firing history, so a restart can
                        // never reset an overdue entry.
                        let last_fired_at_ms = existing.last_fired_at_ms;
                        let next_fire_at_ms = existing.next_fire_at_ms;
                        *existing = entry.clone();
                        existing.last_fired_at_ms = last_fired_at_ms;
                        existing.next_fire_at_ms = next_fire_at_ms;
                    }
                }
            }

            Event::CronFired {
                name,
                fired_at_ms,
                next_fire_at_ms,
            } => {
                if let Some(entry) = self.scheduled.get_mut(name) {
                    entry.last_fired_at_ms = Some(*fired_at_ms);
                    entry.next_fire_at_ms = *next_fire_at_ms;
                }
            }

            Event::CronToggled { name, enabled } => {
                if let Some(entry) = self.scheduled.get_mut(name) {
                    entry.enabled = *enabled;
                }
            }

            // -- measurement sets --
            Event::MsRegistered { record } => {
                if !self.ms_records.contains_key(&record.ms_path) {
                    self.ms_records.insert(record.ms_path.clone(), record.clone());
                }
            }

            Event::MsTransitioned {
                ms_path,
                from,
                to,
                checkpoint,
                at_ms,
            } => {
                if let Some(record) = self.ms_records.get_mut(ms_path) {
                    if record.state == *from {
                        let recovering =
                            matches!(from, MsState::Failed | MsState::Quarantined);
                        record.state = *to;
                        record.updated_at_ms = *at_ms;
                        if checkpoint.is_some() {
                            record.checkpoint = checkpoint.clone();
                        }
                        // A successful forward move clears failure
                        // tracking. A recovery move (failed back to the
                        // prior state) keeps retry_count so repeated
                        // failures on the same stage still quarantine.
                        if !recovering && !matches!(to, MsState::Failed | MsState::Quarantined) {
                            record.retry_count = 0;
                            record.last_error = None;
                            record.prior_state = None;
                        }
                    }
                }
            }

            Event::MsFailed {
                ms_path,
                error,
                at_ms,
            } => {
                if let Some(record) = self.ms_records.get_mut(ms_path) {
                    if record.state != MsState::Failed {
                        record.prior_state = Some(record.state);
                        record.retry_count += 1;
                        record.state = MsState::Failed;
                    }
                    record.last_error = Some(error.clone());
                    record.updated_at_ms = *at_ms;
                }
            }

            Event::MsQuarantined { ms_path, at_ms } => {
                if let Some(record) = self.ms_records.get_mut(ms_path) {
                    record.state = MsState::Quarantined;
                    record.updated_at_ms = *at_ms;
                }
            }

            // Observability-only events; never persisted state.
            Event::StageStarted { .. } | Event::StageFinished { .. } => {}
        }
    }

    /// Advance stable member files to `grouped`.
    fn advance_members(files: &mut HashMap<PathBuf, SubbandFile>, members: &[PathBuf]) {
        for path in members {
            if let Some(file) = files.get_mut(path) {
                if file.state == FileState::Stable {
                    file.state = FileState::Grouped;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
