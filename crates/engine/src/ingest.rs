// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Ingest orchestration: stable files in, conversion triggers out.
//!
//! Consumes the watcher's stable-file stream, clusters subbands into
//! groups, records everything durably, and dispatches a conversion
//! pipeline trigger exactly once per group - either on completion or
//! on an accepted timeout.
//!
//! Degraded-group policy: a group that times out with at least
//! `min_required` stable members IS dispatched (with only the observed
//! members); a group below the floor is abandoned and never processed.

use crate::grouper::{Assignment, SubbandGrouper};
use crate::watch::StableFile;
use contimg_core::{
    Clock, FileState, GroupId, GroupStatus, IngestConfig, SpawnRequest, SubbandFile, SubbandName,
};
use contimg_storage::{Store, StoreError, TimeoutOutcome};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pipeline triggered for each dispatched group.
const CONVERSION_PIPELINE: &str = "conversion";

/// Handle to the running ingest task.
pub struct IngestHandle {
    task: JoinHandle<()>,
}

impl IngestHandle {
    pub fn stop(self) {
        self.task.abort();
    }
}

/// Wires watcher → grouper → store.
pub struct IngestRunner<C: Clock> {
    store: Arc<Store<C>>,
    config: IngestConfig,
    queue: String,
    max_attempts: u32,
    clock: C,
    grouper: SubbandGrouper,
}

impl<C: Clock> IngestRunner<C> {
    /// Start the ingest loop over a stream of stable files.
    pub fn start(
        store: Arc<Store<C>>,
        config: IngestConfig,
        queue: impl Into<String>,
        max_attempts: u32,
        rx: mpsc::Receiver<StableFile>,
        clock: C,
    ) -> IngestHandle {
        let mut runner = Self {
            grouper: SubbandGrouper::new(config.cluster_tolerance, config.group_timeout),
            store,
            config,
            queue: queue.into(),
            max_attempts,
            clock,
        };

        // Re-open clusters for groups that were partial at shutdown.
        for group in runner.store.partial_groups() {
            runner.grouper.restore_open(&group.group_id);
        }

        let task = tokio::spawn(runner.run(rx));
        IngestHandle { task }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<StableFile>) {
        info!(
            queue = %self.queue,
            expected = self.config.expected_subbands,
            min_required = self.config.min_required(),
            "ingest runner started"
        );
        let mut sweep = tokio::time::interval(self.config.scan_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                stable = rx.recv() => match stable {
                    Some(file) => self.handle_stable_file(file),
                    None => {
                        info!("stable-file stream closed, ingest exiting");
                        return;
                    }
                },
                _ = sweep.tick() => self.sweep(),
            }
        }
    }

    fn handle_stable_file(&mut self, stable: StableFile) {
        let name = match SubbandName::parse(&stable.path) {
            Ok(name) => name,
            Err(e) => {
                warn!(path = %stable.path.display(), error = %e, "unparsable landing file, skipping");
                return;
            }
        };

        let group_id = match self.grouper.assign(&name, self.clock.utc()) {
            Assignment::Open(group_id) => group_id,
            Assignment::Late(group_id) => {
                warn!(
                    path = %stable.path.display(),
                    group = %group_id,
                    "late subband for a resolved group, not included"
                );
                // Durable mark so the rejection survives restart and
                // reaches bus observers.
                let late = SubbandFile {
                    path: stable.path.clone(),
                    mtime_ms: stable.mtime_ms,
                    size: stable.size,
                    group_id: group_id.clone(),
                    subband_index: name.subband_index,
                    state: FileState::UnparsableLate,
                };
                if let Err(e) = self.store.mark_file_unparsable_late(late) {
                    warn!(path = %stable.path.display(), error = %e, "late mark failed");
                }
                return;
            }
        };

        let file = SubbandFile {
            path: stable.path.clone(),
            mtime_ms: stable.mtime_ms,
            size: stable.size,
            group_id: group_id.clone(),
            subband_index: name.subband_index,
            state: FileState::Seen,
        };
        match self
            .store
            .register_file(file, self.config.expected_subbands)
        {
            Ok(()) => {}
            Err(StoreError::SubbandOutOfRange { index, .. }) => {
                warn!(path = %stable.path.display(), index, "subband index out of range, skipping");
                return;
            }
            Err(e) => {
                warn!(path = %stable.path.display(), error = %e, "file registration failed");
                return;
            }
        }
        if let Err(e) = self.store.mark_file_stable(&stable.path) {
            warn!(path = %stable.path.display(), error = %e, "stability mark failed");
            return;
        }

        match self.store.try_complete_group(&group_id) {
            Ok((true, _members)) => self.dispatch(&group_id),
            Ok((false, _)) => {}
            Err(e) => warn!(group = %group_id, error = %e, "completion check failed"),
        }
    }

    /// Deadline scan: resolve overdue partial groups, and dispatch any
    /// group left complete-but-undispatched by a crash.
    fn sweep(&mut self) {
        let now_ms = self.clock.epoch_ms();
        let timeout_ms = self.config.group_timeout.as_millis() as u64;

        for group in self.store.partial_groups() {
            if now_ms.saturating_sub(group.first_seen_at_ms) < timeout_ms {
                continue;
            }
            match self
                .store
                .time_out_group(&group.group_id, self.config.min_required())
            {
                Ok(TimeoutOutcome::Accepted(members)) => {
                    info!(
                        group = %group.group_id,
                        members = members.len(),
                        expected = group.expected_subbands,
                        "group timed out with enough members, dispatching degraded"
                    );
                    self.dispatch(&group.group_id);
                }
                Ok(TimeoutOutcome::Abandoned) => {
                    warn!(
                        group = %group.group_id,
                        observed = group.observed_subbands.len(),
                        min_required = self.config.min_required(),
                        "group abandoned below the member floor"
                    );
                    self.grouper.close(&group.group_id, self.clock.utc());
                }
                Ok(TimeoutOutcome::AlreadyResolved) => {}
                Err(e) => warn!(group = %group.group_id, error = %e, "timeout check failed"),
            }
        }

        // Crash recovery: dispatchable groups whose conversion task was
        // never spawned.
        let stranded: Vec<GroupId> = self.store.with_state(|state| {
            state
                .groups
                .values()
                .filter(|g| g.dispatchable && g.status != GroupStatus::Dispatched)
                .map(|g| g.group_id.clone())
                .collect()
        });
        for group_id in stranded {
            debug!(group = %group_id, "re-dispatching stranded group");
            self.dispatch(&group_id);
        }
    }

    /// Spawn the conversion trigger and mark the group dispatched -
    /// atomically, so it can only ever happen once per group.
    fn dispatch(&mut self, group_id: &GroupId) {
        let Some(group) = self.store.get_group(group_id) else {
            warn!(group = %group_id, "dispatch of unknown group");
            return;
        };
        if group.status == GroupStatus::Dispatched {
            return;
        }

        let members: Vec<String> = group
            .members
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        let params = json!({
            "group_id": group_id.as_str(),
            "members": members,
            "expected_subbands": group.expected_subbands,
            "observed_subbands": group.observed_subbands.len(),
        });
        let request = SpawnRequest::new(self.queue.clone(), CONVERSION_PIPELINE, params)
            .max_attempts(self.max_attempts);

        match self.store.dispatch_group(group_id, request) {
            Ok(task_id) => {
                info!(
                    group = %group_id,
                    task_id = %task_id.short(8),
                    members = group.members.len(),
                    "group dispatched"
                );
                self.grouper.close(group_id, self.clock.utc());
            }
            Err(StoreError::GroupAlreadyDispatched(_)) => {
                self.grouper.close(group_id, self.clock.utc());
            }
            Err(e) => warn!(group = %group_id, error = %e, "dispatch failed"),
        }
    }
}

#[cfg(test)]
#[path = "ingest_tests.rs"]
mod tests;
