// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The durable store: one transactional API over WAL + materialized state.
//!
//! Every operation follows the same shape: validate under the state
//! lock, append the resulting events to the WAL, fsync, apply them to
//! the materialized state, release the lock, then mirror the events to
//! registered sinks. Holding one lock across validate-and-append is
//! what makes conditional updates (claim, MS transition, cron fire,
//! group dispatch) atomic; the fsync before return is what makes the
//! acknowledgement durable.

use crate::checkpoint::{Checkpointer, FsCheckpointWriter};
use crate::{load_snapshot, CheckpointError, MaterializedState, SnapshotError, Wal, WalError};
use contimg_core::{
    Clock, DeadLetterReason, ErrorCode, Event, EventSink, FileState, GroupId, GroupStatus, IdGen,
    MsRecord, MsState, QueueConfig, ResumePlan, RetryPolicy, ScheduledTask, SpawnRequest,
    SubbandFile, Task, TaskError, TaskId, TaskStatus, UuidIdGen, WorkerId,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// WAL file name under the data directory.
pub const WAL_FILE: &str = "events.wal";
/// Snapshot file name under the data directory.
pub const SNAPSHOT_FILE: &str = "state.snapshot";

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("task {task_id} is {status}, cannot {op}")]
    InvalidStatus {
        task_id: String,
        status: TaskStatus,
        op: &'static str,
    },
    #[error("task {task_id} not held by {worker}")]
    WorkerMismatch { task_id: String, worker: WorkerId },
    #[error("dead letter entry not found: {0}")]
    DeadLetterNotFound(String),
    #[error("dead letter queue is disabled")]
    DeadLetterDisabled,
    #[error("file not registered: {0}")]
    FileNotFound(PathBuf),
    #[error("file {path}: subband index {index} out of range 0..{expected}")]
    SubbandOutOfRange {
        path: PathBuf,
        index: u8,
        expected: u8,
    },
    #[error("file {0}: conflicting registration for a non-seen file")]
    FileConflict(PathBuf),
    #[error("group not found: {0}")]
    GroupNotFound(String),
    #[error("group {0} is not dispatchable")]
    GroupNotDispatchable(String),
    #[error("group {0} already dispatched")]
    GroupAlreadyDispatched(String),
    #[error("measurement set not found: {0}")]
    MsNotFound(PathBuf),
    #[error("{ms_path}: state is {found}, expected {expected}")]
    StateMismatch {
        ms_path: PathBuf,
        expected: MsState,
        found: MsState,
    },
    #[error("illegal transition {from} -> {to}")]
    InvalidTransition { from: MsState, to: MsState },
    #[error("scheduled task not found: {0}")]
    CronNotFound(String),
}

/// Result of a heartbeat: the lease was renewed, and the claimant may
/// have been asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    Renewed,
    CancelRequested,
}

/// Result of a conditional MS transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsTransition {
    Applied,
    /// The transition had already been applied; safe retry.
    NoOp,
}

/// Outcome of a group timeout check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// Enough members arrived; the group may be dispatched degraded.
    Accepted(Vec<PathBuf>),
    /// Too few members; the group is dropped.
    Abandoned,
    /// The group already left `partial` (lost a race with completion).
    AlreadyResolved,
}

/// Per-status task counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_letter: usize,
    pub cancelled: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed + self.dead_letter + self.cancelled
    }
}

struct Inner {
    wal: Wal,
    state: MaterializedState,
    last_snapshot_seq: u64,
}

/// The durable store.
pub struct Store<C: Clock> {
    inner: Mutex<Inner>,
    sinks: Mutex<Vec<Arc<dyn EventSink>>>,
    checkpointer: Checkpointer<FsCheckpointWriter>,
    queue_config: QueueConfig,
    clock: C,
    ids: UuidIdGen,
}

impl<C: Clock> Store<C> {
    /// Open or create a store under `data_dir`: load the snapshot,
    /// replay WAL entries after it.
    pub fn open(data_dir: &Path, queue_config: QueueConfig, clock: C) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir).map_err(WalError::Io)?;
        let snapshot_path = data_dir.join(SNAPSHOT_FILE);

        let (mut state, snapshot_seq) = match load_snapshot(&snapshot_path)? {
            Some(snapshot) => (snapshot.state, snapshot.seq),
            None => (MaterializedState::default(), 0),
        };

        let mut wal = Wal::open(&data_dir.join(WAL_FILE))?;
        wal.ensure_seq_at_least(snapshot_seq);

        let replayed = wal.entries_after(snapshot_seq)?;
        let replay_count = replayed.len();
        for entry in replayed {
            state.apply_event(&entry.event);
        }

        info!(
            data_dir = %data_dir.display(),
            snapshot_seq,
            replayed = replay_count,
            tasks = state.tasks.len(),
            "store opened"
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                wal,
                state,
                last_snapshot_seq: snapshot_seq,
            }),
            sinks: Mutex::new(Vec::new()),
            checkpointer: Checkpointer::new(snapshot_path),
            queue_config,
            clock,
            ids: UuidIdGen,
        })
    }

    /// Register an observer. Sinks must never block.
    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.sinks.lock().push(sink);
    }

    /// Run a read-only closure against the materialized state.
    pub fn with_state<R>(&self, f: impl FnOnce(&MaterializedState) -> R) -> R {
        f(&self.inner.lock().state)
    }

    /// Durably commit events: WAL append + fsync, then apply.
    fn commit(inner: &mut Inner, events: &[Event]) -> Result<(), StoreError> {
        for event in events {
            inner.wal.append(event)?;
            debug!(event = %event.log_summary(), "committing");
        }
        inner.wal.flush()?;
        for event in events {
            inner.state.apply_event(event);
        }
        Ok(())
    }

    fn publish(&self, events: &[Event]) {
        let sinks = self.sinks.lock();
        for sink in sinks.iter() {
            for event in events {
                sink.publish(event);
            }
        }
    }

    fn effective_policy(&self, task: &Task) -> RetryPolicy {
        match &task.retry {
            Some(policy) => policy.clone(),
            None => {
                let mut policy = self.queue_config.retry_policy();
                policy.max_attempts = task.max_attempts;
                policy
            }
        }
    }

    /// Build a fresh task row from a spawn request.
    fn build_task(&self, req: SpawnRequest, now: u64) -> Task {
        Task {
            id: self.ids.next_task_id(),
            queue: req.queue,
            task_name: req.task_name,
            params: req.params,
            status: TaskStatus::Pending,
            priority: req.priority,
            attempts: 0,
            max_attempts: req.max_attempts,
            created_at_ms: now,
            scheduled_at_ms: now + req.delay_ms,
            claimed_at_ms: None,
            claimed_by: None,
            lease_expires_at_ms: None,
            last_error: None,
            error_history: Vec::new(),
            parent_task_id: req.parent_task_id,
            retry: req.retry,
            cancel_requested: false,
            result: None,
        }
    }

    // ------------------------------------------------------------------
    // Task operations
    // ------------------------------------------------------------------

    /// Insert a new pending task row.
    pub fn spawn(&self, req: SpawnRequest) -> Result<TaskId, StoreError> {
        let now = self.clock.epoch_ms();
        let task = self.build_task(req, now);
        let task_id = task.id.clone();

        let events = vec![Event::TaskSpawned { task }];
        {
            let mut inner = self.inner.lock();
            Self::commit(&mut inner, &events)?;
        }
        self.publish(&events);
        Ok(task_id)
    }

    /// Atomically claim the best eligible task in `queue`.
    ///
    /// Ordering: priority desc, scheduled_at asc, created_at asc. A
    /// running task whose lease expired is eligible for reclaim unless
    /// its attempts are exhausted, in which case it dead-letters here.
    pub fn claim(
        &self,
        queue: &str,
        worker: &WorkerId,
        lease_ttl: Duration,
    ) -> Result<Option<Task>, StoreError> {
        let now = self.clock.epoch_ms();
        let mut published = Vec::new();

        let claimed = {
            let mut inner = self.inner.lock();
            loop {
                let candidate = inner
                    .state
                    .tasks
                    .values()
                    .filter(|t| t.queue == queue && t.claimable_at(now))
                    .min_by(|a, b| {
                        b.priority
                            .cmp(&a.priority)
                            .then(a.scheduled_at_ms.cmp(&b.scheduled_at_ms))
                            .then(a.created_at_ms.cmp(&b.created_at_ms))
                            .then(a.id.as_str().cmp(b.id.as_str()))
                    })
                    .cloned();

                let Some(task) = candidate else {
                    break None;
                };

                // Invariant: running claims per task never exceed the
                // attempt bound. An expired lease whose attempts are
                // spent goes to the dead-letter queue instead.
                if task.status == TaskStatus::Running
                    && task.attempts >= task.max_attempts.max(1)
                {
                    let error = TaskError::new(
                        ErrorCode::Timeout,
                        "lease expired with attempts exhausted",
                    );
                    let mut history = task.error_history.clone();
                    history.push(error.clone());
                    let events = vec![Event::TaskDeadLettered {
                        task_id: task.id.clone(),
                        reason: DeadLetterReason::derive(&history),
                        error,
                        failed_at_ms: now,
                    }];
                    Self::commit(&mut inner, &events)?;
                    published.extend(events);
                    continue;
                }

                let events = vec![Event::TaskClaimed {
                    task_id: task.id.clone(),
                    worker_id: worker.clone(),
                    attempt: task.attempts + 1,
                    claimed_at_ms: now,
                    lease_expires_at_ms: now + lease_ttl.as_millis() as u64,
                }];
                Self::commit(&mut inner, &events)?;
                published.extend(events);

                break inner.state.tasks.get(task.id.as_str()).cloned();
            }
        };

        self.publish(&published);
        Ok(claimed)
    }

    /// Extend the caller's lease. Reports a pending cancellation.
    pub fn heartbeat(&self, task_id: &TaskId, worker: &WorkerId) -> Result<Heartbeat, StoreError> {
        let now = self.clock.epoch_ms();
        let lease_ttl = self.queue_config.lease_ttl;

        let (events, outcome) = {
            let mut inner = self.inner.lock();
            let task = inner
                .state
                .tasks
                .get(task_id.as_str())
                .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;

            if task.status != TaskStatus::Running {
                return Err(StoreError::InvalidStatus {
                    task_id: task_id.to_string(),
                    status: task.status,
                    op: "heartbeat",
                });
            }
            if task.claimed_by.as_ref() != Some(worker) {
                return Err(StoreError::WorkerMismatch {
                    task_id: task_id.to_string(),
                    worker: worker.clone(),
                });
            }

            let outcome = if task.cancel_requested {
                Heartbeat::CancelRequested
            } else {
                Heartbeat::Renewed
            };

            let events = vec![Event::TaskHeartbeat {
                task_id: task_id.clone(),
                lease_expires_at_ms: now + lease_ttl.as_millis() as u64,
            }];
            Self::commit(&mut inner, &events)?;
            (events, outcome)
        };

        self.publish(&events);
        Ok(outcome)
    }

    /// Record successful completion.
    pub fn complete(
        &self,
        task_id: &TaskId,
        worker: &WorkerId,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        let now = self.clock.epoch_ms();
        let events = {
            let mut inner = self.inner.lock();
            let task = inner
                .state
                .tasks
                .get(task_id.as_str())
                .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;

            if task.status != TaskStatus::Running {
                return Err(StoreError::InvalidStatus {
                    task_id: task_id.to_string(),
                    status: task.status,
                    op: "complete",
                });
            }
            if task.claimed_by.as_ref() != Some(worker) {
                return Err(StoreError::WorkerMismatch {
                    task_id: task_id.to_string(),
                    worker: worker.clone(),
                });
            }

            let events = vec![Event::TaskCompleted {
                task_id: task_id.clone(),
                result,
                completed_at_ms: now,
            }];
            Self::commit(&mut inner, &events)?;
            events
        };

        self.publish(&events);
        Ok(())
    }

    /// Record a failed attempt and route it: retry with backoff, dead
    /// letter, or terminal cancellation when a cancel was pending.
    pub fn fail(
        &self,
        task_id: &TaskId,
        worker: &WorkerId,
        error: TaskError,
        retryable: bool,
    ) -> Result<TaskStatus, StoreError> {
        let now = self.clock.epoch_ms();
        let (events, status) = {
            let mut inner = self.inner.lock();
            let task = inner
                .state
                .tasks
                .get(task_id.as_str())
                .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?
                .clone();

            if task.status != TaskStatus::Running {
                return Err(StoreError::InvalidStatus {
                    task_id: task_id.to_string(),
                    status: task.status,
                    op: "fail",
                });
            }
            if task.claimed_by.as_ref() != Some(worker) {
                return Err(StoreError::WorkerMismatch {
                    task_id: task_id.to_string(),
                    worker: worker.clone(),
                });
            }

            let (events, status) = if task.cancel_requested || error.code == ErrorCode::Cancelled {
                (
                    vec![Event::TaskCancelled {
                        task_id: task_id.clone(),
                        at_ms: now,
                    }],
                    TaskStatus::Cancelled,
                )
            } else {
                let policy = self.effective_policy(&task);
                let can_retry =
                    retryable && error.code.retryable() && policy.allows_retry(task.attempts);

                if can_retry {
                    let delay = policy.next_delay(
                        task.attempts,
                        error.code.backoff_class(),
                        task.id.as_str(),
                    );
                    (
                        vec![Event::TaskRetried {
                            task_id: task_id.clone(),
                            error,
                            scheduled_at_ms: now + delay.as_millis() as u64,
                        }],
                        TaskStatus::Failed,
                    )
                } else {
                    let mut history = task.error_history.clone();
                    history.push(error.clone());
                    (
                        vec![Event::TaskDeadLettered {
                            task_id: task_id.clone(),
                            reason: DeadLetterReason::derive(&history),
                            error,
                            failed_at_ms: now,
                        }],
                        TaskStatus::DeadLetter,
                    )
                }
            };

            Self::commit(&mut inner, &events)?;
            (events, status)
        };

        self.publish(&events);
        Ok(status)
    }

    /// Cancel a task. Pending and cooling-down tasks cancel
    /// immediately; running tasks get a revocation flag their claimant
    /// observes at the next heartbeat.
    pub fn cancel(&self, task_id: &TaskId) -> Result<TaskStatus, StoreError> {
        let now = self.clock.epoch_ms();
        let (events, status) = {
            let mut inner = self.inner.lock();
            let task = inner
                .state
                .tasks
                .get(task_id.as_str())
                .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;

            let (events, status) = match task.status {
                TaskStatus::Pending | TaskStatus::Failed => (
                    vec![Event::TaskCancelled {
                        task_id: task_id.clone(),
                        at_ms: now,
                    }],
                    TaskStatus::Cancelled,
                ),
                TaskStatus::Running => (
                    vec![Event::TaskCancelRequested {
                        task_id: task_id.clone(),
                    }],
                    TaskStatus::Running,
                ),
                status => {
                    return Err(StoreError::InvalidStatus {
                        task_id: task_id.to_string(),
                        status,
                        op: "cancel",
                    })
                }
            };
            Self::commit(&mut inner, &events)?;
            (events, status)
        };

        self.publish(&events);
        Ok(status)
    }

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.with_state(|state| state.get_task(task_id).cloned())
    }

    /// Tasks in a queue, newest first.
    pub fn list_tasks(
        &self,
        queue: &str,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Vec<Task> {
        self.with_state(|state| {
            let mut tasks: Vec<Task> = state
                .tasks
                .values()
                .filter(|t| t.queue == queue && status.is_none_or(|s| t.status == s))
                .cloned()
                .collect();
            tasks.sort_by(|a, b| {
                b.created_at_ms
                    .cmp(&a.created_at_ms)
                    .then(a.id.as_str().cmp(b.id.as_str()))
            });
            tasks.truncate(limit);
            tasks
        })
    }

    pub fn queue_stats(&self, queue: &str) -> QueueStats {
        self.with_state(|state| {
            let mut stats = QueueStats::default();
            for task in state.tasks.values().filter(|t| t.queue == queue) {
                match task.status {
                    TaskStatus::Pending => stats.pending += 1,
                    TaskStatus::Running => stats.running += 1,
                    TaskStatus::Completed => stats.completed += 1,
                    TaskStatus::Failed => stats.failed += 1,
                    TaskStatus::DeadLetter => stats.dead_letter += 1,
                    TaskStatus::Cancelled => stats.cancelled += 1,
                }
            }
            stats
        })
    }

    pub fn list_dead_letters(&self, queue: &str, limit: usize) -> Vec<contimg_core::DeadLetter> {
        self.with_state(|state| {
            let mut entries: Vec<_> = state
                .dead_letters
                .values()
                .filter(|d| d.original_task.queue == queue)
                .cloned()
                .collect();
            entries.sort_by(|a, b| b.failed_at_ms.cmp(&a.failed_at_ms));
            entries.truncate(limit);
            entries
        })
    }

    /// Replay a dead-lettered task as a fresh row with zeroed attempts.
    pub fn retry_dead_letter(&self, task_id: &TaskId) -> Result<TaskId, StoreError> {
        if !self.queue_config.dead_letter_enabled {
            return Err(StoreError::DeadLetterDisabled);
        }
        let original = self
            .with_state(|state| state.dead_letters.get(task_id.as_str()).cloned())
            .ok_or_else(|| StoreError::DeadLetterNotFound(task_id.to_string()))?;

        let task = original.original_task;
        let req = SpawnRequest {
            queue: task.queue,
            task_name: task.task_name,
            params: task.params,
            priority: task.priority,
            delay_ms: 0,
            max_attempts: task.max_attempts,
            parent_task_id: Some(task.id),
            retry: task.retry,
        };
        self.spawn(req)
    }

    // ------------------------------------------------------------------
    // Ingest operations
    // ------------------------------------------------------------------

    /// Register (or refresh) a landing file and record its group
    /// membership. Idempotent: identical registrations are no-ops.
    pub fn register_file(
        &self,
        file: SubbandFile,
        expected_subbands: u8,
    ) -> Result<(), StoreError> {
        if file.subband_index >= expected_subbands {
            return Err(StoreError::SubbandOutOfRange {
                path: file.path,
                index: file.subband_index,
                expected: expected_subbands,
            });
        }

        let now = self.clock.epoch_ms();
        let events = {
            let mut inner = self.inner.lock();
            match inner.state.files.get(&file.path) {
                Some(existing)
                    if existing.mtime_ms == file.mtime_ms && existing.size == file.size =>
                {
                    return Ok(()); // identical registration
                }
                Some(existing) if existing.state != FileState::Seen => {
                    return Err(StoreError::FileConflict(file.path));
                }
                _ => {}
            }

            let events = vec![Event::FileRegistered {
                file,
                expected_subbands,
                seen_at_ms: now,
            }];
            Self::commit(&mut inner, &events)?;
            events
        };

        self.publish(&events);
        Ok(())
    }

    /// Durably mark a subband that arrived after its group was
    /// resolved. The row is terminal from creation; an existing member
    /// row is never overwritten (the call no-ops).
    pub fn mark_file_unparsable_late(&self, mut file: SubbandFile) -> Result<(), StoreError> {
        let now = self.clock.epoch_ms();
        file.state = FileState::UnparsableLate;

        let events = {
            let mut inner = self.inner.lock();
            if inner.state.files.contains_key(&file.path) {
                return Ok(());
            }

            let events = vec![Event::FileUnparsableLate { file, at_ms: now }];
            Self::commit(&mut inner, &events)?;
            events
        };

        self.publish(&events);
        Ok(())
    }

    /// Transition a file `seen -> stable`. Already-stable files no-op.
    pub fn mark_file_stable(&self, path: &Path) -> Result<(), StoreError> {
        let events = {
            let mut inner = self.inner.lock();
            let file = inner
                .state
                .files
                .get(path)
                .ok_or_else(|| StoreError::FileNotFound(path.to_path_buf()))?;

            if file.state != FileState::Seen {
                return Ok(());
            }

            let events = vec![Event::FileStable {
                path: path.to_path_buf(),
            }];
            Self::commit(&mut inner, &events)?;
            events
        };

        self.publish(&events);
        Ok(())
    }

    /// Complete a group iff all expected members are present and
    /// stable. Returns `(completed, members)`. Fires the completion
    /// event at most once.
    pub fn try_complete_group(
        &self,
        group_id: &GroupId,
    ) -> Result<(bool, Vec<PathBuf>), StoreError> {
        let (events, outcome) = {
            let mut inner = self.inner.lock();
            let group = inner
                .state
                .groups
                .get(group_id.as_str())
                .ok_or_else(|| StoreError::GroupNotFound(group_id.to_string()))?;

            match group.status {
                GroupStatus::Dispatched => return Ok((false, group.members.clone())),
                GroupStatus::Complete => return Ok((true, group.members.clone())),
                GroupStatus::TimedOut => return Ok((group.dispatchable, group.members.clone())),
                GroupStatus::Partial => {}
            }

            if !group.is_full() || !Self::members_stable(&inner.state, &group.members) {
                return Ok((false, Vec::new()));
            }

            let members = group.members.clone();
            let events = vec![Event::GroupCompleted {
                group_id: group_id.clone(),
            }];
            Self::commit(&mut inner, &events)?;
            (events, (true, members))
        };

        self.publish(&events);
        Ok(outcome)
    }

    /// Resolve a partial group that hit its deadline: accept it
    /// degraded when at least `min_required` stable members arrived,
    /// abandon it otherwise.
    pub fn time_out_group(
        &self,
        group_id: &GroupId,
        min_required: u8,
    ) -> Result<TimeoutOutcome, StoreError> {
        let (events, outcome) = {
            let mut inner = self.inner.lock();
            let group = inner
                .state
                .groups
                .get(group_id.as_str())
                .ok_or_else(|| StoreError::GroupNotFound(group_id.to_string()))?;

            if group.status != GroupStatus::Partial {
                return Ok(TimeoutOutcome::AlreadyResolved);
            }

            let stable_members: Vec<PathBuf> = group
                .members
                .iter()
                .filter(|path| {
                    inner
                        .state
                        .files
                        .get(*path)
                        .is_some_and(|f| f.state != FileState::Seen)
                })
                .cloned()
                .collect();

            let accepted = stable_members.len() as u8 >= min_required;
            let events = vec![Event::GroupTimedOut {
                group_id: group_id.clone(),
                accepted,
            }];
            Self::commit(&mut inner, &events)?;

            let outcome = if accepted {
                TimeoutOutcome::Accepted(stable_members)
            } else {
                TimeoutOutcome::Abandoned
            };
            (events, outcome)
        };

        self.publish(&events);
        Ok(outcome)
    }

    /// Atomically mark the group dispatched and spawn its conversion
    /// task - one WAL batch, so neither happens without the other.
    /// Succeeds at most once per group.
    pub fn dispatch_group(
        &self,
        group_id: &GroupId,
        req: SpawnRequest,
    ) -> Result<TaskId, StoreError> {
        let now = self.clock.epoch_ms();
        let (events, task_id) = {
            let mut inner = self.inner.lock();
            let group = inner
                .state
                .groups
                .get(group_id.as_str())
                .ok_or_else(|| StoreError::GroupNotFound(group_id.to_string()))?;

            if group.status == GroupStatus::Dispatched {
                return Err(StoreError::GroupAlreadyDispatched(group_id.to_string()));
            }
            if !group.dispatchable {
                return Err(StoreError::GroupNotDispatchable(group_id.to_string()));
            }

            let task = self.build_task(req, now);
            let task_id = task.id.clone();

            let events = vec![
                Event::TaskSpawned { task },
                Event::GroupDispatched {
                    group_id: group_id.clone(),
                    task_id: task_id.clone(),
                },
            ];
            Self::commit(&mut inner, &events)?;
            (events, task_id)
        };

        self.publish(&events);
        Ok(task_id)
    }

    /// Bulk-advance files to `consumed`.
    pub fn mark_files_consumed(&self, paths: &[PathBuf]) -> Result<(), StoreError> {
        let events = {
            let mut inner = self.inner.lock();
            let known: Vec<PathBuf> = paths
                .iter()
                .filter(|p| {
                    let found = inner.state.files.contains_key(*p);
                    if !found {
                        warn!(path = %p.display(), "consuming unregistered file, skipping");
                    }
                    found
                })
                .cloned()
                .collect();

            if known.is_empty() {
                return Ok(());
            }

            let events = vec![Event::FilesConsumed { paths: known }];
            Self::commit(&mut inner, &events)?;
            events
        };

        self.publish(&events);
        Ok(())
    }

    pub fn get_group(&self, group_id: &GroupId) -> Option<contimg_core::SubbandGroup> {
        self.with_state(|state| state.groups.get(group_id.as_str()).cloned())
    }

    /// Groups still in `partial` state, for the timeout sweep.
    pub fn partial_groups(&self) -> Vec<contimg_core::SubbandGroup> {
        self.with_state(|state| {
            state
                .groups
                .values()
                .filter(|g| g.status == GroupStatus::Partial)
                .cloned()
                .collect()
        })
    }

    fn members_stable(state: &MaterializedState, members: &[PathBuf]) -> bool {
        members.iter().all(|path| {
            state
                .files
                .get(path)
                .is_some_and(|f| f.state != FileState::Seen)
        })
    }

    // ------------------------------------------------------------------
    // Measurement-set operations
    // ------------------------------------------------------------------

    /// Fetch or create the lifecycle record for `ms_path`.
    pub fn get_or_create_ms(
        &self,
        ms_path: &Path,
        parent: Option<&Path>,
    ) -> Result<MsRecord, StoreError> {
        let now = self.clock.epoch_ms();
        let (events, record) = {
            let mut inner = self.inner.lock();
            if let Some(record) = inner.state.ms_records.get(ms_path) {
                return Ok(record.clone());
            }

            let mut record = MsRecord::new(ms_path.to_path_buf(), now);
            record.parent_ms_path = parent.map(Path::to_path_buf);

            let events = vec![Event::MsRegistered {
                record: record.clone(),
            }];
            Self::commit(&mut inner, &events)?;
            (events, record)
        };

        self.publish(&events);
        Ok(record)
    }

    /// Conditional state transition.
    ///
    /// Safely retryable: a repeat of an already-applied transition
    /// returns `NoOp` success. A conflicting concurrent transition
    /// loses with `StateMismatch`.
    pub fn transition_ms(
        &self,
        ms_path: &Path,
        from: MsState,
        to: MsState,
        checkpoint: Option<serde_json::Value>,
    ) -> Result<MsTransition, StoreError> {
        let now = self.clock.epoch_ms();
        let events = {
            let mut inner = self.inner.lock();
            let record = inner
                .state
                .ms_records
                .get(ms_path)
                .ok_or_else(|| StoreError::MsNotFound(ms_path.to_path_buf()))?;

            if !from.can_transition_to(to) {
                return Err(StoreError::InvalidTransition { from, to });
            }
            // Recovery from failure may only target the recorded prior state.
            if from == MsState::Failed && record.state == MsState::Failed {
                let target = record.resume_state();
                if to != target && to != MsState::Quarantined {
                    return Err(StoreError::InvalidTransition { from, to });
                }
            }

            if record.state == to {
                return Ok(MsTransition::NoOp);
            }
            if record.state != from {
                return Err(StoreError::StateMismatch {
                    ms_path: ms_path.to_path_buf(),
                    expected: from,
                    found: record.state,
                });
            }

            let events = vec![Event::MsTransitioned {
                ms_path: ms_path.to_path_buf(),
                from,
                to,
                checkpoint,
                at_ms: now,
            }];
            Self::commit(&mut inner, &events)?;
            events
        };

        self.publish(&events);
        Ok(MsTransition::Applied)
    }

    /// Record a stage failure. Quarantines once `retry_count` reaches
    /// `max_retries` (no automatic re-enqueue afterwards).
    pub fn record_ms_failure(
        &self,
        ms_path: &Path,
        error: &str,
        max_retries: u32,
    ) -> Result<MsState, StoreError> {
        let now = self.clock.epoch_ms();
        let (events, state) = {
            let mut inner = self.inner.lock();
            let record = inner
                .state
                .ms_records
                .get(ms_path)
                .ok_or_else(|| StoreError::MsNotFound(ms_path.to_path_buf()))?;

            if record.state == MsState::Quarantined {
                return Err(StoreError::InvalidTransition {
                    from: MsState::Quarantined,
                    to: MsState::Failed,
                });
            }

            let next_retry_count = if record.state == MsState::Failed {
                record.retry_count
            } else {
                record.retry_count + 1
            };
            let quarantine = max_retries > 0 && next_retry_count >= max_retries;

            let mut events = vec![Event::MsFailed {
                ms_path: ms_path.to_path_buf(),
                error: error.to_string(),
                at_ms: now,
            }];
            let state = if quarantine {
                events.push(Event::MsQuarantined {
                    ms_path: ms_path.to_path_buf(),
                    at_ms: now,
                });
                MsState::Quarantined
            } else {
                MsState::Failed
            };
            Self::commit(&mut inner, &events)?;
            (events, state)
        };

        self.publish(&events);
        Ok(state)
    }

    /// What to run next for `ms_path`, from its current state and
    /// checkpoint.
    pub fn resume_plan(&self, ms_path: &Path) -> Result<ResumePlan, StoreError> {
        self.with_state(|state| {
            let record = state
                .ms_records
                .get(ms_path)
                .ok_or_else(|| StoreError::MsNotFound(ms_path.to_path_buf()))?;
            let from_state = record.resume_state();
            Ok(ResumePlan {
                ms_path: ms_path.to_path_buf(),
                from_state,
                next_pipeline: from_state.next_pipeline().map(String::from),
                has_checkpoint: record.checkpoint.is_some(),
            })
        })
    }

    pub fn ms_record(&self, ms_path: &Path) -> Option<MsRecord> {
        self.with_state(|state| state.ms_records.get(ms_path).cloned())
    }

    /// MS records, most recently updated first.
    pub fn list_ms(&self, state_filter: Option<MsState>, limit: usize) -> Vec<MsRecord> {
        self.with_state(|state| {
            let mut records: Vec<MsRecord> = state
                .ms_records
                .values()
                .filter(|r| state_filter.is_none_or(|s| r.state == s))
                .cloned()
                .collect();
            records.sort_by(|a, b| b.updated_at_ms.cmp(&a.updated_at_ms));
            records.truncate(limit);
            records
        })
    }

    // ------------------------------------------------------------------
    // Scheduled (cron) operations
    // ------------------------------------------------------------------

    /// Register a recurring task. Re-registration updates the
    /// definition but never resets firing history.
    pub fn register_scheduled(&self, entry: ScheduledTask) -> Result<(), StoreError> {
        let events = {
            let mut inner = self.inner.lock();
            if let Some(existing) = inner.state.scheduled.get(&entry.name) {
                let unchanged = existing.schedule == entry.schedule
                    && existing.queue == entry.queue
                    && existing.task_name == entry.task_name
                    && existing.params_template == entry.params_template
                    && existing.catchup == entry.catchup;
                if unchanged {
                    return Ok(());
                }
            }

            let events = vec![Event::CronRegistered { entry }];
            Self::commit(&mut inner, &events)?;
            events
        };

        self.publish(&events);
        Ok(())
    }

    /// Fire a due entry: advance `next_fire_at` and spawn from the
    /// template in one atomic batch. Returns `None` when the entry is
    /// not due - a restarted scheduler cannot double-fire.
    pub fn fire_scheduled(&self, name: &str) -> Result<Option<TaskId>, StoreError> {
        let now_ms = self.clock.epoch_ms();
        let now_utc = self.clock.utc();

        let (events, task_id) = {
            let mut inner = self.inner.lock();
            let entry = inner
                .state
                .scheduled
                .get(name)
                .ok_or_else(|| StoreError::CronNotFound(name.to_string()))?;

            if !entry.due_at(now_ms) {
                return Ok(None);
            }

            let fired_at_ms = entry.next_fire_at_ms;
            // Default policy: no catch-up. The next instant is computed
            // from now, so downtime collapses to a single fire.
            let next_base = if entry.catchup {
                chrono::DateTime::from_timestamp_millis(fired_at_ms as i64).unwrap_or(now_utc)
            } else {
                now_utc
            };
            let next_fire_at_ms = entry
                .schedule
                .next_after(next_base)
                .map(|t| t.timestamp_millis() as u64)
                .unwrap_or(u64::MAX);

            let mut req = SpawnRequest::new(
                entry.queue.clone(),
                entry.task_name.clone(),
                entry.params_template.clone(),
            );
            req.max_attempts = self.queue_config.max_attempts;
            let task = self.build_task(req, now_ms);
            let task_id = task.id.clone();

            let events = vec![
                Event::CronFired {
                    name: name.to_string(),
                    fired_at_ms,
                    next_fire_at_ms,
                },
                Event::TaskSpawned { task },
            ];
            Self::commit(&mut inner, &events)?;
            (events, task_id)
        };

        self.publish(&events);
        Ok(Some(task_id))
    }

    pub fn set_scheduled_enabled(&self, name: &str, enabled: bool) -> Result<(), StoreError> {
        let events = {
            let mut inner = self.inner.lock();
            let entry = inner
                .state
                .scheduled
                .get(name)
                .ok_or_else(|| StoreError::CronNotFound(name.to_string()))?;
            if entry.enabled == enabled {
                return Ok(());
            }

            let events = vec![Event::CronToggled {
                name: name.to_string(),
                enabled,
            }];
            Self::commit(&mut inner, &events)?;
            events
        };

        self.publish(&events);
        Ok(())
    }

    pub fn list_scheduled(&self) -> Vec<ScheduledTask> {
        self.with_state(|state| {
            let mut entries: Vec<_> = state.scheduled.values().cloned().collect();
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            entries
        })
    }

    // ------------------------------------------------------------------
    // Checkpointing
    // ------------------------------------------------------------------

    /// Write a durable snapshot and truncate the WAL behind it.
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        let (seq, state_clone) = {
            let mut inner = self.inner.lock();
            inner.wal.flush()?;
            (inner.wal.write_seq(), inner.state.clone())
        };

        // Snapshot durability (including directory fsync) comes before
        // WAL truncation; a crash between the two only costs replay time.
        self.checkpointer.checkpoint(seq, &state_clone)?;

        {
            let mut inner = self.inner.lock();
            inner.wal.truncate_before(seq + 1)?;
            inner.last_snapshot_seq = seq;
        }

        info!(seq, "checkpoint complete");
        Ok(())
    }

    /// Checkpoint when at least `min_events` accumulated since the last one.
    pub fn maybe_checkpoint(&self, min_events: u64) -> Result<bool, StoreError> {
        let due = {
            let inner = self.inner.lock();
            inner.wal.write_seq() - inner.last_snapshot_seq >= min_events
        };
        if due {
            self.checkpoint()?;
        }
        Ok(due)
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
