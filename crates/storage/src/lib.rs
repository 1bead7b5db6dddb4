// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! contimg-storage: the durable store behind the ingest queue, task
//! queue, cron table, and measurement-set lifecycle records.
//!
//! Every mutation is an event appended to a JSONL write-ahead log and
//! applied to an in-memory materialized state. Recovery is snapshot +
//! replay. All conditional updates run under one lock, which is what
//! makes claim, MS transition, cron fire, and group dispatch atomic.

mod checkpoint;
mod snapshot;
mod state;
mod store;
mod wal;

pub use checkpoint::{
    load_snapshot, CheckpointError, CheckpointWriter, Checkpointer, FsCheckpointWriter,
};
pub use snapshot::{rotate_bak_path, Snapshot, SnapshotError, CURRENT_SNAPSHOT_VERSION};
pub use state::MaterializedState;
pub use store::{
    Heartbeat, MsTransition, QueueStats, Store, StoreError, TimeoutOutcome, SNAPSHOT_FILE,
    WAL_FILE,
};
pub use wal::{Wal, WalEntry, WalError};
