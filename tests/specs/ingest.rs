// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Ingest specs: grouping, timeout-accept, file immutability.

use crate::prelude::*;
use contimg_core::{FakeClock, FileState, GroupId, GroupStatus, SubbandFile, TaskStatus};
use contimg_engine::{IngestRunner, StableFile};
use contimg_core::IngestConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn stable(ts: &str, index: u8) -> StableFile {
    StableFile {
        path: PathBuf::from(format!("/data/incoming/{}_sb{:02}.hdf5", ts, index)),
        mtime_ms: 1_000,
        size: 4096,
    }
}

struct IngestFixture {
    _dir: tempfile::TempDir,
    store: Arc<contimg_storage::Store<FakeClock>>,
    clock: FakeClock,
    tx: mpsc::Sender<StableFile>,
    handle: contimg_engine::IngestHandle,
}

fn ingest_fixture(expected: u8, min_required: u8) -> IngestFixture {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::new();
    let store = open_store(dir.path(), &clock);

    let mut config = IngestConfig::new("/data/incoming");
    config.expected_subbands = expected;
    config.min_required_subbands = Some(min_required);
    config.scan_interval = Duration::from_millis(20);

    let (tx, rx) = mpsc::channel(64);
    let handle = IngestRunner::start(
        Arc::clone(&store),
        config,
        "contimg",
        3,
        rx,
        clock.clone(),
    );

    IngestFixture {
        _dir: dir,
        store,
        clock,
        tx,
        handle,
    }
}

/// Sixteen stable subbands produce exactly one
/// complete group and one conversion trigger.
#[tokio::test]
async fn complete_group_fires_once_with_all_members() {
    let f = ingest_fixture(16, 16);

    for index in 0..16u8 {
        f.tx.send(stable("2025-06-01T12:00:00", index)).await.unwrap();
    }

    let store = Arc::clone(&f.store);
    eventually("conversion trigger spawned", move || {
        store
            .list_tasks("contimg", Some(TaskStatus::Pending), 10)
            .iter()
            .any(|t| t.task_name == "conversion")
    })
    .await;

    let tasks = f.store.list_tasks("contimg", None, 10);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].params["group_id"], "2025-06-01T12:00:00");
    assert_eq!(tasks[0].params["members"].as_array().unwrap().len(), 16);

    let group = f
        .store
        .get_group(&GroupId::new("2025-06-01T12:00:00"))
        .unwrap();
    assert_eq!(group.status, GroupStatus::Dispatched);

    f.handle.stop();
}

/// Fourteen of sixteen subbands by the deadline, floor of twelve.
/// The group is accepted degraded at the deadline; the straggler that
/// limps in later is reported and not included.
#[tokio::test]
async fn partial_group_timeout_accept_excludes_late_file() {
    let f = ingest_fixture(16, 12);

    for index in 0..14u8 {
        f.tx.send(stable("2025-06-01T12:00:00", index)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(f.store.list_tasks("contimg", None, 10).is_empty());

    // the ten-minute deadline passes
    f.clock.advance(Duration::from_secs(601));

    let store = Arc::clone(&f.store);
    eventually("degraded group dispatched", move || {
        !store
            .list_tasks("contimg", Some(TaskStatus::Pending), 10)
            .is_empty()
    })
    .await;

    // the 15th subband arrives at T+11m
    f.tx.send(stable("2025-06-01T12:00:30", 14)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let tasks = f.store.list_tasks("contimg", None, 10);
    assert_eq!(tasks.len(), 1, "late subband must not spawn anything");
    assert_eq!(tasks[0].params["members"].as_array().unwrap().len(), 14);
    assert_eq!(tasks[0].params["observed_subbands"], 14);

    // the straggler is durably marked unparsable_late
    f.store.with_state(|state| {
        let late = &state.files
            [&PathBuf::from("/data/incoming/2025-06-01T12:00:30_sb14.hdf5")];
        assert_eq!(late.state, FileState::UnparsableLate);
    });

    f.handle.stop();
}

/// Group below the floor at the deadline is abandoned, never dispatched.
#[tokio::test]
async fn timed_out_sparse_group_is_abandoned() {
    let f = ingest_fixture(16, 12);

    for index in 0..5u8 {
        f.tx.send(stable("2025-06-01T12:00:00", index)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    f.clock.advance(Duration::from_secs(601));

    let store = Arc::clone(&f.store);
    eventually("group resolved", move || {
        store
            .get_group(&GroupId::new("2025-06-01T12:00:00"))
            .is_some_and(|g| g.status == GroupStatus::TimedOut)
    })
    .await;

    assert!(f.store.list_tasks("contimg", None, 10).is_empty());
    f.handle.stop();
}

/// Registered landing files advance monotonically
/// and never regress once consumed.
#[tokio::test]
async fn file_rows_advance_monotonically() {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::new();
    let store = open_store(dir.path(), &clock);

    let file = SubbandFile {
        path: PathBuf::from("/data/incoming/2025-06-01T12:00:00_sb00.hdf5"),
        mtime_ms: 1_000,
        size: 64,
        group_id: GroupId::new("2025-06-01T12:00:00"),
        subband_index: 0,
        state: FileState::Seen,
    };
    store.register_file(file.clone(), 16).unwrap();
    store.mark_file_stable(&file.path).unwrap();
    store.mark_files_consumed(std::slice::from_ref(&file.path)).unwrap();

    store.mark_file_stable(&file.path).unwrap();
    store.with_state(|state| {
        assert_eq!(state.files[&file.path].state, FileState::Consumed);
    });
}
