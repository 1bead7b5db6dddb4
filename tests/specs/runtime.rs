// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end runtime spec: the happy path.

use crate::prelude::*;
use contimg_core::{Event, FileState, MsState, SystemClock, TaskStatus};
use contimg_engine::{CoreRuntime, PipelineRegistry};
use std::path::Path;
use std::sync::Arc;

/// Sixteen stable subband files flow through grouping, conversion,
/// calibration, imaging, and mosaicking, leaving one measurement set
/// in `mosaicked`, the landing files consumed, and every pipeline task
/// completed.
#[tokio::test]
async fn happy_path_sixteen_subbands_to_mosaic() {
    let landing = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();

    for index in 0..16u8 {
        std::fs::write(
            landing
                .path()
                .join(format!("2025-06-01T12:00:00_sb{:02}.hdf5", index)),
            b"visibility data",
        )
        .unwrap();
    }

    let runtime = CoreRuntime::start(
        data.path(),
        fast_core_config(landing.path()),
        happy_kernels(),
        PipelineRegistry::standard(),
        SystemClock,
    )
    .unwrap();

    let mut sub = runtime.bus().subscribe();
    let store = runtime.store();

    let ms_path = Path::new("/ms/2025-06-01T12:00:00.ms");
    {
        let store = Arc::clone(&store);
        eventually("measurement set mosaicked", move || {
            store
                .ms_record(ms_path)
                .is_some_and(|r| r.state == MsState::Mosaicked)
        })
        .await;
    }

    // the group dispatched exactly one conversion chain: four pipeline
    // tasks, all completed
    {
        let store = Arc::clone(&store);
        eventually("all pipeline tasks completed", move || {
            let stats = store.queue_stats("contimg");
            stats.completed == 4 && stats.running == 0 && stats.pending == 0
        })
        .await;
    }

    // landing files were consumed exactly once and never touched on disk
    store.with_state(|state| {
        assert_eq!(state.files.len(), 16);
        assert!(state
            .files
            .values()
            .all(|f| f.state == FileState::Consumed));
    });
    for index in 0..16u8 {
        let path = landing
            .path()
            .join(format!("2025-06-01T12:00:00_sb{:02}.hdf5", index));
        assert_eq!(std::fs::read(&path).unwrap(), b"visibility data");
    }

    // lineage events were observable on the bus
    let group_complete = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        sub.recv_matching(|e| matches!(e, Event::GroupCompleted { .. })),
    )
    .await
    .expect("no group completion event on the bus")
    .expect("bus closed early");
    assert_eq!(
        group_complete.log_summary(),
        "group:completed 2025-06-01T12:00:00"
    );

    runtime.shutdown().await;

    // the final checkpoint makes a cold restart cheap: reopen and the
    // state is already there
    let config = fast_core_config(landing.path());
    let store = contimg_storage::Store::open(data.path(), config.queue, SystemClock).unwrap();
    assert_eq!(
        store.ms_record(ms_path).map(|r| r.state),
        Some(MsState::Mosaicked)
    );
    assert_eq!(store.queue_stats("contimg").completed, 4);
}

/// Operator surface against a live runtime: stats and MS listing.
#[tokio::test]
async fn control_surface_reflects_progress() {
    let landing = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();

    let mut config = fast_core_config(landing.path());
    config.ingest.expected_subbands = 2;

    for index in 0..2u8 {
        std::fs::write(
            landing
                .path()
                .join(format!("2025-06-01T13:00:00_sb{:02}.hdf5", index)),
            b"visibility data",
        )
        .unwrap();
    }

    let runtime = CoreRuntime::start(
        data.path(),
        config,
        happy_kernels(),
        PipelineRegistry::standard(),
        SystemClock,
    )
    .unwrap();

    let control = runtime.control();
    let store = runtime.store();
    {
        let store = Arc::clone(&store);
        eventually("chain finished", move || {
            store.queue_stats("contimg").completed == 4
        })
        .await;
    }

    let records = control.list_ms_states(Some(MsState::Mosaicked), 10);
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].ms_path,
        Path::new("/ms/2025-06-01T13:00:00.ms")
    );

    assert!(control
        .list_tasks(Some(TaskStatus::Completed), 10)
        .iter()
        .all(|t| t.queue == "contimg"));

    runtime.shutdown().await;
}
