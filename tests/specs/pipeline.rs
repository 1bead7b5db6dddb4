// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pipeline specs: duplicate transitions and MS lineage.

use crate::prelude::*;
use contimg_core::{FakeClock, MsState};
use contimg_storage::MsTransition;
use std::path::Path;
use std::sync::Arc;

/// Two workers record the same transition "at the same instant".
/// Exactly one applies it; the other sees a safe no-op and must not
/// chain the next stage.
#[tokio::test]
async fn concurrent_duplicate_transition_single_winner() {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::new();
    let store = open_store(dir.path(), &clock);
    let ms = Path::new("/ms/2025-06-01T12:00:00.ms");

    store.get_or_create_ms(ms, None).unwrap();
    store
        .transition_ms(ms, MsState::Registered, MsState::Converted, None)
        .unwrap();

    let mut racers = Vec::new();
    for _ in 0..2 {
        let store = Arc::clone(&store);
        let ms = ms.to_path_buf();
        racers.push(tokio::spawn(async move {
            store.transition_ms(&ms, MsState::Converted, MsState::Calibrated, None)
        }));
    }

    let mut applied = 0;
    let mut noop = 0;
    for racer in racers {
        match racer.await.unwrap() {
            Ok(MsTransition::Applied) => applied += 1,
            Ok(MsTransition::NoOp) => noop += 1,
            Err(e) => panic!("unexpected transition error: {}", e),
        }
    }

    assert_eq!(applied, 1, "exactly one racer may apply the transition");
    assert_eq!(noop, 1);
    assert_eq!(store.ms_record(ms).unwrap().state, MsState::Calibrated);
}

/// Idempotence law: transition(ms, A, B) twice equals once.
#[tokio::test]
async fn repeated_transition_is_noop_success() {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::new();
    let store = open_store(dir.path(), &clock);
    let ms = Path::new("/ms/a.ms");

    store.get_or_create_ms(ms, None).unwrap();
    assert_eq!(
        store
            .transition_ms(ms, MsState::Registered, MsState::Converted, None)
            .unwrap(),
        MsTransition::Applied
    );
    assert_eq!(
        store
            .transition_ms(ms, MsState::Registered, MsState::Converted, None)
            .unwrap(),
        MsTransition::NoOp
    );

    let record = store.ms_record(ms).unwrap();
    assert_eq!(record.state, MsState::Converted);
}

/// The MS state DAG is enforced; downgrades only exist
/// from `failed` back to the prior successful state.
#[tokio::test]
async fn ms_state_dag_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::new();
    let store = open_store(dir.path(), &clock);
    let ms = Path::new("/ms/a.ms");
    store.get_or_create_ms(ms, None).unwrap();

    // forward skips are rejected
    assert!(store
        .transition_ms(ms, MsState::Registered, MsState::Imaged, None)
        .is_err());

    store
        .transition_ms(ms, MsState::Registered, MsState::Converted, None)
        .unwrap();
    // arbitrary downgrades are rejected
    assert!(store
        .transition_ms(ms, MsState::Converted, MsState::Registered, None)
        .is_err());

    // the sanctioned downgrade: failed → prior successful state
    store.record_ms_failure(ms, "solver diverged", 5).unwrap();
    store
        .transition_ms(ms, MsState::Failed, MsState::Converted, None)
        .unwrap();
    assert_eq!(store.ms_record(ms).unwrap().state, MsState::Converted);
}

/// Quarantine after repeated failures on the same stage; no automatic
/// re-enqueue is possible afterwards.
#[tokio::test]
async fn repeated_stage_failures_quarantine() {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::new();
    let store = open_store(dir.path(), &clock);
    let ms = Path::new("/ms/a.ms");
    store.get_or_create_ms(ms, None).unwrap();
    store
        .transition_ms(ms, MsState::Registered, MsState::Converted, None)
        .unwrap();

    assert_eq!(
        store.record_ms_failure(ms, "oom", 3).unwrap(),
        MsState::Failed
    );
    store
        .transition_ms(ms, MsState::Failed, MsState::Converted, None)
        .unwrap();
    assert_eq!(
        store.record_ms_failure(ms, "oom", 3).unwrap(),
        MsState::Failed
    );
    store
        .transition_ms(ms, MsState::Failed, MsState::Converted, None)
        .unwrap();
    assert_eq!(
        store.record_ms_failure(ms, "oom", 3).unwrap(),
        MsState::Quarantined
    );

    assert!(store.record_ms_failure(ms, "again", 3).is_err());
}
