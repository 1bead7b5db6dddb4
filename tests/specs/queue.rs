// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable-queue specs: crash recovery, poison payloads, terminal
//! immutability.

use crate::prelude::*;
use contimg_core::{
    BackoffStrategy, DeadLetterReason, ErrorCode, FakeClock, RetryPolicy, SpawnRequest, TaskError,
    TaskStatus, WorkerId,
};
use serde_json::json;
use std::time::Duration;

fn worker(name: &str) -> WorkerId {
    WorkerId::new(name)
}

fn lease() -> Duration {
    Duration::from_secs(300)
}

/// worker-A dies halfway through; after lease expiry worker-B
/// reclaims the same task, the attempt count reflects both claims, and
/// the idempotent kernel completes on the rerun.
#[tokio::test]
async fn worker_crash_mid_task_recovers_via_lease_expiry() {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::new();
    let store = open_store(dir.path(), &clock);

    let id = store
        .spawn(SpawnRequest::new("contimg", "convert", json!({"group_id": "g1"})))
        .unwrap();

    let claimed = store
        .claim("contimg", &worker("worker-A"), lease())
        .unwrap()
        .unwrap();
    assert_eq!(claimed.attempts, 1);

    // worker-A is killed; no heartbeat arrives and the lease runs out
    clock.advance(Duration::from_secs(301));

    let reclaimed = store
        .claim("contimg", &worker("worker-B"), lease())
        .unwrap()
        .unwrap();
    assert_eq!(reclaimed.id, id);
    assert_eq!(reclaimed.attempts, 2);

    store
        .complete(&id, &worker("worker-B"), json!({"ms_path": "/ms/g1.ms"}))
        .unwrap();
    assert_eq!(
        store.get_task(id.as_str()).unwrap().status,
        TaskStatus::Completed
    );
}

/// Params that deterministically fail the same way on every
/// attempt exhaust their retries and land in the dead-letter queue as
/// a poison payload, with the full per-attempt error history.
#[tokio::test]
async fn poison_payload_exhausts_retries_into_dlq() {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::new();
    let store = open_store(dir.path(), &clock);

    let id = store
        .spawn(
            SpawnRequest::new("contimg", "convert", json!({"bad_field": true}))
                .max_attempts(3)
                .retry(RetryPolicy::new(
                    3,
                    BackoffStrategy::Immediate,
                    Duration::from_secs(1),
                    Duration::from_secs(60),
                )),
        )
        .unwrap();

    for attempt in 1..=3 {
        let claimed = store
            .claim("contimg", &worker("worker-A"), lease())
            .unwrap()
            .unwrap();
        assert_eq!(claimed.attempts, attempt);
        store
            .fail(
                &id,
                &worker("worker-A"),
                TaskError::new(ErrorCode::KernelError, "bad_field is not a real field"),
                true,
            )
            .unwrap();
    }

    let task = store.get_task(id.as_str()).unwrap();
    assert_eq!(task.status, TaskStatus::DeadLetter);
    assert_eq!(task.error_history.len(), 3);

    let entries = store.list_dead_letters("contimg", 10);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reason, DeadLetterReason::PoisonPayload);
    assert!(entries[0]
        .error_history
        .iter()
        .all(|e| e.message == "bad_field is not a real field"));

    // no further attempts are possible
    assert!(store
        .claim("contimg", &worker("worker-B"), lease())
        .unwrap()
        .is_none());
}

/// Terminal rows never mutate.
#[tokio::test]
async fn terminal_statuses_are_immutable() {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::new();
    let store = open_store(dir.path(), &clock);

    let id = store
        .spawn(SpawnRequest::new("contimg", "convert", json!({})))
        .unwrap();
    store
        .claim("contimg", &worker("worker-A"), lease())
        .unwrap()
        .unwrap();
    store.complete(&id, &worker("worker-A"), json!({})).unwrap();

    let before = store.get_task(id.as_str()).unwrap();
    assert!(store.complete(&id, &worker("worker-A"), json!({"x": 1})).is_err());
    assert!(store
        .fail(
            &id,
            &worker("worker-A"),
            TaskError::new(ErrorCode::KernelError, "late failure"),
            true,
        )
        .is_err());
    assert!(store.cancel(&id).is_err());
    assert_eq!(store.get_task(id.as_str()).unwrap(), before);
}

/// A pending task either completes or dead
/// letters; the store survives a process restart in between.
#[tokio::test]
async fn queue_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::new();

    let id = {
        let store = open_store(dir.path(), &clock);
        let id = store
            .spawn(SpawnRequest::new("contimg", "convert", json!({})))
            .unwrap();
        store
            .claim("contimg", &worker("worker-A"), lease())
            .unwrap()
            .unwrap();
        store.checkpoint().unwrap();
        id
    };

    // "restart": reopen from snapshot + WAL
    let store = open_store(dir.path(), &clock);
    let task = store.get_task(id.as_str()).unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.claimed_by, Some(worker("worker-A")));

    // the claimant never came back; lease expiry frees it
    clock.advance(Duration::from_secs(301));
    let reclaimed = store
        .claim("contimg", &worker("worker-B"), lease())
        .unwrap()
        .unwrap();
    assert_eq!(reclaimed.id, id);
}

/// Boundary: max_attempts = 0 dead-letters on the first failure.
#[tokio::test]
async fn zero_attempt_budget_goes_straight_to_dlq() {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::new();
    let store = open_store(dir.path(), &clock);

    let id = store
        .spawn(SpawnRequest::new("contimg", "convert", json!({})).max_attempts(0))
        .unwrap();
    store
        .claim("contimg", &worker("worker-A"), lease())
        .unwrap()
        .unwrap();
    let status = store
        .fail(
            &id,
            &worker("worker-A"),
            TaskError::new(ErrorCode::KernelError, "boom"),
            true,
        )
        .unwrap();

    assert_eq!(status, TaskStatus::DeadLetter);
    assert_eq!(store.list_dead_letters("contimg", 10).len(), 1);
}
