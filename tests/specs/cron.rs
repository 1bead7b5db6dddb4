// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cron specs: restart safety and single-fire semantics.

use crate::prelude::*;
use contimg_core::{Clock, CronSchedule, FakeClock, ScheduledTask, TaskStatus};
use serde_json::json;
use std::time::Duration;

fn nightly(clock: &FakeClock) -> ScheduledTask {
    // day D at 00:00 (2025-06-01T00:00:00Z)
    clock.set_epoch_ms(1_748_736_000_000);
    ScheduledTask::new(
        "nightly-mosaic",
        CronSchedule::parse("0 2 * * *").unwrap(),
        "contimg",
        "mosaic-sweep",
        json!({"window_days": 1}),
        clock.utc(),
    )
}

/// The entry fired at 02:00 on day D; the scheduler process
/// restarts at 02:05 on day D+1. The restart loop fires exactly once
/// for the overdue instant and does not replay intervening days.
#[tokio::test]
async fn scheduler_restart_fires_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::new();

    {
        let store = open_store(dir.path(), &clock);
        store.register_scheduled(nightly(&clock)).unwrap();

        // day D, 02:00: the normal fire
        clock.advance(Duration::from_secs(2 * 3600 + 30));
        assert!(store.fire_scheduled("nightly-mosaic").unwrap().is_some());
        // store drops: scheduler host goes down
    }

    // day D+1, 02:05: restart
    clock.advance(Duration::from_secs(24 * 3600 + 5 * 60));
    let store = open_store(dir.path(), &clock);

    let first = store.fire_scheduled("nightly-mosaic").unwrap();
    assert!(first.is_some(), "overdue instant must fire after restart");
    let second = store.fire_scheduled("nightly-mosaic").unwrap();
    assert!(second.is_none(), "the same instant must not double-fire");

    // two spawns total across both "processes"
    assert_eq!(
        store
            .list_tasks("contimg", Some(TaskStatus::Pending), 10)
            .len(),
        2
    );

    // and the next instant is in the future
    let entry = &store.list_scheduled()[0];
    assert!(entry.next_fire_at_ms > clock.epoch_ms());
}

/// With catchup enabled, every missed instant fires.
#[tokio::test]
async fn catchup_replays_missed_instants() {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::new();
    let store = open_store(dir.path(), &clock);

    let mut entry = nightly(&clock);
    entry.catchup = true;
    store.register_scheduled(entry).unwrap();

    // down for three instants
    clock.advance(Duration::from_secs(3 * 24 * 3600));

    let mut fired = 0;
    while store.fire_scheduled("nightly-mosaic").unwrap().is_some() {
        fired += 1;
        assert!(fired < 10, "catchup failed to converge");
    }
    assert_eq!(fired, 3);
}

/// Invariant: at most one spawn per next_fire_at, even under a racing
/// pair of scheduler loops.
#[tokio::test]
async fn racing_schedulers_cannot_double_fire() {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::new();
    let store = open_store(dir.path(), &clock);
    store.register_scheduled(nightly(&clock)).unwrap();
    clock.advance(Duration::from_secs(2 * 3600 + 30));

    let mut racers = Vec::new();
    for _ in 0..4 {
        let store = std::sync::Arc::clone(&store);
        racers.push(tokio::spawn(async move {
            store.fire_scheduled("nightly-mosaic").unwrap()
        }));
    }

    let mut fired = 0;
    for racer in racers {
        if racer.await.unwrap().is_some() {
            fired += 1;
        }
    }
    assert_eq!(fired, 1);
}
