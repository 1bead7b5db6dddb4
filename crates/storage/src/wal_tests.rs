// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use contimg_core::TaskId;
use std::io::Write as _;

fn cancel_event(n: u64) -> Event {
    Event::TaskCancelled {
        task_id: TaskId::new(format!("t-{}", n)),
        at_ms: n,
    }
}

#[test]
fn append_assigns_increasing_seqs() {
    let dir = tempfile::tempdir().unwrap();
    let mut wal = Wal::open(&dir.path().join("events.wal")).unwrap();

    assert_eq!(wal.append(&cancel_event(1)).unwrap(), 1);
    assert_eq!(wal.append(&cancel_event(2)).unwrap(), 2);
    assert_eq!(wal.write_seq(), 2);
}

#[test]
fn entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.wal");

    {
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&cancel_event(1)).unwrap();
        wal.append(&cancel_event(2)).unwrap();
        wal.flush().unwrap();
    }

    let wal = Wal::open(&path).unwrap();
    assert_eq!(wal.write_seq(), 2);
    let entries = wal.entries_after(0).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].seq, 1);
    assert_eq!(entries[1].seq, 2);
}

#[test]
fn entries_after_skips_older_seqs() {
    let dir = tempfile::tempdir().unwrap();
    let mut wal = Wal::open(&dir.path().join("events.wal")).unwrap();
    for n in 1..=5 {
        wal.append(&cancel_event(n)).unwrap();
    }
    wal.flush().unwrap();

    let entries = wal.entries_after(3).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].seq, 4);
}

#[test]
fn unflushed_entries_are_not_durable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.wal");

    {
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&cancel_event(1)).unwrap();
        // dropped without flush
    }

    let wal = Wal::open(&path).unwrap();
    assert_eq!(wal.write_seq(), 0);
}

#[test]
fn corrupt_tail_is_rotated_and_prefix_preserved() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.wal");

    {
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&cancel_event(1)).unwrap();
        wal.append(&cancel_event(2)).unwrap();
        wal.flush().unwrap();
    }

    // Simulate a torn write at the tail.
    {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap();
        file.write_all(b"{\"seq\":3,\"event\":{\"ty").unwrap();
    }

    let wal = Wal::open(&path).unwrap();
    assert_eq!(wal.write_seq(), 2);
    assert_eq!(wal.entries_after(0).unwrap().len(), 2);
    assert!(path.with_extension("wal.bak").exists() || dir
        .path()
        .read_dir()
        .unwrap()
        .filter_map(|e| e.ok())
        .any(|e| e.file_name().to_string_lossy().contains(".bak")));
}

#[test]
fn truncate_before_drops_old_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.wal");
    let mut wal = Wal::open(&path).unwrap();
    for n in 1..=5 {
        wal.append(&cancel_event(n)).unwrap();
    }
    wal.flush().unwrap();

    wal.truncate_before(4).unwrap();

    let entries = wal.entries_after(0).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].seq, 4);
    assert_eq!(entries[1].seq, 5);

    // New appends continue the old numbering.
    assert_eq!(wal.append(&cancel_event(6)).unwrap(), 6);
}

#[test]
fn reopen_after_truncate_keeps_seq_monotonic() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.wal");

    {
        let mut wal = Wal::open(&path).unwrap();
        for n in 1..=3 {
            wal.append(&cancel_event(n)).unwrap();
        }
        wal.flush().unwrap();
        wal.truncate_before(4).unwrap();
    }

    // All entries truncated; reopen sees an empty file and would restart
    // numbering, which is fine because the snapshot holds seq 3.
    let wal = Wal::open(&path).unwrap();
    assert_eq!(wal.entries_after(0).unwrap().len(), 0);
    assert_eq!(wal.write_seq(), 0);
}
