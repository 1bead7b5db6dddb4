// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use chrono::TimeZone;
use yare::parameterized;

#[test]
fn parses_canonical_filename() {
    let name = SubbandName::parse(Path::new("/data/incoming/2025-06-01T12:00:00_sb07.hdf5"))
        .unwrap();
    assert_eq!(name.subband_index, 7);
    assert_eq!(
        name.timestamp,
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    );
}

#[parameterized(
    wrong_ext = { "2025-06-01T12:00:00_sb00.fits" },
    no_subband = { "2025-06-01T12:00:00.hdf5" },
    bad_index = { "2025-06-01T12:00:00_sbXX.hdf5" },
    bad_timestamp = { "yesterday_sb00.hdf5" },
    index_overflow = { "2025-06-01T12:00:00_sb999.hdf5" },
)]
fn rejects_malformed_names(name: &str) {
    assert!(SubbandName::parse(Path::new(name)).is_err());
}

#[test]
fn group_id_formats_representative_timestamp() {
    let ts = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
    assert_eq!(group_id_for(ts), "2025-06-01T12:00:00");
}

#[parameterized(
    seen_to_stable = { FileState::Seen, FileState::Stable, true },
    stable_to_grouped = { FileState::Stable, FileState::Grouped, true },
    grouped_to_consumed = { FileState::Grouped, FileState::Consumed, true },
    seen_to_consumed = { FileState::Seen, FileState::Consumed, true },
    stable_to_seen = { FileState::Stable, FileState::Seen, false },
    consumed_to_stable = { FileState::Consumed, FileState::Stable, false },
    stable_to_stable = { FileState::Stable, FileState::Stable, false },
    late_is_terminal = { FileState::UnparsableLate, FileState::Consumed, false },
    no_advance_into_late = { FileState::Consumed, FileState::UnparsableLate, false },
    seen_never_becomes_late = { FileState::Seen, FileState::UnparsableLate, false },
)]
fn file_state_advances_monotonically(from: FileState, to: FileState, ok: bool) {
    assert_eq!(from.can_advance_to(to), ok);
}

#[test]
fn unparsable_late_tag_matches_wire_name() {
    assert_eq!(FileState::UnparsableLate.to_string(), "unparsable_late");
    let json = serde_json::to_string(&FileState::UnparsableLate).unwrap();
    assert_eq!(json, "\"unparsable_late\"");
}

#[test]
fn group_observe_tracks_members_in_arrival_order() {
    let mut group = SubbandGroup::new(GroupId::new("g"), 16, 100);
    assert!(group.observe(3, Path::new("/in/a_sb03.hdf5"), 110));
    assert!(group.observe(0, Path::new("/in/a_sb00.hdf5"), 120));
    assert_eq!(group.members.len(), 2);
    assert_eq!(group.members[0], Path::new("/in/a_sb03.hdf5"));
    assert_eq!(group.last_seen_at_ms, 120);
}

#[test]
fn group_observe_rejects_out_of_range_index() {
    let mut group = SubbandGroup::new(GroupId::new("g"), 16, 100);
    assert!(!group.observe(16, Path::new("/in/a_sb16.hdf5"), 110));
    assert!(group.observed_subbands.is_empty());
}

#[test]
fn group_observe_ignores_duplicates() {
    let mut group = SubbandGroup::new(GroupId::new("g"), 16, 100);
    assert!(group.observe(5, Path::new("/in/a_sb05.hdf5"), 110));
    assert!(!group.observe(5, Path::new("/in/a_sb05.hdf5"), 120));
    assert_eq!(group.members.len(), 1);
}

#[test]
fn group_full_at_expected_count() {
    let mut group = SubbandGroup::new(GroupId::new("g"), 2, 100);
    group.observe(0, Path::new("/in/a_sb00.hdf5"), 100);
    assert!(!group.is_full());
    group.observe(1, Path::new("/in/a_sb01.hdf5"), 100);
    assert!(group.is_full());
}
