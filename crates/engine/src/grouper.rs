// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subband clustering.
//!
//! Assigns each stable file to the open group whose representative
//! timestamp lies within the cluster tolerance - the closest one when
//! several qualify. Groups that were completed, dispatched, or
//! abandoned stay on a closed list for a while so a straggler can be
//! recognized as late rather than seeding a bogus new group.

use contimg_core::{group_id_for, GroupId, SubbandName};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Result of assigning a file to a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    /// File belongs to this open (or newly opened) group.
    Open(GroupId),
    /// File arrived after its group was already resolved.
    Late(GroupId),
}

#[derive(Debug, Clone)]
struct ClusterEntry {
    group_id: GroupId,
    representative: DateTime<Utc>,
    /// Wall time of closure, for pruning.
    closed_at: Option<DateTime<Utc>>,
}

/// Time-window clustering of subband files into groups.
pub struct SubbandGrouper {
    tolerance: chrono::Duration,
    /// How long closed groups are remembered for late-arrival detection.
    retention: chrono::Duration,
    clusters: Vec<ClusterEntry>,
}

impl SubbandGrouper {
    pub fn new(tolerance: Duration, group_timeout: Duration) -> Self {
        Self {
            tolerance: chrono::Duration::milliseconds(tolerance.as_millis() as i64),
            // Remember closed groups for two timeout windows.
            retention: chrono::Duration::milliseconds((group_timeout.as_millis() * 2) as i64),
            clusters: Vec::new(),
        }
    }

    /// Re-open a group restored from the durable store (restart path).
    pub fn restore_open(&mut self, group_id: &GroupId) {
        if let Some(representative) = parse_group_id(group_id) {
            if self.find(group_id).is_none() {
                self.clusters.push(ClusterEntry {
                    group_id: group_id.clone(),
                    representative,
                    closed_at: None,
                });
            }
        }
    }

    /// Assign a parsed filename to a group, opening one when no open
    /// or closed cluster lies within tolerance.
    pub fn assign(&mut self, name: &SubbandName, now: DateTime<Utc>) -> Assignment {
        self.prune(now);

        let best = self
            .clusters
            .iter()
            .filter(|c| {
                (c.representative - name.timestamp).abs() <= self.tolerance
            })
            .min_by_key(|c| (c.representative - name.timestamp).abs())
            .cloned();

        match best {
            Some(entry) if entry.closed_at.is_some() => Assignment::Late(entry.group_id),
            Some(entry) => Assignment::Open(entry.group_id),
            None => {
                let group_id = group_id_for(name.timestamp);
                self.clusters.push(ClusterEntry {
                    group_id: group_id.clone(),
                    representative: name.timestamp,
                    closed_at: None,
                });
                Assignment::Open(group_id)
            }
        }
    }

    /// Close a group once it is complete, dispatched, or abandoned.
    pub fn close(&mut self, group_id: &GroupId, now: DateTime<Utc>) {
        if let Some(entry) = self.clusters.iter_mut().find(|c| &c.group_id == group_id) {
            entry.closed_at = Some(now);
        }
    }

    /// Open group ids, oldest representative first.
    pub fn open_groups(&self) -> Vec<GroupId> {
        let mut open: Vec<_> = self
            .clusters
            .iter()
            .filter(|c| c.closed_at.is_none())
            .collect();
        open.sort_by_key(|c| c.representative);
        open.iter().map(|c| c.group_id.clone()).collect()
    }

    fn find(&self, group_id: &GroupId) -> Option<&ClusterEntry> {
        self.clusters.iter().find(|c| &c.group_id == group_id)
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let retention = self.retention;
        self.clusters.retain(|c| match c.closed_at {
            Some(closed_at) => now - closed_at <= retention,
            None => true,
        });
    }
}

/// Parse a group id back into its representative timestamp.
fn parse_group_id(group_id: &GroupId) -> Option<DateTime<Utc>> {
    chrono::NaiveDateTime::parse_from_str(group_id.as_str(), "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
#[path = "grouper_tests.rs"]
mod tests;
