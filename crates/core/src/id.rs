// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Task-id minting.
//!
//! Every durable task row gets a fresh [`TaskId`] at spawn time. The
//! generator sits behind a trait so tests can mint predictable
//! sequential ids while production uses UUIDv4. Group ids are not
//! minted here; they derive from cluster timestamps in `subband`.

use crate::task::TaskId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Mints unique task identifiers.
pub trait IdGen: Clone + Send + Sync {
    fn next_task_id(&self) -> TaskId;
}

/// UUIDv4 ids for production use.
#[derive(Clone, Default)]
pub struct UuidIdGen;

impl IdGen for UuidIdGen {
    fn next_task_id(&self) -> TaskId {
        TaskId::new(uuid::Uuid::new_v4().to_string())
    }
}

/// Predictable `<prefix>-N` ids for tests.
#[derive(Clone)]
pub struct SequentialIdGen {
    prefix: String,
    counter: Arc<AtomicU64>,
}

impl SequentialIdGen {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl Default for SequentialIdGen {
    fn default() -> Self {
        Self::new("task")
    }
}

impl IdGen for SequentialIdGen {
    fn next_task_id(&self) -> TaskId {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        TaskId::new(format!("{}-{}", self.prefix, n))
    }
}

#[cfg(test)]
#[path = "id_tests.rs"]
mod tests;
