// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Retry policies and backoff computation.
//!
//! Jitter is deterministic: it is derived from the (task id, attempt)
//! pair, so a replayed WAL produces the same retry schedule as the
//! original run.

use crate::errors::BackoffClass;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// Multiplier applied to the computed delay for extended-backoff codes.
const EXTENDED_FACTOR: u32 = 4;

/// How delays grow between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base * 2^(n-1)`, capped at `max_delay`.
    Exponential,
    /// Always `base_delay`.
    Fixed,
    /// No delay between attempts.
    Immediate,
    /// Never retry, regardless of the error code.
    None,
}

/// Per-task or per-queue retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
    #[serde(with = "secs_serde")]
    pub base_delay: Duration,
    #[serde(with = "secs_serde")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, strategy: BackoffStrategy, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            strategy,
            base_delay: base,
            max_delay: max,
        }
    }

    /// Whether another attempt is allowed after `attempts` completed tries.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        self.strategy != BackoffStrategy::None && attempts < self.max_attempts
    }

    /// Delay before attempt `n + 1`, where `n >= 1` attempts have already run.
    ///
    /// `min(max_delay, base_delay * 2^(n-1) + jitter)` with jitter in
    /// `[0, base_delay)` seeded from `seed` (the task id). The `class`
    /// stretches the envelope for resource-pressure errors and collapses
    /// it to a single base delay for transient I/O.
    pub fn next_delay(&self, attempts: u32, class: BackoffClass, seed: &str) -> Duration {
        let n = attempts.max(1);
        let base = match self.strategy {
            BackoffStrategy::Immediate | BackoffStrategy::None => return Duration::ZERO,
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(n - 1).unwrap_or(u32::MAX);
                self.base_delay
                    .checked_mul(factor)
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
        };

        match class {
            BackoffClass::Short => self.base_delay,
            BackoffClass::Standard => base + jitter(self.base_delay, seed, n),
            BackoffClass::Extended => {
                base.checked_mul(EXTENDED_FACTOR).unwrap_or(self.max_delay)
                    + jitter(self.base_delay, seed, n)
            }
        }
    }
}

/// Deterministic jitter in `[0, base)` from (seed, attempt).
fn jitter(base: Duration, seed: &str, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    if base_ms == 0 {
        return Duration::ZERO;
    }
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    attempt.hash(&mut hasher);
    Duration::from_millis(hasher.finish() % base_ms)
}

mod secs_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
