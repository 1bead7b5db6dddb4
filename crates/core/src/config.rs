// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed configuration for the core.
//!
//! Loading and merging config files is the caller's concern; this
//! module defines the keys the core recognizes, their defaults, and a
//! `from_toml_str` convenience for embedding in host configuration.

use crate::exec::{ExecutorMode, ResourceLimits};
use crate::retry::{BackoffStrategy, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level core configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub queue: QueueConfig,
    pub ingest: IngestConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl CoreConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

/// Task queue and worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Primary task queue name. Required.
    pub name: String,
    /// Workers per process.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// Claim poll interval.
    #[serde(with = "secs", default = "default_poll_interval")]
    pub worker_poll_interval: Duration,
    /// Task lease duration.
    #[serde(with = "secs", default = "default_lease_ttl")]
    pub lease_ttl: Duration,
    /// Default retry cap.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff envelope.
    #[serde(with = "secs", default = "default_base_backoff")]
    pub base_backoff: Duration,
    #[serde(with = "secs", default = "default_max_backoff")]
    pub max_backoff: Duration,
    /// Drain deadline on shutdown.
    #[serde(with = "secs", default = "default_shutdown_grace")]
    pub shutdown_grace: Duration,
    #[serde(default = "default_true")]
    pub dead_letter_enabled: bool,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            worker_concurrency: default_worker_concurrency(),
            worker_poll_interval: default_poll_interval(),
            lease_ttl: default_lease_ttl(),
            max_attempts: default_max_attempts(),
            base_backoff: default_base_backoff(),
            max_backoff: default_max_backoff(),
            shutdown_grace: default_shutdown_grace(),
            dead_letter_enabled: default_true(),
        }
    }

    /// Queue-default retry policy, used when a task carries no override.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            BackoffStrategy::Exponential,
            self.base_backoff,
            self.max_backoff,
        )
    }
}

/// Landing-directory ingest settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Landing directory root. Required.
    pub input_dir: PathBuf,
    /// Glob matched against filenames under the root.
    #[serde(default = "default_pattern")]
    pub pattern: String,
    /// Grouping target.
    #[serde(default = "default_expected_subbands")]
    pub expected_subbands: u8,
    /// Grouping floor for timeout-accept. Defaults to `expected_subbands`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_required_subbands: Option<u8>,
    /// Subband clustering window.
    #[serde(with = "secs", default = "default_cluster_tolerance")]
    pub cluster_tolerance: Duration,
    /// Partial-group deadline.
    #[serde(with = "secs", default = "default_group_timeout")]
    pub group_timeout: Duration,
    /// File stability window.
    #[serde(with = "secs", default = "default_quiet_period")]
    pub file_stability_quiet: Duration,
    /// Scan cadence of the file watcher.
    #[serde(with = "secs", default = "default_scan_interval")]
    pub scan_interval: Duration,
    /// Files unseen for this long are evicted from the watch map.
    #[serde(with = "secs", default = "default_forget_after")]
    pub forget_after: Duration,
}

impl IngestConfig {
    pub fn new(input_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            pattern: default_pattern(),
            expected_subbands: default_expected_subbands(),
            min_required_subbands: None,
            cluster_tolerance: default_cluster_tolerance(),
            group_timeout: default_group_timeout(),
            file_stability_quiet: default_quiet_period(),
            scan_interval: default_scan_interval(),
            forget_after: default_forget_after(),
        }
    }

    pub fn min_required(&self) -> u8 {
        self.min_required_subbands
            .unwrap_or(self.expected_subbands)
            .min(self.expected_subbands)
    }
}

/// Cron scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(with = "secs", default = "default_check_interval")]
    pub check_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
        }
    }
}

/// Per-task-type execution settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskTypeConfig {
    #[serde(default)]
    pub mode: ExecutorMode,
    /// Subprocess isolation is mandatory for resource-risky types.
    #[serde(default)]
    pub resource_risky: bool,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(with = "opt_secs", default)]
    pub timeout: Option<Duration>,
    /// Shell command for subprocess mode. The child receives the
    /// execution task as JSON on stdin and must print an execution
    /// result as JSON on stdout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// Executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Wall-clock budget for task types with no explicit timeout.
    #[serde(with = "secs", default = "default_task_timeout")]
    pub default_timeout: Duration,
    #[serde(default)]
    pub task_types: HashMap<String, TaskTypeConfig>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_task_timeout(),
            task_types: HashMap::new(),
        }
    }
}

impl ExecutorConfig {
    /// Execution mode for a task type. `resource_risky` forces subprocess
    /// isolation regardless of the configured mode.
    pub fn mode_for(&self, task_type: &str) -> ExecutorMode {
        match self.task_types.get(task_type) {
            Some(cfg) if cfg.resource_risky => ExecutorMode::Subprocess,
            Some(cfg) => cfg.mode,
            None => ExecutorMode::default(),
        }
    }

    pub fn limits_for(&self, task_type: &str) -> ResourceLimits {
        self.task_types
            .get(task_type)
            .map(|cfg| cfg.limits)
            .unwrap_or_default()
    }

    pub fn timeout_for(&self, task_type: &str) -> Duration {
        self.task_types
            .get(task_type)
            .and_then(|cfg| cfg.timeout)
            .unwrap_or(self.default_timeout)
    }

    pub fn command_for(&self, task_type: &str) -> Option<&str> {
        self.task_types
            .get(task_type)
            .and_then(|cfg| cfg.command.as_deref())
    }
}

fn default_worker_concurrency() -> usize {
    4
}
fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_lease_ttl() -> Duration {
    Duration::from_secs(300)
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_backoff() -> Duration {
    Duration::from_secs(1)
}
fn default_max_backoff() -> Duration {
    Duration::from_secs(60)
}
fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}
fn default_true() -> bool {
    true
}
fn default_pattern() -> String {
    "*_sb*.hdf5".to_string()
}
fn default_expected_subbands() -> u8 {
    16
}
fn default_cluster_tolerance() -> Duration {
    Duration::from_secs(150)
}
fn default_group_timeout() -> Duration {
    Duration::from_secs(600)
}
fn default_quiet_period() -> Duration {
    Duration::from_secs(60)
}
fn default_scan_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_forget_after() -> Duration {
    Duration::from_secs(24 * 3600)
}
fn default_check_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_task_timeout() -> Duration {
    Duration::from_secs(3600)
}

mod secs {
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

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        v.map(|d| d.as_secs_f64()).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs: Option<f64> = Option::deserialize(d)?;
        Ok(secs.map(Duration::from_secs_f64))
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
