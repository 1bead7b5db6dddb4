// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Execution contracts shared by the worker pool and both executor modes.
//!
//! A scientific kernel is invoked with an [`ExecutionTask`] and must
//! yield an [`ExecutionResult`] - the same value whether it ran in
//! process or in an isolated subprocess.

use crate::errors::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// How a task type is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorMode {
    /// Invoke the kernel directly in the worker. Fastest; shares RAM.
    #[default]
    InProcess,
    /// Fork a dedicated child with OS-enforced resource limits.
    /// Mandatory for task types flagged `resource_risky`.
    Subprocess,
}

crate::tag_display! {
    ExecutorMode {
        InProcess => "in_process",
        Subprocess => "subprocess",
    }
}

/// Per-task resource caps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ram_gb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_wall_seconds: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl ResourceLimits {
    pub fn unlimited() -> Self {
        Self {
            max_ram_gb: None,
            max_cpu_seconds: None,
            max_wall_seconds: None,
        }
    }

    pub fn max_ram_bytes(&self) -> Option<u64> {
        self.max_ram_gb.map(|gb| (gb * 1e9) as u64)
    }

    pub fn wall_timeout(&self) -> Option<Duration> {
        self.max_wall_seconds.map(Duration::from_secs)
    }
}

/// Input to an executor run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTask {
    pub task_type: String,
    pub params: Value,
    #[serde(default)]
    pub limits: ResourceLimits,
    /// Wall-clock budget; the executor kills or cancels on expiry.
    #[serde(with = "opt_secs_serde", default)]
    pub timeout: Option<Duration>,
}

/// Observed resource usage for one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ExecMetrics {
    pub cpu_seconds: f64,
    pub peak_rss_bytes: u64,
    pub wall_seconds: f64,
}

/// Output of an executor run - identical shape for both modes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metrics: ExecMetrics,
}

impl ExecutionResult {
    pub fn ok(result: Value, metrics: ExecMetrics) -> Self {
        Self {
            success: true,
            result: Some(result),
            error_code: None,
            error_message: None,
            metrics,
        }
    }

    pub fn err(code: ErrorCode, message: impl Into<String>, metrics: ExecMetrics) -> Self {
        Self {
            success: false,
            result: None,
            error_code: Some(code),
            error_message: Some(message.into()),
            metrics,
        }
    }
}

mod opt_secs_serde {
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
#[path = "exec_tests.rs"]
mod tests;
