// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Uniform execution wrapper around the scientific kernels.
//!
//! Two modes with one contract: a kernel receives an [`ExecutionTask`]
//! and the worker gets back an [`ExecutionResult`], whether the kernel
//! ran in process or in an isolated subprocess. In-process runs use a
//! cooperative cancellation flag plus an RSS monitor; subprocess runs
//! get hard OS limits via a ulimit prelude and are killed on timeout.

use crate::resource::ResourceGuard;
use async_trait::async_trait;
use contimg_core::{
    Clock, ErrorCode, ExecMetrics, ExecutionResult, ExecutionTask, ExecutorConfig, ExecutorMode,
};
use nix::sys::resource::{getrusage, UsageWho};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

/// Grace between SIGTERM and SIGKILL for subprocess kernels.
const KILL_GRACE: Duration = Duration::from_secs(5);
/// Cadence of the in-process RSS monitor.
const RSS_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Structured failure returned by a kernel.
#[derive(Debug, Clone)]
pub struct KernelFailure {
    pub code: ErrorCode,
    pub message: String,
}

impl KernelFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for KernelFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for KernelFailure {}

/// Cooperative execution context handed to in-process kernels.
#[derive(Debug, Clone)]
pub struct KernelContext {
    cancelled: Arc<AtomicBool>,
}

impl KernelContext {
    pub fn new(cancelled: Arc<AtomicBool>) -> Self {
        Self { cancelled }
    }

    /// Kernels poll this at safe points and abort promptly when set.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A scientific kernel: opaque to the core, idempotent for the same
/// params and on-disk inputs.
#[async_trait]
pub trait Kernel: Send + Sync {
    async fn run(&self, params: Value, ctx: KernelContext) -> Result<Value, KernelFailure>;
}

/// Registry of in-process kernels by task type.
#[derive(Default)]
pub struct KernelRegistry {
    kernels: HashMap<String, Arc<dyn Kernel>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_type: impl Into<String>, kernel: Arc<dyn Kernel>) {
        self.kernels.insert(task_type.into(), kernel);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn Kernel>> {
        self.kernels.get(task_type).cloned()
    }
}

/// Mode-dispatching executor.
pub struct Executor<C: Clock> {
    registry: Arc<KernelRegistry>,
    config: ExecutorConfig,
    guard: Arc<ResourceGuard>,
    clock: C,
}

impl<C: Clock> Executor<C> {
    pub fn new(
        registry: Arc<KernelRegistry>,
        config: ExecutorConfig,
        guard: Arc<ResourceGuard>,
        clock: C,
    ) -> Self {
        Self {
            registry,
            config,
            guard,
            clock,
        }
    }

    /// Run one task to an [`ExecutionResult`]. Never panics and never
    /// raises: every failure mode maps to a standardized error code.
    pub async fn run(&self, task: ExecutionTask, cancel: Arc<AtomicBool>) -> ExecutionResult {
        let mode = self.config.mode_for(&task.task_type);
        let timeout = task
            .timeout
            .unwrap_or_else(|| self.config.timeout_for(&task.task_type));

        info!(task_type = %task.task_type, %mode, timeout_s = timeout.as_secs(), "executing");

        let start = self.clock.now();
        let result = match mode {
            ExecutorMode::InProcess => self.run_in_process(&task, timeout, cancel).await,
            ExecutorMode::Subprocess => self.run_subprocess(&task, timeout, cancel).await,
        };
        let wall = self.clock.now().duration_since(start);

        let mut result = result;
        result.metrics.wall_seconds = wall.as_secs_f64();
        match (result.success, &result.error_code) {
            (true, _) => info!(task_type = %task.task_type, wall_s = result.metrics.wall_seconds, "kernel succeeded"),
            (false, code) => warn!(
                task_type = %task.task_type,
                code = ?code,
                error = result.error_message.as_deref().unwrap_or(""),
                "kernel failed"
            ),
        }
        result
    }

    async fn run_in_process(
        &self,
        task: &ExecutionTask,
        timeout: Duration,
        cancel: Arc<AtomicBool>,
    ) -> ExecutionResult {
        let Some(kernel) = self.registry.get(&task.task_type) else {
            return ExecutionResult::err(
                ErrorCode::ValidationError,
                format!("no kernel registered for task type `{}`", task.task_type),
                ExecMetrics::default(),
            );
        };

        if let Some(ram_gb) = task.limits.max_ram_gb {
            if let Err(reason) = self.guard.precheck(ram_gb, 0.0, Path::new("/")) {
                return ExecutionResult::err(
                    ErrorCode::ResourceExhaustion,
                    reason,
                    ExecMetrics::default(),
                );
            }
        }

        let breached = Arc::new(AtomicBool::new(false));
        let monitor = task.limits.max_ram_bytes().map(|limit| {
            ResourceGuard::spawn_rss_monitor(
                limit,
                Arc::clone(&cancel),
                Arc::clone(&breached),
                RSS_SAMPLE_INTERVAL,
            )
        });

        let cpu_before = cpu_seconds_now();
        let ctx = KernelContext::new(Arc::clone(&cancel));
        let outcome = tokio::time::timeout(timeout, kernel.run(task.params.clone(), ctx)).await;

        if let Some(monitor) = monitor {
            monitor.abort();
        }

        let metrics = ExecMetrics {
            cpu_seconds: cpu_seconds_now() - cpu_before,
            peak_rss_bytes: peak_rss_bytes(),
            wall_seconds: 0.0, // filled by run()
        };

        match outcome {
            Err(_) => {
                // Cooperative cancellation: the kernel observes the
                // flag and unwinds; the task is already lost to the
                // wall clock either way.
                cancel.store(true, Ordering::SeqCst);
                ExecutionResult::err(
                    ErrorCode::Timeout,
                    format!("wall clock exceeded {:.0}s", timeout.as_secs_f64()),
                    metrics,
                )
            }
            Ok(Ok(value)) => ExecutionResult::ok(value, metrics),
            Ok(Err(failure)) => {
                // A kernel that aborted because the RSS monitor
                // tripped is a memory failure, not a cancellation.
                let code = if breached.load(Ordering::SeqCst) {
                    ErrorCode::ResourceExhaustion
                } else {
                    failure.code
                };
                ExecutionResult::err(code, failure.message, metrics)
            }
        }
    }

    async fn run_subprocess(
        &self,
        task: &ExecutionTask,
        timeout: Duration,
        cancel: Arc<AtomicBool>,
    ) -> ExecutionResult {
        let Some(command) = self.config.command_for(&task.task_type) else {
            return ExecutionResult::err(
                ErrorCode::ValidationError,
                format!(
                    "subprocess mode for `{}` but no command configured",
                    task.task_type
                ),
                ExecMetrics::default(),
            );
        };

        let input = match serde_json::to_vec(task) {
            Ok(bytes) => bytes,
            Err(e) => {
                return ExecutionResult::err(
                    ErrorCode::ValidationError,
                    format!("unserializable task params: {}", e),
                    ExecMetrics::default(),
                )
            }
        };

        let prelude = ResourceGuard::ulimit_prelude(&task.limits);
        let script = format!("{}set -euo pipefail\n{}", prelude, command);

        // Own process group: kills reach the whole kernel tree, not
        // just the wrapping shell.
        let mut child = match tokio::process::Command::new("bash")
            .arg("-c")
            .arg(&script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return ExecutionResult::err(
                    ErrorCode::SubprocessCrash,
                    format!("failed to spawn kernel subprocess: {}", e),
                    ExecMetrics::default(),
                )
            }
        };
        let child_pid = child.id();

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&input).await {
                warn!(error = %e, "failed writing params to kernel stdin");
            }
            drop(stdin);
        }

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let drain = async move {
            let mut out = Vec::new();
            let mut err = Vec::new();
            if let Some(ref mut stdout) = stdout_pipe {
                let _ = stdout.read_to_end(&mut out).await;
            }
            if let Some(ref mut stderr) = stderr_pipe {
                let _ = stderr.read_to_end(&mut err).await;
            }
            (out, err)
        };
        tokio::pin!(drain);

        let cancel_watch = {
            let cancel = Arc::clone(&cancel);
            async move {
                loop {
                    if cancel.load(Ordering::SeqCst) {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        };

        enum Interrupt {
            Timeout,
            Cancelled,
        }

        let interrupted = tokio::select! {
            output = &mut drain => {
                let status = child.wait().await;
                return self.subprocess_outcome(status, output);
            }
            _ = tokio::time::sleep(timeout) => Interrupt::Timeout,
            _ = cancel_watch => Interrupt::Cancelled,
        };

        // SIGTERM the group, drain through the grace period, then SIGKILL.
        if let Some(pid) = child_pid {
            let _ = kill(Pid::from_raw(-(pid as i32)), Signal::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, &mut drain).await.is_err() {
            if let Some(pid) = child_pid {
                let _ = kill(Pid::from_raw(-(pid as i32)), Signal::SIGKILL);
            }
            let _ = child.start_kill();
            let _ = tokio::time::timeout(KILL_GRACE, &mut drain).await;
        }
        let _ = child.wait().await;

        match interrupted {
            Interrupt::Timeout => ExecutionResult::err(
                ErrorCode::Timeout,
                format!("subprocess exceeded {:.0}s, killed", timeout.as_secs_f64()),
                ExecMetrics::default(),
            ),
            Interrupt::Cancelled => ExecutionResult::err(
                ErrorCode::Cancelled,
                "subprocess cancelled",
                ExecMetrics::default(),
            ),
        }
    }

    /// Map a finished subprocess to the uniform result shape.
    fn subprocess_outcome(
        &self,
        status: std::io::Result<std::process::ExitStatus>,
        (stdout, stderr): (Vec<u8>, Vec<u8>),
    ) -> ExecutionResult {
        // A structured result on stdout wins regardless of exit code.
        if let Ok(result) = serde_json::from_slice::<ExecutionResult>(&stdout) {
            return result;
        }

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                return ExecutionResult::err(
                    ErrorCode::SubprocessCrash,
                    format!("failed to reap kernel subprocess: {}", e),
                    ExecMetrics::default(),
                )
            }
        };

        if let Some(signal) = status.signal() {
            // SIGKILL / SIGXCPU are how the OS reports ulimit breaches.
            let code = if signal == Signal::SIGKILL as i32 || signal == Signal::SIGXCPU as i32 {
                ErrorCode::ResourceExhaustion
            } else {
                ErrorCode::SubprocessCrash
            };
            return ExecutionResult::err(
                code,
                format!("kernel killed by signal {}: {}", signal, tail(&stderr)),
                ExecMetrics::default(),
            );
        }

        if status.success() {
            ExecutionResult::err(
                ErrorCode::SubprocessCrash,
                format!("kernel exited 0 without a structured result: {}", tail(&stderr)),
                ExecMetrics::default(),
            )
        } else {
            ExecutionResult::err(
                ErrorCode::SubprocessCrash,
                format!(
                    "kernel exited {}: {}",
                    status.code().unwrap_or(-1),
                    tail(&stderr)
                ),
                ExecMetrics::default(),
            )
        }
    }
}

/// Last few hundred bytes of captured stderr, for error messages.
fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    match trimmed.char_indices().rev().nth(499) {
        Some((idx, _)) => trimmed[idx..].to_string(),
        None => trimmed.to_string(),
    }
}

/// Accumulated user+system CPU seconds of this process.
fn cpu_seconds_now() -> f64 {
    match getrusage(UsageWho::RUSAGE_SELF) {
        Ok(usage) => {
            let user = usage.user_time();
            let system = usage.system_time();
            (user.tv_sec() + system.tv_sec()) as f64
                + (user.tv_usec() + system.tv_usec()) as f64 / 1e6
        }
        Err(_) => 0.0,
    }
}

/// High-water RSS of this process in bytes (ru_maxrss is KiB on Linux).
fn peak_rss_bytes() -> u64 {
    match getrusage(UsageWho::RUSAGE_SELF) {
        Ok(usage) => (usage.max_rss() as u64) * 1024,
        Err(_) => 0,
    }
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
