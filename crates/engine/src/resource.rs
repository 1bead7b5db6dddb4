// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Resource guarding: pre-flight feasibility checks, RAM estimation,
//! and runtime enforcement.
//!
//! Subprocess-mode enforcement is hard (the OS kills on breach, via a
//! ulimit prelude on the child shell). In-process enforcement is
//! cooperative: a monitor samples the process RSS and trips the
//! kernel's cancellation flag before allocation escalates.

use contimg_core::ResourceLimits;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Disks, System};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Bytes per visibility sample: complex64 per polarization pair.
const BYTES_PER_VIS: f64 = 8.0 * 2.0;
/// Working-set multiplier: input buffer, scratch, and output copies.
const WORKING_SET_FACTOR: f64 = 3.0;

/// System-resource guard.
#[derive(Default)]
pub struct ResourceGuard;

impl ResourceGuard {
    pub fn new() -> Self {
        Self
    }

    /// Check that the host currently has headroom for a task needing
    /// `required_ram_gb` of memory and `required_disk_gb` under
    /// `disk_path`. Returns the denial reason on failure.
    pub fn precheck(
        &self,
        required_ram_gb: f64,
        required_disk_gb: f64,
        disk_path: &Path,
    ) -> Result<(), String> {
        let mut sys = System::new();
        sys.refresh_memory();
        let available_gb = sys.available_memory() as f64 / 1e9;
        if available_gb < required_ram_gb {
            return Err(format!(
                "insufficient memory: need {:.1} GB, {:.1} GB available",
                required_ram_gb, available_gb
            ));
        }

        if required_disk_gb > 0.0 {
            let disks = Disks::new_with_refreshed_list();
            // Best mount-point match for the target path.
            let available = disks
                .iter()
                .filter(|d| disk_path.starts_with(d.mount_point()))
                .max_by_key(|d| d.mount_point().as_os_str().len())
                .map(|d| d.available_space());
            match available {
                Some(bytes) => {
                    let disk_gb = bytes as f64 / 1e9;
                    if disk_gb < required_disk_gb {
                        return Err(format!(
                            "insufficient disk under {}: need {:.1} GB, {:.1} GB available",
                            disk_path.display(),
                            required_disk_gb,
                            disk_gb
                        ));
                    }
                }
                None => {
                    warn!(path = %disk_path.display(), "no disk found for path, skipping disk precheck");
                }
            }
        }

        Ok(())
    }

    /// Deterministic RAM estimate for converting one subband group.
    ///
    /// Visibility volume is baselines x channels x times at two
    /// polarizations of complex64, tripled for working copies.
    pub fn estimate_ram_for_group(n_antennas: u64, n_channels: u64, n_times: u64) -> f64 {
        let baselines = (n_antennas * (n_antennas + 1)) / 2;
        let vis_bytes = baselines as f64 * n_channels as f64 * n_times as f64 * BYTES_PER_VIS;
        vis_bytes * WORKING_SET_FACTOR / 1e9
    }

    /// Spawn a cooperative RSS monitor: samples this process every
    /// `interval` and raises `cancel` when `limit_bytes` is breached.
    /// Returns the monitor handle; abort it when the kernel finishes.
    pub fn spawn_rss_monitor(
        limit_bytes: u64,
        cancel: Arc<AtomicBool>,
        breached: Arc<AtomicBool>,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let Ok(pid) = sysinfo::get_current_pid() else {
                warn!("cannot resolve own pid, rss monitor disabled");
                return;
            };
            let mut sys = System::new();
            loop {
                tokio::time::sleep(interval).await;
                sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
                let Some(process) = sys.process(pid) else {
                    continue;
                };
                let rss = process.memory();
                debug!(rss, limit_bytes, "rss sample");
                if rss > limit_bytes {
                    warn!(rss, limit_bytes, "rss limit breached, cancelling kernel");
                    breached.store(true, Ordering::SeqCst);
                    cancel.store(true, Ordering::SeqCst);
                    return;
                }
            }
        })
    }

    /// Shell prelude applying hard limits to a subprocess kernel.
    ///
    /// `ulimit -v` is in KiB; `ulimit -t` in CPU seconds. The child is
    /// killed by the operating system on breach.
    pub fn ulimit_prelude(limits: &ResourceLimits) -> String {
        let mut prelude = String::new();
        if let Some(bytes) = limits.max_ram_bytes() {
            prelude.push_str(&format!("ulimit -v {}; ", bytes / 1024));
        }
        if let Some(cpu) = limits.max_cpu_seconds {
            prelude.push_str(&format!("ulimit -t {}; ", cpu));
        }
        prelude
    }
}

#[cfg(test)]
#[path = "resource_tests.rs"]
mod tests;
