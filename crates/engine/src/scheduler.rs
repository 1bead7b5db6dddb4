// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cron-driven spawner of recurring tasks.
//!
//! The loop only decides *when* to look; firing itself is the store's
//! conditional update, so a crashed or restarted scheduler can never
//! double-fire an instant.

use contimg_core::{Clock, SchedulerConfig};
use contimg_storage::Store;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Handle to the running scheduler loop.
pub struct SchedulerHandle {
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn stop(self) {
        self.task.abort();
    }
}

/// Periodic check-and-fire loop over the scheduled-task table.
pub struct Scheduler;

impl Scheduler {
    pub fn start<C: Clock>(
        store: Arc<Store<C>>,
        config: SchedulerConfig,
        clock: C,
    ) -> SchedulerHandle {
        let task = tokio::spawn(async move {
            info!(
                check_interval_s = config.check_interval.as_secs_f64(),
                "scheduler started"
            );
            let mut tick = tokio::time::interval(config.check_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tick.tick().await;
                let now_ms = clock.epoch_ms();

                for entry in store.list_scheduled() {
                    // `due_at` is advisory; the store re-checks under
                    // its lock and advances next_fire_at atomically.
                    while entry.due_at(now_ms) {
                        match store.fire_scheduled(&entry.name) {
                            Ok(Some(task_id)) => {
                                info!(
                                    cron = %entry.name,
                                    task_id = %task_id.short(8),
                                    "cron fired"
                                );
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!(cron = %entry.name, error = %e, "cron fire failed");
                                break;
                            }
                        }
                        // Catch-up entries drain one instant per pass.
                        if !entry.catchup {
                            break;
                        }
                    }
                }
            }
        });

        SchedulerHandle { task }
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
