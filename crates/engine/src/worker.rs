// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The worker pool: N concurrent claimants draining one queue.
//!
//! Each worker is single-threaded for the lifetime of one task: claim,
//! heartbeat at a third of the lease, dispatch to the pipeline runner
//! (or straight to the executor for plain kernel tasks), then report
//! completion or failure. No shared mutable state beyond the store.

use crate::{Executor, PipelineRunner};
use contimg_core::{
    Clock, ErrorCode, ExecutionTask, ExecutorConfig, QueueConfig, Task, TaskError, WorkerId,
};
use contimg_storage::{Heartbeat, Store, StoreError};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Handle to a running pool of workers.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    grace: std::time::Duration,
}

impl WorkerPool {
    /// Start `worker_concurrency` workers draining `config.name`.
    pub fn start<C: Clock>(
        store: Arc<Store<C>>,
        runner: Arc<PipelineRunner<C>>,
        executor: Arc<Executor<C>>,
        config: QueueConfig,
        executor_config: ExecutorConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let grace = config.shutdown_grace;

        let workers = (0..config.worker_concurrency)
            .map(|n| {
                let worker = WorkerLoop {
                    store: Arc::clone(&store),
                    runner: Arc::clone(&runner),
                    executor: Arc::clone(&executor),
                    config: config.clone(),
                    executor_config: executor_config.clone(),
                    worker_id: WorkerId::new(format!("worker-{}", n)),
                    shutdown_rx: shutdown_rx.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        Self {
            workers,
            shutdown_tx,
            grace,
        }
    }

    /// Graceful drain: workers finish their current task (up to the
    /// shutdown grace), then stop. A task still running at grace
    /// expiry loses its heartbeat and is reclaimed after lease expiry.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.workers {
            if tokio::time::timeout(self.grace, handle).await.is_err() {
                warn!("worker exceeded shutdown grace, abandoning to lease expiry");
            }
        }
    }
}

struct WorkerLoop<C: Clock> {
    store: Arc<Store<C>>,
    runner: Arc<PipelineRunner<C>>,
    executor: Arc<Executor<C>>,
    config: QueueConfig,
    executor_config: ExecutorConfig,
    worker_id: WorkerId,
    shutdown_rx: watch::Receiver<bool>,
}

impl<C: Clock> WorkerLoop<C> {
    async fn run(mut self) {
        info!(worker = %self.worker_id, queue = %self.config.name, "worker started");

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            match self
                .store
                .claim(&self.config.name, &self.worker_id, self.config.lease_ttl)
            {
                Ok(Some(task)) => self.process(task).await,
                Ok(None) => {
                    let poll = self.config.worker_poll_interval;
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => {}
                        _ = self.shutdown_rx.changed() => {}
                    }
                }
                Err(e) => {
                    // A store that cannot claim is a broken invariant;
                    // exit and let the lease machinery recover.
                    error!(worker = %self.worker_id, error = %e, "store failure, worker exiting");
                    break;
                }
            }
        }

        info!(worker = %self.worker_id, "worker stopped");
    }

    async fn process(&self, task: Task) {
        info!(
            worker = %self.worker_id,
            task_id = %task.id.short(8),
            task_name = %task.task_name,
            attempt = task.attempts,
            "task claimed"
        );

        let cancel = Arc::new(AtomicBool::new(false));
        let lease_lost = Arc::new(AtomicBool::new(false));
        let heartbeat = self.spawn_heartbeat(&task, Arc::clone(&cancel), Arc::clone(&lease_lost));

        let result = self.dispatch(&task, Arc::clone(&cancel)).await;

        heartbeat.abort();

        if lease_lost.load(Ordering::SeqCst) {
            // Another worker owns the task now; reporting would be
            // rejected anyway.
            warn!(worker = %self.worker_id, task_id = %task.id.short(8), "lease lost mid-task");
            return;
        }

        match result {
            Ok(value) => {
                if let Err(e) = self.store.complete(&task.id, &self.worker_id, value) {
                    warn!(task_id = %task.id.short(8), error = %e, "completion rejected");
                }
            }
            Err(task_error) => {
                let retryable = task_error.code.retryable();
                match self
                    .store
                    .fail(&task.id, &self.worker_id, task_error, retryable)
                {
                    Ok(status) => {
                        info!(task_id = %task.id.short(8), %status, "task failed")
                    }
                    Err(e) => warn!(task_id = %task.id.short(8), error = %e, "failure rejected"),
                }
            }
        }
    }

    /// Renew the lease at a third of its TTL; surface cancellation and
    /// lease loss through shared flags.
    fn spawn_heartbeat(
        &self,
        task: &Task,
        cancel: Arc<AtomicBool>,
        lease_lost: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let task_id = task.id.clone();
        let worker_id = self.worker_id.clone();
        let interval = self.config.lease_ttl / 3;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match store.heartbeat(&task_id, &worker_id) {
                    Ok(Heartbeat::Renewed) => {}
                    Ok(Heartbeat::CancelRequested) => {
                        info!(task_id = %task_id.short(8), "cancellation requested via heartbeat");
                        cancel.store(true, Ordering::SeqCst);
                    }
                    Err(StoreError::WorkerMismatch { .. })
                    | Err(StoreError::InvalidStatus { .. })
                    | Err(StoreError::TaskNotFound(_)) => {
                        lease_lost.store(true, Ordering::SeqCst);
                        cancel.store(true, Ordering::SeqCst);
                        return;
                    }
                    Err(e) => {
                        warn!(task_id = %task_id.short(8), error = %e, "heartbeat failed");
                    }
                }
            }
        })
    }

    /// Route a claimed task: pipeline triggers go through the runner,
    /// anything else runs as a plain kernel task.
    async fn dispatch(&self, task: &Task, cancel: Arc<AtomicBool>) -> Result<Value, TaskError> {
        if self.runner.registry().contains(&task.task_name) {
            return self.runner.run(task, cancel).await;
        }

        let exec_task = ExecutionTask {
            task_type: task.task_name.clone(),
            params: task.params.clone(),
            limits: self.executor_config.limits_for(&task.task_name),
            timeout: Some(self.executor_config.timeout_for(&task.task_name)),
        };
        let result = self.executor.run(exec_task, cancel).await;

        if result.success {
            Ok(result.result.unwrap_or(Value::Null))
        } else {
            Err(TaskError::new(
                result.error_code.unwrap_or(ErrorCode::KernelError),
                result
                    .error_message
                    .unwrap_or_else(|| "kernel failed without a message".to_string()),
            ))
        }
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
