// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Runtime assembly.
//!
//! One [`CoreRuntime`] value owns every subsystem - store, bus,
//! watcher, ingest, scheduler, workers, checkpoint maintenance - built
//! explicitly from configuration at startup and torn down in order at
//! shutdown. Nothing global, nothing lazy.

use crate::{
    Control, EventBus, Executor, FileWatcher, IngestRunner, KernelRegistry, PipelineRegistry,
    PipelineRunner, ResourceGuard, Scheduler, WorkerPool,
};
use crate::ingest::IngestHandle;
use crate::scheduler::SchedulerHandle;
use crate::watch::WatcherHandle;
use crate::EngineError;
use contimg_core::{Clock, CoreConfig, ScheduledTask};
use contimg_storage::Store;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Checkpoint when this many events accumulated since the last one.
const CHECKPOINT_EVERY_EVENTS: u64 = 500;
/// Cadence of the checkpoint maintenance loop.
const CHECKPOINT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// The assembled ingest and orchestration core.
pub struct CoreRuntime<C: Clock> {
    store: Arc<Store<C>>,
    bus: Arc<EventBus>,
    config: CoreConfig,
    watcher: WatcherHandle,
    ingest: IngestHandle,
    scheduler: SchedulerHandle,
    workers: WorkerPool,
    maintenance: JoinHandle<()>,
}

impl<C: Clock> CoreRuntime<C> {
    /// Construct and start every subsystem.
    ///
    /// `kernels` supplies the in-process scientific kernels;
    /// `pipelines` usually comes from [`PipelineRegistry::standard`].
    pub fn start(
        data_dir: &Path,
        config: CoreConfig,
        kernels: KernelRegistry,
        pipelines: PipelineRegistry,
        clock: C,
    ) -> Result<Self, EngineError> {
        let store = Arc::new(Store::open(
            data_dir,
            config.queue.clone(),
            clock.clone(),
        )?);

        let bus = Arc::new(EventBus::new(1024));
        store.add_sink(Arc::clone(&bus) as Arc<dyn contimg_core::EventSink>);

        let guard = Arc::new(ResourceGuard::new());
        let executor = Arc::new(Executor::new(
            Arc::new(kernels),
            config.executor.clone(),
            guard,
            clock.clone(),
        ));

        let runner = Arc::new(PipelineRunner::new(
            Arc::clone(&store),
            Arc::clone(&executor),
            Arc::clone(&bus),
            Arc::new(pipelines),
            config.executor.clone(),
            config.queue.name.clone(),
            config.queue.max_attempts,
        ));

        let (watcher, stable_rx) = FileWatcher::start(config.ingest.clone(), clock.clone())?;
        let ingest = IngestRunner::start(
            Arc::clone(&store),
            config.ingest.clone(),
            config.queue.name.clone(),
            config.queue.max_attempts,
            stable_rx,
            clock.clone(),
        );

        let scheduler = Scheduler::start(
            Arc::clone(&store),
            config.scheduler.clone(),
            clock.clone(),
        );

        let workers = WorkerPool::start(
            Arc::clone(&store),
            runner,
            executor,
            config.queue.clone(),
            config.executor.clone(),
        );

        let maintenance = spawn_maintenance(Arc::clone(&store));

        info!(
            data_dir = %data_dir.display(),
            queue = %config.queue.name,
            workers = config.queue.worker_concurrency,
            "core runtime started"
        );

        Ok(Self {
            store,
            bus,
            config,
            watcher,
            ingest,
            scheduler,
            workers,
            maintenance,
        })
    }

    pub fn store(&self) -> Arc<Store<C>> {
        Arc::clone(&self.store)
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// Operator control surface bound to the primary queue.
    pub fn control(&self) -> Control<C> {
        Control::new(
            Arc::clone(&self.store),
            self.config.queue.name.clone(),
            self.config.queue.max_attempts,
        )
    }

    /// Register a recurring task (e.g. the nightly mosaic).
    pub fn register_scheduled(&self, entry: ScheduledTask) -> Result<(), EngineError> {
        self.store.register_scheduled(entry)?;
        Ok(())
    }

    /// Orderly shutdown: stop intake first, drain workers up to the
    /// grace period, then write a final checkpoint.
    pub async fn shutdown(self) {
        info!("core runtime shutting down");
        self.watcher.stop();
        self.ingest.stop();
        self.scheduler.stop();
        self.maintenance.abort();
        self.workers.shutdown().await;

        let store = self.store;
        let result = tokio::task::spawn_blocking(move || store.checkpoint()).await;
        match result {
            Ok(Ok(())) => info!("final checkpoint written"),
            Ok(Err(e)) => warn!(error = %e, "final checkpoint failed"),
            Err(e) => warn!(error = %e, "final checkpoint task failed"),
        }
    }
}

/// Periodic WAL compaction.
fn spawn_maintenance<C: Clock>(store: Arc<Store<C>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(CHECKPOINT_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let store = Arc::clone(&store);
            let result = tokio::task::spawn_blocking(move || {
                store.maybe_checkpoint(CHECKPOINT_EVERY_EVENTS)
            })
            .await;
            match result {
                Ok(Ok(true)) => info!("periodic checkpoint written"),
                Ok(Ok(false)) => {}
                Ok(Err(e)) => warn!(error = %e, "periodic checkpoint failed"),
                Err(e) => warn!(error = %e, "checkpoint task failed"),
            }
        }
    })
}
