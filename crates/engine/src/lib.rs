// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! contimg-engine: the runtime of the ingest and orchestration core.
//!
//! Wires the landing-directory watcher, subband grouper, durable
//! store, cron scheduler, worker pool, and executors into a single
//! [`CoreRuntime`]. All subsystems are constructed explicitly at
//! startup and passed by handle - no process-global state.

mod bus;
mod control;
mod error;
mod executor;
mod grouper;
mod ingest;
mod pipeline;
mod resource;
mod runtime;
mod scheduler;
mod watch;
mod worker;

pub use bus::{BusSubscription, EventBus};
pub use control::Control;
pub use error::EngineError;
pub use executor::{Executor, Kernel, KernelContext, KernelFailure, KernelRegistry};
pub use grouper::{Assignment, SubbandGrouper};
pub use ingest::{IngestHandle, IngestRunner};
pub use pipeline::{
    Pipeline, PipelineContext, PipelineRegistry, PipelineReport, PipelineRunner, StageOutcome,
    StageSpec, StageStatus,
};
pub use resource::ResourceGuard;
pub use runtime::CoreRuntime;
pub use scheduler::{Scheduler, SchedulerHandle};
pub use watch::{FileWatcher, StableFile, WatcherHandle};
pub use worker::WorkerPool;
