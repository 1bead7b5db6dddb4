// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared helpers for the behavioral specs.

use async_trait::async_trait;
use contimg_core::{CoreConfig, FakeClock, IngestConfig, QueueConfig};
use contimg_engine::{Kernel, KernelContext, KernelFailure, KernelRegistry};
use contimg_storage::Store;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// A kernel that derives its outputs from the stage inputs, the way
/// the real conversion/calibration/imaging kernels shape theirs.
pub struct ScriptedKernel {
    outputs: Box<dyn Fn(&Value) -> Result<Value, KernelFailure> + Send + Sync>,
}

impl ScriptedKernel {
    pub fn new(
        outputs: impl Fn(&Value) -> Result<Value, KernelFailure> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            outputs: Box::new(outputs),
        })
    }
}

#[async_trait]
impl Kernel for ScriptedKernel {
    async fn run(&self, params: Value, _ctx: KernelContext) -> Result<Value, KernelFailure> {
        (self.outputs)(&params)
    }
}

/// Registry with well-behaved kernels for the whole standard chain.
/// The conversion kernel names the MS after the group id.
pub fn happy_kernels() -> KernelRegistry {
    let mut kernels = KernelRegistry::new();
    kernels.register(
        "convert",
        ScriptedKernel::new(|params| {
            let group = params["group_id"].as_str().unwrap_or("unknown");
            Ok(json!({"ms_path": format!("/ms/{}.ms", group)}))
        }),
    );
    kernels.register(
        "calibrate",
        ScriptedKernel::new(|params| {
            let ms = params["ms_path"].as_str().unwrap_or("unknown");
            Ok(json!({"cal_table": format!("{}.bcal", ms)}))
        }),
    );
    kernels.register(
        "image",
        ScriptedKernel::new(|params| {
            let ms = params["ms_path"].as_str().unwrap_or("unknown");
            Ok(json!({"image_path": format!("{}.fits", ms)}))
        }),
    );
    kernels.register(
        "mosaic",
        ScriptedKernel::new(|params| {
            let ms = params["ms_path"].as_str().unwrap_or("unknown");
            Ok(json!({"mosaic_path": format!("{}.mosaic.fits", ms)}))
        }),
    );
    kernels
}

pub fn open_store(dir: &Path, clock: &FakeClock) -> Arc<Store<FakeClock>> {
    Arc::new(Store::open(dir, QueueConfig::new("contimg"), clock.clone()).unwrap())
}

/// Runtime configuration with short intervals for the specs.
pub fn fast_core_config(landing: &Path) -> CoreConfig {
    let mut queue = QueueConfig::new("contimg");
    queue.worker_concurrency = 2;
    queue.worker_poll_interval = Duration::from_millis(10);

    let mut ingest = IngestConfig::new(landing);
    ingest.file_stability_quiet = Duration::from_millis(80);
    ingest.scan_interval = Duration::from_millis(20);

    CoreConfig {
        queue,
        ingest,
        scheduler: Default::default(),
        executor: Default::default(),
    }
}

/// Poll until `check` passes or the deadline hits.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(15);
    loop {
        if check() {
            return;
        }
        assert!(std::time::Instant::now() < deadline, "timed out: {}", what);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
