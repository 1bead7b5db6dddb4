// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::{Kernel, KernelContext, KernelFailure, KernelRegistry};
use async_trait::async_trait;
use contimg_core::{
    FakeClock, FileState, GroupId, QueueConfig, SubbandFile, Task, TaskStatus,
};
use serde_json::json;
use std::path::Path;
use tempfile::TempDir;

struct StubKernel {
    outputs: Value,
}

#[async_trait]
impl Kernel for StubKernel {
    async fn run(&self, _params: Value, _ctx: KernelContext) -> Result<Value, KernelFailure> {
        Ok(self.outputs.clone())
    }
}

struct FailingKernel;

#[async_trait]
impl Kernel for FailingKernel {
    async fn run(&self, _params: Value, _ctx: KernelContext) -> Result<Value, KernelFailure> {
        Err(KernelFailure::new(
            contimg_core::ErrorCode::KernelError,
            "solver diverged",
        ))
    }
}

fn stub(outputs: Value) -> Arc<dyn Kernel> {
    Arc::new(StubKernel { outputs })
}

struct Harness {
    _dir: TempDir,
    store: Arc<Store<FakeClock>>,
    runner: PipelineRunner<FakeClock>,
    bus: Arc<EventBus>,
}

fn harness(registry: PipelineRegistry) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let clock = FakeClock::new();
    let store = Arc::new(
        Store::open(dir.path(), QueueConfig::new("contimg"), clock.clone()).unwrap(),
    );

    let mut kernels = KernelRegistry::new();
    kernels.register("convert", stub(json!({"ms_path": "/ms/g1.ms"})));
    kernels.register("calibrate", stub(json!({"cal_table": "/cal/g1.bcal"})));
    kernels.register("image", stub(json!({"image_path": "/img/g1.fits"})));
    kernels.register("mosaic", stub(json!({"mosaic_path": "/img/mosaic.fits"})));
    kernels.register("flaky", Arc::new(FailingKernel));

    let executor = Arc::new(Executor::new(
        Arc::new(kernels),
        ExecutorConfig::default(),
        Arc::new(crate::ResourceGuard::new()),
        clock.clone(),
    ));
    let bus = Arc::new(EventBus::new(64));
    let runner = PipelineRunner::new(
        Arc::clone(&store),
        executor,
        Arc::clone(&bus),
        Arc::new(registry),
        ExecutorConfig::default(),
        "contimg",
        3,
    );

    Harness {
        _dir: dir,
        store,
        runner,
        bus,
    }
}

fn conversion_task(params: Value) -> Task {
    Task::builder()
        .id("trigger-1")
        .task_name("conversion")
        .params(params)
        .status(TaskStatus::Running)
        .build()
}

fn cancel() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

fn register_member(store: &Store<FakeClock>, path: &str, index: u8) {
    store
        .register_file(
            SubbandFile {
                path: PathBuf::from(path),
                mtime_ms: 1_000,
                size: 64,
                group_id: GroupId::new("2025-06-01T12:00:00"),
                subband_index: index,
                state: FileState::Seen,
            },
            16,
        )
        .unwrap();
    store.mark_file_stable(Path::new(path)).unwrap();
}

#[tokio::test]
async fn conversion_advances_ms_and_chains_calibration() {
    let h = harness(PipelineRegistry::standard());
    register_member(&h.store, "/in/2025-06-01T12:00:00_sb00.hdf5", 0);

    let task = conversion_task(json!({
        "group_id": "2025-06-01T12:00:00",
        "members": ["/in/2025-06-01T12:00:00_sb00.hdf5"],
    }));

    let result = h.runner.run(&task, cancel()).await.unwrap();
    let report: PipelineReport = serde_json::from_value(result).unwrap();
    assert!(report.success);
    assert_eq!(report.stages.len(), 1);
    assert_eq!(report.stages[0].status, StageStatus::Completed);

    // MS advanced registered → converted
    let record = h.store.ms_record(Path::new("/ms/g1.ms")).unwrap();
    assert_eq!(record.state, contimg_core::MsState::Converted);

    // member files consumed
    h.store.with_state(|state| {
        assert_eq!(
            state.files[&PathBuf::from("/in/2025-06-01T12:00:00_sb00.hdf5")].state,
            FileState::Consumed
        );
    });

    // calibration trigger chained with the ms_path in its params
    let pending = h.store.list_tasks("contimg", Some(TaskStatus::Pending), 10);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].task_name, "calibration");
    assert_eq!(pending[0].params["ms_path"], "/ms/g1.ms");
    assert_eq!(pending[0].parent_task_id, Some(task.id));
}

#[tokio::test]
async fn full_chain_reaches_mosaicked() {
    let h = harness(PipelineRegistry::standard());

    let mut task = conversion_task(json!({
        "group_id": "2025-06-01T12:00:00",
        "members": [],
    }));

    // run each chained trigger in turn: conversion → calibration →
    // imaging → mosaic
    for _ in 0..4 {
        h.runner.run(&task, cancel()).await.unwrap();
        let pending = h.store.list_tasks("contimg", Some(TaskStatus::Pending), 10);
        match pending.first() {
            Some(next) => {
                task = Task::builder()
                    .id(next.id.as_str())
                    .task_name(next.task_name.as_str())
                    .params(next.params.clone())
                    .status(TaskStatus::Running)
                    .build();
                // consume the pending trigger so the next loop sees only new spawns
                let claimed = h
                    .store
                    .claim("contimg", &contimg_core::WorkerId::new("w"), std::time::Duration::from_secs(300))
                    .unwrap()
                    .unwrap();
                h.store
                    .complete(&claimed.id, &contimg_core::WorkerId::new("w"), json!({}))
                    .unwrap();
            }
            None => break,
        }
    }

    let record = h.store.ms_record(Path::new("/ms/g1.ms")).unwrap();
    assert_eq!(record.state, contimg_core::MsState::Mosaicked);
}

#[tokio::test]
async fn rerun_of_applied_transition_does_not_double_chain() {
    let h = harness(PipelineRegistry::standard());
    let task = conversion_task(json!({
        "group_id": "2025-06-01T12:00:00",
        "members": [],
    }));

    h.runner.run(&task, cancel()).await.unwrap();
    // crashed-worker replay: same trigger runs again
    h.runner.run(&task, cancel()).await.unwrap();

    let pending = h.store.list_tasks("contimg", Some(TaskStatus::Pending), 10);
    let calibrations = pending
        .iter()
        .filter(|t| t.task_name == "calibration")
        .count();
    assert_eq!(calibrations, 1);
}

#[tokio::test]
async fn unknown_pipeline_is_validation_error() {
    let h = harness(PipelineRegistry::standard());
    let task = Task::builder()
        .task_name("transmogrify")
        .status(TaskStatus::Running)
        .build();

    let error = h.runner.run(&task, cancel()).await.unwrap_err();
    assert_eq!(error.code, contimg_core::ErrorCode::ValidationError);
}

#[tokio::test]
async fn missing_input_key_is_validation_error() {
    let h = harness(PipelineRegistry::standard());
    let task = conversion_task(json!({"group_id": "2025-06-01T12:00:00"}));

    let error = h.runner.run(&task, cancel()).await.unwrap_err();
    assert_eq!(error.code, contimg_core::ErrorCode::ValidationError);
    assert!(error.message.contains("members"));
}

#[tokio::test]
async fn missing_output_key_is_validation_error() {
    let mut registry = PipelineRegistry::new();
    let mut stage = StageSpec::new("convert");
    stage.output_keys = vec!["ms_path".into(), "flags_path".into()];
    registry.register(Pipeline {
        name: "conversion".into(),
        stages: vec![stage],
        next: None,
    });

    let h = harness(registry);
    let task = conversion_task(json!({}));

    let error = h.runner.run(&task, cancel()).await.unwrap_err();
    assert_eq!(error.code, contimg_core::ErrorCode::ValidationError);
    assert!(error.message.contains("flags_path"));
}

#[tokio::test]
async fn failed_stage_records_ms_failure_and_aborts() {
    let mut registry = PipelineRegistry::new();
    let mut flaky = StageSpec::new("flaky");
    flaky.input_keys = vec!["ms_path".into()];
    registry.register(Pipeline {
        name: "calibration".into(),
        stages: vec![flaky],
        next: Some("imaging".into()),
    });

    let h = harness(registry);
    h.store.get_or_create_ms(Path::new("/ms/g1.ms"), None).unwrap();
    h.store
        .transition_ms(
            Path::new("/ms/g1.ms"),
            contimg_core::MsState::Registered,
            contimg_core::MsState::Converted,
            None,
        )
        .unwrap();

    let task = Task::builder()
        .task_name("calibration")
        .params(json!({"ms_path": "/ms/g1.ms"}))
        .status(TaskStatus::Running)
        .build();

    let error = h.runner.run(&task, cancel()).await.unwrap_err();
    assert_eq!(error.code, contimg_core::ErrorCode::KernelError);

    let record = h.store.ms_record(Path::new("/ms/g1.ms")).unwrap();
    assert_eq!(record.state, contimg_core::MsState::Failed);
    assert_eq!(record.prior_state, Some(contimg_core::MsState::Converted));

    // no chain on failure
    assert!(h
        .store
        .list_tasks("contimg", Some(TaskStatus::Pending), 10)
        .is_empty());
}

#[tokio::test]
async fn continue_on_failure_skips_and_proceeds() {
    let mut registry = PipelineRegistry::new();
    let mut flaky = StageSpec::new("flaky");
    flaky.continue_on_failure = true;
    let probe = StageSpec::new("convert");
    registry.register(Pipeline {
        name: "diagnostics".into(),
        stages: vec![flaky, probe],
        next: None,
    });

    let h = harness(registry);
    let task = Task::builder()
        .task_name("diagnostics")
        .params(json!({}))
        .status(TaskStatus::Running)
        .build();

    let result = h.runner.run(&task, cancel()).await.unwrap();
    let report: PipelineReport = serde_json::from_value(result).unwrap();
    assert_eq!(report.stages[0].status, StageStatus::Failed);
    assert_eq!(report.stages[1].status, StageStatus::Completed);
}

#[tokio::test]
async fn stage_events_reach_the_bus() {
    let h = harness(PipelineRegistry::standard());
    let mut sub = h.bus.subscribe();

    let task = conversion_task(json!({
        "group_id": "2025-06-01T12:00:00",
        "members": [],
    }));
    h.runner.run(&task, cancel()).await.unwrap();

    let started = sub
        .recv_matching(|e| matches!(e, contimg_core::Event::StageStarted { .. }))
        .await
        .unwrap();
    assert_eq!(started.log_summary(), "stage:started conversion/convert");

    let finished = sub
        .recv_matching(|e| matches!(e, contimg_core::Event::StageFinished { .. }))
        .await
        .unwrap();
    assert!(finished
        .log_summary()
        .starts_with("stage:finished conversion/convert"));
}

#[test]
fn context_is_immutable_across_outputs() {
    let base = PipelineContext::from_params(&json!({"a": 1}));
    let extended = base.with_output("b", json!(2));

    assert!(base.get("b").is_none());
    assert_eq!(extended.get("b"), Some(&json!(2)));
    assert_eq!(extended.get("a"), Some(&json!(1)));
}

#[test]
fn context_accessors() {
    let context = PipelineContext::from_params(&json!({
        "ms_path": "/ms/a.ms",
        "members": ["/in/a_sb00.hdf5", "/in/a_sb01.hdf5"],
    }));
    assert_eq!(context.ms_path(), Some(PathBuf::from("/ms/a.ms")));
    assert_eq!(context.members().len(), 2);

    let scalar = PipelineContext::from_params(&json!(42));
    assert_eq!(scalar.get("params"), Some(&json!(42)));
}
