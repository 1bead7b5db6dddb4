// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pipelines: ordered stage sequences with recovery.
//!
//! A pipeline is triggered by one claimed task. Each stage runs the
//! kernel named after it through the executor, merges its outputs into
//! an immutable context, and advances the measurement-set record. On
//! completion the next pipeline's trigger task is spawned - but only
//! when this run actually applied the state transition, so two workers
//! finishing the same transition can never double-spawn the chain.

use crate::{EventBus, Executor};
use contimg_core::{
    BackoffStrategy, Clock, ErrorCode, Event, ExecutionTask, ExecutorConfig, MsState, RetryPolicy,
    SpawnRequest, Task, TaskError,
};
use contimg_storage::{MsTransition, Store, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Declarative description of one stage.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// Stage name; doubles as the executor task type.
    pub name: String,
    /// Context keys that must exist before the stage runs.
    pub input_keys: Vec<String>,
    /// Keys the kernel result must contribute to the context.
    pub output_keys: Vec<String>,
    /// MS state recorded after the stage succeeds.
    pub advances_to: Option<MsState>,
    /// Landing files listed under `members` are consumed on success.
    pub consumes_files: bool,
    /// In-stage retry policy; task-level retry wraps around it.
    pub retry: RetryPolicy,
    /// Keep running later stages when this one fails.
    pub continue_on_failure: bool,
}

impl StageSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_keys: Vec::new(),
            output_keys: Vec::new(),
            advances_to: None,
            consumes_files: false,
            retry: default_stage_retry(),
            continue_on_failure: false,
        }
    }
}

/// Two quick tries inside the stage; slower recovery belongs to the
/// task-level retry with backoff.
fn default_stage_retry() -> RetryPolicy {
    RetryPolicy::new(
        2,
        BackoffStrategy::Immediate,
        Duration::from_secs(1),
        Duration::from_secs(60),
    )
}

/// An ordered stage sequence plus its chained successor.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub name: String,
    pub stages: Vec<StageSpec>,
    /// Pipeline triggered after this one completes.
    pub next: Option<String>,
}

/// Fixed set of registered pipelines.
#[derive(Default)]
pub struct PipelineRegistry {
    pipelines: HashMap<String, Pipeline>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The production chain: conversion → calibration → imaging → mosaic.
    pub fn standard() -> Self {
        let mut registry = Self::new();

        let mut convert = StageSpec::new("convert");
        convert.input_keys = vec!["group_id".into(), "members".into()];
        convert.output_keys = vec!["ms_path".into()];
        convert.advances_to = Some(MsState::Converted);
        convert.consumes_files = true;

        let mut calibrate = StageSpec::new("calibrate");
        calibrate.input_keys = vec!["ms_path".into()];
        calibrate.output_keys = vec!["cal_table".into()];
        calibrate.advances_to = Some(MsState::Calibrated);

        let mut image = StageSpec::new("image");
        image.input_keys = vec!["ms_path".into()];
        image.output_keys = vec!["image_path".into()];
        image.advances_to = Some(MsState::Imaged);

        let mut mosaic = StageSpec::new("mosaic");
        mosaic.input_keys = vec!["ms_path".into()];
        mosaic.output_keys = vec!["mosaic_path".into()];
        mosaic.advances_to = Some(MsState::Mosaicked);

        registry.register(Pipeline {
            name: "conversion".into(),
            stages: vec![convert],
            next: Some("calibration".into()),
        });
        registry.register(Pipeline {
            name: "calibration".into(),
            stages: vec![calibrate],
            next: Some("imaging".into()),
        });
        registry.register(Pipeline {
            name: "imaging".into(),
            stages: vec![image],
            next: Some("mosaic".into()),
        });
        registry.register(Pipeline {
            name: "mosaic".into(),
            stages: vec![mosaic],
            next: None,
        });

        registry
    }

    pub fn register(&mut self, pipeline: Pipeline) {
        self.pipelines.insert(pipeline.name.clone(), pipeline);
    }

    pub fn get(&self, name: &str) -> Option<&Pipeline> {
        self.pipelines.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pipelines.contains_key(name)
    }
}

/// Immutable key-value context threaded through the stages.
///
/// `with_output` returns a new context, so a stage can never mutate
/// what an earlier stage saw.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineContext {
    values: Map<String, Value>,
}

impl PipelineContext {
    pub fn from_params(params: &Value) -> Self {
        let values = match params {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert("params".to_string(), other.clone());
                map
            }
        };
        Self { values }
    }

    #[must_use]
    pub fn with_output(&self, key: impl Into<String>, value: Value) -> Self {
        let mut values = self.values.clone();
        values.insert(key.into(), value);
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn ms_path(&self) -> Option<PathBuf> {
        self.values
            .get("ms_path")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
    }

    /// Landing files recorded under `members`.
    pub fn members(&self) -> Vec<PathBuf> {
        self.values
            .get("members")
            .and_then(|v| v.as_array())
            .map(|paths| {
                paths
                    .iter()
                    .filter_map(|p| p.as_str())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }
}

/// Result of one stage within a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub name: String,
    pub status: StageStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Task result payload for a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub pipeline: String,
    pub stages: Vec<StageOutcome>,
    pub success: bool,
    pub context: Value,
}

/// Executes pipelines against the store and executor.
pub struct PipelineRunner<C: Clock> {
    store: Arc<Store<C>>,
    executor: Arc<Executor<C>>,
    bus: Arc<EventBus>,
    registry: Arc<PipelineRegistry>,
    executor_config: ExecutorConfig,
    queue: String,
    /// Stage failures per MS before quarantine.
    max_ms_retries: u32,
}

impl<C: Clock> PipelineRunner<C> {
    pub fn new(
        store: Arc<Store<C>>,
        executor: Arc<Executor<C>>,
        bus: Arc<EventBus>,
        registry: Arc<PipelineRegistry>,
        executor_config: ExecutorConfig,
        queue: impl Into<String>,
        max_ms_retries: u32,
    ) -> Self {
        Self {
            store,
            executor,
            bus,
            registry,
            executor_config,
            queue: queue.into(),
            max_ms_retries,
        }
    }

    pub fn registry(&self) -> &PipelineRegistry {
        &self.registry
    }

    /// Run the pipeline a claimed task triggers. The error side feeds
    /// the task-level retry decision in the worker.
    pub async fn run(&self, task: &Task, cancel: Arc<AtomicBool>) -> Result<Value, TaskError> {
        let pipeline = self
            .registry
            .get(&task.task_name)
            .ok_or_else(|| {
                TaskError::new(
                    ErrorCode::ValidationError,
                    format!("unknown pipeline `{}`", task.task_name),
                )
            })?
            .clone();

        info!(pipeline = %pipeline.name, task_id = %task.id, "pipeline start");

        let mut context = PipelineContext::from_params(&task.params);
        let mut outcomes: Vec<StageOutcome> = Vec::new();
        let mut chain_allowed = true;
        let mut aborted: Option<TaskError> = None;

        for stage in &pipeline.stages {
            if aborted.is_some() {
                outcomes.push(StageOutcome {
                    name: stage.name.clone(),
                    status: StageStatus::Skipped,
                    attempts: 0,
                    error: None,
                });
                continue;
            }

            if let Some(missing) = stage.input_keys.iter().find(|k| !context.contains(k)) {
                return Err(TaskError::new(
                    ErrorCode::ValidationError,
                    format!("stage `{}` missing input `{}`", stage.name, missing),
                ));
            }

            self.bus.publish(Event::StageStarted {
                pipeline: pipeline.name.clone(),
                stage: stage.name.clone(),
                task_id: task.id.clone(),
                ms_path: context.ms_path(),
            });

            let (result, attempts) = self.run_stage(stage, &context, task, &cancel).await;

            match result {
                Ok(new_context) => {
                    context = new_context;

                    if let Some(to) = stage.advances_to {
                        match self.advance_ms(stage, to, &context) {
                            Ok(applied) => chain_allowed = chain_allowed && applied,
                            Err(e) => {
                                aborted = Some(e);
                            }
                        }
                    }
                    if aborted.is_none() && stage.consumes_files {
                        let members = context.members();
                        if !members.is_empty() {
                            if let Err(e) = self.store.mark_files_consumed(&members) {
                                warn!(error = %e, "failed consuming member files");
                            }
                        }
                    }

                    self.bus.publish(Event::StageFinished {
                        pipeline: pipeline.name.clone(),
                        stage: stage.name.clone(),
                        task_id: task.id.clone(),
                        ms_path: context.ms_path(),
                        success: aborted.is_none(),
                        skipped: false,
                    });
                    outcomes.push(StageOutcome {
                        name: stage.name.clone(),
                        status: StageStatus::Completed,
                        attempts,
                        error: None,
                    });
                }
                Err(error) => {
                    self.bus.publish(Event::StageFinished {
                        pipeline: pipeline.name.clone(),
                        stage: stage.name.clone(),
                        task_id: task.id.clone(),
                        ms_path: context.ms_path(),
                        success: false,
                        skipped: false,
                    });

                    if let Some(ms_path) = context.ms_path() {
                        if let Err(e) = self.store.record_ms_failure(
                            &ms_path,
                            &error.to_string(),
                            self.max_ms_retries,
                        ) {
                            warn!(error = %e, "failed recording ms failure");
                        }
                    }

                    if stage.continue_on_failure {
                        outcomes.push(StageOutcome {
                            name: stage.name.clone(),
                            status: StageStatus::Failed,
                            attempts,
                            error: Some(error.to_string()),
                        });
                        chain_allowed = false;
                    } else {
                        outcomes.push(StageOutcome {
                            name: stage.name.clone(),
                            status: StageStatus::Failed,
                            attempts,
                            error: Some(error.to_string()),
                        });
                        aborted = Some(error);
                    }
                }
            }
        }

        if let Some(error) = aborted {
            return Err(error);
        }

        // Chain the next pipeline, but only when this run owned the
        // final state transition.
        if chain_allowed {
            if let Some(next) = &pipeline.next {
                let spawn = SpawnRequest::new(self.queue.clone(), next.clone(), context.to_value())
                    .parent_task_id(task.id.clone());
                match self.store.spawn(spawn) {
                    Ok(next_task) => {
                        info!(pipeline = %pipeline.name, next = %next, next_task = %next_task.short(8), "chained next pipeline");
                    }
                    Err(e) => {
                        return Err(TaskError::new(
                            ErrorCode::TransientIo,
                            format!("failed to chain pipeline `{}`: {}", next, e),
                        ))
                    }
                }
            }
        }

        let report = PipelineReport {
            pipeline: pipeline.name.clone(),
            stages: outcomes,
            success: true,
            context: context.to_value(),
        };
        serde_json::to_value(&report)
            .map_err(|e| TaskError::new(ErrorCode::ValidationError, e.to_string()))
    }

    /// Run one stage with its in-stage retry loop. Returns the updated
    /// context on success and the attempt count either way.
    async fn run_stage(
        &self,
        stage: &StageSpec,
        context: &PipelineContext,
        task: &Task,
        cancel: &Arc<AtomicBool>,
    ) -> (Result<PipelineContext, TaskError>, u32) {
        let max_attempts = stage.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let exec_task = ExecutionTask {
                task_type: stage.name.clone(),
                params: context.to_value(),
                limits: self.executor_config.limits_for(&stage.name),
                timeout: Some(self.executor_config.timeout_for(&stage.name)),
            };

            let result = self.executor.run(exec_task, Arc::clone(cancel)).await;

            if result.success {
                let outputs = result.result.unwrap_or(Value::Null);
                return (self.merge_outputs(stage, context, outputs), attempt);
            }

            let code = result.error_code.unwrap_or(ErrorCode::KernelError);
            let message = result
                .error_message
                .unwrap_or_else(|| "kernel failed without a message".to_string());

            if code == ErrorCode::Cancelled {
                return (Err(TaskError::new(code, message)), attempt);
            }
            if code.retryable() && stage.retry.allows_retry(attempt) && attempt < max_attempts {
                let delay = stage
                    .retry
                    .next_delay(attempt, code.backoff_class(), task.id.as_str());
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                continue;
            }
            return (Err(TaskError::new(code, message)), attempt);
        }
    }

    /// Merge kernel outputs into the context and check the declared
    /// output keys all materialized.
    fn merge_outputs(
        &self,
        stage: &StageSpec,
        context: &PipelineContext,
        outputs: Value,
    ) -> Result<PipelineContext, TaskError> {
        let mut next = context.clone();
        if let Value::Object(map) = outputs {
            for (key, value) in map {
                next = next.with_output(key, value);
            }
        }

        if let Some(missing) = stage.output_keys.iter().find(|k| !next.contains(k)) {
            return Err(TaskError::new(
                ErrorCode::ValidationError,
                format!("stage `{}` produced no output `{}`", stage.name, missing),
            ));
        }
        Ok(next)
    }

    /// Record the stage's MS state advance. Returns whether this run
    /// applied the transition (a lost race or replay returns false and
    /// suppresses chaining).
    fn advance_ms(
        &self,
        stage: &StageSpec,
        to: MsState,
        context: &PipelineContext,
    ) -> Result<bool, TaskError> {
        let ms_path = context.ms_path().ok_or_else(|| {
            TaskError::new(
                ErrorCode::ValidationError,
                format!("stage `{}` advanced without an ms_path", stage.name),
            )
        })?;
        let from = to.prior().ok_or_else(|| {
            TaskError::new(
                ErrorCode::ValidationError,
                format!("stage `{}` advances to non-chain state {}", stage.name, to),
            )
        })?;

        if from == MsState::Registered {
            self.store
                .get_or_create_ms(&ms_path, None)
                .map_err(store_to_task_error)?;
        }

        let checkpoint = context.get("checkpoint").cloned();
        match self.store.transition_ms(&ms_path, from, to, checkpoint) {
            Ok(MsTransition::Applied) => Ok(true),
            Ok(MsTransition::NoOp) => {
                info!(ms = %ms_path.display(), %to, "transition already applied, skipping chain");
                Ok(false)
            }
            Err(StoreError::StateMismatch { found, .. }) => {
                warn!(ms = %ms_path.display(), %found, %to, "lost transition race");
                Ok(false)
            }
            Err(e) => Err(store_to_task_error(e)),
        }
    }
}

fn store_to_task_error(e: StoreError) -> TaskError {
    TaskError::new(ErrorCode::TransientIo, e.to_string())
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
