// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Engine-level errors.

use contimg_storage::StoreError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by engine subsystems.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("watch root missing: {0}")]
    WatchRootMissing(PathBuf),
    #[error("invalid glob pattern `{pattern}`: {reason}")]
    BadPattern { pattern: String, reason: String },
    #[error("unknown pipeline: {0}")]
    UnknownPipeline(String),
    #[error("unknown kernel: {0}")]
    UnknownKernel(String),
    #[error("measurement set {0} has nothing to resume")]
    NothingToResume(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
