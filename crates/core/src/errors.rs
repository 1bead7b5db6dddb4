// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Standardized error codes for task execution.
//!
//! Every failure a worker observes is mapped onto one of these codes
//! before it touches the task row. The code drives the retry decision
//! and the dead-letter reason, so the taxonomy is closed: kernels and
//! executors may not invent codes of their own.

use serde::{Deserialize, Serialize};

/// How aggressively a retryable failure should back off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffClass {
    /// Transient glitch; retry after a single base delay.
    Short,
    /// Normal exponential backoff.
    Standard,
    /// Resource pressure; retry with a stretched envelope.
    Extended,
}

/// Standardized execution error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Inputs malformed or missing.
    ValidationError,
    /// RAM/disk pre-check failed or runtime OOM.
    ResourceExhaustion,
    /// Wall-clock limit exceeded.
    Timeout,
    /// Child process died without a structured error.
    SubprocessCrash,
    /// Scientific kernel returned a structured error.
    KernelError,
    /// Filesystem or network glitch.
    TransientIo,
    /// Params repeatedly cause the same failure across attempts.
    PoisonPayload,
    /// Operator cancellation or pipeline abort.
    Cancelled,
}

impl ErrorCode {
    /// Whether a failure with this code may be retried at all.
    pub fn retryable(self) -> bool {
        match self {
            ErrorCode::ResourceExhaustion
            | ErrorCode::Timeout
            | ErrorCode::SubprocessCrash
            | ErrorCode::KernelError
            | ErrorCode::TransientIo => true,
            ErrorCode::ValidationError | ErrorCode::PoisonPayload | ErrorCode::Cancelled => false,
        }
    }

    /// Backoff envelope for retryable codes. Non-retryable codes report
    /// `Standard`; callers must check [`ErrorCode::retryable`] first.
    pub fn backoff_class(self) -> BackoffClass {
        match self {
            ErrorCode::TransientIo => BackoffClass::Short,
            ErrorCode::ResourceExhaustion => BackoffClass::Extended,
            _ => BackoffClass::Standard,
        }
    }
}

crate::tag_display! {
    ErrorCode {
        ValidationError => "validation_error",
        ResourceExhaustion => "resource_exhaustion",
        Timeout => "timeout",
        SubprocessCrash => "subprocess_crash",
        KernelError => "kernel_error",
        TransientIo => "transient_io",
        PoisonPayload => "poison_payload",
        Cancelled => "cancelled",
    }
}

#[cfg(test)]
#[path = "errors_tests.rs"]
mod tests;
