// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn err(code: ErrorCode, msg: &str) -> TaskError {
    TaskError::new(code, msg)
}

#[test]
fn identical_repeated_errors_are_poison() {
    let history = vec![
        err(ErrorCode::KernelError, "bad antenna table"),
        err(ErrorCode::KernelError, "bad antenna table"),
        err(ErrorCode::KernelError, "bad antenna table"),
    ];
    assert_eq!(
        DeadLetterReason::derive(&history),
        DeadLetterReason::PoisonPayload
    );
}

#[test]
fn single_validation_error_maps_to_validation() {
    let history = vec![err(ErrorCode::ValidationError, "missing ms_path")];
    assert_eq!(
        DeadLetterReason::derive(&history),
        DeadLetterReason::ValidationError
    );
}

#[test]
fn varied_errors_map_by_final_code() {
    let history = vec![
        err(ErrorCode::TransientIo, "nfs blip"),
        err(ErrorCode::ResourceExhaustion, "oom at 31GB"),
    ];
    assert_eq!(
        DeadLetterReason::derive(&history),
        DeadLetterReason::ResourceExhaustion
    );
}

#[test]
fn varied_kernel_errors_are_exceeded_retries() {
    let history = vec![
        err(ErrorCode::KernelError, "solver diverged"),
        err(ErrorCode::Timeout, "wall clock exceeded"),
        err(ErrorCode::KernelError, "solver diverged again"),
    ];
    assert_eq!(
        DeadLetterReason::derive(&history),
        DeadLetterReason::ExceededRetries
    );
}

#[test]
fn cancelled_final_error_is_explicit() {
    let history = vec![err(ErrorCode::Cancelled, "operator cancel")];
    assert_eq!(
        DeadLetterReason::derive(&history),
        DeadLetterReason::Explicit
    );
}

#[test]
fn empty_history_defaults_to_exceeded_retries() {
    assert_eq!(
        DeadLetterReason::derive(&[]),
        DeadLetterReason::ExceededRetries
    );
}
