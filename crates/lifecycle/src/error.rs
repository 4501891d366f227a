/*
 * SPDX-FileCopyrightText: 2024 DataKeeper Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Error types for lifecycle operations

use crate::job::JobStatus;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for lifecycle operations
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Lifecycle-specific errors
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("source path not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("job {job_id} is {status}, expected {expected}")]
    InvalidState {
        job_id: String,
        status: JobStatus,
        expected: JobStatus,
    },

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidSchedule { expr: String, reason: String },

    #[error("archive integrity check failed: expected {expected} entries, found {actual}")]
    Integrity { expected: usize, actual: usize },

    #[error("unsupported compression format: {0}")]
    UnsupportedFormat(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl LifecycleError {
    /// Whether the error indicates a caller bug rather than an
    /// environmental failure. Caller bugs are never retried.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            LifecycleError::SourceNotFound(_)
                | LifecycleError::NotFound(_)
                | LifecycleError::InvalidState { .. }
                | LifecycleError::InvalidTransition { .. }
                | LifecycleError::InvalidSchedule { .. }
                | LifecycleError::UnsupportedFormat(_)
        )
    }
}
