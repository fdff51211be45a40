//! Error catalog and error type for the management harness.
//!
//! # Error Code Ranges
//!
//! | Range      | Category    | Description                          |
//! |------------|-------------|--------------------------------------|
//! | E001-E099  | Config      | Configuration and setup errors       |
//! | E100-E199  | Transport   | SSH, API and remote command failures |
//! | E200-E299  | Rejection   | Control plane refusals               |
//! | E300-E399  | Poll        | Bounded waits that failed            |
//! | E500-E599  | Internal    | Internal/unexpected errors           |
//!
//! A task finishing in `ERROR` or `ABORTED` is an outcome, not an error:
//! those are returned as [`crate::TaskStatus`] values.

pub mod catalog;

pub use catalog::{ErrorCategory, ErrorCode, ErrorEntry};

use crate::exec::ExecError;
use crate::types::TaskId;
use std::time::Duration;
use thiserror::Error;

/// Failures raised by the orchestrator.
#[derive(Debug, Error)]
pub enum MgmtError {
    #[error("configuration error: {0}")]
    Config(String),

    /// Transient by nature; the poller retries these.
    #[error(transparent)]
    Transport(#[from] ExecError),

    #[error("{operation} rejected: {reason}")]
    Rejected { operation: String, reason: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("timed out after {waited:?} waiting for {what} (last observed: {last})")]
    PollTimeout {
        what: String,
        waited: Duration,
        last: String,
    },

    #[error("task {task} was observed RUNNING {after:?} into a hold that expected STOPPED")]
    PrematureResume { task: TaskId, after: Duration },

    #[error("tasks not STOPPED after {waited:?}: {}", tasks.join(", "))]
    NotStopped { tasks: Vec<String>, waited: Duration },

    #[error("{operation} is not available for {kind} tasks")]
    Capability { operation: String, kind: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl MgmtError {
    pub fn rejected(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Whether the failure is a transient transport problem.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Catalog code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Config(_) => ErrorCode::ConfigValidationError,
            Self::Transport(e) => e.code(),
            Self::Rejected { .. } => ErrorCode::OperationRejected,
            Self::NotFound { .. } => ErrorCode::ResourceNotFound,
            Self::InvalidParams(_) => ErrorCode::InvalidParameters,
            Self::PollTimeout { .. } => ErrorCode::PollTimeout,
            Self::PrematureResume { .. } => ErrorCode::PrematureResume,
            Self::NotStopped { .. } => ErrorCode::TasksNotStopped,
            Self::Capability { .. } => ErrorCode::CapabilityMismatch,
            Self::Internal(_) => ErrorCode::InternalStateError,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        self.code().category()
    }
}

impl From<serde_json::Error> for MgmtError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serde: {err}"))
    }
}
