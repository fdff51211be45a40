//! Shared types and utilities for the management harness.
//!
//! Everything the orchestrator crates agree on lives here: task and host
//! status enums, the error catalog, configuration loading, remote command
//! execution and the bounded retry policy used around it.

pub mod config;
pub mod errors;
pub mod exec;
pub mod retry;
pub mod testing;
pub mod types;
pub mod util;

pub use config::{HarnessConfig, PollSettings};
pub use errors::{ErrorCategory, ErrorCode, MgmtError};
pub use exec::{
    CommandOutput, ExecError, LocalExecutor, MockExecutor, RemoteExecutor, RetryingExecutor,
    SshExecutor, SshTarget,
};
pub use retry::{RetryPolicy, RetryableError, run_with_retry};
pub use types::{
    BackupStage, ClusterId, HostHealth, HostRestStatus, HostSsl, HostStatus, TaskId, TaskKind,
    TaskRun, TaskStatus,
};
pub use util::mask_sensitive_command;
