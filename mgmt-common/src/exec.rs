//! Remote command execution.
//!
//! Every interaction with database nodes and storage CLIs goes through a
//! [`RemoteExecutor`]. The SSH implementation shells out to the system
//! `ssh` binary in batch mode; the local one runs `sh -c`. Tests script a
//! [`MockExecutor`] instead.

use crate::errors::ErrorCode;
use crate::retry::{RetryPolicy, RetryableError, run_with_retry};
use crate::util::mask_sensitive_command;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, trace};

/// ssh reserves this exit status for its own failures.
const SSH_TRANSPORT_EXIT: i32 = 255;

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    pub fn ok(&self) -> bool {
        self.exit_code == 0
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().map(str::trim).filter(|l| !l.is_empty())
    }
}

/// Command execution failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecError {
    #[error("command `{command}` exited with {exit_code}: {stderr}")]
    UnexpectedExit {
        command: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("command `{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },
}

impl ExecError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnexpectedExit { .. } => ErrorCode::RemoteCommandFailed,
            Self::Transport(_) => ErrorCode::SshConnectionFailed,
            Self::Timeout { .. } => ErrorCode::SshTimeout,
        }
    }
}

impl RetryableError for ExecError {
    fn is_retryable(&self) -> bool {
        true
    }
}

/// Something that can run a shell command somewhere.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Human-readable target, used in logs.
    fn target(&self) -> &str;

    /// Run the command and return its output whatever the exit status.
    async fn execute(&self, command: &str) -> Result<CommandOutput, ExecError>;

    /// Run the command, failing with [`ExecError::UnexpectedExit`] on a
    /// non-zero exit status.
    async fn run(&self, command: &str) -> Result<CommandOutput, ExecError> {
        let output = self.execute(command).await?;
        if output.ok() {
            Ok(output)
        } else {
            Err(ExecError::UnexpectedExit {
                command: mask_sensitive_command(command),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl<T: RemoteExecutor + ?Sized> RemoteExecutor for Arc<T> {
    fn target(&self) -> &str {
        (**self).target()
    }

    async fn execute(&self, command: &str) -> Result<CommandOutput, ExecError> {
        (**self).execute(command).await
    }
}

/// Where and as whom an SSH command runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshTarget {
    pub host: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub identity_file: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl SshTarget {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            identity_file: None,
            port: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity_file = Some(identity.into());
        self
    }

    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    fn identity_path(&self) -> Option<PathBuf> {
        self.identity_file
            .as_deref()
            .map(|raw| PathBuf::from(shellexpand::tilde(raw).into_owned()))
    }
}

/// Runs commands on a node through the system `ssh` binary.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    target: SshTarget,
    label: String,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshExecutor {
    pub fn new(target: SshTarget) -> Self {
        let label = target.destination();
        Self {
            target,
            label,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Build SSH args with optional identity file and port.
    fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ];
        if let Some(identity) = self.target.identity_path() {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().to_string());
        }
        if let Some(port) = self.target.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.push(self.target.destination());
        args
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    fn target(&self) -> &str {
        &self.label
    }

    async fn execute(&self, command: &str) -> Result<CommandOutput, ExecError> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_args())
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!(host = %self.label, command = %mask_sensitive_command(command), "ssh exec");
        let output = spawn_with_timeout(cmd, command, self.command_timeout).await?;

        if output.exit_code == SSH_TRANSPORT_EXIT {
            return Err(ExecError::Transport(format!(
                "ssh to {} failed: {}",
                self.label,
                output.stderr.trim()
            )));
        }
        Ok(output)
    }
}

/// Runs commands on this machine via `sh -c`.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    timeout: Duration,
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
        }
    }
}

impl LocalExecutor {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    fn target(&self) -> &str {
        "localhost"
    }

    async fn execute(&self, command: &str) -> Result<CommandOutput, ExecError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        debug!(command = %mask_sensitive_command(command), "local exec");
        spawn_with_timeout(cmd, command, self.timeout).await
    }
}

async fn spawn_with_timeout(
    mut cmd: Command,
    command: &str,
    timeout: Duration,
) -> Result<CommandOutput, ExecError> {
    let child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ExecError::Transport(format!("spawn failed: {e}")))?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let result = CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                // Killed by signal has no code.
                exit_code: output.status.code().unwrap_or(-1),
            };
            trace!(exit_code = result.exit_code, "command finished");
            Ok(result)
        }
        Ok(Err(e)) => Err(ExecError::Transport(format!("wait failed: {e}"))),
        Err(_) => Err(ExecError::Timeout {
            command: mask_sensitive_command(command),
            after: timeout,
        }),
    }
}

/// Wraps another executor with a bounded retry policy.
pub struct RetryingExecutor<E> {
    inner: E,
    policy: RetryPolicy,
}

impl<E: RemoteExecutor> RetryingExecutor<E> {
    pub fn new(inner: E, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

#[async_trait]
impl<E: RemoteExecutor> RemoteExecutor for RetryingExecutor<E> {
    fn target(&self) -> &str {
        self.inner.target()
    }

    async fn execute(&self, command: &str) -> Result<CommandOutput, ExecError> {
        let masked = mask_sensitive_command(command);
        run_with_retry(&masked, &self.policy, || self.inner.execute(command)).await
    }

    async fn run(&self, command: &str) -> Result<CommandOutput, ExecError> {
        let masked = mask_sensitive_command(command);
        run_with_retry(&masked, &self.policy, || self.inner.run(command)).await
    }
}

type ScriptedResult = Result<CommandOutput, ExecError>;

/// Deterministic in-memory executor for tests.
///
/// Results are consumed FIFO; once the queue is empty, the first response
/// rule whose pattern is a substring of the command answers. Every command
/// is recorded.
#[derive(Debug, Clone, Default)]
pub struct MockExecutor {
    label: String,
    scripted_results: Arc<Mutex<Vec<ScriptedResult>>>,
    rules: Arc<Mutex<Vec<(String, CommandOutput)>>>,
    recorded_calls: Arc<Mutex<Vec<String>>>,
}

impl MockExecutor {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    /// Append a scripted result. Results are consumed FIFO.
    pub fn push_result(&self, result: ScriptedResult) {
        lock(&self.scripted_results).push(result);
    }

    /// Answer every command containing `pattern` with `output`.
    pub fn respond_to(&self, pattern: impl Into<String>, output: CommandOutput) {
        lock(&self.rules).push((pattern.into(), output));
    }

    /// Snapshot of all commands received.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.recorded_calls).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    fn target(&self) -> &str {
        &self.label
    }

    async fn execute(&self, command: &str) -> Result<CommandOutput, ExecError> {
        lock(&self.recorded_calls).push(command.to_string());

        {
            let mut scripted = lock(&self.scripted_results);
            if !scripted.is_empty() {
                return scripted.remove(0);
            }
        }

        lock(&self.rules)
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .ok_or_else(|| ExecError::Transport(format!("mock has no result for `{command}`")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_args_with_identity_and_user() {
        let exec = SshExecutor::new(
            SshTarget::new("10.0.0.5")
                .with_user("centos")
                .with_identity("/tmp/key.pem"),
        )
        .with_connect_timeout(Duration::from_secs(5));
        let args = exec.ssh_args();
        assert_eq!(
            args,
            vec![
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=5",
                "-i",
                "/tmp/key.pem",
                "centos@10.0.0.5",
            ]
        );
        assert_eq!(exec.target(), "centos@10.0.0.5");
    }

    #[test]
    fn test_ssh_identity_tilde_is_expanded() {
        let target = SshTarget::new("node").with_identity("~/.ssh/id_ed25519");
        let path = target.identity_path().unwrap();
        assert!(!path.to_string_lossy().starts_with('~'));
    }

    #[tokio::test]
    async fn test_mock_fifo_then_rules() {
        let mock = MockExecutor::new("node1");
        mock.push_result(Ok(CommandOutput::success("first")));
        mock.respond_to("df", CommandOutput::success("42%"));

        assert_eq!(mock.run("echo").await.unwrap().stdout, "first");
        assert_eq!(mock.run("df -h /var").await.unwrap().stdout, "42%");
        assert!(matches!(mock.run("uptime").await, Err(ExecError::Transport(_))));
        assert_eq!(mock.calls(), vec!["echo", "df -h /var", "uptime"]);
    }

    #[tokio::test]
    async fn test_run_rejects_nonzero_exit_and_masks() {
        let mock = MockExecutor::new("node1");
        mock.push_result(Ok(CommandOutput::failure(2, "boom\n")));
        let err = mock.run("tool --password=hunter2").await.unwrap_err();
        match err {
            ExecError::UnexpectedExit {
                command,
                exit_code,
                stderr,
            } => {
                assert_eq!(exit_code, 2);
                assert_eq!(stderr, "boom");
                assert!(!command.contains("hunter2"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrying_executor_recovers_from_transport() {
        let mock = MockExecutor::new("node1");
        mock.push_result(Err(ExecError::Transport("reset".into())));
        mock.push_result(Ok(CommandOutput::failure(1, "not yet")));
        mock.push_result(Ok(CommandOutput::success("ok")));

        let exec = RetryingExecutor::new(mock.clone(), RetryPolicy::fixed(3, Duration::from_secs(1)));
        let out = exec.run("nodetool status").await.unwrap();
        assert_eq!(out.stdout, "ok");
        assert_eq!(exec.inner().calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrying_executor_gives_up_after_bound() {
        let mock = MockExecutor::new("node1");
        for _ in 0..5 {
            mock.push_result(Err(ExecError::Transport("down".into())));
        }
        let exec = RetryingExecutor::new(mock.clone(), RetryPolicy::fixed(2, Duration::from_secs(1)));
        assert!(exec.run("true").await.is_err());
        assert_eq!(mock.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_local_executor_captures_output() {
        let exec = LocalExecutor::default();
        let out = exec.execute("echo hello; echo oops >&2; exit 3").await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn test_local_executor_timeout() {
        let exec = LocalExecutor::with_timeout(Duration::from_millis(100));
        let err = exec.execute("sleep 5").await.unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
    }

    #[test]
    fn test_exec_error_codes() {
        assert_eq!(ExecError::Transport("x".into()).code(), ErrorCode::SshConnectionFailed);
        let timeout = ExecError::Timeout {
            command: "x".into(),
            after: Duration::from_secs(1),
        };
        assert_eq!(timeout.code(), ErrorCode::SshTimeout);
    }
}
