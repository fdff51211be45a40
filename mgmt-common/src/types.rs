//! Common types used across the harness crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a management task as reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Created, not yet scheduled.
    New,
    /// Actively executing.
    Running,
    /// Stop requested, winding down.
    Stopping,
    /// Quiescent. May be resumed or finalized.
    Stopped,
    /// Finished successfully.
    Done,
    /// Finished with a failure.
    Error,
    /// Cancelled by the control plane.
    Aborted,
    /// Status string was not recognised.
    Unknown,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        Self::New,
        Self::Running,
        Self::Stopping,
        Self::Stopped,
        Self::Done,
        Self::Error,
        Self::Aborted,
        Self::Unknown,
    ];

    /// Terminal states never change again without an explicit restart.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Done => "DONE",
            Self::Error => "ERROR",
            Self::Aborted => "ABORTED",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Lenient parser: case-insensitive, anything unrecognised is `Unknown`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "NEW" => Self::New,
            "RUNNING" => Self::Running,
            "STOPPING" => Self::Stopping,
            "STOPPED" => Self::Stopped,
            "DONE" => Self::Done,
            "ERROR" => Self::Error,
            "ABORTED" => Self::Aborted,
            _ => Self::Unknown,
        }
    }

    /// Direct edges of the lifecycle state machine.
    ///
    /// `STOPPED -> DONE | ERROR` covers the control plane finalizing a
    /// stopped task without resuming it.
    pub fn successors(self) -> &'static [TaskStatus] {
        match self {
            Self::New => &[Self::Running],
            Self::Running => &[Self::Stopping, Self::Done, Self::Error, Self::Aborted],
            Self::Stopping => &[Self::Stopped, Self::Running, Self::Done, Self::Error],
            Self::Stopped => &[Self::Running, Self::Done, Self::Error],
            Self::Done | Self::Error | Self::Aborted | Self::Unknown => &[],
        }
    }

    /// Whether `to` can be observed after `self` when samples may be skipped.
    ///
    /// Reachability rather than adjacency: a poller may never see the
    /// intermediate `STOPPING` between `RUNNING` and `STOPPED`. `UNKNOWN`
    /// on either side is always tolerated.
    pub fn can_reach(self, to: TaskStatus) -> bool {
        if self == to || self == Self::Unknown || to == Self::Unknown {
            return true;
        }
        let mut seen = [false; 8];
        let mut stack = vec![self];
        while let Some(current) = stack.pop() {
            for &next in current.successors() {
                if next == to {
                    return true;
                }
                let idx = next as usize;
                if !seen[idx] {
                    seen[idx] = true;
                    stack.push(next);
                }
            }
        }
        false
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

/// Kind of long-running operation submitted to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Backup,
    Restore,
    Repair,
    Healthcheck,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
            Self::Repair => "repair",
            Self::Healthcheck => "healthcheck",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "backup" => Ok(Self::Backup),
            "restore" => Ok(Self::Restore),
            "repair" => Ok(Self::Repair),
            "healthcheck" => Ok(Self::Healthcheck),
            other => Err(format!("unknown task kind '{other}'")),
        }
    }
}

/// Opaque task identifier, rendered as `<kind>/<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh id for a task of the given kind.
    pub fn generate(kind: TaskKind) -> Self {
        Self(format!("{}/{}", kind, uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Kind encoded in the id prefix, if any.
    pub fn kind(&self) -> Option<TaskKind> {
        self.0.split_once('/').and_then(|(prefix, _)| prefix.parse().ok())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Internal cluster id assigned by the control plane on registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(pub String);

impl ClusterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// CQL-level availability of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostStatus {
    Up,
    Down,
    Timeout,
    Unknown,
}

/// REST API availability of a host's agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostRestStatus {
    Up,
    Down,
    Timeout,
    Http,
    Unauthorized,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostSsl {
    On,
    Off,
}

/// Health of one database host as seen by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostHealth {
    pub host: String,
    pub status: HostStatus,
    pub rest_status: HostRestStatus,
    pub ssl: HostSsl,
    /// Ping latency, absent when the host did not answer.
    pub latency_ms: Option<u64>,
}

/// One run of a task, as listed in its history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub run_id: String,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cause: Option<String>,
}

/// Phase of a backup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStage {
    Snapshot,
    Upload,
    Purge,
    Done,
    Unknown,
}

impl fmt::Display for BackupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Snapshot => "snapshot",
            Self::Upload => "upload",
            Self::Purge => "purge",
            Self::Done => "done",
            Self::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = TaskStatus::ALL
            .iter()
            .copied()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![TaskStatus::Done, TaskStatus::Error, TaskStatus::Aborted]
        );
        assert!(!TaskStatus::Stopped.is_terminal());
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!(TaskStatus::parse("running"), TaskStatus::Running);
        assert_eq!(TaskStatus::parse(" Done "), TaskStatus::Done);
        assert_eq!(TaskStatus::parse("WAITING"), TaskStatus::Unknown);
    }

    #[test]
    fn test_skipped_stopping_sample_is_reachable() {
        assert!(TaskStatus::Running.can_reach(TaskStatus::Stopped));
        assert!(TaskStatus::Stopped.can_reach(TaskStatus::Running));
        assert!(TaskStatus::New.can_reach(TaskStatus::Done));
    }

    #[test]
    fn test_stopped_may_finalize_without_resume() {
        assert!(TaskStatus::Stopped.can_reach(TaskStatus::Done));
        assert!(TaskStatus::Stopped.can_reach(TaskStatus::Error));
    }

    #[test]
    fn test_terminal_cannot_reach_non_terminal() {
        for terminal in [TaskStatus::Done, TaskStatus::Error, TaskStatus::Aborted] {
            assert!(!terminal.can_reach(TaskStatus::Running));
            assert!(!terminal.can_reach(TaskStatus::Stopped));
        }
        assert!(!TaskStatus::Running.can_reach(TaskStatus::New));
    }

    #[test]
    fn test_task_id_kind_prefix() {
        let id = TaskId::generate(TaskKind::Repair);
        assert!(id.as_str().starts_with("repair/"));
        assert_eq!(id.kind(), Some(TaskKind::Repair));
        assert_eq!(TaskId::new("no-prefix").kind(), None);
    }

    #[test]
    fn test_status_serde_upper_case() {
        let json = serde_json::to_string(&TaskStatus::Stopping).unwrap();
        assert_eq!(json, "\"STOPPING\"");
        let kind = serde_json::to_string(&TaskKind::Healthcheck).unwrap();
        assert_eq!(kind, "\"healthcheck\"");
    }

    proptest! {
        #[test]
        fn prop_display_roundtrips_through_parse(idx in 0usize..8) {
            let status = TaskStatus::ALL[idx];
            prop_assert_eq!(TaskStatus::parse(&status.to_string()), status);
        }

        #[test]
        fn prop_terminal_only_reaches_itself(from in 0usize..8, to in 0usize..8) {
            let from = TaskStatus::ALL[from];
            let to = TaskStatus::ALL[to];
            if from.is_terminal() && to != from && to != TaskStatus::Unknown {
                prop_assert!(!from.can_reach(to));
            }
        }
    }
}
