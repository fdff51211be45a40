//! Capability traits for the cluster-management control plane.
//!
//! The control plane is consumed through four narrow traits instead of one
//! wide client so that test doubles only implement what they need.
//! [`ControlPlane`] is their union and is implemented for anything that
//! implements all four.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mgmt_common::config::validate::check_location;
use mgmt_common::{BackupStage, ClusterId, HostHealth, MgmtError, TaskId, TaskKind, TaskRun, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Registration request for a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub name: String,
    /// Contact points; the control plane discovers the rest.
    pub hosts: Vec<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub client_encryption: bool,
}

impl ClusterSpec {
    pub fn new(name: impl Into<String>, hosts: Vec<String>) -> Self {
        Self {
            name: name.into(),
            hosts,
            auth_token: None,
            client_encryption: false,
        }
    }
}

/// A registered cluster as listed by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub id: ClusterId,
    pub name: String,
    pub hosts: Vec<String>,
    pub client_encryption: bool,
    pub force_non_ssl_session_port: bool,
}

/// Changes to a registered cluster. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterUpdate {
    pub name: Option<String>,
    pub client_encryption: Option<bool>,
    pub force_non_ssl_session_port: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupParams {
    pub locations: Vec<String>,
    /// Empty means every user keyspace.
    pub keyspaces: Vec<String>,
    pub retention: u32,
    /// MiB/s per node; none is unlimited.
    pub rate_limit: Option<u32>,
}

impl BackupParams {
    pub fn new(locations: Vec<String>) -> Self {
        Self {
            locations,
            keyspaces: Vec::new(),
            retention: 3,
            rate_limit: None,
        }
    }

    pub fn with_keyspaces(mut self, keyspaces: Vec<String>) -> Self {
        self.keyspaces = keyspaces;
        self
    }

    pub fn with_rate_limit(mut self, mib_per_sec: u32) -> Self {
        self.rate_limit = Some(mib_per_sec);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreParams {
    pub locations: Vec<String>,
    pub snapshot_tag: String,
    pub restore_schema: bool,
    pub restore_data: bool,
    pub keyspaces: Vec<String>,
    /// sstables per node per batch; 0 sends them all at once.
    pub batch_size: u32,
    /// Nodes restoring at the same time; 0 means all of them.
    pub parallel: u32,
}

impl RestoreParams {
    pub fn data(locations: Vec<String>, snapshot_tag: impl Into<String>) -> Self {
        Self {
            locations,
            snapshot_tag: snapshot_tag.into(),
            restore_schema: false,
            restore_data: true,
            keyspaces: Vec::new(),
            batch_size: 2,
            parallel: 1,
        }
    }

    pub fn schema(locations: Vec<String>, snapshot_tag: impl Into<String>) -> Self {
        Self {
            restore_schema: true,
            restore_data: false,
            ..Self::data(locations, snapshot_tag)
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_parallel(mut self, parallel: u32) -> Self {
        self.parallel = parallel;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairParams {
    pub keyspaces: Vec<String>,
    pub intensity: f64,
    /// 0 lets the control plane pick the maximum.
    pub parallel: u32,
    pub fail_fast: bool,
}

impl Default for RepairParams {
    fn default() -> Self {
        Self {
            keyspaces: Vec::new(),
            intensity: 1.0,
            parallel: 0,
            fail_fast: false,
        }
    }
}

/// Mid-flight adjustment of a running repair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RepairControl {
    pub intensity: Option<f64>,
    pub parallel: Option<u32>,
}

impl RepairControl {
    pub fn intensity(value: f64) -> Self {
        Self {
            intensity: Some(value),
            parallel: None,
        }
    }

    pub fn parallel(value: u32) -> Self {
        Self {
            intensity: None,
            parallel: Some(value),
        }
    }

    pub fn validate(&self) -> Result<(), MgmtError> {
        if let Some(intensity) = self.intensity
            && (intensity.is_nan() || intensity < 0.0)
        {
            return Err(MgmtError::InvalidParams(format!("intensity must be >= 0, got {intensity}")));
        }
        if self.intensity.is_none() && self.parallel.is_none() {
            return Err(MgmtError::InvalidParams("repair control changes nothing".into()));
        }
        Ok(())
    }
}

/// Parameters for a new task, one variant per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskParams {
    Backup(BackupParams),
    Restore(RestoreParams),
    Repair(RepairParams),
    Healthcheck,
}

impl TaskParams {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Backup(_) => TaskKind::Backup,
            Self::Restore(_) => TaskKind::Restore,
            Self::Repair(_) => TaskKind::Repair,
            Self::Healthcheck => TaskKind::Healthcheck,
        }
    }

    /// Checks done before anything is submitted.
    ///
    /// Location syntax is checked here too; a location with a path is
    /// reported as [`MgmtError::Rejected`] to match what the control plane
    /// itself answers.
    pub fn validate(&self) -> Result<(), MgmtError> {
        match self {
            Self::Backup(p) => {
                validate_locations("backup", &p.locations)?;
                if p.rate_limit == Some(0) {
                    return Err(MgmtError::InvalidParams(
                        "rate limit must be > 0 MiB/s; leave it unset for no limit".into(),
                    ));
                }
                Ok(())
            }
            Self::Restore(p) => {
                validate_locations("restore", &p.locations)?;
                if p.snapshot_tag.trim().is_empty() {
                    return Err(MgmtError::InvalidParams("restore requires a snapshot tag".into()));
                }
                if !p.restore_schema && !p.restore_data {
                    return Err(MgmtError::InvalidParams(
                        "restore must select schema, data or both".into(),
                    ));
                }
                Ok(())
            }
            Self::Repair(p) => {
                if p.intensity.is_nan() || p.intensity < 0.0 {
                    return Err(MgmtError::InvalidParams(format!(
                        "intensity must be >= 0, got {}",
                        p.intensity
                    )));
                }
                Ok(())
            }
            Self::Healthcheck => Ok(()),
        }
    }
}

fn validate_locations(operation: &str, locations: &[String]) -> Result<(), MgmtError> {
    if locations.is_empty() {
        return Err(MgmtError::InvalidParams(format!("{operation} requires at least one location")));
    }
    for location in locations {
        check_location(location).map_err(|reason| MgmtError::rejected(operation, reason))?;
    }
    Ok(())
}

/// Repair progress: aggregate plus per keyspace, both in percent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepairProgress {
    pub percent: f64,
    pub keyspaces: BTreeMap<String, f64>,
    pub intensity: f64,
    pub parallel: u32,
}

/// Backup and restore progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub percent: f64,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub stage: BackupStage,
}

impl Default for TransferProgress {
    fn default() -> Self {
        Self {
            percent: 0.0,
            bytes_done: 0,
            bytes_total: 0,
            stage: BackupStage::Unknown,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthcheckProgress {
    pub hosts_checked: usize,
    pub hosts_down: usize,
}

/// Kind-specific progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskProgress {
    Repair(RepairProgress),
    Backup(TransferProgress),
    Restore(TransferProgress),
    Healthcheck(HealthcheckProgress),
}

impl TaskProgress {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Repair(_) => TaskKind::Repair,
            Self::Backup(_) => TaskKind::Backup,
            Self::Restore(_) => TaskKind::Restore,
            Self::Healthcheck(_) => TaskKind::Healthcheck,
        }
    }

    /// Aggregate completion in percent.
    pub fn percent(&self) -> f64 {
        match self {
            Self::Repair(p) => p.percent,
            Self::Backup(p) | Self::Restore(p) => p.percent,
            Self::Healthcheck(_) => 0.0,
        }
    }

    pub fn as_repair(&self) -> Option<&RepairProgress> {
        match self {
            Self::Repair(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_transfer(&self) -> Option<&TransferProgress> {
        match self {
            Self::Backup(p) | Self::Restore(p) => Some(p),
            _ => None,
        }
    }
}

/// Everything the control plane reports about a task in one read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub kind: TaskKind,
    pub cluster_id: ClusterId,
    pub status: TaskStatus,
    pub cause: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub progress: TaskProgress,
    /// Human-readable progress report, as printed by the management CLI.
    pub progress_text: String,
    pub snapshot_tag: Option<String>,
}

/// Suspension request sent to the control plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendRequest {
    pub stop_tasks: bool,
    pub duration: Option<Duration>,
    pub on_resume_start_tasks: bool,
}

#[async_trait]
pub trait ClusterRegistry: Send + Sync {
    async fn list_clusters(&self) -> Result<Vec<ClusterInfo>, MgmtError>;
    async fn add_cluster(&self, spec: &ClusterSpec) -> Result<ClusterId, MgmtError>;
    async fn update_cluster(&self, cluster: &ClusterId, update: &ClusterUpdate) -> Result<(), MgmtError>;
    /// Deregisters the cluster. The database itself is untouched.
    async fn delete_cluster(&self, cluster: &ClusterId) -> Result<(), MgmtError>;
}

#[async_trait]
pub trait TaskControl: Send + Sync {
    async fn create_task(&self, cluster: &ClusterId, params: &TaskParams) -> Result<TaskId, MgmtError>;
    async fn task_snapshot(&self, cluster: &ClusterId, task: &TaskId) -> Result<TaskSnapshot, MgmtError>;
    async fn list_tasks(&self, cluster: &ClusterId, kind: Option<TaskKind>) -> Result<Vec<TaskId>, MgmtError>;
    async fn stop_task(&self, cluster: &ClusterId, task: &TaskId) -> Result<(), MgmtError>;
    async fn start_task(
        &self,
        cluster: &ClusterId,
        task: &TaskId,
        continue_from_checkpoint: bool,
    ) -> Result<(), MgmtError>;
    async fn delete_task(&self, cluster: &ClusterId, task: &TaskId) -> Result<(), MgmtError>;
    async fn task_history(&self, cluster: &ClusterId, task: &TaskId) -> Result<Vec<TaskRun>, MgmtError>;
    /// Adjusts every running repair on the cluster.
    async fn control_repair(&self, cluster: &ClusterId, control: &RepairControl) -> Result<(), MgmtError>;

    async fn task_status(&self, cluster: &ClusterId, task: &TaskId) -> Result<TaskStatus, MgmtError> {
        Ok(self.task_snapshot(cluster, task).await?.status)
    }
}

#[async_trait]
pub trait HealthQuery: Send + Sync {
    async fn hosts_health(&self, cluster: &ClusterId) -> Result<Vec<HostHealth>, MgmtError>;
}

#[async_trait]
pub trait SessionControl: Send + Sync {
    async fn suspend(&self, cluster: &ClusterId, request: &SuspendRequest) -> Result<(), MgmtError>;
    async fn resume(&self, cluster: &ClusterId, start_tasks: bool) -> Result<(), MgmtError>;
    async fn is_suspended(&self, cluster: &ClusterId) -> Result<bool, MgmtError>;
}

/// The whole control-plane surface.
pub trait ControlPlane: ClusterRegistry + TaskControl + HealthQuery + SessionControl {}

impl<T> ControlPlane for T where T: ClusterRegistry + TaskControl + HealthQuery + SessionControl + ?Sized {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_requires_locations() {
        let err = TaskParams::Backup(BackupParams::new(vec![])).validate().unwrap_err();
        assert!(matches!(err, MgmtError::InvalidParams(_)));
    }

    #[test]
    fn location_with_path_is_rejected() {
        let params = TaskParams::Backup(BackupParams::new(vec!["s3:bucket/path_testing/".into()]));
        let err = params.validate().unwrap_err();
        assert!(matches!(err, MgmtError::Rejected { .. }));
        assert!(err.to_string().contains("without a path"));
    }

    #[test]
    fn zero_rate_limit_is_invalid() {
        let base = BackupParams::new(vec!["s3:bucket".into()]);
        assert!(TaskParams::Backup(base.clone().with_rate_limit(25)).validate().is_ok());
        let err = TaskParams::Backup(base.with_rate_limit(0)).validate().unwrap_err();
        assert!(matches!(err, MgmtError::InvalidParams(_)));
    }

    #[test]
    fn restore_requires_tag_and_selection() {
        let mut params = RestoreParams::data(vec!["s3:b".into()], "");
        assert!(TaskParams::Restore(params.clone()).validate().is_err());

        params.snapshot_tag = "sm_20240101000000UTC".into();
        params.restore_data = false;
        assert!(TaskParams::Restore(params.clone()).validate().is_err());

        params.restore_schema = true;
        assert!(TaskParams::Restore(params).validate().is_ok());
    }

    #[test]
    fn negative_intensity_is_invalid() {
        let params = TaskParams::Repair(RepairParams {
            intensity: -1.0,
            ..RepairParams::default()
        });
        assert!(params.validate().is_err());
        assert!(RepairControl::intensity(-0.5).validate().is_err());
        assert!(RepairControl::intensity(0.0001).validate().is_ok());
        assert!(RepairControl::default().validate().is_err());
    }

    #[test]
    fn progress_accessors() {
        let repair = TaskProgress::Repair(RepairProgress {
            percent: 40.0,
            ..RepairProgress::default()
        });
        assert_eq!(repair.percent(), 40.0);
        assert!(repair.as_repair().is_some());
        assert!(repair.as_transfer().is_none());

        let backup = TaskProgress::Backup(TransferProgress {
            stage: BackupStage::Upload,
            ..TransferProgress::default()
        });
        assert_eq!(backup.as_transfer().unwrap().stage, BackupStage::Upload);
        assert_eq!(backup.kind(), TaskKind::Backup);
    }

    #[test]
    fn params_serialize_tagged() {
        let json = serde_json::to_value(TaskParams::Repair(RepairParams::default())).unwrap();
        assert_eq!(json["kind"], "repair");
        assert_eq!(serde_json::to_value(TaskParams::Healthcheck).unwrap()["kind"], "healthcheck");
    }
}
