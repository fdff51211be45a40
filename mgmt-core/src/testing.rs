//! Scripted control plane for unit tests.

use crate::control_plane::{
    ClusterInfo, ClusterRegistry, ClusterSpec, ClusterUpdate, HealthQuery, RepairControl, SessionControl,
    SuspendRequest, TaskControl, TaskParams, TaskProgress, TaskSnapshot, TransferProgress,
};
use async_trait::async_trait;
use mgmt_common::{ClusterId, ExecError, HostHealth, MgmtError, TaskId, TaskKind, TaskRun, TaskStatus};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

/// One scripted answer to a task status read.
#[derive(Debug, Clone)]
pub enum Step {
    Status(TaskStatus),
    Transport,
}

/// Replays a status script for every task, repeating the last step.
/// Every call is recorded as `operation:argument`.
pub struct ScriptedControlPlane {
    script: Mutex<Vec<Step>>,
    progress: Mutex<TaskProgress>,
    clusters: Mutex<Vec<ClusterInfo>>,
    registrations: AtomicU32,
    tasks: Mutex<Vec<(TaskId, TaskKind)>>,
    suspended: Mutex<bool>,
    calls: Mutex<Vec<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl ScriptedControlPlane {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(script),
            progress: Mutex::new(TaskProgress::Backup(TransferProgress::default())),
            clusters: Mutex::new(Vec::new()),
            registrations: AtomicU32::new(0),
            tasks: Mutex::new(Vec::new()),
            suspended: Mutex::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_progress(&self, progress: TaskProgress) {
        *lock(&self.progress) = progress;
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn record(&self, call: impl Into<String>) {
        lock(&self.calls).push(call.into());
    }

    fn next_step(&self) -> Step {
        let mut script = lock(&self.script);
        match script.len() {
            0 => Step::Status(TaskStatus::Unknown),
            1 => script[0].clone(),
            _ => script.remove(0),
        }
    }
}

#[async_trait]
impl ClusterRegistry for ScriptedControlPlane {
    async fn list_clusters(&self) -> Result<Vec<ClusterInfo>, MgmtError> {
        self.record("list_clusters");
        Ok(lock(&self.clusters).clone())
    }

    async fn add_cluster(&self, spec: &ClusterSpec) -> Result<ClusterId, MgmtError> {
        self.record(format!("add_cluster:{}", spec.name));
        let mut clusters = lock(&self.clusters);
        if clusters.iter().any(|c| c.name == spec.name) {
            return Err(MgmtError::rejected("add cluster", "name already registered"));
        }
        let serial = self.registrations.fetch_add(1, Ordering::Relaxed) + 1;
        let id = ClusterId::new(format!("cluster-{serial}"));
        clusters.push(ClusterInfo {
            id: id.clone(),
            name: spec.name.clone(),
            hosts: spec.hosts.clone(),
            client_encryption: spec.client_encryption,
            force_non_ssl_session_port: false,
        });
        Ok(id)
    }

    async fn update_cluster(&self, cluster: &ClusterId, update: &ClusterUpdate) -> Result<(), MgmtError> {
        self.record(format!("update_cluster:{cluster}"));
        let mut clusters = lock(&self.clusters);
        let info = clusters
            .iter_mut()
            .find(|c| &c.id == cluster)
            .ok_or_else(|| MgmtError::not_found(format!("cluster {cluster}")))?;
        if let Some(name) = &update.name {
            info.name = name.clone();
        }
        Ok(())
    }

    async fn delete_cluster(&self, cluster: &ClusterId) -> Result<(), MgmtError> {
        self.record(format!("delete_cluster:{cluster}"));
        lock(&self.clusters).retain(|c| &c.id != cluster);
        Ok(())
    }
}

#[async_trait]
impl TaskControl for ScriptedControlPlane {
    async fn create_task(&self, cluster: &ClusterId, params: &TaskParams) -> Result<TaskId, MgmtError> {
        self.record(format!("create_task:{cluster}:{}", params.kind()));
        let id = TaskId::generate(params.kind());
        lock(&self.tasks).push((id.clone(), params.kind()));
        Ok(id)
    }

    async fn task_snapshot(&self, cluster: &ClusterId, task: &TaskId) -> Result<TaskSnapshot, MgmtError> {
        let status = match self.next_step() {
            Step::Status(status) => status,
            Step::Transport => return Err(ExecError::Transport("connection reset".into()).into()),
        };
        let progress = lock(&self.progress).clone();
        Ok(TaskSnapshot {
            id: task.clone(),
            kind: task.kind().unwrap_or(TaskKind::Backup),
            cluster_id: cluster.clone(),
            status,
            cause: None,
            started_at: None,
            ended_at: None,
            next_run: None,
            progress_text: format!("Status: {status}"),
            progress,
            snapshot_tag: None,
        })
    }

    async fn list_tasks(&self, _cluster: &ClusterId, kind: Option<TaskKind>) -> Result<Vec<TaskId>, MgmtError> {
        Ok(lock(&self.tasks)
            .iter()
            .filter(|(_, k)| kind.is_none_or(|wanted| wanted == *k))
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn stop_task(&self, _cluster: &ClusterId, task: &TaskId) -> Result<(), MgmtError> {
        self.record(format!("stop_task:{task}"));
        Ok(())
    }

    async fn start_task(&self, _cluster: &ClusterId, task: &TaskId, continue_from_checkpoint: bool) -> Result<(), MgmtError> {
        self.record(format!("start_task:{task}:{continue_from_checkpoint}"));
        Ok(())
    }

    async fn delete_task(&self, _cluster: &ClusterId, task: &TaskId) -> Result<(), MgmtError> {
        self.record(format!("delete_task:{task}"));
        lock(&self.tasks).retain(|(id, _)| id != task);
        Ok(())
    }

    async fn task_history(&self, _cluster: &ClusterId, _task: &TaskId) -> Result<Vec<TaskRun>, MgmtError> {
        Ok(Vec::new())
    }

    async fn control_repair(&self, cluster: &ClusterId, control: &RepairControl) -> Result<(), MgmtError> {
        self.record(format!("control_repair:{cluster}:{:?}:{:?}", control.intensity, control.parallel));
        Ok(())
    }
}

#[async_trait]
impl HealthQuery for ScriptedControlPlane {
    async fn hosts_health(&self, _cluster: &ClusterId) -> Result<Vec<HostHealth>, MgmtError> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl SessionControl for ScriptedControlPlane {
    async fn suspend(&self, cluster: &ClusterId, request: &SuspendRequest) -> Result<(), MgmtError> {
        self.record(format!(
            "suspend:{cluster}:{}:{}",
            request.stop_tasks, request.on_resume_start_tasks
        ));
        *lock(&self.suspended) = true;
        Ok(())
    }

    async fn resume(&self, cluster: &ClusterId, start_tasks: bool) -> Result<(), MgmtError> {
        self.record(format!("resume:{cluster}:{start_tasks}"));
        *lock(&self.suspended) = false;
        Ok(())
    }

    async fn is_suspended(&self, _cluster: &ClusterId) -> Result<bool, MgmtError> {
        Ok(*lock(&self.suspended))
    }
}
