//! Cluster registration and the per-cluster session.

use crate::control_plane::{
    BackupParams, ClusterInfo, ClusterSpec, ClusterUpdate, ControlPlane, RepairControl, RepairParams, RestoreParams,
    SuspendRequest, TaskParams,
};
use crate::events::{EVENT_RESUMED, EVENT_SUSPENDED, EventBus, ResumeEvent, SuspendEvent};
use crate::poller::StatusPoller;
use crate::suspend::SuspensionWindow;
use crate::task::TaskHandle;
use mgmt_common::{ClusterId, HostHealth, MgmtError, PollSettings, TaskId, TaskKind};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Entry point: registers clusters and hands out sessions.
pub struct ManagerClient<C: ?Sized = dyn ControlPlane> {
    control: Arc<C>,
    poller: StatusPoller,
    events: EventBus,
}

impl<C: ControlPlane + ?Sized> ManagerClient<C> {
    pub fn new(control: Arc<C>, settings: &PollSettings) -> Self {
        Self {
            control,
            poller: StatusPoller::from_settings(settings),
            events: EventBus::default(),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn control(&self) -> &Arc<C> {
        &self.control
    }

    fn session(&self, info: ClusterInfo) -> ClusterSession<C> {
        ClusterSession {
            control: self.control.clone(),
            id: info.id,
            name: Mutex::new(info.name),
            poller: self.poller.clone(),
            events: self.events.clone(),
            created: Mutex::new(Vec::new()),
        }
    }

    pub async fn list_clusters(&self) -> Result<Vec<ClusterInfo>, MgmtError> {
        self.control.list_clusters().await
    }

    pub async fn get_cluster(&self, name: &str) -> Result<Option<ClusterSession<C>>, MgmtError> {
        let found = self
            .control
            .list_clusters()
            .await?
            .into_iter()
            .find(|c| c.name == name);
        Ok(found.map(|info| self.session(info)))
    }

    /// Register a new cluster. Fails if the name is taken.
    pub async fn add_cluster(&self, spec: &ClusterSpec) -> Result<ClusterSession<C>, MgmtError> {
        let id = self.control.add_cluster(spec).await?;
        info!(cluster = %id, name = %spec.name, hosts = spec.hosts.len(), "cluster registered");
        Ok(self.session(ClusterInfo {
            id,
            name: spec.name.clone(),
            hosts: spec.hosts.clone(),
            client_encryption: spec.client_encryption,
            force_non_ssl_session_port: false,
        }))
    }

    /// Reuse a cluster registered under the same name, or register it.
    /// With `force_re_add` an existing registration is deleted first.
    pub async fn register_or_reuse(&self, spec: &ClusterSpec, force_re_add: bool) -> Result<ClusterSession<C>, MgmtError> {
        if let Some(existing) = self.get_cluster(&spec.name).await? {
            if !force_re_add {
                debug!(cluster = %existing.id, name = %spec.name, "reusing registered cluster");
                return Ok(existing);
            }
            info!(cluster = %existing.id, name = %spec.name, "re-adding cluster");
            existing.delete().await?;
        }
        self.add_cluster(spec).await
    }
}

/// One registered cluster, as seen by the harness.
pub struct ClusterSession<C: ?Sized = dyn ControlPlane> {
    control: Arc<C>,
    id: ClusterId,
    name: Mutex<String>,
    poller: StatusPoller,
    events: EventBus,
    created: Mutex<Vec<TaskId>>,
}

impl<C: ?Sized> std::fmt::Debug for ClusterSession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSession")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl<C: ControlPlane + ?Sized> ClusterSession<C> {
    pub fn id(&self) -> &ClusterId {
        &self.id
    }

    pub fn name(&self) -> String {
        lock(&self.name).clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn poller(&self) -> &StatusPoller {
        &self.poller
    }

    /// Ids of the tasks created through this session.
    pub fn created_tasks(&self) -> Vec<TaskId> {
        lock(&self.created).clone()
    }

    /// Handle for an existing task.
    pub fn task(&self, id: TaskId, kind: TaskKind) -> TaskHandle<C> {
        TaskHandle::new(self.control.clone(), self.id.clone(), id, kind, self.poller.clone())
            .with_events(self.events.clone())
    }

    /// Validate and submit a task.
    pub async fn create_task(&self, params: TaskParams) -> Result<TaskHandle<C>, MgmtError> {
        params.validate()?;
        let kind = params.kind();
        let id = self.control.create_task(&self.id, &params).await?;
        info!(cluster = %self.id, task = %id, %kind, "task created");
        lock(&self.created).push(id.clone());
        Ok(self.task(id, kind))
    }

    pub async fn create_backup_task(&self, params: BackupParams) -> Result<TaskHandle<C>, MgmtError> {
        self.create_task(TaskParams::Backup(params)).await
    }

    pub async fn create_restore_task(&self, params: RestoreParams) -> Result<TaskHandle<C>, MgmtError> {
        self.create_task(TaskParams::Restore(params)).await
    }

    pub async fn create_repair_task(&self, params: RepairParams) -> Result<TaskHandle<C>, MgmtError> {
        self.create_task(TaskParams::Repair(params)).await
    }

    /// The recurring health check the control plane creates on registration.
    pub async fn healthcheck_task(&self) -> Result<TaskHandle<C>, MgmtError> {
        self.tasks(TaskKind::Healthcheck)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| MgmtError::not_found(format!("healthcheck task of cluster {}", self.id)))
    }

    pub async fn tasks(&self, kind: TaskKind) -> Result<Vec<TaskHandle<C>>, MgmtError> {
        let ids = self.control.list_tasks(&self.id, Some(kind)).await?;
        Ok(ids.into_iter().map(|id| self.task(id, kind)).collect())
    }

    pub async fn backup_tasks(&self) -> Result<Vec<TaskHandle<C>>, MgmtError> {
        self.tasks(TaskKind::Backup).await
    }

    /// Open-ended suspension without auto-resume.
    pub async fn suspend(&self, stop_tasks: bool) -> Result<(), MgmtError> {
        self.suspend_with(&SuspensionWindow::new().stop_tasks(stop_tasks)).await
    }

    pub async fn suspend_with(&self, window: &SuspensionWindow) -> Result<(), MgmtError> {
        let request: SuspendRequest = window.request();
        self.control.suspend(&self.id, &request).await?;
        info!(
            cluster = %self.id,
            stop_tasks = request.stop_tasks,
            duration = ?request.duration,
            on_resume_start_tasks = request.on_resume_start_tasks,
            "cluster suspended"
        );
        self.events.emit(
            EVENT_SUSPENDED,
            &SuspendEvent::new(
                self.id.clone(),
                request.stop_tasks,
                request.duration,
                request.on_resume_start_tasks,
            ),
        );
        Ok(())
    }

    pub async fn resume(&self, start_tasks: bool) -> Result<(), MgmtError> {
        self.control.resume(&self.id, start_tasks).await?;
        info!(cluster = %self.id, start_tasks, "cluster resumed");
        self.events.emit(
            EVENT_RESUMED,
            &ResumeEvent {
                cluster_id: self.id.clone(),
                start_tasks,
            },
        );
        Ok(())
    }

    pub async fn is_suspended(&self) -> Result<bool, MgmtError> {
        self.control.is_suspended(&self.id).await
    }

    pub async fn control_repair(&self, control: &RepairControl) -> Result<(), MgmtError> {
        control.validate()?;
        info!(cluster = %self.id, intensity = ?control.intensity, parallel = ?control.parallel, "adjusting repair");
        self.control.control_repair(&self.id, control).await
    }

    pub async fn hosts_health(&self) -> Result<Vec<HostHealth>, MgmtError> {
        self.control.hosts_health(&self.id).await
    }

    pub async fn update(&self, update: &ClusterUpdate) -> Result<(), MgmtError> {
        self.control.update_cluster(&self.id, update).await?;
        if let Some(name) = &update.name {
            *lock(&self.name) = name.clone();
        }
        info!(cluster = %self.id, ?update, "cluster updated");
        Ok(())
    }

    pub async fn rename(&self, name: impl Into<String>) -> Result<(), MgmtError> {
        self.update(&ClusterUpdate {
            name: Some(name.into()),
            ..ClusterUpdate::default()
        })
        .await
    }

    /// Deregister. The database itself is untouched.
    pub async fn delete(self) -> Result<(), MgmtError> {
        let created = self.created_tasks().len();
        if created > 0 {
            warn!(cluster = %self.id, created, "deleting cluster with tasks created by this session");
        }
        self.control.delete_cluster(&self.id).await?;
        info!(cluster = %self.id, "cluster deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedControlPlane, Step};
    use mgmt_common::TaskStatus;

    fn client() -> (Arc<ScriptedControlPlane>, ManagerClient<ScriptedControlPlane>) {
        let plane = Arc::new(ScriptedControlPlane::new(vec![Step::Status(TaskStatus::New)]));
        let client = ManagerClient::new(plane.clone(), &PollSettings::default());
        (plane, client)
    }

    fn spec() -> ClusterSpec {
        ClusterSpec::new("c", vec!["10.0.0.1".into()])
    }

    #[tokio::test]
    async fn register_or_reuse_twice_gives_same_id() {
        let (_, client) = client();
        let first = client.register_or_reuse(&spec(), false).await.unwrap();
        let second = client.register_or_reuse(&spec(), false).await.unwrap();
        assert_eq!(first.id(), second.id());
    }

    #[tokio::test]
    async fn force_re_add_replaces_registration() {
        let (plane, client) = client();
        let first = client.register_or_reuse(&spec(), false).await.unwrap();
        let first_id = first.id().clone();
        let second = client.register_or_reuse(&spec(), true).await.unwrap();
        assert_ne!(&first_id, second.id());
        assert!(plane.calls().contains(&format!("delete_cluster:{first_id}")));
        let listed = client.get_cluster("c").await.unwrap().unwrap();
        assert_eq!(listed.id(), second.id());
    }

    #[tokio::test]
    async fn invalid_params_never_reach_the_control_plane() {
        let (plane, client) = client();
        let session = client.add_cluster(&spec()).await.unwrap();
        let err = session
            .create_backup_task(BackupParams::new(vec!["s3:bucket/path_testing/".into()]))
            .await
            .unwrap_err();
        assert!(matches!(err, MgmtError::Rejected { .. }));
        assert!(!plane.calls().iter().any(|c| c.starts_with("create_task")));
        assert!(session.created_tasks().is_empty());
    }

    #[tokio::test]
    async fn created_tasks_are_tracked_and_listed() {
        let (_, client) = client();
        let session = client.add_cluster(&spec()).await.unwrap();
        let task = session
            .create_backup_task(BackupParams::new(vec!["s3:bucket".into()]))
            .await
            .unwrap();
        assert_eq!(session.created_tasks(), vec![task.id().clone()]);
        let listed = session.backup_tasks().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(session.healthcheck_task().await.is_err());
    }

    #[tokio::test]
    async fn rename_updates_cached_name() {
        let (_, client) = client();
        let session = client.add_cluster(&spec()).await.unwrap();
        session.rename("renamed").await.unwrap();
        assert_eq!(session.name(), "renamed");
        assert!(client.get_cluster("renamed").await.unwrap().is_some());
        assert!(client.get_cluster("c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn suspend_and_resume_emit_events() {
        let (plane, client) = client();
        let mut rx = client.events().subscribe();
        let session = client.add_cluster(&spec()).await.unwrap();
        session.suspend(true).await.unwrap();
        assert!(session.is_suspended().await.unwrap());
        session.resume(false).await.unwrap();

        let events: Vec<_> = crate::events::drain(&mut rx)
            .into_iter()
            .map(|e| e["event"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(events, vec![EVENT_SUSPENDED.to_string(), EVENT_RESUMED.to_string()]);
        assert!(plane.calls().iter().any(|c| c.ends_with(":true:false") && c.starts_with("suspend")));
    }

    #[tokio::test]
    async fn control_repair_validates_first() {
        let (plane, client) = client();
        let session = client.add_cluster(&spec()).await.unwrap();
        assert!(session.control_repair(&RepairControl::default()).await.is_err());
        session.control_repair(&RepairControl::intensity(2.0)).await.unwrap();
        assert_eq!(
            plane.calls().iter().filter(|c| c.starts_with("control_repair")).count(),
            1
        );
    }
}
