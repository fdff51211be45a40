//! In-process control plane.
//!
//! [`SimulatedManager`] implements every control-plane trait together with
//! the object store, node and data-plane collaborators over one shared
//! model of the database cluster. Task progress follows the tokio clock, so
//! scenarios run in milliseconds under a paused runtime.

mod cql;
mod task;
mod world;

use self::task::{RunEnv, SimTask, Snapshot};
use self::world::{Database, Objects};
use crate::control_plane::{
    ClusterInfo, ClusterRegistry, ClusterSpec, ClusterUpdate, HealthQuery, RepairControl, SessionControl,
    SuspendRequest, TaskControl, TaskParams, TaskSnapshot,
};
use crate::dataplane::{DataPlane, Row};
use crate::node_ops::NodeOps;
use crate::storage::ObjectStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mgmt_common::config::{HarnessConfig, NodeSettings, SimulatorSettings};
use mgmt_common::{ClusterId, ExecError, HostHealth, MgmtError, TaskId, TaskKind, TaskRun};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Maps tokio instants to wall-clock time.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SimClock {
    origin: Instant,
    wall: DateTime<Utc>,
}

impl SimClock {
    fn start() -> Self {
        Self {
            origin: Instant::now(),
            wall: Utc::now(),
        }
    }

    pub fn wall(&self, at: Instant) -> DateTime<Utc> {
        let offset = at.saturating_duration_since(self.origin);
        self.wall + chrono::Duration::from_std(offset).unwrap_or_default()
    }
}

#[derive(Debug)]
struct Suspension {
    until: Option<Instant>,
    on_resume_start: bool,
    stopped: Vec<TaskId>,
}

#[derive(Debug)]
struct SimCluster {
    info: ClusterInfo,
    tasks: BTreeMap<TaskId, SimTask>,
    suspension: Option<Suspension>,
    snapshots: BTreeMap<String, Snapshot>,
    tags: BTreeSet<String>,
    health: Vec<HostHealth>,
}

impl SimCluster {
    fn task(&mut self, id: &TaskId) -> Result<&mut SimTask, MgmtError> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| MgmtError::not_found(format!("task {id}")))
    }

    fn advance(&mut self, now: Instant, shared: &mut Shared<'_>) {
        if let Some(until) = self.suspension.as_ref().and_then(|s| s.until)
            && until <= now
        {
            self.advance_tasks(until, shared);
            if let Some(suspension) = self.suspension.take() {
                info!(cluster = %self.info.id, start_tasks = suspension.on_resume_start, "suspension elapsed");
                if suspension.on_resume_start {
                    self.resume_stopped(&suspension.stopped, until + shared.settings.start_delay);
                }
            }
        }
        self.advance_tasks(now, shared);
    }

    fn advance_tasks(&mut self, now: Instant, shared: &mut Shared<'_>) {
        let suspended = self.suspension.is_some();
        let SimCluster {
            info,
            tasks,
            snapshots,
            tags,
            health,
            ..
        } = self;
        let mut env = RunEnv {
            cluster_id: &info.id,
            db: &mut *shared.db,
            objects: &mut *shared.objects,
            snapshots,
            tags,
            health,
            client_encryption: info.client_encryption,
            settings: shared.settings,
            clock: shared.clock,
        };
        for task in tasks.values_mut() {
            task.advance(now, suspended, &mut env);
        }
    }

    fn resume_stopped(&mut self, stopped: &[TaskId], at: Instant) {
        for id in stopped {
            if let Some(task) = self.tasks.get_mut(id) {
                task.resume_at(at);
            }
        }
    }
}

/// Borrowed state shared by every cluster while advancing.
struct Shared<'a> {
    db: &'a mut Database,
    objects: &'a mut Objects,
    settings: &'a SimulatorSettings,
    clock: &'a SimClock,
}

#[derive(Debug)]
struct SimState {
    db: Database,
    objects: Objects,
    clusters: BTreeMap<ClusterId, SimCluster>,
    /// Upcoming status reads that fail with a transport error.
    failing_reads: u32,
}

/// Simulated management server, database cluster and object storage.
pub struct SimulatedManager {
    settings: SimulatorSettings,
    clock: SimClock,
    state: Mutex<SimState>,
}

impl SimulatedManager {
    pub fn new(settings: SimulatorSettings, nodes: &[NodeSettings]) -> Self {
        Self {
            settings,
            clock: SimClock::start(),
            state: Mutex::new(SimState {
                db: Database::seeded(nodes),
                objects: Objects::default(),
                clusters: BTreeMap::new(),
                failing_reads: 0,
            }),
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(config.simulator.clone(), &config.cluster.nodes)
    }

    /// Make the next `count` task reads fail as if the server were
    /// unreachable.
    pub fn fail_next_status_reads(&self, count: u32) {
        self.lock().failing_reads = count;
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Lock the state with every cluster advanced to the current instant.
    fn current(&self) -> MutexGuard<'_, SimState> {
        let now = Instant::now();
        let mut state = self.lock();
        let SimState {
            db,
            objects,
            clusters,
            ..
        } = &mut *state;
        let mut shared = Shared {
            db,
            objects,
            settings: &self.settings,
            clock: &self.clock,
        };
        for cluster in clusters.values_mut() {
            cluster.advance(now, &mut shared);
        }
        state
    }

    fn with_cluster<T>(
        &self,
        id: &ClusterId,
        f: impl FnOnce(&mut SimCluster, Instant, &SimulatorSettings) -> Result<T, MgmtError>,
    ) -> Result<T, MgmtError> {
        let mut state = self.current();
        let cluster = state
            .clusters
            .get_mut(id)
            .ok_or_else(|| MgmtError::not_found(format!("cluster {id}")))?;
        f(cluster, Instant::now(), &self.settings)
    }
}

fn name_taken(state: &SimState, name: &str, except: Option<&ClusterId>) -> bool {
    state
        .clusters
        .values()
        .any(|c| c.info.name == name && Some(&c.info.id) != except)
}

#[async_trait]
impl ClusterRegistry for SimulatedManager {
    async fn list_clusters(&self) -> Result<Vec<ClusterInfo>, MgmtError> {
        Ok(self.current().clusters.values().map(|c| c.info.clone()).collect())
    }

    async fn add_cluster(&self, spec: &ClusterSpec) -> Result<ClusterId, MgmtError> {
        let now = Instant::now();
        let mut state = self.current();
        if spec.hosts.is_empty() {
            return Err(MgmtError::InvalidParams("cluster needs at least one host".into()));
        }
        if name_taken(&state, &spec.name, None) {
            return Err(MgmtError::rejected(
                "add cluster",
                format!("a cluster named {} already exists", spec.name),
            ));
        }
        if let Some(unknown) = spec.hosts.iter().find(|h| !state.db.hosts.contains_key(*h)) {
            return Err(MgmtError::rejected("add cluster", format!("host {unknown} is unreachable")));
        }

        let id = ClusterId::generate();
        let healthcheck = TaskId::generate(TaskKind::Healthcheck);
        let mut tasks = BTreeMap::new();
        tasks.insert(
            healthcheck.clone(),
            SimTask::new(healthcheck, TaskParams::Healthcheck, now, &self.settings),
        );
        let health = state.db.health(spec.client_encryption);
        state.clusters.insert(
            id.clone(),
            SimCluster {
                info: ClusterInfo {
                    id: id.clone(),
                    name: spec.name.clone(),
                    hosts: spec.hosts.clone(),
                    client_encryption: spec.client_encryption,
                    force_non_ssl_session_port: false,
                },
                tasks,
                suspension: None,
                snapshots: BTreeMap::new(),
                tags: BTreeSet::new(),
                health,
            },
        );
        info!(cluster = %id, name = %spec.name, hosts = spec.hosts.len(), "cluster registered");
        Ok(id)
    }

    async fn update_cluster(&self, cluster: &ClusterId, update: &ClusterUpdate) -> Result<(), MgmtError> {
        let mut state = self.current();
        if let Some(name) = &update.name
            && name_taken(&state, name, Some(cluster))
        {
            return Err(MgmtError::rejected(
                "update cluster",
                format!("a cluster named {name} already exists"),
            ));
        }
        let entry = state
            .clusters
            .get_mut(cluster)
            .ok_or_else(|| MgmtError::not_found(format!("cluster {cluster}")))?;
        if let Some(name) = &update.name {
            entry.info.name.clone_from(name);
        }
        if let Some(enabled) = update.client_encryption {
            entry.info.client_encryption = enabled;
        }
        if let Some(force) = update.force_non_ssl_session_port {
            entry.info.force_non_ssl_session_port = force;
        }
        debug!(cluster = %cluster, ?update, "cluster updated");
        Ok(())
    }

    async fn delete_cluster(&self, cluster: &ClusterId) -> Result<(), MgmtError> {
        self.current()
            .clusters
            .remove(cluster)
            .map(|_| info!(cluster = %cluster, "cluster deregistered"))
            .ok_or_else(|| MgmtError::not_found(format!("cluster {cluster}")))
    }
}

#[async_trait]
impl TaskControl for SimulatedManager {
    async fn create_task(&self, cluster: &ClusterId, params: &TaskParams) -> Result<TaskId, MgmtError> {
        params.validate()?;
        self.with_cluster(cluster, |entry, now, settings| {
            if let TaskParams::Restore(restore) = params
                && !entry.snapshots.contains_key(&restore.snapshot_tag)
            {
                return Err(MgmtError::rejected(
                    "create restore task",
                    format!("no snapshot with tag {}", restore.snapshot_tag),
                ));
            }
            let id = TaskId::generate(params.kind());
            let mut task = SimTask::new(id.clone(), params.clone(), now, settings);
            if let Some(suspension) = &mut entry.suspension {
                task.cancel_pending();
                suspension.stopped.push(id.clone());
            }
            entry.tasks.insert(id.clone(), task);
            debug!(cluster = %cluster, task = %id, "task created");
            Ok(id)
        })
    }

    async fn task_snapshot(&self, cluster: &ClusterId, task: &TaskId) -> Result<TaskSnapshot, MgmtError> {
        {
            let mut state = self.lock();
            if state.failing_reads > 0 {
                state.failing_reads -= 1;
                return Err(ExecError::Transport(format!("connection refused reading task {task}")).into());
            }
        }
        let clock = self.clock;
        self.with_cluster(cluster, |entry, _, _| Ok(entry.task(task)?.snapshot(cluster, &clock)))
    }

    async fn list_tasks(&self, cluster: &ClusterId, kind: Option<TaskKind>) -> Result<Vec<TaskId>, MgmtError> {
        self.with_cluster(cluster, |entry, _, _| {
            Ok(entry
                .tasks
                .values()
                .filter(|t| kind.is_none_or(|k| t.kind == k))
                .map(|t| t.id.clone())
                .collect())
        })
    }

    async fn stop_task(&self, cluster: &ClusterId, task: &TaskId) -> Result<(), MgmtError> {
        self.with_cluster(cluster, |entry, now, settings| entry.task(task)?.stop(now, settings))
    }

    async fn start_task(
        &self,
        cluster: &ClusterId,
        task: &TaskId,
        continue_from_checkpoint: bool,
    ) -> Result<(), MgmtError> {
        self.with_cluster(cluster, |entry, now, settings| {
            if entry.suspension.is_some() {
                return Err(MgmtError::rejected("start task", format!("cluster {cluster} is suspended")));
            }
            entry.task(task)?.start(now, continue_from_checkpoint, settings)
        })
    }

    async fn delete_task(&self, cluster: &ClusterId, task: &TaskId) -> Result<(), MgmtError> {
        self.with_cluster(cluster, |entry, _, _| {
            entry
                .tasks
                .remove(task)
                .map(|_| ())
                .ok_or_else(|| MgmtError::not_found(format!("task {task}")))
        })
    }

    async fn task_history(&self, cluster: &ClusterId, task: &TaskId) -> Result<Vec<TaskRun>, MgmtError> {
        let clock = self.clock;
        self.with_cluster(cluster, |entry, _, _| Ok(entry.task(task)?.history(&clock)))
    }

    async fn control_repair(&self, cluster: &ClusterId, control: &RepairControl) -> Result<(), MgmtError> {
        control.validate()?;
        self.with_cluster(cluster, |entry, _, _| {
            let mut adjusted = 0;
            for task in entry
                .tasks
                .values_mut()
                .filter(|t| t.kind == TaskKind::Repair && t.is_active())
            {
                task.set_repair_control(control.intensity, control.parallel);
                adjusted += 1;
            }
            if adjusted == 0 {
                return Err(MgmtError::rejected("repair control", "no repair is running"));
            }
            info!(cluster = %cluster, intensity = ?control.intensity, parallel = ?control.parallel, "repair adjusted");
            Ok(())
        })
    }
}

#[async_trait]
impl HealthQuery for SimulatedManager {
    async fn hosts_health(&self, cluster: &ClusterId) -> Result<Vec<HostHealth>, MgmtError> {
        self.with_cluster(cluster, |entry, _, _| Ok(entry.health.clone()))
    }
}

#[async_trait]
impl SessionControl for SimulatedManager {
    async fn suspend(&self, cluster: &ClusterId, request: &SuspendRequest) -> Result<(), MgmtError> {
        self.with_cluster(cluster, |entry, now, settings| {
            let active: Vec<TaskId> = entry
                .tasks
                .values()
                .filter(|t| t.is_active() && t.kind != TaskKind::Healthcheck)
                .map(|t| t.id.clone())
                .collect();
            if !request.stop_tasks && !active.is_empty() {
                return Err(MgmtError::rejected(
                    "suspend",
                    format!("{} task(s) running and stopping was not requested", active.len()),
                ));
            }

            let mut stopped = Vec::new();
            for task in entry.tasks.values_mut().filter(|t| t.kind != TaskKind::Healthcheck) {
                let was_active = task.is_active();
                let was_pending = task.cancel_pending();
                if was_active {
                    task.stop(now, settings)?;
                }
                if was_active || was_pending {
                    stopped.push(task.id.clone());
                }
            }

            let until = request.duration.map(|d| now + d);
            match &mut entry.suspension {
                Some(existing) => {
                    existing.stopped.extend(stopped);
                    existing.until = until;
                    existing.on_resume_start = request.on_resume_start_tasks;
                }
                None => {
                    entry.suspension = Some(Suspension {
                        until,
                        on_resume_start: request.on_resume_start_tasks,
                        stopped,
                    });
                }
            }
            info!(cluster = %cluster, duration = ?request.duration, "cluster suspended");
            Ok(())
        })
    }

    async fn resume(&self, cluster: &ClusterId, start_tasks: bool) -> Result<(), MgmtError> {
        self.with_cluster(cluster, |entry, now, settings| {
            let Some(suspension) = entry.suspension.take() else {
                debug!(cluster = %cluster, "resume of a cluster that is not suspended");
                return Ok(());
            };
            if start_tasks {
                entry.resume_stopped(&suspension.stopped, now + settings.start_delay);
            }
            info!(cluster = %cluster, start_tasks, "cluster resumed");
            Ok(())
        })
    }

    async fn is_suspended(&self, cluster: &ClusterId) -> Result<bool, MgmtError> {
        self.with_cluster(cluster, |entry, _, _| Ok(entry.suspension.is_some()))
    }
}

#[async_trait]
impl ObjectStore for SimulatedManager {
    async fn list_keys(&self, location: &str, prefix: &str) -> Result<BTreeSet<String>, MgmtError> {
        Ok(self.current().objects.keys(location, prefix).into_iter().collect())
    }

    async fn download(&self, location: &str, key: &str) -> Result<Vec<u8>, MgmtError> {
        self.current()
            .objects
            .get(location, key)
            .cloned()
            .ok_or_else(|| MgmtError::not_found(format!("object {location}/{key}")))
    }
}

#[async_trait]
impl NodeOps for SimulatedManager {
    async fn stop_service(&self, host: &str) -> Result<(), MgmtError> {
        self.current().db.host(host)?.up = false;
        info!(host, "database service stopped");
        Ok(())
    }

    async fn start_service(&self, host: &str) -> Result<(), MgmtError> {
        self.current().db.host(host)?.up = true;
        info!(host, "database service started");
        Ok(())
    }

    async fn fill_disk(&self, host: &str) -> Result<(), MgmtError> {
        self.current().db.host(host)?.disk_full = true;
        warn!(host, "data volume filled");
        Ok(())
    }

    async fn clean_disk(&self, host: &str) -> Result<(), MgmtError> {
        self.current().db.host(host)?.disk_full = false;
        Ok(())
    }

    async fn enable_client_encryption(&self, host: &str) -> Result<(), MgmtError> {
        self.current().db.host(host)?.client_encryption = true;
        info!(host, "client encryption enabled");
        Ok(())
    }

    async fn nodetool(&self, host: &str, args: &str) -> Result<String, MgmtError> {
        let mut state = self.current();
        let node = state.db.host(host)?;
        if !node.up {
            return Err(ExecError::UnexpectedExit {
                command: format!("nodetool {args}"),
                exit_code: 1,
                stderr: "Failed to connect to JMX".into(),
            }
            .into());
        }
        match args.split_whitespace().next() {
            Some("compact") => {
                node.generation += 1;
                debug!(host, generation = node.generation, "compaction rewrote sstables");
                Ok(String::new())
            }
            _ => Ok(String::new()),
        }
    }
}

#[async_trait]
impl DataPlane for SimulatedManager {
    async fn execute(&self, statement: &str) -> Result<Vec<Row>, MgmtError> {
        let mut state = self.current();
        if !state.db.hosts.values().any(|h| h.up) {
            return Err(ExecError::Transport("no host is reachable".into()).into());
        }
        cql::execute(&mut state.db, statement)
    }
}
