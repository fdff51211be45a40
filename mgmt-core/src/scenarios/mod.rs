//! End-to-end scenarios over the orchestration core.
//!
//! Every scenario is a plain async function that takes a
//! [`ScenarioContext`] and fails through `anyhow` when one of its
//! assertions does not hold. The [`ScenarioDriver`] runs them by name and
//! turns each outcome into a [`ScenarioReport`].

mod backup;
mod cluster;
mod faults;
mod repair;
mod suspend;

use crate::cluster::{ClusterSession, ManagerClient};
use crate::control_plane::{BackupParams, ClusterSpec, ControlPlane};
use crate::dataplane::DataPlane;
use crate::events::{EVENT_SCENARIO, EventBus};
use crate::node_ops::NodeOps;
use crate::sim::SimulatedManager;
use crate::storage::ObjectStore;
use crate::task::TaskHandle;
use anyhow::{Context, bail, ensure};
use futures::future::BoxFuture;
use mgmt_common::{HarnessConfig, TaskId, TaskStatus};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Everything a scenario talks to.
pub struct ScenarioContext {
    pub config: HarnessConfig,
    pub manager: ManagerClient,
    pub storage: Arc<dyn ObjectStore>,
    pub nodes: Arc<dyn NodeOps>,
    pub data: Arc<dyn DataPlane>,
}

impl ScenarioContext {
    pub fn new(
        config: HarnessConfig,
        control: Arc<dyn ControlPlane>,
        storage: Arc<dyn ObjectStore>,
        nodes: Arc<dyn NodeOps>,
        data: Arc<dyn DataPlane>,
    ) -> Self {
        let manager = ManagerClient::new(control, &config.polling);
        Self {
            config,
            manager,
            storage,
            nodes,
            data,
        }
    }

    /// Context backed by one [`SimulatedManager`] for every collaborator.
    pub fn simulated(config: HarnessConfig) -> Self {
        let sim = Arc::new(SimulatedManager::from_config(&config));
        Self::new(config, sim.clone(), sim.clone(), sim.clone(), sim)
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.manager = self.manager.with_events(events);
        self
    }

    pub fn hosts(&self) -> Vec<String> {
        self.config.cluster.nodes.iter().map(|n| n.host.clone()).collect()
    }

    pub fn cluster_spec(&self) -> ClusterSpec {
        let mut spec = ClusterSpec::new(self.config.cluster.name.clone(), self.hosts());
        spec.auth_token.clone_from(&self.config.cluster.auth_token);
        spec
    }

    /// Register the configured cluster, or reuse the existing registration.
    pub async fn session(&self, force_re_add: bool) -> anyhow::Result<ClusterSession> {
        let force = force_re_add || self.config.cluster.force_re_add;
        self.manager
            .register_or_reuse(&self.cluster_spec(), force)
            .await
            .with_context(|| format!("registering cluster {}", self.config.cluster.name))
    }

    pub fn locations(&self) -> Vec<String> {
        self.config.backup.locations.clone()
    }

    pub fn backup_params(&self) -> BackupParams {
        let mut params = BackupParams::new(self.locations());
        params.retention = self.config.backup.retention;
        params
    }

    pub fn step(&self) -> Duration {
        self.config.polling.step
    }

    /// Host used for fault injection: the second node, or the only one.
    pub fn target_host(&self) -> anyhow::Result<String> {
        let hosts = self.hosts();
        match hosts.get(1).or_else(|| hosts.first()) {
            Some(host) => Ok(host.clone()),
            None => bail!("no cluster nodes configured"),
        }
    }
}

/// Measurements a scenario reports besides pass/fail.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore_secs: Option<f64>,
    pub task_ids: Vec<TaskId>,
}

impl ScenarioMetrics {
    fn track(&mut self, task: &TaskHandle) {
        self.task_ids.push(task.id().clone());
    }
}

pub type ScenarioFuture<'a> = BoxFuture<'a, anyhow::Result<ScenarioMetrics>>;

#[derive(Clone, Copy)]
pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    run: for<'a> fn(&'a ScenarioContext) -> ScenarioFuture<'a>,
}

impl std::fmt::Debug for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scenario").field("name", &self.name).finish()
    }
}

/// Every scenario in run order. Client encryption stays on once enabled,
/// so it runs last.
pub fn registry() -> Vec<Scenario> {
    vec![
        Scenario {
            name: "basic_backup",
            description: "backup, truncate, restore data with a task and verify rows",
            run: backup::basic_backup,
        },
        Scenario {
            name: "restore_with_task",
            description: "backup a keyspace list and restore it with zero row mismatches",
            run: backup::restore_with_task,
        },
        Scenario {
            name: "backup_rate_limit",
            description: "a rate-limited backup finishes, slower than an unlimited one",
            run: backup::backup_rate_limit,
        },
        Scenario {
            name: "backup_location_with_path",
            description: "a backup location with a path is rejected",
            run: backup::backup_location_with_path,
        },
        Scenario {
            name: "purge_orphans",
            description: "files of a backup stopped mid-upload are purged by a fresh run",
            run: backup::purge_orphans,
        },
        Scenario {
            name: "repair_control",
            description: "repair pace follows intensity and parallel changes",
            run: repair::repair_control,
        },
        Scenario {
            name: "repair_multiple_keyspace_types",
            description: "repair covers replicated keyspaces and skips LocalStrategy",
            run: repair::repair_multiple_keyspace_types,
        },
        Scenario {
            name: "suspend_resume_backup",
            description: "a running backup stops under suspension and finishes after resume",
            run: suspend::suspend_resume_backup,
        },
        Scenario {
            name: "suspend_resume_repair",
            description: "a running repair stops under suspension and finishes after resume",
            run: suspend::suspend_resume_repair,
        },
        Scenario {
            name: "suspend_without_start",
            description: "resume without starting tasks leaves them stopped",
            run: suspend::suspend_without_start,
        },
        Scenario {
            name: "suspend_auto_resume_after_duration",
            description: "a timed suspension starts stopped tasks when it elapses",
            run: suspend::suspend_auto_resume_after_duration,
        },
        Scenario {
            name: "suspend_resume_before_duration",
            description: "an early explicit resume cancels the scheduled start",
            run: suspend::suspend_resume_before_duration,
        },
        Scenario {
            name: "enospc_before_restore",
            description: "restore onto a node without disk space fails with a clear cause",
            run: faults::enospc_before_restore,
        },
        Scenario {
            name: "enospc_during_backup",
            description: "a backup resumed after its snapshot survives a full disk",
            run: faults::enospc_during_backup,
        },
        Scenario {
            name: "cluster_healthcheck",
            description: "host health follows a stopped node",
            run: cluster::cluster_healthcheck,
        },
        Scenario {
            name: "cluster_crud",
            description: "rename, delete and re-add a cluster registration",
            run: cluster::cluster_crud,
        },
        Scenario {
            name: "client_encryption",
            description: "hosts report SSL after client encryption is enabled",
            run: cluster::client_encryption,
        },
    ]
}

/// Outcome of one scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_secs: f64,
    pub metrics: ScenarioMetrics,
}

pub struct ScenarioDriver {
    ctx: ScenarioContext,
    scenarios: Vec<Scenario>,
}

impl ScenarioDriver {
    pub fn new(ctx: ScenarioContext) -> Self {
        Self {
            ctx,
            scenarios: registry(),
        }
    }

    pub fn context(&self) -> &ScenarioContext {
        &self.ctx
    }

    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }

    pub async fn run(&self, name: &str) -> anyhow::Result<ScenarioReport> {
        let Some(scenario) = self.scenarios.iter().find(|s| s.name == name) else {
            let known: Vec<_> = self.scenarios.iter().map(|s| s.name).collect();
            bail!("unknown scenario {name}; known: {}", known.join(", "));
        };
        Ok(self.execute(scenario).await)
    }

    pub async fn run_all(&self) -> Vec<ScenarioReport> {
        let mut reports = Vec::with_capacity(self.scenarios.len());
        for scenario in &self.scenarios {
            reports.push(self.execute(scenario).await);
        }
        reports
    }

    async fn execute(&self, scenario: &Scenario) -> ScenarioReport {
        info!(scenario = scenario.name, "scenario started");
        let started = Instant::now();
        let outcome = (scenario.run)(&self.ctx).await;
        let duration_secs = started.elapsed().as_secs_f64();

        let report = match outcome {
            Ok(metrics) => {
                info!(scenario = scenario.name, duration_secs, "scenario passed");
                ScenarioReport {
                    name: scenario.name.to_string(),
                    passed: true,
                    error: None,
                    duration_secs,
                    metrics,
                }
            }
            Err(err) => {
                error!(scenario = scenario.name, error = %format!("{err:#}"), "scenario failed");
                ScenarioReport {
                    name: scenario.name.to_string(),
                    passed: false,
                    error: Some(format!("{err:#}")),
                    duration_secs,
                    metrics: ScenarioMetrics::default(),
                }
            }
        };
        self.ctx.manager.events().emit(EVENT_SCENARIO, &report);
        report
    }
}

/// Wait for a terminal status and require DONE.
async fn expect_done(task: &TaskHandle, step: Duration, timeout: Duration) -> anyhow::Result<()> {
    let status = task.wait_and_get_final_status(step, timeout).await;
    ensure!(
        status == TaskStatus::Done,
        "task {} ended in {status} instead of {}",
        task.id(),
        TaskStatus::Done
    );
    Ok(())
}

/// Require `task` to reach one of `statuses` within `timeout`.
async fn expect_status(
    task: &TaskHandle,
    statuses: &[TaskStatus],
    step: Duration,
    timeout: Duration,
) -> anyhow::Result<()> {
    if !task.wait_for_status(statuses, step, timeout).await? {
        let wanted: Vec<_> = statuses.iter().map(|s| s.as_str()).collect();
        bail!(
            "task {} did not reach {} within {timeout:?}, last status {}",
            task.id(),
            wanted.join("|"),
            task.cached_status()
        );
    }
    Ok(())
}

/// Wall time a finished task took, when the control plane reports it.
async fn task_secs(task: &TaskHandle) -> Option<f64> {
    match task.duration().await {
        Ok(duration) => duration.map(|d| d.as_secs_f64()),
        Err(err) => {
            warn!(task = %task.id(), error = %err, "task duration unavailable");
            None
        }
    }
}
