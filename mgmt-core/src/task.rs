//! Handle on one remote task.
//!
//! A [`TaskHandle`] never holds authoritative state: every accessor except
//! [`TaskHandle::cached_status`] reads the control plane. What it keeps is
//! the log of observed status changes. Each change is checked against the
//! lifecycle state machine; an impossible one is logged and counted as an
//! anomaly but never raised, since the remote side is the source of truth.

use crate::control_plane::{ControlPlane, TaskProgress, TaskSnapshot};
use crate::events::{EVENT_TASK_ANOMALY, EVENT_TASK_TRANSITION, EventBus, TransitionEvent};
use crate::poller::{PollOutcome, StatusPoller};
use chrono::{DateTime, Utc};
use mgmt_common::{BackupStage, ClusterId, MgmtError, TaskId, TaskKind, TaskRun, TaskStatus};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One observed status change.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub at: DateTime<Utc>,
    pub legal: bool,
}

#[derive(Debug)]
struct Observations {
    cached: TaskStatus,
    transitions: Vec<Transition>,
    anomalies: u32,
    /// Set by `start`, cleared by the first non-terminal observation after it.
    restart_pending: bool,
}

pub struct TaskHandle<C: ?Sized = dyn ControlPlane> {
    control: Arc<C>,
    cluster_id: ClusterId,
    id: TaskId,
    kind: TaskKind,
    poller: StatusPoller,
    events: Option<EventBus>,
    observations: Mutex<Observations>,
}

impl<C: ?Sized> std::fmt::Debug for TaskHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("cluster_id", &self.cluster_id)
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl<C: ControlPlane + ?Sized> TaskHandle<C> {
    pub fn new(control: Arc<C>, cluster_id: ClusterId, id: TaskId, kind: TaskKind, poller: StatusPoller) -> Self {
        Self {
            control,
            cluster_id,
            id,
            kind,
            poller,
            events: None,
            observations: Mutex::new(Observations {
                cached: TaskStatus::New,
                transitions: Vec::new(),
                anomalies: 0,
                restart_pending: false,
            }),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn cluster_id(&self) -> &ClusterId {
        &self.cluster_id
    }

    fn observations(&self) -> MutexGuard<'_, Observations> {
        self.observations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Last status seen by any read. No remote call.
    pub fn cached_status(&self) -> TaskStatus {
        self.observations().cached
    }

    /// Every status change observed so far, oldest first.
    pub fn transitions(&self) -> Vec<Transition> {
        self.observations().transitions.clone()
    }

    /// Number of observed changes the state machine cannot explain.
    pub fn anomalies(&self) -> u32 {
        self.observations().anomalies
    }

    fn observe(&self, status: TaskStatus) {
        let transition = {
            let mut obs = self.observations();
            let from = obs.cached;
            if from == status {
                return;
            }
            // Health checks are rescheduled by the control plane itself.
            let rescheduled = self.kind == TaskKind::Healthcheck && from.is_terminal();
            let legal = from.can_reach(status) || obs.restart_pending || rescheduled;
            if !status.is_terminal() {
                obs.restart_pending = false;
            }
            obs.cached = status;
            if !legal {
                obs.anomalies += 1;
            }
            let transition = Transition {
                from,
                to: status,
                at: Utc::now(),
                legal,
            };
            obs.transitions.push(transition.clone());
            transition
        };

        if transition.legal {
            debug!(task = %self.id, from = %transition.from, to = %transition.to, "task status changed");
        } else {
            warn!(
                task = %self.id,
                from = %transition.from,
                to = %transition.to,
                "unexpected task transition"
            );
        }

        if let Some(events) = &self.events {
            let event = TransitionEvent {
                task_id: self.id.clone(),
                from: transition.from,
                to: transition.to,
                legal: transition.legal,
            };
            events.emit(EVENT_TASK_TRANSITION, &event);
            if !transition.legal {
                events.emit(EVENT_TASK_ANOMALY, &event);
            }
        }
    }

    /// Fresh read of everything the control plane reports.
    pub async fn snapshot(&self) -> Result<TaskSnapshot, MgmtError> {
        let snapshot = self.control.task_snapshot(&self.cluster_id, &self.id).await?;
        self.observe(snapshot.status);
        Ok(snapshot)
    }

    /// Fresh status read; updates the cache.
    pub async fn status(&self) -> Result<TaskStatus, MgmtError> {
        Ok(self.snapshot().await?.status)
    }

    fn poller_with_step(&self, step: Duration) -> StatusPoller {
        self.poller.with_interval(step)
    }

    /// Poll until the task is terminal.
    ///
    /// Returns the terminal status, or the last status seen when `timeout`
    /// passes first. A status read that keeps failing is logged and the
    /// cached status returned instead.
    pub async fn wait_and_get_final_status(&self, step: Duration, timeout: Duration) -> TaskStatus {
        let what = format!("{} to finish", self.id);
        let outcome = self
            .poller_with_step(step)
            .poll_status(&what, timeout, || self.status())
            .await;
        match outcome {
            Ok(PollOutcome::Completed(status)) => {
                info!(task = %self.id, %status, "task finished");
                status
            }
            Ok(PollOutcome::TimedOut { last }) => {
                let status = last.unwrap_or_else(|| self.cached_status());
                warn!(task = %self.id, %status, ?timeout, "task did not finish in time");
                status
            }
            Err(err) => {
                let status = self.cached_status();
                warn!(task = %self.id, error = %err, %status, "status reads failed, returning cached status");
                status
            }
        }
    }

    /// Whether one of `statuses` shows up before `timeout`.
    pub async fn wait_for_status(
        &self,
        statuses: &[TaskStatus],
        step: Duration,
        timeout: Duration,
    ) -> Result<bool, MgmtError> {
        self.poller_with_step(step)
            .wait_for_any(statuses, timeout, || self.status())
            .await
    }

    /// Block until aggregate progress reaches `threshold` percent.
    pub async fn wait_for_percentage(&self, threshold: f64, step: Duration, timeout: Duration) -> Result<f64, MgmtError> {
        let reached = self
            .poller_with_step(step)
            .wait_for_percentage(threshold, timeout, || async {
                Ok(self.snapshot().await?.progress.percent())
            })
            .await?;
        info!(task = %self.id, threshold, reached, "progress threshold reached");
        Ok(reached)
    }

    /// Whether the backup enters its upload stage before `timeout`.
    ///
    /// `false` when the task ends or times out first.
    pub async fn wait_for_uploading_stage(&self, step: Duration, timeout: Duration) -> Result<bool, MgmtError> {
        self.require(TaskKind::Backup, "wait_for_uploading_stage")?;
        let outcome = self
            .poller_with_step(step)
            .poll(
                "backup upload stage",
                timeout,
                || self.snapshot(),
                |s: &TaskSnapshot| s.status.is_terminal() || stage_of(s) == Some(BackupStage::Upload),
            )
            .await?;
        Ok(match outcome {
            PollOutcome::Completed(snapshot) => stage_of(&snapshot) == Some(BackupStage::Upload),
            PollOutcome::TimedOut { .. } => false,
        })
    }

    fn require(&self, kind: TaskKind, operation: &str) -> Result<(), MgmtError> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(MgmtError::Capability {
                operation: operation.to_string(),
                kind: self.kind.to_string(),
            })
        }
    }

    pub async fn stop(&self) -> Result<(), MgmtError> {
        info!(task = %self.id, "stopping task");
        self.control.stop_task(&self.cluster_id, &self.id).await
    }

    /// Start again. Recorded, so that leaving a terminal state afterwards is
    /// not flagged as an anomaly.
    pub async fn start(&self, continue_from_checkpoint: bool) -> Result<(), MgmtError> {
        info!(task = %self.id, continue_from_checkpoint, "starting task");
        self.control
            .start_task(&self.cluster_id, &self.id, continue_from_checkpoint)
            .await?;
        self.observations().restart_pending = true;
        Ok(())
    }

    pub async fn progress(&self) -> Result<TaskProgress, MgmtError> {
        Ok(self.snapshot().await?.progress)
    }

    /// Raw progress report, for substring assertions.
    pub async fn progress_text(&self) -> Result<String, MgmtError> {
        Ok(self.snapshot().await?.progress_text)
    }

    pub async fn per_keyspace_progress(&self) -> Result<BTreeMap<String, f64>, MgmtError> {
        self.require(TaskKind::Repair, "per_keyspace_progress")?;
        match self.progress().await? {
            TaskProgress::Repair(repair) => Ok(repair.keyspaces),
            other => Err(MgmtError::Internal(format!(
                "repair task {} reported {} progress",
                self.id,
                other.kind()
            ))),
        }
    }

    /// Run time of the current run; still counting while it runs.
    pub async fn duration(&self) -> Result<Option<Duration>, MgmtError> {
        let snapshot = self.snapshot().await?;
        let Some(started) = snapshot.started_at else {
            return Ok(None);
        };
        let ended = snapshot.ended_at.unwrap_or_else(Utc::now);
        Ok(Some((ended - started).to_std().unwrap_or_default()))
    }

    /// Tag of the snapshot taken by the current backup run, once known.
    pub async fn snapshot_tag(&self) -> Result<Option<String>, MgmtError> {
        self.require(TaskKind::Backup, "snapshot_tag")?;
        Ok(self.snapshot().await?.snapshot_tag)
    }

    pub async fn history(&self) -> Result<Vec<TaskRun>, MgmtError> {
        self.control.task_history(&self.cluster_id, &self.id).await
    }

    pub async fn next_run(&self) -> Result<Option<DateTime<Utc>>, MgmtError> {
        Ok(self.snapshot().await?.next_run)
    }

    pub async fn delete(self) -> Result<(), MgmtError> {
        info!(task = %self.id, "deleting task");
        self.control.delete_task(&self.cluster_id, &self.id).await
    }
}

fn stage_of(snapshot: &TaskSnapshot) -> Option<BackupStage> {
    snapshot.progress.as_transfer().map(|p| p.stage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::{RepairProgress, TransferProgress};
    use crate::testing::{ScriptedControlPlane, Step};

    fn handle(plane: &Arc<ScriptedControlPlane>, kind: TaskKind) -> TaskHandle<ScriptedControlPlane> {
        TaskHandle::new(
            plane.clone(),
            ClusterId::new("c1"),
            TaskId::generate(kind),
            kind,
            StatusPoller::new(Duration::from_secs(1)),
        )
    }

    const STEP: Duration = Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn final_status_is_terminal_status() {
        let plane = Arc::new(ScriptedControlPlane::new(vec![
            Step::Status(TaskStatus::New),
            Step::Status(TaskStatus::Running),
            Step::Status(TaskStatus::Done),
        ]));
        let task = handle(&plane, TaskKind::Backup);
        let status = task.wait_and_get_final_status(STEP, Duration::from_secs(60)).await;
        assert_eq!(status, TaskStatus::Done);
        assert_eq!(task.cached_status(), TaskStatus::Done);
        assert_eq!(task.anomalies(), 0);
        assert_eq!(task.transitions().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn final_status_on_timeout_is_last_seen() {
        let plane = Arc::new(ScriptedControlPlane::new(vec![Step::Status(TaskStatus::Running)]));
        let task = handle(&plane, TaskKind::Repair);
        let status = task.wait_and_get_final_status(STEP, Duration::from_secs(5)).await;
        assert_eq!(status, TaskStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn final_status_survives_failing_reads() {
        let plane = Arc::new(ScriptedControlPlane::new(vec![
            Step::Status(TaskStatus::Running),
            Step::Transport,
        ]));
        let task = handle(&plane, TaskKind::Repair);
        let status = task.wait_and_get_final_status(STEP, Duration::from_secs(60)).await;
        assert_eq!(status, TaskStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_to_running_without_restart_is_an_anomaly() {
        let plane = Arc::new(ScriptedControlPlane::new(vec![
            Step::Status(TaskStatus::Done),
            Step::Status(TaskStatus::Running),
        ]));
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let task = handle(&plane, TaskKind::Backup).with_events(events);

        assert_eq!(task.status().await.unwrap(), TaskStatus::Done);
        assert_eq!(task.status().await.unwrap(), TaskStatus::Running);
        assert_eq!(task.anomalies(), 1);
        assert!(!task.transitions()[1].legal);

        let kinds: Vec<_> = crate::events::drain(&mut rx)
            .into_iter()
            .map(|e| e["event"].as_str().unwrap_or_default().to_string())
            .collect();
        assert!(kinds.contains(&EVENT_TASK_ANOMALY.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_makes_leaving_terminal_legal() {
        let plane = Arc::new(ScriptedControlPlane::new(vec![
            Step::Status(TaskStatus::Done),
            Step::Status(TaskStatus::Running),
            Step::Status(TaskStatus::Done),
        ]));
        let task = handle(&plane, TaskKind::Backup);
        task.status().await.unwrap();
        task.start(false).await.unwrap();
        task.status().await.unwrap();
        task.status().await.unwrap();
        assert_eq!(task.anomalies(), 0);
        assert!(plane.calls().iter().any(|c| c.starts_with("start_task")));
    }

    #[tokio::test(start_paused = true)]
    async fn skipped_stopping_sample_is_legal() {
        let plane = Arc::new(ScriptedControlPlane::new(vec![
            Step::Status(TaskStatus::Running),
            Step::Status(TaskStatus::Stopped),
        ]));
        let task = handle(&plane, TaskKind::Repair);
        assert!(
            task.wait_for_status(&[TaskStatus::Stopped], STEP, Duration::from_secs(10))
                .await
                .unwrap()
        );
        assert_eq!(task.anomalies(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn per_keyspace_progress_requires_repair() {
        let plane = Arc::new(ScriptedControlPlane::new(vec![Step::Status(TaskStatus::Running)]));
        let backup = handle(&plane, TaskKind::Backup);
        let err = backup.per_keyspace_progress().await.unwrap_err();
        assert!(matches!(err, MgmtError::Capability { .. }));

        let mut keyspaces = BTreeMap::new();
        keyspaces.insert("ks1".to_string(), 50.0);
        plane.set_progress(TaskProgress::Repair(RepairProgress {
            percent: 50.0,
            keyspaces: keyspaces.clone(),
            ..RepairProgress::default()
        }));
        let repair = handle(&plane, TaskKind::Repair);
        assert_eq!(repair.per_keyspace_progress().await.unwrap(), keyspaces);
    }

    #[tokio::test(start_paused = true)]
    async fn uploading_stage_wait_stops_on_terminal() {
        let plane = Arc::new(ScriptedControlPlane::new(vec![
            Step::Status(TaskStatus::Running),
            Step::Status(TaskStatus::Error),
        ]));
        plane.set_progress(TaskProgress::Backup(TransferProgress {
            stage: BackupStage::Snapshot,
            ..TransferProgress::default()
        }));
        let task = handle(&plane, TaskKind::Backup);
        assert!(!task.wait_for_uploading_stage(STEP, Duration::from_secs(30)).await.unwrap());
        assert_eq!(task.cached_status(), TaskStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn percentage_timeout_is_fatal() {
        let plane = Arc::new(ScriptedControlPlane::new(vec![Step::Status(TaskStatus::Running)]));
        plane.set_progress(TaskProgress::Repair(RepairProgress {
            percent: 12.5,
            ..RepairProgress::default()
        }));
        let task = handle(&plane, TaskKind::Repair);
        let err = task
            .wait_for_percentage(20.0, STEP, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("12.5%"), "{err}");
    }
}
