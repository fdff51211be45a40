//! One simulated task and its progression over tokio time.
//!
//! Tasks are advanced lazily: every control-plane call first moves each
//! task forward to the current instant, replaying whatever happened in
//! between (start, stage boundaries, stop completion, recurring runs) at
//! the instant it happened.

use super::world::{Database, LOCAL_STRATEGY, Objects, TableData, capture, matches_filter};
use super::SimClock;
use crate::control_plane::{
    HealthcheckProgress, RepairProgress, TaskParams, TaskProgress, TaskSnapshot, TransferProgress,
};
use crate::schema::{SchemaEntry, create_statements, parse_schema, schema_prefix};
use mgmt_common::config::SimulatorSettings;
use mgmt_common::util::format_percent;
use mgmt_common::{BackupStage, ClusterId, HostHealth, MgmtError, TaskId, TaskKind, TaskRun, TaskStatus};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Fraction of a backup run spent taking the snapshot.
const SNAPSHOT_END: f64 = 0.1;
/// Fraction at which every file is uploaded and purging starts.
const UPLOAD_END: f64 = 0.9;
const HEALTHCHECK_WORK: Duration = Duration::from_secs(1);
/// Per-node upload bandwidth, MiB/s, that `backup_duration` assumes.
const UNLIMITED_UPLOAD_RATE: u32 = 100;

/// A completed backup snapshot.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub location: String,
    pub data: TableData,
    pub schema_key: String,
}

/// State shared by the tasks of one cluster while they advance.
pub(crate) struct RunEnv<'a> {
    pub cluster_id: &'a ClusterId,
    pub db: &'a mut Database,
    pub objects: &'a mut Objects,
    pub snapshots: &'a mut BTreeMap<String, Snapshot>,
    /// Every snapshot tag handed out in the cluster.
    pub tags: &'a mut BTreeSet<String>,
    pub health: &'a mut Vec<HostHealth>,
    pub client_encryption: bool,
    pub settings: &'a SimulatorSettings,
    pub clock: &'a SimClock,
}

#[derive(Debug, Clone)]
enum Work {
    Backup {
        tag: Option<String>,
        /// sstable keys planned at the end of the snapshot stage.
        files: Vec<String>,
        uploaded: usize,
        data: TableData,
    },
    Restore,
    Repair {
        intensity: f64,
        parallel: u32,
        keyspaces: Vec<String>,
    },
    Healthcheck {
        hosts_checked: usize,
        hosts_down: usize,
    },
}

#[derive(Debug, Clone)]
struct SimRun {
    id: String,
    status: TaskStatus,
    started: Instant,
    ended: Option<Instant>,
    cause: Option<String>,
}

#[derive(Debug)]
pub(crate) struct SimTask {
    pub id: TaskId,
    pub kind: TaskKind,
    params: TaskParams,
    pub status: TaskStatus,
    cursor: Instant,
    /// Completed fraction of the current run.
    progress: f64,
    pending_start: Option<(Instant, bool)>,
    stop_at: Option<Instant>,
    interval: Option<Duration>,
    next_run: Option<Instant>,
    runs: Vec<SimRun>,
    cause: Option<String>,
    work: Work,
}

impl SimTask {
    pub fn new(id: TaskId, params: TaskParams, now: Instant, settings: &SimulatorSettings) -> Self {
        let work = match &params {
            TaskParams::Backup(_) => Work::Backup {
                tag: None,
                files: Vec::new(),
                uploaded: 0,
                data: TableData::new(),
            },
            TaskParams::Restore(_) => Work::Restore,
            TaskParams::Repair(p) => Work::Repair {
                intensity: p.intensity,
                parallel: p.parallel,
                keyspaces: Vec::new(),
            },
            TaskParams::Healthcheck => Work::Healthcheck {
                hosts_checked: 0,
                hosts_down: 0,
            },
        };
        let interval = matches!(params, TaskParams::Healthcheck).then_some(settings.healthcheck_interval);
        Self {
            id,
            kind: params.kind(),
            params,
            status: TaskStatus::New,
            cursor: now,
            progress: 0.0,
            pending_start: Some((now + settings.start_delay, false)),
            stop_at: None,
            interval,
            next_run: None,
            runs: Vec::new(),
            cause: None,
            work,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, TaskStatus::Running | TaskStatus::Stopping)
    }

    pub fn has_pending_start(&self) -> bool {
        self.pending_start.is_some()
    }

    pub fn snapshot_tag(&self) -> Option<&str> {
        match &self.work {
            Work::Backup { tag, .. } => tag.as_deref(),
            _ => None,
        }
    }

    /// Length of a whole run at the pace of the current stage.
    fn work_secs(&self, settings: &SimulatorSettings) -> f64 {
        match (&self.work, &self.params) {
            (Work::Backup { .. }, TaskParams::Backup(params)) => {
                let base = settings.backup_duration.as_secs_f64();
                if (SNAPSHOT_END..UPLOAD_END).contains(&self.progress) {
                    base * upload_slowdown(params.rate_limit)
                } else {
                    base
                }
            }
            (Work::Restore, TaskParams::Restore(params)) => {
                settings.restore_duration.as_secs_f64() / restore_speed(params.batch_size, params.parallel)
            }
            (Work::Backup { .. }, _) => settings.backup_duration.as_secs_f64(),
            (Work::Restore, _) => settings.restore_duration.as_secs_f64(),
            (
                Work::Repair {
                    intensity,
                    parallel,
                    keyspaces,
                },
                _,
            ) => {
                let per_keyspace = settings.repair_duration.as_secs_f64();
                per_keyspace * keyspaces.len().max(1) as f64 / repair_speed(*intensity, *parallel)
            }
            (Work::Healthcheck { .. }, _) => HEALTHCHECK_WORK.as_secs_f64(),
        }
    }

    /// Next stage boundary strictly ahead of the current progress.
    fn next_boundary(&self) -> f64 {
        match self.work {
            Work::Backup { .. } => [SNAPSHOT_END, UPLOAD_END, 1.0]
                .into_iter()
                .find(|b| *b > self.progress)
                .unwrap_or(1.0),
            _ => 1.0,
        }
    }

    pub fn advance(&mut self, now: Instant, suspended: bool, env: &mut RunEnv<'_>) {
        loop {
            match self.status {
                TaskStatus::Running => {
                    if let Some(cause) = self.fault(env) {
                        self.finish(self.cursor, TaskStatus::Error, Some(cause));
                        continue;
                    }
                    let total = self.work_secs(env.settings).max(f64::EPSILON);
                    let target = self.next_boundary();
                    let to_target = (target - self.progress) * total;
                    let available = now.saturating_duration_since(self.cursor).as_secs_f64();
                    if to_target <= available {
                        self.cursor += Duration::from_secs_f64(to_target);
                        self.progress = target;
                        self.cross(target, env);
                        continue;
                    }
                    self.progress += available / total;
                    self.cursor = now;
                    self.sync_uploads(env);
                    break;
                }
                TaskStatus::Stopping => match self.stop_at {
                    Some(at) if at <= now => {
                        self.stop_at = None;
                        self.cursor = at;
                        self.finish(at, TaskStatus::Stopped, None);
                    }
                    _ => break,
                },
                _ => {
                    if suspended && self.kind != TaskKind::Healthcheck {
                        self.cursor = now;
                        break;
                    }
                    let due = match self.pending_start {
                        Some((at, continue_from_checkpoint)) if at <= now => Some((at, continue_from_checkpoint)),
                        Some(_) => None,
                        None => self
                            .next_run
                            .filter(|at| *at <= now && self.status.is_terminal())
                            .map(|at| (at, false)),
                    };
                    match due {
                        Some((at, continue_from_checkpoint)) => {
                            self.begin_run(at.max(self.cursor), continue_from_checkpoint, env)
                        }
                        None => break,
                    }
                }
            }
        }
    }

    fn fault(&self, env: &RunEnv<'_>) -> Option<String> {
        match &self.work {
            Work::Backup { .. } if self.progress < SNAPSHOT_END => env
                .db
                .full_disk_host()
                .map(|host| format!("snapshot: {host}: not enough disk space")),
            Work::Restore => env
                .db
                .full_disk_host()
                .map(|host| format!("restore data: {host}: not enough disk space")),
            Work::Repair { .. } => env
                .db
                .down_host()
                .map(|host| format!("repair: host {host} is down")),
            _ => None,
        }
    }

    fn begin_run(&mut self, at: Instant, continue_from_checkpoint: bool, env: &mut RunEnv<'_>) {
        let resume = continue_from_checkpoint
            && matches!(self.status, TaskStatus::Stopped | TaskStatus::Error | TaskStatus::Aborted)
            && self.progress > 0.0;
        if !resume {
            self.progress = 0.0;
            self.reset_work(at, env);
        }
        self.pending_start = None;
        self.cause = None;
        self.status = TaskStatus::Running;
        self.cursor = at;
        self.runs.push(SimRun {
            id: Uuid::new_v4().to_string(),
            status: TaskStatus::Running,
            started: at,
            ended: None,
            cause: None,
        });
        debug!(task = %self.id, resume, "simulated run started");
    }

    fn reset_work(&mut self, at: Instant, env: &mut RunEnv<'_>) {
        match (&mut self.work, &self.params) {
            (Work::Backup { tag, files, uploaded, data }, _) => {
                *tag = Some(unique_tag(env, at));
                files.clear();
                *uploaded = 0;
                data.clear();
            }
            (Work::Repair { keyspaces, .. }, TaskParams::Repair(params)) => {
                *keyspaces = env
                    .db
                    .keyspaces
                    .iter()
                    .filter(|(_, ks)| ks.class != LOCAL_STRATEGY)
                    .filter(|(name, _)| matches_filter(&params.keyspaces, name))
                    .map(|(name, _)| name.clone())
                    .collect();
            }
            _ => {}
        }
    }

    fn finish(&mut self, at: Instant, status: TaskStatus, cause: Option<String>) {
        self.status = status;
        self.cause.clone_from(&cause);
        if let Some(run) = self.runs.last_mut() {
            run.status = status;
            run.ended = Some(at);
            run.cause = cause;
        }
        if let (Some(interval), true) = (self.interval, status.is_terminal()) {
            let started = self.runs.last().map_or(at, |r| r.started);
            let next = started + interval;
            self.next_run = Some(if next > at { next } else { at + interval });
        }
        debug!(task = %self.id, %status, "simulated run ended");
    }

    /// Side effects of reaching a stage boundary.
    fn cross(&mut self, boundary: f64, env: &mut RunEnv<'_>) {
        match self.kind {
            TaskKind::Backup if boundary == SNAPSHOT_END => self.plan_upload(env),
            TaskKind::Backup if boundary == UPLOAD_END => {
                self.sync_uploads(env);
                self.write_manifest(env);
            }
            TaskKind::Backup => {
                self.purge(env);
                self.finish(self.cursor, TaskStatus::Done, None);
            }
            TaskKind::Restore => {
                let outcome = self.apply_restore(env);
                match outcome {
                    Ok(()) => self.finish(self.cursor, TaskStatus::Done, None),
                    Err(err) => self.finish(self.cursor, TaskStatus::Error, Some(err.to_string())),
                }
            }
            TaskKind::Repair => self.finish(self.cursor, TaskStatus::Done, None),
            TaskKind::Healthcheck => {
                let health = env.db.health(env.client_encryption);
                if let Work::Healthcheck {
                    hosts_checked,
                    hosts_down,
                } = &mut self.work
                {
                    *hosts_checked = health.len();
                    *hosts_down = health.iter().filter(|h| h.status != mgmt_common::HostStatus::Up).count();
                }
                *env.health = health;
                self.finish(self.cursor, TaskStatus::Done, None);
            }
        }
    }

    fn backup_location(&self) -> Option<&str> {
        match &self.params {
            TaskParams::Backup(p) => p.locations.first().map(String::as_str),
            _ => None,
        }
    }

    fn plan_upload(&mut self, env: &mut RunEnv<'_>) {
        let TaskParams::Backup(params) = &self.params else {
            return;
        };
        let keyspaces = env.db.user_keyspaces(&params.keyspaces);
        let captured = capture(env.db, &keyspaces);
        let cluster = env.cluster_id;
        let mut planned = Vec::new();
        for (host_name, host) in &env.db.hosts {
            for (ks_name, ks) in env.db.keyspaces.iter().filter(|(k, _)| keyspaces.contains(k)) {
                for (table_name, table) in &ks.tables {
                    for component in ["Data.db", "Index.db", "Statistics.db"] {
                        planned.push(format!(
                            "backup/sst/cluster/{cluster}/dc/{dc}/node/{host_name}/keyspace/{ks_name}/table/{table_name}/{id}/me-{gen}-big-{component}",
                            dc = host.datacenter,
                            id = table.id.simple(),
                            gen = host.generation,
                        ));
                    }
                }
            }
        }
        if let Work::Backup { files, uploaded, data, .. } = &mut self.work {
            *files = planned;
            *uploaded = 0;
            *data = captured;
        }
    }

    /// Upload files in proportion to progress through the upload stage.
    fn sync_uploads(&mut self, env: &mut RunEnv<'_>) {
        if self.progress < SNAPSHOT_END {
            return;
        }
        let Some(location) = self.backup_location().map(str::to_string) else {
            return;
        };
        let fraction = ((self.progress - SNAPSHOT_END) / (UPLOAD_END - SNAPSHOT_END)).clamp(0.0, 1.0);
        if let Work::Backup { files, uploaded, .. } = &mut self.work {
            let target = ((files.len() as f64 * fraction).ceil() as usize).max(1).min(files.len());
            for key in files.iter().take(target).skip(*uploaded) {
                env.objects.put(&location, key.clone(), Vec::new());
            }
            *uploaded = (*uploaded).max(target);
        }
    }

    fn write_manifest(&mut self, env: &mut RunEnv<'_>) {
        let Some(location) = self.backup_location().map(str::to_string) else {
            return;
        };
        let Work::Backup {
            tag: Some(tag),
            files,
            data,
            ..
        } = &self.work
        else {
            return;
        };
        let cluster = env.cluster_id;
        let manifest_key = format!("backup/meta/cluster/{cluster}/task_{}_tag_{tag}_manifest.json", self.id.as_str().replace('/', "_"));
        let manifest = serde_json::to_vec(files).unwrap_or_default();
        env.objects.put(&location, manifest_key, manifest);

        let schema_key = format!(
            "{}/task_{}_tag_{tag}_schema_with_internals.json",
            schema_prefix(cluster),
            self.id.as_str().replace('/', "_")
        );
        let schema: Vec<SchemaEntry> = env.db.schema_entries();
        env.objects
            .put(&location, schema_key.clone(), serde_json::to_vec(&schema).unwrap_or_default());

        env.snapshots.insert(
            tag.clone(),
            Snapshot {
                location,
                data: data.clone(),
                schema_key,
            },
        );
        info!(task = %self.id, %tag, files = files.len(), "simulated snapshot uploaded");
    }

    /// Drop snapshots beyond retention and every sstable no kept manifest
    /// references.
    fn purge(&mut self, env: &mut RunEnv<'_>) {
        let (Some(location), TaskParams::Backup(params)) = (self.backup_location().map(str::to_string), &self.params) else {
            return;
        };
        let retention = params.retention.max(1) as usize;
        let cluster = env.cluster_id;
        let manifest_prefix = format!("backup/meta/cluster/{cluster}/");
        let mut manifests = env.objects.keys(&location, &manifest_prefix);
        // Tags sort chronologically.
        manifests.sort_by_key(|k| k.rsplit("_tag_").next().map(str::to_string));
        let excess = manifests.len().saturating_sub(retention);
        for expired in manifests.drain(..excess) {
            if let Some(tag) = expired
                .rsplit("_tag_")
                .next()
                .and_then(|t| t.strip_suffix("_manifest.json"))
                && let Some(snapshot) = env.snapshots.remove(tag)
            {
                env.objects.remove(&location, &snapshot.schema_key);
            }
            env.objects.remove(&location, &expired);
        }

        let mut referenced = BTreeSet::new();
        for manifest in &manifests {
            if let Some(body) = env.objects.get(&location, manifest) {
                let files: Vec<String> = serde_json::from_slice(body).unwrap_or_default();
                referenced.extend(files);
            }
        }
        let sst_prefix = format!("backup/sst/cluster/{cluster}/");
        let mut purged = 0usize;
        for key in env.objects.keys(&location, &sst_prefix) {
            if !referenced.contains(&key) {
                env.objects.remove(&location, &key);
                purged += 1;
            }
        }
        info!(task = %self.id, purged, kept = referenced.len(), "simulated purge finished");
    }

    fn apply_restore(&self, env: &mut RunEnv<'_>) -> Result<(), MgmtError> {
        let TaskParams::Restore(params) = &self.params else {
            return Ok(());
        };
        let snapshot = env
            .snapshots
            .get(&params.snapshot_tag)
            .cloned()
            .ok_or_else(|| MgmtError::not_found(format!("snapshot {}", params.snapshot_tag)))?;

        if params.restore_schema {
            let raw = env
                .objects
                .get(&snapshot.location, &snapshot.schema_key)
                .cloned()
                .ok_or_else(|| MgmtError::not_found(format!("schema file {}", snapshot.schema_key)))?;
            let (keyspaces, tables) = create_statements(&parse_schema(&raw)?);
            for statement in keyspaces.iter().chain(tables.iter()) {
                super::cql::execute(env.db, statement)?;
            }
        }

        if params.restore_data {
            for (ks, tables) in snapshot.data.iter().filter(|(ks, _)| matches_filter(&params.keyspaces, ks)) {
                for (table, rows) in tables {
                    let target = env.db.table(ks, table)?;
                    target.rows.extend(rows.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
        }
        Ok(())
    }

    pub fn stop(&mut self, now: Instant, settings: &SimulatorSettings) -> Result<(), MgmtError> {
        match self.status {
            TaskStatus::New => Err(MgmtError::rejected("stop", format!("task {} has not started", self.id))),
            TaskStatus::Running => {
                self.status = TaskStatus::Stopping;
                self.stop_at = Some(now + settings.stop_latency);
                if let Some(run) = self.runs.last_mut() {
                    run.status = TaskStatus::Stopping;
                }
                Ok(())
            }
            _ => {
                self.pending_start = None;
                Ok(())
            }
        }
    }

    pub fn start(&mut self, now: Instant, continue_from_checkpoint: bool, settings: &SimulatorSettings) -> Result<(), MgmtError> {
        match self.status {
            TaskStatus::Stopping => Err(MgmtError::rejected("start", format!("task {} is stopping", self.id))),
            TaskStatus::Running => Ok(()),
            _ => {
                self.pending_start = Some((now + settings.start_delay, continue_from_checkpoint));
                Ok(())
            }
        }
    }

    /// Drop a scheduled start. Returns whether one was pending.
    pub fn cancel_pending(&mut self) -> bool {
        self.pending_start.take().is_some()
    }

    /// Schedule a task stopped by a suspension to continue.
    pub fn resume_at(&mut self, at: Instant) {
        if self.status != TaskStatus::Running {
            self.pending_start = Some((at, true));
        }
    }

    pub fn set_repair_control(&mut self, new_intensity: Option<f64>, new_parallel: Option<u32>) {
        if let Work::Repair { intensity, parallel, .. } = &mut self.work {
            if let Some(value) = new_intensity {
                *intensity = value;
            }
            if let Some(value) = new_parallel {
                *parallel = value;
            }
        }
    }

    pub fn history(&self, clock: &SimClock) -> Vec<TaskRun> {
        self.runs
            .iter()
            .rev()
            .map(|run| TaskRun {
                run_id: run.id.clone(),
                status: run.status,
                started_at: Some(clock.wall(run.started)),
                ended_at: run.ended.map(|at| clock.wall(at)),
                cause: run.cause.clone(),
            })
            .collect()
    }

    fn progress(&self) -> TaskProgress {
        let percent = (self.progress * 100.0).min(100.0);
        match &self.work {
            Work::Backup { files, uploaded, .. } => TaskProgress::Backup(TransferProgress {
                percent,
                bytes_done: *uploaded as u64 * 1024,
                bytes_total: files.len() as u64 * 1024,
                stage: backup_stage(self.status, self.progress),
            }),
            Work::Restore => TaskProgress::Restore(TransferProgress {
                percent,
                bytes_done: (self.progress * 1_048_576.0) as u64,
                bytes_total: 1_048_576,
                stage: BackupStage::Unknown,
            }),
            Work::Repair {
                intensity,
                parallel,
                keyspaces,
            } => {
                let count = keyspaces.len().max(1) as f64;
                let per_keyspace = keyspaces
                    .iter()
                    .enumerate()
                    .map(|(idx, ks)| {
                        let done = (self.progress * count - idx as f64).clamp(0.0, 1.0);
                        (ks.clone(), done * 100.0)
                    })
                    .collect();
                TaskProgress::Repair(RepairProgress {
                    percent,
                    keyspaces: per_keyspace,
                    intensity: *intensity,
                    parallel: *parallel,
                })
            }
            Work::Healthcheck {
                hosts_checked,
                hosts_down,
            } => TaskProgress::Healthcheck(HealthcheckProgress {
                hosts_checked: *hosts_checked,
                hosts_down: *hosts_down,
            }),
        }
    }

    pub fn snapshot(&self, cluster_id: &ClusterId, clock: &SimClock) -> TaskSnapshot {
        let run = self.runs.last();
        let progress = self.progress();
        TaskSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            cluster_id: cluster_id.clone(),
            status: self.status,
            cause: self.cause.clone(),
            started_at: run.map(|r| clock.wall(r.started)),
            ended_at: run.and_then(|r| r.ended).map(|at| clock.wall(at)),
            next_run: self.next_run.map(|at| clock.wall(at)),
            progress_text: self.render(&progress, clock),
            progress,
            snapshot_tag: self.snapshot_tag().map(str::to_string),
        }
    }

    /// Progress report in the layout of the management CLI.
    fn render(&self, progress: &TaskProgress, clock: &SimClock) -> String {
        let mut out = String::new();
        if let Some(run) = self.runs.last() {
            out.push_str(&format!("Run:\t\t{}\n", run.id));
            out.push_str(&format!("Status:\t\t{}\n", self.status));
            if let Some(cause) = &self.cause {
                out.push_str(&format!("Cause:\t\t{cause}\n"));
            }
            out.push_str(&format!("Start time:\t{}\n", clock.wall(run.started).format("%d %b %y %H:%M:%S UTC")));
            if let Some(ended) = run.ended {
                out.push_str(&format!("End time:\t{}\n", clock.wall(ended).format("%d %b %y %H:%M:%S UTC")));
            }
        } else {
            out.push_str(&format!("Status:\t\t{}\n", self.status));
        }
        out.push_str(&format!("Progress:\t{}\n", format_percent(progress.percent())));
        if let Some(tag) = self.snapshot_tag() {
            out.push_str(&format!("Snapshot Tag:\t{tag}\n"));
        }
        if let Some(transfer) = progress.as_transfer()
            && self.kind == TaskKind::Backup
        {
            out.push_str(&format!("Stage:\t\t{}\n", transfer.stage));
        }
        if let Some(repair) = progress.as_repair() {
            for (ks, pct) in &repair.keyspaces {
                out.push_str(&format!("{ks}\t{}\n", format_percent(*pct)));
            }
        }
        out
    }
}

fn backup_stage(status: TaskStatus, progress: f64) -> BackupStage {
    if status == TaskStatus::New {
        BackupStage::Unknown
    } else if progress >= 1.0 {
        BackupStage::Done
    } else if progress >= UPLOAD_END {
        BackupStage::Purge
    } else if progress >= SNAPSHOT_END {
        BackupStage::Upload
    } else {
        BackupStage::Snapshot
    }
}

/// Relative speed of a repair. Intensity 0 means unthrottled; parallel 0
/// means as many replica sets as possible.
pub(crate) fn repair_speed(intensity: f64, parallel: u32) -> f64 {
    let intensity = if intensity <= 0.0 { 4.0 } else { intensity.clamp(0.25, 4.0) };
    let parallel = match parallel {
        0 => 1.0,
        n => (0.5 + 0.25 * f64::from(n)).min(1.0),
    };
    intensity * parallel
}

/// How much longer the upload stage takes under a per-node rate limit.
pub(crate) fn upload_slowdown(rate_limit: Option<u32>) -> f64 {
    match rate_limit {
        Some(limit) if limit > 0 && limit < UNLIMITED_UPLOAD_RATE => {
            f64::from(UNLIMITED_UPLOAD_RATE) / f64::from(limit)
        }
        _ => 1.0,
    }
}

/// Relative speed of a restore. The defaults (batch 2, one node at a time)
/// run at 1.0; batch size 0 sends every sstable of a node in one batch and
/// parallel 0 restores on all nodes at once.
pub(crate) fn restore_speed(batch_size: u32, parallel: u32) -> f64 {
    let batch = match batch_size {
        0 => 2.0,
        n => (0.5 + 0.25 * f64::from(n)).min(2.0),
    };
    let parallel = match parallel {
        0 => 1.5,
        n => (0.75 + 0.25 * f64::from(n)).min(1.5),
    };
    batch * parallel
}

/// `sm_YYYYMMDDhhmmssUTC`, unique within the cluster.
fn unique_tag(env: &mut RunEnv<'_>, at: Instant) -> String {
    let mut wall = env.clock.wall(at);
    loop {
        let tag = wall.format("sm_%Y%m%d%H%M%SUTC").to_string();
        if env.tags.insert(tag.clone()) {
            return tag;
        }
        wall += chrono::Duration::seconds(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn stages_follow_progress() {
        assert_eq!(backup_stage(TaskStatus::New, 0.5), BackupStage::Unknown);
        assert_eq!(backup_stage(TaskStatus::Running, 0.0), BackupStage::Snapshot);
        assert_eq!(backup_stage(TaskStatus::Running, SNAPSHOT_END), BackupStage::Upload);
        assert_eq!(backup_stage(TaskStatus::Stopped, UPLOAD_END), BackupStage::Purge);
        assert_eq!(backup_stage(TaskStatus::Done, 1.0), BackupStage::Done);
    }

    #[test]
    fn unthrottled_repair_is_fastest() {
        assert_eq!(repair_speed(0.0, 0), 4.0);
        assert_eq!(repair_speed(1.0, 0), 1.0);
        assert!(repair_speed(0.0001, 0) < repair_speed(1.0, 0));
        assert!(repair_speed(1.0, 1) < repair_speed(1.0, 2));
    }

    #[test]
    fn rate_limit_slows_only_limited_uploads() {
        assert_eq!(upload_slowdown(None), 1.0);
        assert_eq!(upload_slowdown(Some(25)), 4.0);
        assert_eq!(upload_slowdown(Some(UNLIMITED_UPLOAD_RATE * 2)), 1.0);
    }

    #[test]
    fn restore_defaults_run_at_base_pace() {
        assert_eq!(restore_speed(2, 1), 1.0);
        assert!(restore_speed(1, 1) < restore_speed(2, 1));
        assert!(restore_speed(0, 1) > restore_speed(2, 1));
        assert!(restore_speed(2, 0) > restore_speed(2, 1));
    }

    proptest! {
        #[test]
        fn prop_restore_speed_is_positive(batch in 0u32..64, parallel in 0u32..16) {
            let speed = restore_speed(batch, parallel);
            prop_assert!(speed > 0.0);
            prop_assert!(speed <= 3.0);
        }

        #[test]
        fn prop_lower_rate_limit_never_speeds_up(a in 1u32..200, b in 1u32..200) {
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(upload_slowdown(Some(low)) >= upload_slowdown(Some(high)));
        }

        #[test]
        fn prop_repair_speed_is_bounded(intensity in -1.0f64..10.0, parallel in 0u32..16) {
            let speed = repair_speed(intensity, parallel);
            prop_assert!(speed > 0.0);
            prop_assert!(speed <= 4.0);
        }

        #[test]
        fn prop_more_intensity_never_slows_down(a in 0.25f64..4.0, b in 0.25f64..4.0, parallel in 0u32..8) {
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(repair_speed(low, parallel) <= repair_speed(high, parallel));
        }
    }
}
