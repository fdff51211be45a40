use super::{ScenarioContext, ScenarioFuture, ScenarioMetrics, expect_done, expect_status, task_secs};
use crate::cluster::ClusterSession;
use crate::control_plane::{BackupParams, RestoreParams};
use crate::dataplane::{read_rows, table_id, verify_rows};
use crate::schema::{datacenter_from_keyspace_statement, schema_create_statements};
use crate::task::TaskHandle;
use anyhow::{Context, bail, ensure};
use mgmt_common::{MgmtError, TaskStatus};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::info;

const TABLE: &str = "standard1";

/// Every sstable key of `session`'s cluster across the backup locations.
async fn snapshot_files(ctx: &ScenarioContext, session: &ClusterSession) -> anyhow::Result<BTreeSet<String>> {
    let prefix = format!("backup/sst/cluster/{}", session.id());
    let mut files = BTreeSet::new();
    for location in ctx.locations() {
        let keys = ctx.storage.list_keys(&location, &prefix).await?;
        files.extend(keys.into_iter().map(|k| format!("{location}/{k}")));
    }
    Ok(files)
}

async fn compact_all(ctx: &ScenarioContext) -> anyhow::Result<()> {
    for host in ctx.hosts() {
        ctx.nodes.compact(&host).await?;
    }
    Ok(())
}

/// Check the uploaded files and schema of a finished backup.
async fn verify_uploaded(ctx: &ScenarioContext, session: &ClusterSession, keyspaces: &[String]) -> anyhow::Result<()> {
    let files = snapshot_files(ctx, session).await?;
    for keyspace in keyspaces {
        let id = table_id(ctx.data.as_ref(), keyspace, TABLE, true).await?;
        let needle = format!("/keyspace/{keyspace}/table/{TABLE}/{id}/");
        ensure!(
            files.iter().any(|f| f.contains(&needle)),
            "no uploaded files for {keyspace}.{TABLE}"
        );
    }

    for location in ctx.locations() {
        let (keyspace_stmts, table_stmts) = schema_create_statements(ctx.storage.as_ref(), &location, session.id()).await?;
        ensure!(!table_stmts.is_empty(), "schema file in {location} has no tables");
        for keyspace in keyspaces {
            let statement = keyspace_stmts
                .iter()
                .find(|s| s.contains(&format!("KEYSPACE {keyspace} ")))
                .with_context(|| format!("schema file in {location} lacks keyspace {keyspace}"))?;
            let datacenter = datacenter_from_keyspace_statement(statement)?;
            info!(keyspace, datacenter = ?datacenter, "keyspace found in schema file");
        }
    }
    Ok(())
}

async fn restore_data(
    ctx: &ScenarioContext,
    session: &ClusterSession,
    backup: &TaskHandle,
    batch_size: Option<u32>,
    metrics: &mut ScenarioMetrics,
) -> anyhow::Result<()> {
    let tag = backup
        .snapshot_tag()
        .await?
        .with_context(|| format!("backup {} has no snapshot tag", backup.id()))?;
    let mut params = RestoreParams::data(ctx.locations(), tag);
    if let Some(batch_size) = batch_size {
        params = params.with_batch_size(batch_size);
    }
    let restore = session.create_restore_task(params).await?;
    metrics.track(&restore);
    expect_done(&restore, ctx.step(), ctx.config.polling.task_timeout).await?;
    metrics.restore_secs = task_secs(&restore).await;
    Ok(())
}

pub(super) fn basic_backup(ctx: &ScenarioContext) -> ScenarioFuture<'_> {
    Box::pin(async move {
        let mut metrics = ScenarioMetrics::default();
        let session = ctx.session(false).await?;
        let keyspaces = ctx.config.backup.keyspaces.clone();

        let backup = session.create_backup_task(ctx.backup_params()).await?;
        metrics.track(&backup);
        expect_done(&backup, ctx.step(), ctx.config.polling.task_timeout).await?;
        metrics.backup_secs = task_secs(&backup).await;
        verify_uploaded(ctx, &session, &keyspaces).await?;

        let mut expected = Vec::new();
        for keyspace in &keyspaces {
            expected.push((keyspace.clone(), read_rows(ctx.data.as_ref(), keyspace, TABLE).await?));
            ctx.data.execute(&format!("TRUNCATE {keyspace}.{TABLE}")).await?;
        }

        restore_data(ctx, &session, &backup, None, &mut metrics).await?;
        for (keyspace, rows) in &expected {
            let mismatches = verify_rows(ctx.data.as_ref(), keyspace, TABLE, rows).await?;
            ensure!(mismatches == 0, "{mismatches} rows of {keyspace}.{TABLE} differ after restore");
        }

        session.delete().await?;
        Ok(metrics)
    })
}

pub(super) fn restore_with_task(ctx: &ScenarioContext) -> ScenarioFuture<'_> {
    Box::pin(async move {
        let mut metrics = ScenarioMetrics::default();
        let session = ctx.session(false).await?;
        let keyspaces = ctx.config.backup.keyspaces.clone();

        let params = ctx.backup_params().with_keyspaces(keyspaces.clone());
        let backup = session.create_backup_task(params).await?;
        metrics.track(&backup);
        expect_done(&backup, ctx.step(), ctx.config.polling.task_timeout).await?;
        metrics.backup_secs = task_secs(&backup).await;

        let mut expected = Vec::new();
        for keyspace in &keyspaces {
            let rows = read_rows(ctx.data.as_ref(), keyspace, TABLE).await?;
            ensure!(!rows.is_empty(), "{keyspace}.{TABLE} has no rows to back up");
            expected.push((keyspace.clone(), rows));
            ctx.data.execute(&format!("TRUNCATE {keyspace}.{TABLE}")).await?;
        }

        // Whole-node batches.
        restore_data(ctx, &session, &backup, Some(0), &mut metrics).await?;
        let mut mismatches = 0;
        for (keyspace, rows) in &expected {
            mismatches += verify_rows(ctx.data.as_ref(), keyspace, TABLE, rows).await?;
        }
        ensure!(mismatches == 0, "{mismatches} rows differ after restore");

        session.delete().await?;
        Ok(metrics)
    })
}

/// Per-node upload limit for the limited run, MiB/s.
const RATE_LIMIT: u32 = 25;

/// A rate-limited backup still finishes, and takes longer than an
/// unlimited one of the same data.
pub(super) fn backup_rate_limit(ctx: &ScenarioContext) -> ScenarioFuture<'_> {
    Box::pin(async move {
        let mut metrics = ScenarioMetrics::default();
        let session = ctx.session(false).await?;
        let keyspaces = ctx.config.backup.keyspaces.clone();

        let unlimited = session.create_backup_task(ctx.backup_params()).await?;
        metrics.track(&unlimited);
        expect_done(&unlimited, ctx.step(), ctx.config.polling.task_timeout).await?;
        let unlimited_secs = task_secs(&unlimited)
            .await
            .with_context(|| format!("backup {} has no duration", unlimited.id()))?;

        info!(rate_limit = RATE_LIMIT, "starting rate-limited backup");
        let limited = session
            .create_backup_task(ctx.backup_params().with_rate_limit(RATE_LIMIT))
            .await?;
        metrics.track(&limited);
        expect_done(&limited, ctx.step(), ctx.config.polling.task_timeout).await?;
        let limited_secs = task_secs(&limited)
            .await
            .with_context(|| format!("backup {} has no duration", limited.id()))?;
        metrics.backup_secs = Some(limited_secs);
        info!(unlimited_secs, limited_secs, "backup durations");

        ensure!(
            limited_secs > unlimited_secs,
            "backup limited to {RATE_LIMIT} MiB/s took {limited_secs:.0}s, unlimited took {unlimited_secs:.0}s"
        );
        verify_uploaded(ctx, &session, &keyspaces).await?;

        session.delete().await?;
        Ok(metrics)
    })
}

pub(super) fn backup_location_with_path(ctx: &ScenarioContext) -> ScenarioFuture<'_> {
    Box::pin(async move {
        let session = ctx.session(false).await?;
        let locations = ctx
            .locations()
            .into_iter()
            .map(|l| format!("{l}/path_testing/"))
            .collect();
        match session.create_backup_task(BackupParams::new(locations)).await {
            Err(MgmtError::Rejected { reason, .. }) => info!(%reason, "location with a path rejected"),
            Err(other) => bail!("expected a rejection, got: {other}"),
            Ok(task) => bail!("backup task {} was created for a location with a path", task.id()),
        }
        Ok(ScenarioMetrics::default())
    })
}

/// Stop a backup mid-upload, then rerun it from scratch and check that the
/// files left behind by the stopped run are gone.
pub(super) fn purge_orphans(ctx: &ScenarioContext) -> ScenarioFuture<'_> {
    Box::pin(async move {
        let mut metrics = ScenarioMetrics::default();
        let session = ctx.session(false).await?;
        // Fresh sstable names, so nothing is shared with earlier backups.
        compact_all(ctx).await?;
        let before = snapshot_files(ctx, &session).await?;

        let mut params = ctx.backup_params();
        params.retention = 1;
        let backup = session.create_backup_task(params).await?;
        metrics.track(&backup);
        let uploading = backup
            .wait_for_uploading_stage(Duration::from_secs(5), ctx.config.polling.status_timeout)
            .await?;
        ensure!(uploading, "backup {} never reached the upload stage", backup.id());
        backup.stop().await?;
        expect_status(&backup, &[TaskStatus::Stopped], Duration::from_secs(5), ctx.config.polling.status_timeout).await?;

        let stopped = snapshot_files(ctx, &session).await?;
        let orphans: BTreeSet<_> = stopped.difference(&before).cloned().collect();
        ensure!(!orphans.is_empty(), "stopping the backup left no orphan files");
        info!(orphans = orphans.len(), "orphan files after stop");

        compact_all(ctx).await?;
        backup.start(false).await?;
        expect_done(&backup, ctx.step(), ctx.config.polling.task_timeout).await?;

        let after = snapshot_files(ctx, &session).await?;
        let remaining = after.intersection(&orphans).count();
        ensure!(remaining == 0, "{remaining} orphan files were not purged");
        metrics.backup_secs = task_secs(&backup).await;
        Ok(metrics)
    })
}
