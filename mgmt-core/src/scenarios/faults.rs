use super::{ScenarioContext, ScenarioFuture, ScenarioMetrics, expect_done, expect_status, task_secs};
use crate::control_plane::RestoreParams;
use anyhow::{Context, ensure};
use mgmt_common::TaskStatus;
use std::time::Duration;
use tracing::{info, warn};

const NO_SPACE: &str = "not enough disk space";

/// Run `body` with the disk of `host` full, cleaning it up afterwards.
async fn with_full_disk<F, Fut>(ctx: &ScenarioContext, host: &str, body: F) -> anyhow::Result<ScenarioMetrics>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<ScenarioMetrics>>,
{
    ctx.nodes.fill_disk(host).await?;
    let outcome = body().await;
    if let Err(err) = ctx.nodes.clean_disk(host).await {
        warn!(host, error = %err, "cleaning the filled disk failed");
        if outcome.is_ok() {
            return Err(err.into());
        }
    }
    outcome
}

/// A restore onto a node without free space fails with a clear cause.
pub(super) fn enospc_before_restore(ctx: &ScenarioContext) -> ScenarioFuture<'_> {
    Box::pin(async move {
        let mut metrics = ScenarioMetrics::default();
        let session = ctx.session(false).await?;
        let params = ctx
            .backup_params()
            .with_keyspaces(ctx.config.backup.keyspaces.clone());
        let backup = session.create_backup_task(params).await?;
        metrics.track(&backup);
        expect_done(&backup, ctx.step(), ctx.config.polling.task_timeout).await?;
        metrics.backup_secs = task_secs(&backup).await;
        let tag = backup
            .snapshot_tag()
            .await?
            .with_context(|| format!("backup {} has no snapshot tag", backup.id()))?;

        let host = ctx.target_host()?;
        with_full_disk(ctx, &host, || async {
            let restore = session
                .create_restore_task(RestoreParams::data(ctx.locations(), tag))
                .await?;
            metrics.track(&restore);
            let status = restore
                .wait_and_get_final_status(Duration::from_secs(30), ctx.config.polling.task_timeout)
                .await;
            ensure!(
                status == TaskStatus::Error,
                "restore {} ended in {status} although {host} has no free space",
                restore.id()
            );
            let report = restore.progress_text().await?;
            ensure!(
                report.to_lowercase().contains(NO_SPACE),
                "restore failed without mentioning disk space: {report}"
            );
            info!(task = %restore.id(), "restore failed on the full disk as expected");
            Ok(metrics)
        })
        .await
    })
}

/// A backup stopped after its snapshot finishes on a node that then runs
/// out of space, since the snapshot already holds its files.
pub(super) fn enospc_during_backup(ctx: &ScenarioContext) -> ScenarioFuture<'_> {
    Box::pin(async move {
        let mut metrics = ScenarioMetrics::default();
        let session = ctx.session(false).await?;
        let backup = session.create_backup_task(ctx.backup_params()).await?;
        metrics.track(&backup);
        let uploading = backup
            .wait_for_uploading_stage(Duration::from_secs(5), ctx.config.polling.status_timeout)
            .await?;
        ensure!(uploading, "backup {} never reached the upload stage", backup.id());
        backup.stop().await?;
        expect_status(&backup, &[TaskStatus::Stopped], Duration::from_secs(5), ctx.config.polling.status_timeout).await?;

        let host = ctx.target_host()?;
        with_full_disk(ctx, &host, || async {
            backup.start(true).await?;
            expect_done(&backup, ctx.step(), ctx.config.polling.task_timeout)
                .await
                .context("backup failed on a node without free space despite its snapshot")?;
            metrics.backup_secs = task_secs(&backup).await;
            Ok(metrics)
        })
        .await
    })
}
