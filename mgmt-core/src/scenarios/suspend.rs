use super::{ScenarioContext, ScenarioFuture, ScenarioMetrics, expect_status};
use crate::cluster::ClusterSession;
use crate::control_plane::RepairParams;
use crate::suspend::{SuspendResumeCoordinator, SuspensionWindow};
use crate::task::TaskHandle;
use anyhow::{Context, ensure};
use mgmt_common::{TaskKind, TaskStatus};
use std::time::Duration;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::info;

const RUNNING_STEP: Duration = Duration::from_secs(5);
const STOPPED_STEP: Duration = Duration::from_secs(2);
const DONE_TIMEOUT: Duration = Duration::from_secs(1200);

async fn start_task(ctx: &ScenarioContext, session: &ClusterSession, kind: TaskKind) -> anyhow::Result<TaskHandle> {
    let task = match kind {
        TaskKind::Repair => {
            let params = RepairParams {
                keyspaces: ctx.config.backup.keyspaces.clone(),
                ..RepairParams::default()
            };
            session.create_repair_task(params).await?
        }
        _ => session.create_backup_task(ctx.backup_params()).await?,
    };
    expect_status(&task, &[TaskStatus::Running], RUNNING_STEP, ctx.config.polling.status_timeout).await?;
    Ok(task)
}

/// Suspend while the task runs, resume with start on exit, expect DONE.
async fn suspend_and_resume(ctx: &ScenarioContext, kind: TaskKind) -> anyhow::Result<ScenarioMetrics> {
    let mut metrics = ScenarioMetrics::default();
    // A fresh registration, so the task runs from scratch.
    let session = ctx.session(true).await?;
    let task = start_task(ctx, &session, kind).await?;
    metrics.track(&task);

    let coordinator = SuspendResumeCoordinator::new(&session);
    let window = SuspensionWindow::new().start_tasks_on_exit(true);
    coordinator
        .scoped(window, || async {
            coordinator
                .await_stopped(&[&task], ctx.config.suspend.stop_timeout)
                .await?;
            ensure!(session.is_suspended().await?, "cluster {} is not suspended", session.id());
            Ok::<_, anyhow::Error>(())
        })
        .await?;

    expect_status(&task, &[TaskStatus::Done], Duration::from_secs(10), DONE_TIMEOUT).await?;
    ensure!(task.anomalies() == 0, "task {} made {} unexpected transitions", task.id(), task.anomalies());
    Ok(metrics)
}

pub(super) fn suspend_resume_backup(ctx: &ScenarioContext) -> ScenarioFuture<'_> {
    Box::pin(suspend_and_resume(ctx, TaskKind::Backup))
}

pub(super) fn suspend_resume_repair(ctx: &ScenarioContext) -> ScenarioFuture<'_> {
    Box::pin(suspend_and_resume(ctx, TaskKind::Repair))
}

/// Nested suspend and a resume that does not start tasks.
pub(super) fn suspend_without_start(ctx: &ScenarioContext) -> ScenarioFuture<'_> {
    Box::pin(async move {
        let mut metrics = ScenarioMetrics::default();
        let session = ctx.session(true).await?;
        let task = start_task(ctx, &session, TaskKind::Backup).await?;
        metrics.track(&task);

        let coordinator = SuspendResumeCoordinator::new(&session);
        let window = SuspensionWindow::new().start_tasks_on_exit(false);
        coordinator
            .scoped(window, || async {
                session.suspend(true).await?;
                expect_status(&task, &[TaskStatus::Stopped], Duration::from_secs(10), ctx.config.polling.status_timeout)
                    .await?;
                session.resume(false).await?;
                info!(task = %task.id(), "checking the task is not started");
                sleep(ctx.config.suspend.window).await;
                let status = task.status().await?;
                ensure!(
                    status == TaskStatus::Stopped,
                    "task {} did not stay STOPPED, it reached {status}",
                    task.id()
                );
                Ok::<_, anyhow::Error>(())
            })
            .await?;
        Ok(metrics)
    })
}

/// Timed suspension that starts stopped tasks when it elapses.
pub(super) fn suspend_auto_resume_after_duration(ctx: &ScenarioContext) -> ScenarioFuture<'_> {
    Box::pin(async move {
        let mut metrics = ScenarioMetrics::default();
        let session = ctx.session(true).await?;
        let task = start_task(ctx, &session, TaskKind::Backup).await?;
        metrics.track(&task);

        let slack = ctx.config.suspend.slack;
        let coordinator = SuspendResumeCoordinator::new(&session);
        let window = SuspensionWindow::new()
            .duration(ctx.config.suspend.window)
            .on_resume_start_tasks(true)
            .start_tasks_on_exit(false);
        let token = coordinator.acquire(window).await?;
        let resume_at = token
            .scheduled_resume_at()
            .context("timed suspension has no scheduled resume")?;

        let held = async {
            expect_status(&task, &[TaskStatus::Stopped], STOPPED_STEP, ctx.config.suspend.stop_timeout).await?;
            let hold = resume_at
                .checked_sub(slack)
                .map_or(Duration::ZERO, |until| until.saturating_duration_since(Instant::now()));
            coordinator.hold_stopped(&task, hold, STOPPED_STEP).await?;
            sleep_until(resume_at + slack).await;
            Ok::<_, anyhow::Error>(())
        }
        .await;
        coordinator.release(token).await?;
        held?;

        expect_status(&task, &[TaskStatus::Done], Duration::from_secs(10), DONE_TIMEOUT)
            .await
            .context("task did not finish after the suspension elapsed")?;
        Ok(metrics)
    })
}

/// An explicit resume before the duration elapses cancels the scheduled
/// start, so the task stays stopped past the window.
pub(super) fn suspend_resume_before_duration(ctx: &ScenarioContext) -> ScenarioFuture<'_> {
    Box::pin(async move {
        let mut metrics = ScenarioMetrics::default();
        let session = ctx.session(true).await?;
        let task = start_task(ctx, &session, TaskKind::Repair).await?;
        metrics.track(&task);

        let coordinator = SuspendResumeCoordinator::new(&session);
        let window = SuspensionWindow::new()
            .duration(ctx.config.suspend.window)
            .on_resume_start_tasks(true)
            .start_tasks_on_exit(false);
        let token = coordinator.acquire(window).await?;
        let resume_at = token
            .scheduled_resume_at()
            .context("timed suspension has no scheduled resume")?;
        let stopped =
            expect_status(&task, &[TaskStatus::Stopped], STOPPED_STEP, ctx.config.suspend.stop_timeout).await;
        coordinator.release(token).await?;
        stopped?;

        let status = task.status().await?;
        ensure!(status == TaskStatus::Stopped, "task {} left STOPPED on resume: {status}", task.id());
        sleep_until(resume_at + ctx.config.suspend.slack).await;
        let status = task.status().await?;
        ensure!(
            status == TaskStatus::Stopped,
            "task {} started after the cancelled suspension window: {status}",
            task.id()
        );
        Ok(metrics)
    })
}
