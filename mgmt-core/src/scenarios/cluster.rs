use super::{ScenarioContext, ScenarioFuture, ScenarioMetrics};
use crate::control_plane::ClusterUpdate;
use anyhow::{Context, ensure};
use mgmt_common::{HostHealth, HostRestStatus, HostSsl, HostStatus, TaskStatus};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Long enough for the recurring health check to run at least twice.
const HEALTH_SETTLE: Duration = Duration::from_secs(40);

fn host_health<'a>(health: &'a [HostHealth], host: &str) -> anyhow::Result<&'a HostHealth> {
    health
        .iter()
        .find(|h| h.host == host)
        .with_context(|| format!("no health entry for host {host}"))
}

/// Health of a stopped node turns DOWN and comes back once it restarts.
pub(super) fn cluster_healthcheck(ctx: &ScenarioContext) -> ScenarioFuture<'_> {
    Box::pin(async move {
        let session = ctx.session(false).await?;
        sleep(HEALTH_SETTLE).await;
        let health = session.hosts_health().await?;
        for entry in &health {
            ensure!(
                entry.status == HostStatus::Up && entry.rest_status == HostRestStatus::Up,
                "host {} is not healthy before the fault: {:?}",
                entry.host,
                entry.status
            );
        }

        let host = ctx.target_host()?;
        ctx.nodes.stop_service(&host).await?;
        let outcome = async {
            let next_run = session.healthcheck_task().await?.next_run().await?;
            info!(host, ?next_run, "waiting for the health check to notice");
            sleep(HEALTH_SETTLE).await;
            let health = session.hosts_health().await?;
            let entry = host_health(&health, &host)?;
            ensure!(
                entry.status == HostStatus::Down,
                "stopped host {host} reports {:?}",
                entry.status
            );
            ensure!(
                entry.rest_status == HostRestStatus::Down,
                "stopped host {host} reports REST {:?}",
                entry.rest_status
            );
            Ok::<_, anyhow::Error>(())
        }
        .await;
        if let Err(err) = ctx.nodes.start_service(&host).await {
            warn!(host, error = %err, "restarting the database service failed");
            outcome?;
            return Err(err.into());
        }
        outcome?;

        session.delete().await?;
        Ok(ScenarioMetrics::default())
    })
}

/// Rename, delete and register again.
pub(super) fn cluster_crud(ctx: &ScenarioContext) -> ScenarioFuture<'_> {
    Box::pin(async move {
        let session = ctx.session(false).await?;
        let original = session.name();
        let renamed = format!("{original}_renamed");
        session.rename(renamed.as_str()).await?;
        ensure!(session.name() == renamed, "session still named {}", session.name());
        let found = ctx
            .manager
            .get_cluster(&renamed)
            .await?
            .with_context(|| format!("no cluster named {renamed} after rename"))?;
        ensure!(found.id() == session.id(), "{renamed} resolves to cluster {}", found.id());
        ensure!(
            ctx.manager.get_cluster(&original).await?.is_none(),
            "old name {original} still resolves"
        );

        session.delete().await?;
        ensure!(
            ctx.manager.get_cluster(&renamed).await?.is_none(),
            "deleted cluster {renamed} is still listed"
        );

        let again = ctx.manager.add_cluster(&ctx.cluster_spec()).await?;
        info!(cluster = %again.id(), "cluster registered again");
        again.delete().await?;
        Ok(ScenarioMetrics::default())
    })
}

/// Hosts report SSL once encryption is on and the cluster is told about it.
pub(super) fn client_encryption(ctx: &ScenarioContext) -> ScenarioFuture<'_> {
    Box::pin(async move {
        let session = ctx.session(false).await?;
        let health = session.hosts_health().await?;
        ensure!(
            health.iter().all(|h| h.ssl == HostSsl::Off),
            "client encryption is already on for some hosts"
        );
        let check = session.healthcheck_task().await?;

        for host in ctx.hosts() {
            ctx.nodes.enable_client_encryption(&host).await?;
        }
        session
            .update(&ClusterUpdate {
                client_encryption: Some(true),
                force_non_ssl_session_port: Some(true),
                ..ClusterUpdate::default()
            })
            .await?;
        sleep(Duration::from_secs(90)).await;

        let done = check
            .wait_for_status(&[TaskStatus::Done], Duration::from_secs(5), Duration::from_secs(240))
            .await?;
        ensure!(done, "health check {} did not finish after enabling encryption", check.id());
        sleep(HEALTH_SETTLE).await;

        let health = session.hosts_health().await?;
        for entry in &health {
            ensure!(entry.ssl == HostSsl::On, "host {} reports SSL {:?}", entry.host, entry.ssl);
            ensure!(
                entry.status == HostStatus::Up,
                "host {} is {:?} over an encrypted session",
                entry.host,
                entry.status
            );
        }
        session.delete().await?;
        Ok(ScenarioMetrics::default())
    })
}
