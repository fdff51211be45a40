use super::{ScenarioContext, ScenarioFuture, ScenarioMetrics, expect_done};
use crate::control_plane::{RepairControl, RepairParams};
use anyhow::{Context, ensure};
use tracing::info;

const NETWORK_KEYSPACE: &str = "mgmt_network_strategy_ks";
const LOCAL_KEYSPACE: &str = "mgmt_local_strategy_ks";
const PERCENT_STEP: f64 = 20.0;

/// Walk a repair through 20% steps, changing its pace before each one.
pub(super) fn repair_control(ctx: &ScenarioContext) -> ScenarioFuture<'_> {
    Box::pin(async move {
        let mut metrics = ScenarioMetrics::default();
        let session = ctx.session(false).await?;
        let timeout = ctx.config.polling.repair_timeout;
        let step = ctx.step();

        let params = RepairParams {
            keyspaces: ctx.config.backup.keyspaces.clone(),
            ..RepairParams::default()
        };
        let repair = session.create_repair_task(params).await?;
        metrics.track(&repair);

        let controls = [
            RepairControl::intensity(0.0001),
            RepairControl::intensity(0.0),
            RepairControl::parallel(1),
            RepairControl {
                intensity: Some(2.0),
                parallel: Some(1),
            },
        ];
        let mut threshold = PERCENT_STEP;
        repair.wait_for_percentage(threshold, step, timeout).await?;
        for control in &controls {
            threshold += PERCENT_STEP;
            info!(intensity = ?control.intensity, parallel = ?control.parallel, threshold, "changing repair pace");
            session.control_repair(control).await?;
            repair.wait_for_percentage(threshold, step, timeout).await?;
        }
        expect_done(&repair, step, timeout).await?;

        session.delete().await?;
        Ok(metrics)
    })
}

/// A replicated keyspace is repaired in full, a LocalStrategy one not at all.
pub(super) fn repair_multiple_keyspace_types(ctx: &ScenarioContext) -> ScenarioFuture<'_> {
    Box::pin(async move {
        let mut metrics = ScenarioMetrics::default();
        let session = ctx.session(false).await?;
        let datacenter = ctx
            .config
            .cluster
            .nodes
            .first()
            .map_or("dc1", |n| n.datacenter.as_str());

        let keyspaces = [
            (
                NETWORK_KEYSPACE,
                format!("{{'class': 'NetworkTopologyStrategy', '{datacenter}': '2'}}"),
            ),
            (LOCAL_KEYSPACE, "{'class': 'LocalStrategy'}".to_string()),
        ];
        for (name, replication) in &keyspaces {
            ctx.data
                .execute(&format!(
                    "CREATE KEYSPACE IF NOT EXISTS {name} WITH replication = {replication}"
                ))
                .await?;
            // Keyspaces without tables are left out of repairs.
            ctx.data
                .execute(&format!(
                    "CREATE TABLE IF NOT EXISTS {name}.example_table (key text PRIMARY KEY, value text)"
                ))
                .await?;
        }

        let repair = session.create_repair_task(RepairParams::default()).await?;
        metrics.track(&repair);
        expect_done(&repair, ctx.step(), ctx.config.polling.repair_timeout).await?;

        let progress = repair.per_keyspace_progress().await?;
        let percent = progress
            .get(NETWORK_KEYSPACE)
            .copied()
            .with_context(|| format!("keyspace {NETWORK_KEYSPACE} was not repaired"))?;
        ensure!(
            percent >= 100.0,
            "repair of keyspace {NETWORK_KEYSPACE} stopped at {percent}%"
        );
        ensure!(
            !progress.contains_key(LOCAL_KEYSPACE),
            "LocalStrategy keyspace {LOCAL_KEYSPACE} was included in the repair"
        );

        session.delete().await?;
        Ok(metrics)
    })
}
