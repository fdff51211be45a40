//! Operations on database nodes: service control, disk faults, nodetool.

use async_trait::async_trait;
use mgmt_common::util::shell_quote;
use mgmt_common::{MgmtError, RemoteExecutor};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

const SERVICE: &str = "scylla-server";
const DATA_DIR: &str = "/var/lib/scylla";
const BALLAST: &str = "/var/lib/scylla/ballast.img";
const SERVER_CONFIG: &str = "/etc/scylla/scylla.yaml";

#[async_trait]
pub trait NodeOps: Send + Sync {
    async fn stop_service(&self, host: &str) -> Result<(), MgmtError>;
    async fn start_service(&self, host: &str) -> Result<(), MgmtError>;
    /// Allocate a file that leaves the data volume without free space.
    async fn fill_disk(&self, host: &str) -> Result<(), MgmtError>;
    async fn clean_disk(&self, host: &str) -> Result<(), MgmtError>;
    /// Enable TLS for client connections and restart the service.
    async fn enable_client_encryption(&self, host: &str) -> Result<(), MgmtError>;
    async fn nodetool(&self, host: &str, args: &str) -> Result<String, MgmtError>;

    /// Major compaction; rewrites every sstable.
    async fn compact(&self, host: &str) -> Result<(), MgmtError> {
        self.nodetool(host, "compact").await.map(|_| ())
    }
}

/// [`NodeOps`] over one executor per host.
#[derive(Default)]
pub struct RemoteNodeOps {
    executors: BTreeMap<String, Arc<dyn RemoteExecutor>>,
}

impl RemoteNodeOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(mut self, host: impl Into<String>, executor: Arc<dyn RemoteExecutor>) -> Self {
        self.executors.insert(host.into(), executor);
        self
    }

    fn executor(&self, host: &str) -> Result<&Arc<dyn RemoteExecutor>, MgmtError> {
        self.executors
            .get(host)
            .ok_or_else(|| MgmtError::not_found(format!("node {host}")))
    }

    async fn run(&self, host: &str, command: &str) -> Result<String, MgmtError> {
        let output = self.executor(host)?.run(command).await?;
        Ok(output.stdout)
    }
}

#[async_trait]
impl NodeOps for RemoteNodeOps {
    async fn stop_service(&self, host: &str) -> Result<(), MgmtError> {
        info!(host, "stopping database service");
        self.run(host, &format!("sudo systemctl stop {SERVICE}")).await.map(|_| ())
    }

    async fn start_service(&self, host: &str) -> Result<(), MgmtError> {
        info!(host, "starting database service");
        self.run(host, &format!("sudo systemctl start {SERVICE}")).await.map(|_| ())
    }

    async fn fill_disk(&self, host: &str) -> Result<(), MgmtError> {
        info!(host, "filling data volume");
        let command = format!(
            "sudo fallocate -l $(df --output=avail -B1 {DATA_DIR} | tail -n 1) {BALLAST}"
        );
        self.run(host, &command).await.map(|_| ())
    }

    async fn clean_disk(&self, host: &str) -> Result<(), MgmtError> {
        info!(host, "removing disk ballast");
        self.run(host, &format!("sudo rm -f {BALLAST}")).await.map(|_| ())
    }

    async fn enable_client_encryption(&self, host: &str) -> Result<(), MgmtError> {
        info!(host, "enabling client encryption");
        let command = format!(
            "sudo sed -i 's/^#\\? *client_encryption_options:.*/client_encryption_options: {{enabled: true, certificate: \\/etc\\/scylla\\/db.crt, keyfile: \\/etc\\/scylla\\/db.key}}/' {SERVER_CONFIG} && sudo systemctl restart {SERVICE}"
        );
        self.run(host, &command).await.map(|_| ())
    }

    async fn nodetool(&self, host: &str, args: &str) -> Result<String, MgmtError> {
        let command = args
            .split_whitespace()
            .map(|arg| shell_quote(arg))
            .fold(String::from("nodetool"), |mut acc, arg| {
                acc.push(' ');
                acc.push_str(&arg);
                acc
            });
        self.run(host, &command).await
    }
}
