//! Task lifecycle orchestration for a cluster-management control plane.
//!
//! The control plane is reached through the capability traits in
//! [`control_plane`]. On top of them sit the [`StatusPoller`], per-task
//! [`TaskHandle`]s, cluster sessions, the scoped
//! [`SuspendResumeCoordinator`] and the end-to-end scenarios. The
//! [`sim::SimulatedManager`] backs everything in-process.

pub mod cluster;
pub mod control_plane;
pub mod dataplane;
pub mod events;
pub mod node_ops;
pub mod poller;
pub mod scenarios;
pub mod schema;
pub mod sim;
pub mod storage;
pub mod suspend;
pub mod task;

#[cfg(test)]
mod testing;

pub use cluster::{ClusterSession, ManagerClient};
pub use control_plane::{
    BackupParams, ClusterInfo, ClusterRegistry, ClusterSpec, ClusterUpdate, ControlPlane, HealthQuery,
    RepairControl, RepairParams, RestoreParams, SessionControl, TaskControl, TaskParams, TaskProgress,
    TaskSnapshot,
};
pub use dataplane::DataPlane;
pub use events::EventBus;
pub use node_ops::NodeOps;
pub use poller::{PollOutcome, StatusPoller};
pub use scenarios::{ScenarioContext, ScenarioDriver, ScenarioMetrics, ScenarioReport};
pub use sim::SimulatedManager;
pub use storage::ObjectStore;
pub use suspend::{SuspendResumeCoordinator, SuspensionToken, SuspensionWindow};
pub use task::TaskHandle;
