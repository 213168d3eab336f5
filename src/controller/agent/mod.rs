//! # Agent Provisioning
//!
//! An agent connects the virtual control plane to schedulable capacity. Two
//! strategies exist, selected by the Cluster's mode:
//!
//! - `virtual`: a full agent emulating a node inside the cluster namespace
//! - `shared`: a kubelet-shim workload that schedules pods onto host nodes,
//!   optionally mirroring real host node kubelet/webhook surfaces (which
//!   requires per-cluster port allocation)
//!
//! Both strategies converge their own resources through the same
//! create-or-update machinery as the rest of the controller.

mod ports;
mod shared_node;
mod virtual_node;

pub use ports::{PortAllocator, PortAllocatorError};
pub use shared_node::SharedNodeAgent;
pub use virtual_node::VirtualNodeAgent;

use crate::controller::safe_concat_name_with_prefix;
use crate::crd::Cluster;
use kube::{Client, ResourceExt};

/// Suffix identifying shared-node agent resources (and the service account
/// bound into the cluster-scoped roles).
pub const SHARED_NODE_AGENT_NAME: &str = "kubelet";

/// Suffix identifying virtual-node agent resources.
pub const VIRTUAL_NODE_AGENT_NAME: &str = "agent";

pub const DEFAULT_KUBELET_PORT: i32 = 10250;
pub const DEFAULT_WEBHOOK_PORT: i32 = 9443;

/// Inputs shared by both agent strategies.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub cluster: Cluster,
    /// Assigned address of the cluster service, the agent's join endpoint
    pub service_ip: String,
    pub token: String,
    pub image: String,
    pub image_pull_policy: String,
}

/// The closed set of agent strategies.
#[derive(Debug)]
pub enum AgentEnsurer {
    Virtual(VirtualNodeAgent),
    Shared(SharedNodeAgent),
}

impl AgentEnsurer {
    /// Converge the workload and service objects of the selected strategy.
    pub async fn ensure_resources(&self, client: &Client) -> anyhow::Result<()> {
        match self {
            AgentEnsurer::Virtual(agent) => agent.ensure_resources(client).await,
            AgentEnsurer::Shared(agent) => agent.ensure_resources(client).await,
        }
    }
}

/// Name of the service account a shared-node agent runs as. Also the subject
/// bound into the cluster-scoped role bindings.
#[must_use]
pub fn agent_service_account_name(cluster_name: &str) -> String {
    safe_concat_name_with_prefix(&[cluster_name, SHARED_NODE_AGENT_NAME])
}

/// Configuration identity scoping port allocations to one cluster.
#[must_use]
pub fn config_identity(cluster: &Cluster) -> String {
    format!(
        "{}/{}",
        cluster.namespace().unwrap_or_else(|| "default".to_string()),
        cluster.name_any()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ClusterSpec;

    #[test]
    fn test_agent_service_account_name() {
        assert_eq!(agent_service_account_name("tenant-a"), "vc-tenant-a-kubelet");
    }

    #[test]
    fn test_config_identity() {
        let mut cluster = Cluster::new("tenant-a", ClusterSpec::default());
        cluster.metadata.namespace = Some("tenants".to_string());
        assert_eq!(config_identity(&cluster), "tenants/tenant-a");
    }
}
