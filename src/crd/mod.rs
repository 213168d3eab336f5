//! # Custom Resource Definitions
//!
//! CRD types for the virtual cluster controller.
//!
//! ## Module Structure
//!
//! - `cluster.rs` - The Cluster resource: spec (user intent) and status
//!   (engine-owned observations)
//! - `policy.rs` - VirtualClusterPolicy, the cluster-scoped mode constraint
//!   bound to namespaces via label

mod cluster;
mod policy;

// Re-export all public types
pub use cluster::{
    Cluster, ClusterMode, ClusterPhase, ClusterSpec, ClusterStatus, Condition, ExposeConfig,
    IngressConfig,
};
pub use policy::{VirtualClusterPolicy, VirtualClusterPolicySpec, POLICY_NAME_LABEL};
