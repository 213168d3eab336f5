//! # VirtualClusterPolicy CRD
//!
//! Cluster-scoped constraint object. A namespace opts into a policy via the
//! `policy.virtual-clusters.microscaler.io/policy-name` label; every Cluster
//! in a bound namespace must use the policy's allowed mode. The controller
//! treats policies as read-only.

use crate::crd::cluster::ClusterMode;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label on a Namespace naming the governing VirtualClusterPolicy.
pub const POLICY_NAME_LABEL: &str = "policy.virtual-clusters.microscaler.io/policy-name";

/// VirtualClusterPolicy Custom Resource Definition
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "virtual-clusters.microscaler.io",
    version = "v1alpha1",
    kind = "VirtualClusterPolicy",
    shortname = "vcp",
    printcolumn = r#"{"name":"AllowedMode", "type":"string", "jsonPath":".spec.allowedMode"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualClusterPolicySpec {
    /// The single mode allowed for Clusters in bound namespaces.
    #[serde(default)]
    pub allowed_mode: ClusterMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_defaults_to_shared() {
        let spec: VirtualClusterPolicySpec = serde_json::from_str("{}").unwrap();
        assert_eq!(spec.allowed_mode, ClusterMode::Shared);
    }

    #[test]
    fn test_policy_mode_roundtrip() {
        let spec: VirtualClusterPolicySpec =
            serde_json::from_str(r#"{"allowedMode":"virtual"}"#).unwrap();
        assert_eq!(spec.allowed_mode, ClusterMode::Virtual);
    }
}
