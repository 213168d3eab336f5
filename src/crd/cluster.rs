//! # Cluster CRD
//!
//! The `Cluster` custom resource describes a desired nested (virtual)
//! Kubernetes control plane running on top of the host cluster.
//!
//! The spec is user-supplied intent and is never mutated by the controller.
//! The status is engine-owned: phase, conditions, resolved host version,
//! resolved CIDRs and allocated ports are written only by the reconciler.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Cluster Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: virtual-clusters.microscaler.io/v1alpha1
/// kind: Cluster
/// metadata:
///   name: tenant-a
///   namespace: tenants
/// spec:
///   mode: shared
///   servers: 1
///   expose:
///     ingress:
///       ingressClassName: nginx
/// ```
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "virtual-clusters.microscaler.io",
    version = "v1alpha1",
    kind = "Cluster",
    namespaced,
    status = "ClusterStatus",
    shortname = "vc",
    printcolumn = r#"{"name":"Mode", "type":"string", "jsonPath":".spec.mode"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Provisioning mode for the virtual cluster agent.
    /// `shared` mirrors host node surfaces, `virtual` emulates a node inside
    /// the cluster namespace.
    #[serde(default)]
    pub mode: ClusterMode,
    /// Kubernetes version for the virtual control plane.
    /// If unset the host version is resolved once and recorded in status.
    #[serde(default)]
    pub version: Option<String>,
    /// Number of server replicas (ordered identity). Defaults to 1.
    #[serde(default)]
    pub servers: Option<i32>,
    /// Pod address range for the virtual cluster.
    /// Defaulted once in status from mode-specific constants if unset.
    #[serde(default, rename = "clusterCIDR")]
    pub cluster_cidr: Option<String>,
    /// Service address range for the virtual cluster.
    /// Defaulted once in status (with host lookup in shared mode) if unset.
    #[serde(default, rename = "serviceCIDR")]
    pub service_cidr: Option<String>,
    /// Name of an existing Secret holding the join token under the `token`
    /// key. If unset a random token is generated and stored alongside the
    /// cluster.
    #[serde(default)]
    pub token_secret_ref: Option<String>,
    /// Mirror real host node kubelet/webhook surfaces (shared mode only).
    /// Enables per-cluster port allocation recorded in status.
    #[serde(default)]
    pub mirror_host_nodes: bool,
    /// Exposure configuration. Absence deletes any existing ingress.
    #[serde(default)]
    pub expose: Option<ExposeConfig>,
    /// Extra environment variables passed to server and agent workloads.
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,
}

/// Provisioning mode, restricted by `VirtualClusterPolicy` when the
/// namespace is policy-governed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    #[default]
    Shared,
    Virtual,
}

impl fmt::Display for ClusterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterMode::Shared => f.write_str("shared"),
            ClusterMode::Virtual => f.write_str("virtual"),
        }
    }
}

/// Exposure configuration for the virtual API server.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExposeConfig {
    /// Ingress exposure. Absence deletes any existing ingress object.
    #[serde(default)]
    pub ingress: Option<IngressConfig>,
}

/// Ingress exposure settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressConfig {
    #[serde(default)]
    pub ingress_class_name: Option<String>,
    /// Host rule for the ingress. Defaults to `<cluster>.<namespace>`.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// Lifecycle phase of a Cluster. Monotonic except for explicit reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ClusterPhase {
    #[default]
    Unknown,
    Provisioning,
    Running,
    Failed,
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterPhase::Unknown => f.write_str("Unknown"),
            ClusterPhase::Provisioning => f.write_str("Provisioning"),
            ClusterPhase::Running => f.write_str("Running"),
            ClusterPhase::Failed => f.write_str("Failed"),
        }
    }
}

/// Status of the Cluster resource, owned by the reconciliation engine.
///
/// Resolved values (host version, CIDRs) are sticky: once set they are never
/// overwritten for the lifetime of the object.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub phase: ClusterPhase,
    /// Conditions represent the latest available observations
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Resolved host Kubernetes version, set once when spec.version is unset
    #[serde(default)]
    pub host_version: Option<String>,
    /// Resolved pod address range, defaulted once
    #[serde(default, rename = "clusterCIDR")]
    pub cluster_cidr: Option<String>,
    /// Resolved service address range, defaulted once
    #[serde(default, rename = "serviceCIDR")]
    pub service_cidr: Option<String>,
    /// Name of the governing VirtualClusterPolicy, mirrors the namespace
    /// label. Empty when the namespace is not policy-bound.
    #[serde(default)]
    pub policy_name: Option<String>,
    /// Allocated kubelet port, present only with host-node mirroring
    #[serde(default)]
    pub kubelet_port: Option<i32>,
    /// Allocated webhook port, present only with host-node mirroring
    #[serde(default)]
    pub webhook_port: Option<i32>,
}

/// Condition represents a status condition for the resource
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of condition (True, False, Unknown)
    pub status: String,
    /// Last transition time
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Reason for condition
    #[serde(default)]
    pub reason: Option<String>,
    /// Message describing condition
    #[serde(default)]
    pub message: Option<String>,
}

impl ClusterStatus {
    /// Set a condition, preserving the transition time when the status value
    /// is unchanged so repeated reconciliations do not churn timestamps.
    pub fn set_condition(&mut self, mut condition: Condition) {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            } else if condition.last_transition_time.is_none() {
                condition.last_transition_time = Some(chrono::Utc::now().to_rfc3339());
            }
            *existing = condition;
        } else {
            if condition.last_transition_time.is_none() {
                condition.last_transition_time = Some(chrono::Utc::now().to_rfc3339());
            }
            self.conditions.push(condition);
        }
    }

    /// Look up a condition by type.
    #[must_use]
    pub fn condition(&self, r#type: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.r#type == r#type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(status: &str, reason: &str) -> Condition {
        Condition {
            r#type: "Ready".to_string(),
            status: status.to_string(),
            last_transition_time: None,
            reason: Some(reason.to_string()),
            message: None,
        }
    }

    #[test]
    fn test_mode_serialization() {
        assert_eq!(
            serde_json::to_string(&ClusterMode::Shared).unwrap(),
            "\"shared\""
        );
        assert_eq!(
            serde_json::to_string(&ClusterMode::Virtual).unwrap(),
            "\"virtual\""
        );
        assert_eq!(ClusterMode::default(), ClusterMode::Shared);
    }

    #[test]
    fn test_set_condition_preserves_transition_time() {
        let mut status = ClusterStatus::default();
        status.set_condition(ready("False", "Provisioning"));

        let first_transition = status
            .condition("Ready")
            .and_then(|c| c.last_transition_time.clone());
        assert!(first_transition.is_some());

        // Same status value, different reason: transition time must not move
        status.set_condition(ready("False", "ValidationFailed"));
        let second = status.condition("Ready").unwrap();
        assert_eq!(second.last_transition_time, first_transition);
        assert_eq!(second.reason.as_deref(), Some("ValidationFailed"));

        // Status flip: transition time is refreshed
        status.set_condition(ready("True", "Provisioned"));
        let third = status.condition("Ready").unwrap();
        assert_eq!(third.status, "True");
        assert!(third.last_transition_time.is_some());
    }

    #[test]
    fn test_spec_defaults() {
        let spec: ClusterSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(spec.mode, ClusterMode::Shared);
        assert!(spec.version.is_none());
        assert!(spec.cluster_cidr.is_none());
        assert!(!spec.mirror_host_nodes);
        assert!(spec.expose.is_none());
    }

    #[test]
    fn test_cidr_fields_use_upper_acronym_keys() {
        let spec = ClusterSpec {
            cluster_cidr: Some("10.52.0.0/16".to_string()),
            service_cidr: Some("10.53.0.0/16".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["clusterCIDR"], "10.52.0.0/16");
        assert_eq!(json["serviceCIDR"], "10.53.0.0/16");

        let status = ClusterStatus {
            cluster_cidr: Some("10.42.0.0/16".to_string()),
            service_cidr: Some("10.43.0.0/16".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["clusterCIDR"], "10.42.0.0/16");
        assert_eq!(json["serviceCIDR"], "10.43.0.0/16");
    }

    #[test]
    fn test_status_structural_equality() {
        let mut a = ClusterStatus::default();
        let b = a.clone();
        assert_eq!(a, b);

        a.cluster_cidr = Some("10.42.0.0/16".to_string());
        assert_ne!(a, b);
    }
}
