//! Policy resolution and cluster validation.
//!
//! A namespace opts into governance with the policy-name label. Validation
//! failures are terminal for the current spec: the status records the
//! failure and the pass stops before any resource is converged.

use super::{ReconcilerError, INVALID_CLUSTER_NAME};
use crate::crd::{Cluster, ClusterStatus, VirtualClusterPolicy, POLICY_NAME_LABEL};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::Api;
use kube::{Client, ResourceExt};
use tracing::debug;

/// Resolve the policy governing the cluster's namespace, if any, and check
/// the cluster against it. The binding is recorded in `status.policy_name`
/// before the policy is fetched, so the networking step sees it even when
/// the fetch fails and the pass is retried.
pub(crate) async fn resolve_policy(
    client: &Client,
    cluster: &Cluster,
    status: &mut ClusterStatus,
) -> Result<(), ReconcilerError> {
    let ns_name = cluster.namespace().unwrap_or_else(|| "default".to_string());

    let namespaces: Api<Namespace> = Api::all(client.clone());
    let namespace = namespaces.get(&ns_name).await?;

    let policy_name = namespace
        .labels()
        .get(POLICY_NAME_LABEL)
        .filter(|v| !v.is_empty())
        .cloned();
    status.policy_name = policy_name.clone();

    let Some(policy_name) = policy_name else {
        debug!("namespace {ns_name} is not policy-bound");
        return Ok(());
    };

    let policies: Api<VirtualClusterPolicy> = Api::all(client.clone());
    let policy = policies.get(&policy_name).await?;

    validate(cluster, Some(&policy))
}

/// Validate a cluster against its governing policy. Pure; failures map to
/// [`ReconcilerError::Validation`].
pub(crate) fn validate(
    cluster: &Cluster,
    policy: Option<&VirtualClusterPolicy>,
) -> Result<(), ReconcilerError> {
    let Some(policy) = policy else {
        return Ok(());
    };

    if cluster.name_any() == INVALID_CLUSTER_NAME {
        return Err(ReconcilerError::Validation(format!(
            "cluster name {INVALID_CLUSTER_NAME:?} is reserved in policy-bound namespaces"
        )));
    }

    if cluster.spec.mode != policy.spec.allowed_mode {
        return Err(ReconcilerError::Validation(format!(
            "mode {} is not allowed by policy {} (allowed mode: {})",
            cluster.spec.mode,
            policy.name_any(),
            policy.spec.allowed_mode
        )));
    }

    Ok(())
}

/// Resolve the host Kubernetes version into a virtual cluster server version.
pub(crate) async fn resolve_host_version(client: &Client) -> Result<String, ReconcilerError> {
    let info = client.apiserver_version().await?;
    Ok(derive_host_version(&info.git_version))
}

/// Derive a server version from a host `gitVersion`: build metadata after
/// `+` is dropped and the distribution suffix appended.
#[must_use]
pub fn derive_host_version(git_version: &str) -> String {
    let base = git_version.split('+').next().unwrap_or(git_version);
    format!("{base}-k3s1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ClusterMode, ClusterSpec, VirtualClusterPolicySpec};

    fn cluster(name: &str, mode: ClusterMode) -> Cluster {
        let mut cluster = Cluster::new(
            name,
            ClusterSpec {
                mode,
                ..Default::default()
            },
        );
        cluster.metadata.namespace = Some("tenants".to_string());
        cluster
    }

    fn policy(allowed_mode: ClusterMode) -> VirtualClusterPolicy {
        VirtualClusterPolicy::new("tenant-policy", VirtualClusterPolicySpec { allowed_mode })
    }

    #[test]
    fn test_unbound_namespace_allows_any_name_and_mode() {
        assert!(validate(&cluster("system", ClusterMode::Virtual), None).is_ok());
    }

    #[test]
    fn test_reserved_name_rejected_when_bound() {
        let err = validate(
            &cluster("system", ClusterMode::Shared),
            Some(&policy(ClusterMode::Shared)),
        )
        .unwrap_err();
        assert!(matches!(err, ReconcilerError::Validation(_)));
    }

    #[test]
    fn test_mode_must_match_policy() {
        let err = validate(
            &cluster("tenant-a", ClusterMode::Virtual),
            Some(&policy(ClusterMode::Shared)),
        )
        .unwrap_err();
        assert!(matches!(err, ReconcilerError::Validation(_)));

        assert!(validate(
            &cluster("tenant-a", ClusterMode::Shared),
            Some(&policy(ClusterMode::Shared)),
        )
        .is_ok());
    }

    #[test]
    fn test_derive_host_version_strips_build_metadata() {
        assert_eq!(derive_host_version("v1.30.2+abcdef"), "v1.30.2-k3s1");
        assert_eq!(derive_host_version("v1.30.2"), "v1.30.2-k3s1");
    }
}
