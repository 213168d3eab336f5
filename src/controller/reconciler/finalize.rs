//! Finalization protocol.
//!
//! Owner references cascade-delete everything living in the cluster
//! namespace. What they cannot cover is the agent's subject entry in the two
//! cluster-scoped role bindings, so finalization removes those by hand.
//! Cleanup is bounded: if it cannot complete within [`MEMBER_REMOVAL_TIMEOUT`]
//! the finalizer is removed anyway and deletion proceeds. A stale subject is
//! a bounded, recoverable inconsistency.

use super::{Reconciler, ReconcilerError, AGENT_CLUSTER_ROLE_BINDINGS, CLUSTER_FINALIZER, MEMBER_REMOVAL_TIMEOUT};
use crate::controller::agent::agent_service_account_name;
use crate::crd::Cluster;
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, Subject};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{info, warn};

/// Tear down a deleted Cluster: unbind the agent from the cluster-scoped
/// role bindings (best effort, bounded), then drop the finalizer so the
/// platform can complete physical deletion.
pub async fn finalize(ctx: &Reconciler, cluster: &Cluster) -> Result<Action, ReconcilerError> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());

    if !cluster.finalizers().iter().any(|f| f == CLUSTER_FINALIZER) {
        // Nothing left to do; deletion is already in the platform's hands.
        return Ok(Action::await_change());
    }

    info!("finalizing cluster {namespace}/{name}");

    let unbind = unbind_cluster_roles(&ctx.client, cluster);
    match tokio::time::timeout(MEMBER_REMOVAL_TIMEOUT, unbind).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!("cleanup of role binding subjects for {namespace}/{name} was incomplete: {err}");
        }
        Err(_) => {
            warn!("cleanup of role binding subjects for {namespace}/{name} timed out; proceeding with deletion");
        }
    }

    remove_finalizer(&ctx.client, cluster).await?;
    ctx.publish_event(cluster, "Finalized", format!("cluster {name} torn down")).await;

    Ok(Action::await_change())
}

/// Remove this cluster's agent subject from each of the shared role
/// bindings. Failures on one binding do not stop work on the other; they
/// are aggregated into one error.
async fn unbind_cluster_roles(client: &Client, cluster: &Cluster) -> Result<(), ReconcilerError> {
    let bindings: Api<ClusterRoleBinding> = Api::all(client.clone());
    let subject = agent_subject(cluster);
    let mut failures: Vec<String> = Vec::new();

    for binding_name in AGENT_CLUSTER_ROLE_BINDINGS {
        let binding = match bindings.get_opt(binding_name).await {
            Ok(Some(binding)) => binding,
            Ok(None) => continue,
            Err(err) => {
                failures.push(format!("get {binding_name}: {err}"));
                continue;
            }
        };

        let Some(remaining) = without_subject(binding.subjects.as_deref().unwrap_or(&[]), &subject)
        else {
            continue;
        };

        let patch = subjects_patch(binding.resource_version(), &remaining);
        if let Err(err) = bindings
            .patch(binding_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            failures.push(format!("update {binding_name}: {err}"));
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(ReconcilerError::Other(anyhow::anyhow!(failures.join("; "))))
    }
}

/// Drop the finalizer marker. This is the final status-mutating act for the
/// object; afterwards the platform completes deletion.
async fn remove_finalizer(client: &Client, cluster: &Cluster) -> Result<(), kube::Error> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Cluster> = Api::namespaced(client.clone(), &namespace);

    let remaining: Vec<&String> = cluster
        .finalizers()
        .iter()
        .filter(|f| *f != CLUSTER_FINALIZER)
        .collect();

    let patch = json!({ "metadata": { "finalizers": remaining } });
    api.patch(&cluster.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    Ok(())
}

/// The role-binding subject identifying this cluster's agent.
pub(crate) fn agent_subject(cluster: &Cluster) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: agent_service_account_name(&cluster.name_any()),
        namespace: cluster.namespace(),
        ..Default::default()
    }
}

/// Merge patch replacing a binding's subject list. The patch carries the
/// resourceVersion the subjects were read at, so a concurrent writer turns
/// this into a conflict error instead of being silently overwritten; the
/// conflicted pass re-reads and retries.
pub(crate) fn subjects_patch(
    resource_version: Option<String>,
    subjects: &[Subject],
) -> serde_json::Value {
    match resource_version {
        Some(version) => json!({
            "metadata": { "resourceVersion": version },
            "subjects": subjects,
        }),
        None => json!({ "subjects": subjects }),
    }
}

/// Subjects with `subject` removed, or `None` when it was not present.
fn without_subject(subjects: &[Subject], subject: &Subject) -> Option<Vec<Subject>> {
    if !subjects.contains(subject) {
        return None;
    }

    Some(subjects.iter().filter(|s| *s != subject).cloned().collect())
}
