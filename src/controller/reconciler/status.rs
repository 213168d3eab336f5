//! Status derivation and persistence.
//!
//! The status subresource is the durable record of the last pass: phase,
//! Ready condition, resolved defaults and allocated ports. Writes go through
//! a merge patch on the status subresource and are skipped when nothing
//! changed structurally.

use super::{ReconcilerError, FIELD_MANAGER};
use crate::crd::{Cluster, ClusterPhase, ClusterStatus, Condition};
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::debug;

pub(crate) const READY_CONDITION: &str = "Ready";

/// Fold the outcome of a convergence pass into the status: phase plus the
/// Ready condition. A not-ready server keeps the cluster in Provisioning;
/// a validation failure is terminal until the spec or policy changes.
pub(crate) fn apply_outcome(status: &mut ClusterStatus, outcome: Option<&ReconcilerError>) {
    let (phase, ready, reason, message) = match outcome {
        None => (
            ClusterPhase::Running,
            "True",
            "Provisioned",
            "virtual cluster resources are in place".to_string(),
        ),
        Some(ReconcilerError::ServerNotReady) => (
            ClusterPhase::Provisioning,
            "False",
            "ServerNotReady",
            "waiting for the virtual cluster server to come up".to_string(),
        ),
        Some(err @ ReconcilerError::Validation(_)) => {
            (ClusterPhase::Failed, "False", "ValidationFailed", err.to_string())
        }
        Some(err @ ReconcilerError::PortAllocation(_)) => {
            (ClusterPhase::Failed, "False", "PortAllocationFailed", err.to_string())
        }
        Some(err) => (
            ClusterPhase::Failed,
            "False",
            "ReconcileError",
            err.to_string(),
        ),
    };

    status.phase = phase;
    status.set_condition(Condition {
        r#type: READY_CONDITION.to_string(),
        status: ready.to_string(),
        last_transition_time: None,
        reason: Some(reason.to_string()),
        message: Some(message),
    });
}

/// Persist a status via a merge patch on the status subresource.
async fn update_status_inner(
    client: &Client,
    cluster: &Cluster,
    status: &ClusterStatus,
) -> Result<(), kube::Error> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let name = cluster.name_any();
    let api: Api<Cluster> = Api::namespaced(client.clone(), &namespace);

    debug!("updating status of cluster {namespace}/{name} to phase {}", status.phase);

    api.patch_status(
        &name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(json!({ "status": status })),
    )
    .await?;

    Ok(())
}

/// Whether `status` differs structurally from what the object carries. An
/// absent status counts as changed.
pub(crate) fn status_changed(cluster: &Cluster, status: &ClusterStatus) -> bool {
    cluster.status.as_ref() != Some(status)
}

/// Persist the status only when it differs from what the object already
/// carries, so an unchanged pass issues no write. Returns whether a write
/// happened.
pub async fn update_status(
    client: &Client,
    cluster: &Cluster,
    status: &ClusterStatus,
) -> Result<bool, kube::Error> {
    if !status_changed(cluster, status) {
        return Ok(false);
    }

    update_status_inner(client, cluster, status).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_success_outcome_marks_running() {
        let mut status = ClusterStatus::default();
        apply_outcome(&mut status, None);

        assert_eq!(status.phase, ClusterPhase::Running);
        let ready = status.condition(READY_CONDITION).unwrap();
        assert_eq!(ready.status, "True");
        assert_eq!(ready.reason.as_deref(), Some("Provisioned"));
    }

    #[test]
    fn test_server_not_ready_keeps_provisioning() {
        let mut status = ClusterStatus::default();
        apply_outcome(&mut status, Some(&ReconcilerError::ServerNotReady));

        assert_eq!(status.phase, ClusterPhase::Provisioning);
        let ready = status.condition(READY_CONDITION).unwrap();
        assert_eq!(ready.status, "False");
        assert_eq!(ready.reason.as_deref(), Some("ServerNotReady"));
    }

    #[test]
    fn test_validation_failure_is_surfaced() {
        let mut status = ClusterStatus::default();
        apply_outcome(
            &mut status,
            Some(&ReconcilerError::Validation("mode mismatch".to_string())),
        );

        assert_eq!(status.phase, ClusterPhase::Failed);
        let ready = status.condition(READY_CONDITION).unwrap();
        assert_eq!(ready.reason.as_deref(), Some("ValidationFailed"));
        assert!(ready.message.as_deref().unwrap().contains("mode mismatch"));
    }

    #[test]
    fn test_generic_failure_reason() {
        let mut status = ClusterStatus::default();
        apply_outcome(&mut status, Some(&ReconcilerError::Other(anyhow!("boom"))));

        assert_eq!(status.phase, ClusterPhase::Failed);
        assert_eq!(
            status.condition(READY_CONDITION).unwrap().reason.as_deref(),
            Some("ReconcileError")
        );
    }

    #[test]
    fn test_unchanged_status_skips_the_write() {
        let mut cluster = Cluster::new("tenant-a", crate::crd::ClusterSpec::default());
        let mut status = ClusterStatus::default();
        apply_outcome(&mut status, None);

        assert!(status_changed(&cluster, &status));

        cluster.status = Some(status.clone());
        assert!(!status_changed(&cluster, &status));

        let mut moved = status.clone();
        moved.kubelet_port = Some(50001);
        assert!(status_changed(&cluster, &moved));
    }

    #[test]
    fn test_recovery_flips_condition_back() {
        let mut status = ClusterStatus::default();
        apply_outcome(&mut status, Some(&ReconcilerError::ServerNotReady));
        apply_outcome(&mut status, None);

        assert_eq!(status.phase, ClusterPhase::Running);
        assert_eq!(status.condition(READY_CONDITION).unwrap().status, "True");
    }
}
