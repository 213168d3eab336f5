//! # Reconciler
//!
//! The reconciliation engine for `Cluster` resources.
//!
//! Each pass drives one Cluster toward its desired state:
//!
//! 1. Load the object; branch to finalization when a deletion timestamp is set
//! 2. Write the initial status and the finalizer (each a persisted step
//!    followed by an immediate requeue)
//! 3. Validate against the governing policy and resolve sticky defaults
//!    (host version, CIDRs)
//! 4. Converge owned resources in dependency order: network policy, cluster
//!    service, server configs, server workload, agent, ingress, bootstrap
//!    and kubeconfig secrets, role bindings
//! 5. Persist status changes and classify the error for the retry policy

mod finalize;
mod reconcile;
mod status;
mod utils;
mod validation;

pub use finalize::finalize;
pub use reconcile::{error_policy, reconcile};
pub use status::update_status;
pub use validation::derive_host_version;

pub(crate) use utils::{
    create_if_absent, delete_ignore_not_found, ensure_object, owner_refs, EnsureResult,
};

use crate::controller::agent::PortAllocator;
use crate::controller::backoff::FibonacciBackoff;
use crate::crd::Cluster;
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, Resource, ResourceExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Finalizer marker guaranteeing teardown runs before physical deletion.
pub const CLUSTER_FINALIZER: &str = "cluster.virtual-clusters.microscaler.io/finalizer";

/// Reserved name no Cluster may use in a policy-governed namespace.
pub const INVALID_CLUSTER_NAME: &str = "system";

/// Field manager used for all controller writes.
pub const FIELD_MANAGER: &str = "virtual-cluster-controller";

pub const DEFAULT_VIRTUAL_CLUSTER_CIDR: &str = "10.52.0.0/16";
pub const DEFAULT_VIRTUAL_SERVICE_CIDR: &str = "10.53.0.0/16";
pub const DEFAULT_SHARED_CLUSTER_CIDR: &str = "10.42.0.0/16";
pub const DEFAULT_SHARED_SERVICE_CIDR: &str = "10.43.0.0/16";

/// Cluster-scoped role bindings that carry per-cluster agent subjects.
pub const AGENT_CLUSTER_ROLE_BINDINGS: [&str; 2] = ["vc-kubelet-node", "vc-priorityclass"];

/// Upper bound for role-binding subject removal during finalization.
pub const MEMBER_REMOVAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Fixed delay before retrying a pass that hit a not-yet-ready virtual server.
pub const SERVER_NOT_READY_RETRY: Duration = Duration::from_secs(10);

/// Reconciler error taxonomy. The variant decides the retry policy: a
/// not-ready server gets a fixed short delay and is not counted as a
/// failure, everything else goes through the error policy's backoff.
#[derive(Debug, Error)]
pub enum ReconcilerError {
    /// The virtual server workload is not serving bootstrap data yet.
    /// Expected during first-time provisioning.
    #[error("virtual cluster server not ready")]
    ServerNotReady,

    /// Policy or naming violation. Persists in status until the spec or the
    /// policy changes.
    #[error("cluster validation error: {0}")]
    Validation(String),

    /// Kubelet or webhook port range exhausted.
    #[error("port allocation failed: {0}")]
    PortAllocation(String),

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Per-resource backoff bookkeeping for the error policy.
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

impl BackoffState {
    fn new() -> Self {
        Self {
            backoff: FibonacciBackoff::new(30, 300),
            error_count: 0,
        }
    }
}

/// Per-resource backoff states keyed by `namespace/name`. Entries are
/// created on failure, reset on success and dropped on finalization so the
/// map does not grow with every cluster that ever failed a pass.
#[derive(Debug, Default)]
pub(crate) struct BackoffTracker {
    states: Mutex<HashMap<String, BackoffState>>,
}

impl BackoffTracker {
    pub(crate) fn next(&self, resource_key: &str) -> (u64, u32) {
        let mut states = match self.states.lock() {
            Ok(states) => states,
            // A poisoned lock only loses backoff history; fall back to the
            // first delay in the sequence.
            Err(_) => return (30, 1),
        };

        let state = states
            .entry(resource_key.to_string())
            .or_insert_with(BackoffState::new);
        state.error_count += 1;

        (state.backoff.next_backoff_seconds(), state.error_count)
    }

    pub(crate) fn reset(&self, resource_key: &str) {
        if let Ok(mut states) = self.states.lock() {
            if let Some(state) = states.get_mut(resource_key) {
                state.error_count = 0;
                state.backoff.reset();
            }
        }
    }

    pub(crate) fn remove(&self, resource_key: &str) {
        if let Ok(mut states) = self.states.lock() {
            states.remove(resource_key);
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.states.lock().map(|states| states.len()).unwrap_or(0)
    }
}

/// Process-start configuration consumed by the convergence steps.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Image for the shared-node agent workload
    pub shared_agent_image: String,
    pub shared_agent_image_pull_policy: String,
    /// Image repository for the virtual server (tag comes from the resolved
    /// cluster version)
    pub server_image: String,
    pub server_image_pull_policy: String,
    /// Namespace the controller itself runs in
    pub controller_namespace: String,
}

/// Shared context handed to every reconciliation pass.
#[allow(
    missing_debug_implementations,
    reason = "the client and event recorder expose no Debug implementation"
)]
pub struct Reconciler {
    pub client: Client,
    pub recorder: Recorder,
    pub settings: Settings,
    pub port_allocator: Arc<PortAllocator>,
    pub(crate) backoff: BackoffTracker,
}

impl Reconciler {
    #[must_use]
    pub fn new(client: Client, settings: Settings, port_allocator: Arc<PortAllocator>) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.into(),
            instance: None,
        };

        Self {
            recorder: Recorder::new(client.clone(), reporter),
            client,
            settings,
            port_allocator,
            backoff: BackoffTracker::default(),
        }
    }

    /// Emit an operator-visible event correlated to the cluster. Event
    /// delivery is best effort and never fails a reconciliation pass.
    pub async fn publish_event(&self, cluster: &Cluster, reason: &str, note: String) {
        let event = Event {
            type_: EventType::Normal,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconciling".to_string(),
            secondary: None,
        };

        if let Err(err) = self
            .recorder
            .publish(&event, &cluster.object_ref(&()))
            .await
        {
            warn!("failed to publish event for {}: {err}", cluster.name_any());
        }
    }

}

/// Map a namespace watch event to the Clusters it contains. A change to the
/// policy-binding label affects every Cluster in that namespace, so the
/// router fans out one reconciliation request per cluster; the queue's dedup
/// makes the over-approximation cheap when the label did not change.
pub fn namespace_policy_targets(
    namespace: &Namespace,
    clusters: &Store<Cluster>,
) -> Vec<ObjectRef<Cluster>> {
    let ns_name = namespace.name_any();

    clusters
        .state()
        .iter()
        .filter(|cluster| cluster.namespace().as_deref() == Some(ns_name.as_str()))
        .map(|cluster| ObjectRef::from_obj(cluster.as_ref()))
        .collect()
}

/// `namespace/name` key used for per-resource backoff state.
pub(crate) fn resource_key(cluster: &Cluster) -> String {
    format!(
        "{}/{}",
        cluster.namespace().as_deref().unwrap_or("default"),
        cluster.name_any()
    )
}
