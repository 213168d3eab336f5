//! The reconciliation pass: state machine steps, the ordered convergence
//! procedure, and the retry policy.

use super::finalize::{agent_subject, finalize, subjects_patch};
use super::status::{apply_outcome, update_status};
use super::validation::{resolve_host_version, resolve_policy};
use super::{
    resource_key, Reconciler, ReconcilerError, AGENT_CLUSTER_ROLE_BINDINGS, CLUSTER_FINALIZER,
    DEFAULT_SHARED_CLUSTER_CIDR, DEFAULT_SHARED_SERVICE_CIDR, DEFAULT_VIRTUAL_CLUSTER_CIDR,
    DEFAULT_VIRTUAL_SERVICE_CIDR, SERVER_NOT_READY_RETRY,
};
use crate::controller::agent::{
    config_identity, AgentContext, AgentEnsurer, SharedNodeAgent, VirtualNodeAgent,
    DEFAULT_KUBELET_PORT, DEFAULT_WEBHOOK_PORT,
};
use crate::controller::bootstrap::{ensure_bootstrap_secret, ensure_token};
use crate::controller::cidr::lookup_service_cidr;
use crate::controller::kubeconfig::ensure_kubeconfig_secret;
use crate::controller::network::{ensure_cluster_service, ensure_ingress, ensure_network_policy};
use crate::controller::server::ServerBuilder;
use crate::crd::{Cluster, ClusterMode, ClusterPhase, ClusterStatus, Condition};
use crate::observability::metrics;
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// One reconciliation pass for one Cluster identity.
pub async fn reconcile(
    cluster: Arc<Cluster>,
    ctx: Arc<Reconciler>,
) -> Result<Action, ReconcilerError> {
    let start = Instant::now();
    metrics::increment_reconciliations();

    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let name = cluster.name_any();

    info!("reconciling cluster {namespace}/{name}");

    // Re-read the object; the watch cache handed to us may be stale.
    let api: Api<Cluster> = Api::namespaced(ctx.client.clone(), &namespace);
    let Some(cluster) = api.get_opt(&name).await? else {
        // already deleted and garbage-collected
        return Ok(Action::await_change());
    };

    if cluster.metadata.deletion_timestamp.is_some() {
        let action = finalize(&ctx, &cluster).await?;
        ctx.port_allocator.release(&config_identity(&cluster));
        ctx.backoff.remove(&resource_key(&cluster));
        metrics::increment_finalizations();
        return Ok(action);
    }

    // Every object passes through an explicit initial-status write before
    // any side effect, so the first observed state is always consistent.
    let observed_phase = cluster
        .status
        .as_ref()
        .map(|s| s.phase)
        .unwrap_or_default();
    if observed_phase == ClusterPhase::Unknown {
        let mut status = cluster.status.clone().unwrap_or_default();
        status.phase = ClusterPhase::Provisioning;
        status.set_condition(Condition {
            r#type: "Ready".to_string(),
            status: "False".to_string(),
            last_transition_time: None,
            reason: Some("Provisioning".to_string()),
            message: Some("cluster is being provisioned".to_string()),
        });
        update_status(&ctx.client, &cluster, &status).await?;

        return Ok(Action::requeue(Duration::ZERO));
    }

    // No owned resource is created before deletion cleanup is guaranteed.
    if !cluster.finalizers().iter().any(|f| f == CLUSTER_FINALIZER) {
        add_finalizer(&api, &cluster).await?;
        return Ok(Action::requeue(Duration::ZERO));
    }

    let mut status = cluster.status.clone().unwrap_or_default();
    let outcome = converge(&ctx, &cluster, &mut status).await;

    // Persist status changes whether or not convergence succeeded; the
    // status is the durable record of how far this pass got.
    apply_outcome(&mut status, outcome.as_ref().err());
    update_status(&ctx.client, &cluster, &status).await?;

    match outcome {
        Err(ReconcilerError::ServerNotReady) => {
            // expected while the server workload boots; not a failure
            info!("cluster {namespace}/{name}: server not ready, retrying shortly");
            metrics::increment_server_not_ready_retries();
            Ok(Action::requeue(SERVER_NOT_READY_RETRY))
        }
        Err(err) => Err(err),
        Ok(()) => {
            ctx.backoff.reset(&resource_key(&cluster));
            metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());

            if observed_phase != ClusterPhase::Running {
                ctx.publish_event(
                    &cluster,
                    "Provisioned",
                    format!("virtual cluster {namespace}/{name} is running"),
                )
                .await;
            }

            Ok(Action::await_change())
        }
    }
}

/// Retry policy for failed passes: per-resource Fibonacci backoff with a
/// ceiling, reset on the next successful pass.
pub fn error_policy(cluster: Arc<Cluster>, err: &ReconcilerError, ctx: Arc<Reconciler>) -> Action {
    metrics::increment_reconciliation_errors();

    let key = resource_key(&cluster);
    let (delay_seconds, error_count) = ctx.backoff.next(&key);

    warn!("reconciliation of {key} failed (attempt {error_count}): {err}; retrying in {delay_seconds}s");

    Action::requeue(Duration::from_secs(delay_seconds))
}

async fn add_finalizer(api: &Api<Cluster>, cluster: &Cluster) -> Result<(), kube::Error> {
    let mut finalizers = cluster.finalizers().to_vec();
    finalizers.push(CLUSTER_FINALIZER.to_string());

    let patch = json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&cluster.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    Ok(())
}

/// The ordered convergence procedure. Mutations to resolved values land in
/// `status`; the caller persists them even when a step fails partway.
///
/// The order is a dependency chain: policy and version resolution first,
/// then address ranges, then the service whose assigned address every later
/// step wires against, then configs before workloads before secrets before
/// RBAC.
async fn converge(
    ctx: &Reconciler,
    cluster: &Cluster,
    status: &mut ClusterStatus,
) -> Result<(), ReconcilerError> {
    resolve_policy(&ctx.client, cluster, status).await?;

    // Sticky: resolved once, never overwritten for the object's lifetime.
    if cluster.spec.version.is_none() && status.host_version.is_none() {
        status.host_version = Some(resolve_host_version(&ctx.client).await?);
    }

    let token = ensure_token(&ctx.client, cluster).await?;

    resolve_cidrs(ctx, cluster, status).await;

    let staged = with_status(cluster, status);
    ensure_network_policy(&ctx.client, &staged).await?;
    let service_ip = ensure_cluster_service(&ctx.client, &staged).await?;

    let server = ServerBuilder::new(
        &staged,
        &token,
        &ctx.settings.server_image,
        &ctx.settings.server_image_pull_policy,
    );
    server.create_configs(&ctx.client, &service_ip).await?;
    server.ensure_server(&ctx.client).await?;

    ensure_agent(ctx, &staged, status, &service_ip, &token).await?;

    ensure_ingress(&ctx.client, &staged).await?;
    ensure_bootstrap_secret(&ctx.client, &staged, &service_ip, &token).await?;
    ensure_kubeconfig_secret(&ctx.client, &staged, &service_ip, &token).await?;

    bind_cluster_roles(&ctx.client, cluster).await
}

/// The cluster with the in-progress status folded in, for steps that read
/// resolved values (CIDRs, policy binding, version) from status.
fn with_status(cluster: &Cluster, status: &ClusterStatus) -> Cluster {
    let mut staged = cluster.clone();
    staged.status = Some(status.clone());
    staged
}

/// Default the address ranges in status once. Explicit spec values win;
/// otherwise shared mode asks the host for its service range and both modes
/// fall back to fixed defaults. Lookup failure degrades, it does not fail.
async fn resolve_cidrs(ctx: &Reconciler, cluster: &Cluster, status: &mut ClusterStatus) {
    let needs_lookup = cidr_is_empty(&status.service_cidr)
        && cidr_is_empty(&cluster.spec.service_cidr)
        && cluster.spec.mode == ClusterMode::Shared;

    let lookup = if needs_lookup {
        match lookup_service_cidr(&ctx.client).await {
            Ok(Some(cidr)) => Some(cidr),
            Ok(None) => {
                warn!("service CIDR lookup found nothing; using default range");
                None
            }
            Err(err) => {
                warn!("service CIDR lookup failed: {err}; using default range");
                None
            }
        }
    } else {
        None
    };

    apply_cidr_defaults(cluster, status, lookup);
}

fn cidr_is_empty(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(str::is_empty)
}

/// Write both address ranges into status if unset. `lookup` is the outcome
/// of the host service-range discovery, when one was attempted.
fn apply_cidr_defaults(cluster: &Cluster, status: &mut ClusterStatus, lookup: Option<String>) {
    if cidr_is_empty(&status.cluster_cidr) {
        let default = match cluster.spec.mode {
            ClusterMode::Shared => DEFAULT_SHARED_CLUSTER_CIDR,
            ClusterMode::Virtual => DEFAULT_VIRTUAL_CLUSTER_CIDR,
        };
        status.cluster_cidr = Some(
            cluster
                .spec
                .cluster_cidr
                .clone()
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| default.to_string()),
        );
    }

    if cidr_is_empty(&status.service_cidr) {
        let resolved = match cluster.spec.service_cidr.clone().filter(|c| !c.is_empty()) {
            Some(explicit) => explicit,
            None => match cluster.spec.mode {
                ClusterMode::Virtual => DEFAULT_VIRTUAL_SERVICE_CIDR.to_string(),
                ClusterMode::Shared => {
                    lookup.unwrap_or_else(|| DEFAULT_SHARED_SERVICE_CIDR.to_string())
                }
            },
        };
        status.service_cidr = Some(resolved);
    }
}

/// Select and run the agent strategy for the cluster's mode. With host-node
/// mirroring both ports are allocated before either lands in status, so a
/// failure never leaves the pair half-recorded.
async fn ensure_agent(
    ctx: &Reconciler,
    cluster: &Cluster,
    status: &mut ClusterStatus,
    service_ip: &str,
    token: &str,
) -> Result<(), ReconcilerError> {
    let version = cluster
        .spec
        .version
        .clone()
        .or_else(|| status.host_version.clone())
        .unwrap_or_else(|| "latest".to_string());

    let ensurer = match cluster.spec.mode {
        ClusterMode::Virtual => AgentEnsurer::Virtual(VirtualNodeAgent::new(AgentContext {
            cluster: cluster.clone(),
            service_ip: service_ip.to_string(),
            token: token.to_string(),
            image: format!("{}:{version}", ctx.settings.server_image),
            image_pull_policy: ctx.settings.server_image_pull_policy.clone(),
        })),
        ClusterMode::Shared => {
            let (kubelet_port, webhook_port) = if cluster.spec.mirror_host_nodes {
                let identity = config_identity(cluster);
                let kubelet = ctx
                    .port_allocator
                    .allocate_kubelet_port(&identity, status.kubelet_port)
                    .map_err(|e| ReconcilerError::PortAllocation(e.to_string()))?;
                let webhook = ctx
                    .port_allocator
                    .allocate_webhook_port(&identity, status.webhook_port)
                    .map_err(|e| ReconcilerError::PortAllocation(e.to_string()))?;

                status.kubelet_port = Some(kubelet);
                status.webhook_port = Some(webhook);
                (kubelet, webhook)
            } else {
                (DEFAULT_KUBELET_PORT, DEFAULT_WEBHOOK_PORT)
            };

            AgentEnsurer::Shared(SharedNodeAgent::new(
                AgentContext {
                    cluster: cluster.clone(),
                    service_ip: service_ip.to_string(),
                    token: token.to_string(),
                    image: ctx.settings.shared_agent_image.clone(),
                    image_pull_policy: ctx.settings.shared_agent_image_pull_policy.clone(),
                },
                kubelet_port,
                webhook_port,
            ))
        }
    };

    ensurer.ensure_resources(&ctx.client).await?;
    Ok(())
}

/// Append the cluster's agent subject to the shared cluster-scoped role
/// bindings. Failures on one binding do not block the other; they are
/// aggregated into one error.
async fn bind_cluster_roles(client: &Client, cluster: &Cluster) -> Result<(), ReconcilerError> {
    let bindings: Api<ClusterRoleBinding> = Api::all(client.clone());
    let subject = agent_subject(cluster);
    let mut failures: Vec<String> = Vec::new();

    for binding_name in AGENT_CLUSTER_ROLE_BINDINGS {
        let binding = match bindings.get(binding_name).await {
            Ok(binding) => binding,
            Err(err) => {
                failures.push(format!("get {binding_name}: {err}"));
                continue;
            }
        };

        let resource_version = binding.resource_version();
        let mut subjects = binding.subjects.unwrap_or_default();
        if subjects.contains(&subject) {
            continue;
        }
        subjects.push(subject.clone());

        let patch = subjects_patch(resource_version, &subjects);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ClusterSpec;

    fn cluster(mode: ClusterMode) -> Cluster {
        let mut cluster = Cluster::new(
            "tenant-a",
            ClusterSpec {
                mode,
                ..Default::default()
            },
        );
        cluster.metadata.namespace = Some("tenants".to_string());
        cluster
    }

    #[test]
    fn test_virtual_mode_defaults_both_cidrs() {
        let cluster = cluster(ClusterMode::Virtual);
        let mut status = ClusterStatus::default();

        apply_cidr_defaults(&cluster, &mut status, None);

        assert_eq!(status.cluster_cidr.as_deref(), Some("10.52.0.0/16"));
        assert_eq!(status.service_cidr.as_deref(), Some("10.53.0.0/16"));
    }

    #[test]
    fn test_shared_mode_uses_lookup_result() {
        let cluster = cluster(ClusterMode::Shared);
        let mut status = ClusterStatus::default();

        apply_cidr_defaults(&cluster, &mut status, Some("10.96.0.0/12".to_string()));

        assert_eq!(status.cluster_cidr.as_deref(), Some("10.42.0.0/16"));
        assert_eq!(status.service_cidr.as_deref(), Some("10.96.0.0/12"));
    }

    #[test]
    fn test_shared_mode_falls_back_when_lookup_fails() {
        let cluster = cluster(ClusterMode::Shared);
        let mut status = ClusterStatus::default();

        apply_cidr_defaults(&cluster, &mut status, None);

        assert_eq!(status.cluster_cidr.as_deref(), Some("10.42.0.0/16"));
        assert_eq!(status.service_cidr.as_deref(), Some("10.43.0.0/16"));
    }

    #[test]
    fn test_explicit_spec_cidrs_win() {
        let mut cluster = cluster(ClusterMode::Shared);
        cluster.spec.cluster_cidr = Some("10.100.0.0/16".to_string());
        cluster.spec.service_cidr = Some("10.101.0.0/16".to_string());
        let mut status = ClusterStatus::default();

        apply_cidr_defaults(&cluster, &mut status, Some("10.96.0.0/12".to_string()));

        assert_eq!(status.cluster_cidr.as_deref(), Some("10.100.0.0/16"));
        assert_eq!(status.service_cidr.as_deref(), Some("10.101.0.0/16"));
    }

    #[test]
    fn test_resolved_cidrs_are_sticky() {
        let mut cluster = cluster(ClusterMode::Virtual);
        let mut status = ClusterStatus {
            cluster_cidr: Some("10.52.0.0/16".to_string()),
            service_cidr: Some("10.53.0.0/16".to_string()),
            ..Default::default()
        };

        // a later spec change must not move the resolved ranges
        cluster.spec.cluster_cidr = Some("10.200.0.0/16".to_string());
        cluster.spec.service_cidr = Some("10.201.0.0/16".to_string());
        apply_cidr_defaults(&cluster, &mut status, None);

        assert_eq!(status.cluster_cidr.as_deref(), Some("10.52.0.0/16"));
        assert_eq!(status.service_cidr.as_deref(), Some("10.53.0.0/16"));
    }
}
