//! # Virtual Cluster Controller
//!
//! Controller entrypoint: wires the reconciliation engine to the cluster,
//! starts the operational HTTP endpoints, and runs until signalled.
//!
//! The controller watches `Cluster` resources across all namespaces, the
//! workload kinds it owns, and Namespace objects (whose policy-binding label
//! governs validation of the Clusters inside them).

use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use kube::api::Api;
use kube::Client;
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{controller, watcher, Controller};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use virtual_cluster_controller::controller::agent::PortAllocator;
use virtual_cluster_controller::controller::reconciler::{
    self, namespace_policy_targets, Reconciler, Settings,
};
use virtual_cluster_controller::crd::Cluster;
use virtual_cluster_controller::observability::metrics;
use virtual_cluster_controller::server;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Namespace, Service};

#[derive(Parser, Debug)]
#[command(name = "virtual-cluster-controller", about = "Provisions nested Kubernetes control planes")]
struct Args {
    /// Image for the shared-node agent workload
    #[arg(long, env = "SHARED_AGENT_IMAGE", default_value = "ghcr.io/microscaler/vc-kubelet:latest")]
    shared_agent_image: String,

    #[arg(long, env = "SHARED_AGENT_IMAGE_PULL_POLICY", default_value = "IfNotPresent")]
    shared_agent_image_pull_policy: String,

    /// Image repository for virtual cluster servers; the tag is derived from
    /// each cluster's resolved version
    #[arg(long, env = "SERVER_IMAGE", default_value = "rancher/k3s")]
    server_image: String,

    #[arg(long, env = "SERVER_IMAGE_PULL_POLICY", default_value = "IfNotPresent")]
    server_image_pull_policy: String,

    /// Namespace the controller runs in
    #[arg(long, env = "CONTROLLER_NAMESPACE", default_value = "vc-system")]
    controller_namespace: String,

    /// Maximum number of Clusters reconciled in parallel
    #[arg(long, env = "WORKERS", default_value_t = 4)]
    workers: u16,

    /// Port for /metrics, /healthz and /readyz
    #[arg(long, env = "METRICS_PORT", default_value_t = 5000)]
    metrics_port: u16,

    /// Port range for mirrored kubelet surfaces, as "low-high"
    #[arg(long, env = "KUBELET_PORT_RANGE", default_value = "50000-51000", value_parser = parse_port_range)]
    kubelet_port_range: (i32, i32),

    /// Port range for mirrored webhook surfaces, as "low-high"
    #[arg(long, env = "WEBHOOK_PORT_RANGE", default_value = "51001-52000", value_parser = parse_port_range)]
    webhook_port_range: (i32, i32),
}

fn parse_port_range(value: &str) -> Result<(i32, i32), String> {
    let (low, high) = value
        .split_once('-')
        .ok_or_else(|| format!("expected \"low-high\", got {value:?}"))?;

    let low: i32 = low.trim().parse().map_err(|e| format!("invalid low port: {e}"))?;
    let high: i32 = high.trim().parse().map_err(|e| format!("invalid high port: {e}"))?;

    if low > high || low < 1 || high > 65535 {
        return Err(format!("invalid port range {low}-{high}"));
    }

    Ok((low, high))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "virtual_cluster_controller=info".into()),
        )
        .init();

    info!("Starting Virtual Cluster Controller");

    metrics::register_metrics()?;

    let ready: server::ReadyFlag = Arc::new(AtomicBool::new(false));
    let metrics_port = args.metrics_port;
    let ready_clone = ready.clone();
    tokio::spawn(async move {
        if let Err(err) = server::serve(metrics_port, ready_clone).await {
            error!("HTTP server error: {err}");
        }
    });

    let client = Client::try_default().await?;

    let settings = Settings {
        shared_agent_image: args.shared_agent_image,
        shared_agent_image_pull_policy: args.shared_agent_image_pull_policy,
        server_image: args.server_image,
        server_image_pull_policy: args.server_image_pull_policy,
        controller_namespace: args.controller_namespace,
    };
    let allocator = Arc::new(PortAllocator::new(args.kubelet_port_range, args.webhook_port_range));
    let ctx = Arc::new(Reconciler::new(client.clone(), settings, allocator));

    let clusters: Api<Cluster> = Api::all(client.clone());
    let statefulsets: Api<StatefulSet> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client.clone());
    let services: Api<Service> = Api::all(client.clone());
    let namespaces: Api<Namespace> = Api::all(client.clone());

    let controller = Controller::new(clusters, watcher::Config::default());

    // A namespace label change can alter which policy governs its Clusters,
    // so namespace events fan out to the Clusters inside that namespace.
    let store = controller.store();
    let gauge_store = store.clone();

    ready.store(true, Ordering::Relaxed);

    controller
        .owns(statefulsets, watcher::Config::default())
        .owns(deployments, watcher::Config::default())
        .owns(services, watcher::Config::default())
        .watches(namespaces, watcher::Config::default(), move |ns| {
            namespace_policy_targets(&ns, &store)
        })
        .with_config(controller::Config::default().concurrency(args.workers))
        .shutdown_on_signal()
        .run(reconciler::reconcile, reconciler::error_policy, ctx)
        .for_each(|result| {
            metrics::set_clusters_managed(gauge_store.state().len() as i64);

            match result {
                Ok((obj, _action)) => log_reconciled(&obj),
                Err(err) => error!("reconciliation stream error: {err}"),
            }

            std::future::ready(())
        })
        .await;

    info!("Controller stopped");

    Ok(())
}

fn log_reconciled(obj: &ObjectRef<Cluster>) {
    info!(
        "reconciled {}/{}",
        obj.namespace.as_deref().unwrap_or("default"),
        obj.name
    );
}
