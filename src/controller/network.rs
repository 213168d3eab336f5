//! # Networking Convergence
//!
//! Three ensure-or-delete steps around the virtual control plane:
//!
//! - the namespace isolation `NetworkPolicy` (standalone clusters only; a
//!   policy-governed namespace gets its isolation from the policy instead)
//! - the cluster `Service`, the stable virtual IP every later step wires
//!   against
//! - the optional `Ingress` exposing the virtual API server

use crate::controller::reconciler::{delete_ignore_not_found, ensure_object, owner_refs};
use crate::controller::safe_concat_name_with_prefix;
use crate::crd::Cluster;
use anyhow::{anyhow, Result};
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, IPBlock, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, NetworkPolicy, NetworkPolicyEgressRule,
    NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicySpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::Api;
use kube::{Client, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::info;

pub const SERVER_PORT: i32 = 6443;

/// Labels selecting the server pods, shared with the server builder.
#[must_use]
pub fn server_labels(cluster: &Cluster) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("cluster".to_string(), cluster.name_any()),
        ("role".to_string(), "server".to_string()),
    ])
}

/// Converge the isolation policy: delete it when a VirtualClusterPolicy
/// governs the namespace, create-or-update it otherwise.
pub async fn ensure_network_policy(client: &Client, cluster: &Cluster) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let name = safe_concat_name_with_prefix(&[&cluster.name_any()]);
    let api: Api<NetworkPolicy> = Api::namespaced(client.clone(), &namespace);

    let policy_governed = cluster
        .status
        .as_ref()
        .and_then(|s| s.policy_name.as_deref())
        .is_some_and(|p| !p.is_empty());

    if policy_governed {
        delete_ignore_not_found(&api, &name).await?;
        return Ok(());
    }

    let desired = network_policy(cluster, &name);
    let result = ensure_object(
        &api,
        &desired,
        json!({ "spec": serde_json::to_value(&desired.spec)? }),
    )
    .await?;

    if result.changed() {
        info!("cluster network policy {namespace}/{name} {result}");
    }

    Ok(())
}

/// The standalone isolation policy: all ingress allowed; egress restricted
/// to the internet minus the cluster's own pod range, the cluster namespace,
/// and DNS in kube-system.
fn network_policy(cluster: &Cluster, name: &str) -> NetworkPolicy {
    let cluster_cidr = cluster
        .status
        .as_ref()
        .and_then(|s| s.cluster_cidr.clone())
        .unwrap_or_default();

    NetworkPolicy {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: cluster.namespace(),
            owner_references: owner_refs(cluster),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
            ingress: Some(vec![NetworkPolicyIngressRule::default()]),
            egress: Some(vec![NetworkPolicyEgressRule {
                to: Some(vec![
                    NetworkPolicyPeer {
                        ip_block: Some(IPBlock {
                            cidr: "0.0.0.0/0".to_string(),
                            except: Some(vec![cluster_cidr]),
                        }),
                        ..Default::default()
                    },
                    NetworkPolicyPeer {
                        namespace_selector: Some(LabelSelector {
                            match_labels: Some(BTreeMap::from([(
                                "kubernetes.io/metadata.name".to_string(),
                                cluster.namespace().unwrap_or_else(|| "default".to_string()),
                            )])),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    NetworkPolicyPeer {
                        namespace_selector: Some(LabelSelector {
                            match_labels: Some(BTreeMap::from([(
                                "kubernetes.io/metadata.name".to_string(),
                                "kube-system".to_string(),
                            )])),
                            ..Default::default()
                        }),
                        pod_selector: Some(LabelSelector {
                            match_labels: Some(BTreeMap::from([(
                                "k8s-app".to_string(),
                                "kube-dns".to_string(),
                            )])),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// Name of the cluster service, the virtual API server endpoint.
#[must_use]
pub fn cluster_service_name(cluster: &Cluster) -> String {
    safe_concat_name_with_prefix(&[&cluster.name_any(), "service"])
}

fn cluster_service(cluster: &Cluster) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(cluster_service_name(cluster)),
            namespace: cluster.namespace(),
            owner_references: owner_refs(cluster),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(server_labels(cluster)),
            ports: Some(vec![ServicePort {
                name: Some("k8s-api".to_string()),
                port: SERVER_PORT,
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::Int(SERVER_PORT)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Converge the cluster service and return its assigned virtual IP, which
/// downstream steps (configs, agent, kubeconfig) wire against.
pub async fn ensure_cluster_service(client: &Client, cluster: &Cluster) -> Result<String> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Service> = Api::namespaced(client.clone(), &namespace);

    let desired = cluster_service(cluster);
    let name = desired.name_any();

    let result = ensure_object(
        &api,
        &desired,
        json!({ "spec": {
            "selector": desired.spec.as_ref().and_then(|s| s.selector.clone()),
            "ports": desired.spec.as_ref().and_then(|s| s.ports.clone()),
        }}),
    )
    .await?;

    if result.changed() {
        info!("cluster service {namespace}/{name} {result}");
    }

    // Read back the live object for the platform-assigned address.
    let live = api.get(&name).await?;
    live.spec
        .and_then(|s| s.cluster_ip)
        .filter(|ip| !ip.is_empty() && ip != "None")
        .ok_or_else(|| anyhow!("cluster service {namespace}/{name} has no assigned address yet"))
}

/// Name of the ingress exposing the virtual API server.
#[must_use]
pub fn ingress_name(cluster: &Cluster) -> String {
    safe_concat_name_with_prefix(&[&cluster.name_any(), "ingress"])
}

fn server_ingress(cluster: &Cluster) -> Ingress {
    let ingress_config = cluster
        .spec
        .expose
        .as_ref()
        .and_then(|e| e.ingress.as_ref());

    let host = ingress_config
        .and_then(|i| i.host.clone())
        .unwrap_or_else(|| {
            format!(
                "{}.{}",
                cluster.name_any(),
                cluster.namespace().unwrap_or_else(|| "default".to_string())
            )
        });

    let annotations = ingress_config
        .map(|i| i.annotations.clone())
        .filter(|a| !a.is_empty());

    Ingress {
        metadata: ObjectMeta {
            name: Some(ingress_name(cluster)),
            namespace: cluster.namespace(),
            annotations,
            owner_references: owner_refs(cluster),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: ingress_config.and_then(|i| i.ingress_class_name.clone()),
            rules: Some(vec![IngressRule {
                host: Some(host),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: cluster_service_name(cluster),
                                port: Some(ServiceBackendPort {
                                    number: Some(SERVER_PORT),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Ensure-or-delete the ingress: absence of exposure configuration in the
/// spec deletes any existing ingress.
pub async fn ensure_ingress(client: &Client, cluster: &Cluster) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let name = ingress_name(cluster);
    let api: Api<Ingress> = Api::namespaced(client.clone(), &namespace);

    let exposed = cluster
        .spec
        .expose
        .as_ref()
        .is_some_and(|e| e.ingress.is_some());

    if !exposed {
        delete_ignore_not_found(&api, &name).await?;
        return Ok(());
    }

    let desired = server_ingress(cluster);
    let result = ensure_object(
        &api,
        &desired,
        json!({
            "metadata": { "annotations": desired.metadata.annotations },
            "spec": serde_json::to_value(&desired.spec)?,
        }),
    )
    .await?;

    if result.changed() {
        info!("cluster ingress {namespace}/{name} {result}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ClusterSpec, ClusterStatus, ExposeConfig, IngressConfig};

    fn cluster() -> Cluster {
        let mut cluster = Cluster::new("tenant-a", ClusterSpec::default());
        cluster.metadata.namespace = Some("tenants".to_string());
        cluster.status = Some(ClusterStatus {
            cluster_cidr: Some("10.42.0.0/16".to_string()),
            ..Default::default()
        });
        cluster
    }

    #[test]
    fn test_network_policy_excludes_own_pod_range() {
        let policy = network_policy(&cluster(), "vc-tenant-a");
        let spec = policy.spec.unwrap();

        let egress = &spec.egress.unwrap()[0];
        let peers = egress.to.as_ref().unwrap();
        let ip_block = peers[0].ip_block.as_ref().unwrap();
        assert_eq!(ip_block.cidr, "0.0.0.0/0");
        assert_eq!(ip_block.except.as_ref().unwrap(), &vec!["10.42.0.0/16".to_string()]);
    }

    #[test]
    fn test_network_policy_allows_dns_and_own_namespace() {
        let policy = network_policy(&cluster(), "vc-tenant-a");
        let egress = policy.spec.unwrap().egress.unwrap();
        let peers = egress[0].to.as_ref().unwrap();
        assert_eq!(peers.len(), 3);

        let ns_peer = peers[1].namespace_selector.as_ref().unwrap();
        assert_eq!(
            ns_peer.match_labels.as_ref().unwrap()["kubernetes.io/metadata.name"],
            "tenants"
        );

        let dns_peer = &peers[2];
        assert_eq!(
            dns_peer.pod_selector.as_ref().unwrap().match_labels.as_ref().unwrap()["k8s-app"],
            "kube-dns"
        );
    }

    #[test]
    fn test_cluster_service_selects_server_pods() {
        let service = cluster_service(&cluster());
        assert_eq!(service.name_any(), "vc-tenant-a-service");

        let spec = service.spec.unwrap();
        assert_eq!(spec.selector.unwrap()["role"], "server");
        assert_eq!(spec.ports.unwrap()[0].port, SERVER_PORT);
    }

    #[test]
    fn test_ingress_defaults_host_and_targets_service() {
        let mut cluster = cluster();
        cluster.spec.expose = Some(ExposeConfig {
            ingress: Some(IngressConfig {
                ingress_class_name: Some("nginx".to_string()),
                ..Default::default()
            }),
        });

        let ingress = server_ingress(&cluster);
        let spec = ingress.spec.unwrap();
        assert_eq!(spec.ingress_class_name.as_deref(), Some("nginx"));

        let rule = &spec.rules.unwrap()[0];
        assert_eq!(rule.host.as_deref(), Some("tenant-a.tenants"));

        let backend = rule.http.as_ref().unwrap().paths[0]
            .backend
            .service
            .as_ref()
            .unwrap();
        assert_eq!(backend.name, "vc-tenant-a-service");
    }

    #[test]
    fn test_ingress_honors_explicit_host_and_annotations() {
        let mut cluster = cluster();
        cluster.spec.expose = Some(ExposeConfig {
            ingress: Some(IngressConfig {
                host: Some("api.tenant-a.example.com".to_string()),
                annotations: BTreeMap::from([(
                    "nginx.ingress.kubernetes.io/ssl-passthrough".to_string(),
                    "true".to_string(),
                )]),
                ..Default::default()
            }),
        });

        let ingress = server_ingress(&cluster);
        assert_eq!(
            ingress.spec.unwrap().rules.unwrap()[0].host.as_deref(),
            Some("api.tenant-a.example.com")
        );
        assert!(ingress
            .metadata
            .annotations
            .unwrap()
            .contains_key("nginx.ingress.kubernetes.io/ssl-passthrough"));
    }
}
