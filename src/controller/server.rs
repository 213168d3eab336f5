//! # Server Convergence
//!
//! The virtual control plane runs as a replicated workload with ordered
//! identity and per-replica persistent storage. Three pieces:
//!
//! - two configuration secrets, one for the initializing node and one for
//!   every later node; created once and never updated in place (changing
//!   server configuration is a cluster recreation, not a reconcile concern)
//! - a headless discovery service giving each replica a stable DNS identity
//! - the server `StatefulSet` itself, converged by create-or-update

use crate::controller::network::{server_labels, SERVER_PORT};
use crate::controller::reconciler::{create_if_absent, ensure_object, owner_refs, EnsureResult};
use crate::controller::safe_concat_name_with_prefix;
use crate::crd::{Cluster, ClusterMode};
use anyhow::Result;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PodSpec, PodTemplateSpec, Secret, SecretVolumeSource, SecurityContext, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::ByteString;
use kube::api::Api;
use kube::{Client, ResourceExt};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::info;

const STORAGE_REQUEST: &str = "1Gi";

/// Replica 0 initializes the datastore, every later ordinal joins it. Both
/// configs are mounted; the ordinal picks which one applies.
const SERVER_ENTRYPOINT: &str = r#"ordinal="${HOSTNAME##*-}"
if [ "$ordinal" = "0" ]; then
  exec k3s server --config /etc/server/init/config.yaml
fi
exec k3s server --config /etc/server/join/config.yaml
"#;

/// Server configuration file content. Serialized to YAML inside the config
/// secrets; the initializing node declares `cluster-init` while the others
/// join it through the cluster service.
#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct ServerConfig<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    cluster_init: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    server: Option<String>,
    token: &'a str,
    cluster_cidr: &'a str,
    service_cidr: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    disable_agent: Option<bool>,
    tls_san: Vec<String>,
}

/// Builder for all server-side objects of one cluster.
#[derive(Debug)]
pub struct ServerBuilder<'a> {
    cluster: &'a Cluster,
    token: &'a str,
    image: String,
    image_pull_policy: String,
}

impl<'a> ServerBuilder<'a> {
    #[must_use]
    pub fn new(
        cluster: &'a Cluster,
        token: &'a str,
        image_repository: &str,
        image_pull_policy: &str,
    ) -> Self {
        let version = cluster
            .spec
            .version
            .clone()
            .or_else(|| cluster.status.as_ref().and_then(|s| s.host_version.clone()))
            .unwrap_or_else(|| "latest".to_string());

        Self {
            cluster,
            token,
            image: format!("{image_repository}:{version}"),
            image_pull_policy: image_pull_policy.to_string(),
        }
    }

    fn namespace(&self) -> String {
        self.cluster
            .namespace()
            .unwrap_or_else(|| "default".to_string())
    }

    fn statefulset_name(&self) -> String {
        safe_concat_name_with_prefix(&[&self.cluster.name_any(), "server"])
    }

    fn headless_service_name(&self) -> String {
        safe_concat_name_with_prefix(&[&self.cluster.name_any(), "server", "headless"])
    }

    fn config_secret_name(&self, init: bool) -> String {
        let role = if init { "init-server" } else { "server" };
        safe_concat_name_with_prefix(&[&self.cluster.name_any(), role, "config"])
    }

    /// One of the two configuration secrets. The init config bootstraps the
    /// datastore; the join config points later replicas at the service IP.
    fn config_secret(&self, init: bool, service_ip: &str) -> Result<Secret> {
        let status = self.cluster.status.clone().unwrap_or_default();
        let cluster_cidr = status.cluster_cidr.unwrap_or_default();
        let service_cidr = status.service_cidr.unwrap_or_default();

        let config = ServerConfig {
            cluster_init: init.then_some(true),
            server: (!init).then(|| format!("https://{service_ip}:{SERVER_PORT}")),
            token: self.token,
            cluster_cidr: &cluster_cidr,
            service_cidr: &service_cidr,
            // shared mode brings its own agent workload
            disable_agent: (self.cluster.spec.mode == ClusterMode::Shared).then_some(true),
            tls_san: vec![
                service_ip.to_string(),
                format!("{}.{}", self.cluster.name_any(), self.namespace()),
            ],
        };
        let content = serde_yaml::to_string(&config)?;

        Ok(Secret {
            metadata: ObjectMeta {
                name: Some(self.config_secret_name(init)),
                namespace: self.cluster.namespace(),
                owner_references: owner_refs(self.cluster),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "config.yaml".to_string(),
                ByteString(content.into_bytes()),
            )])),
            ..Default::default()
        })
    }

    fn headless_service(&self) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(self.headless_service_name()),
                namespace: self.cluster.namespace(),
                owner_references: owner_refs(self.cluster),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(server_labels(self.cluster)),
                ports: Some(vec![ServicePort {
                    name: Some("k8s-api".to_string()),
                    port: SERVER_PORT,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn stateful_set(&self) -> StatefulSet {
        let labels = server_labels(self.cluster);
        let replicas = self.cluster.spec.servers.unwrap_or(1);

        let extra_env: Vec<EnvVar> = self
            .cluster
            .spec
            .extra_env
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                ..Default::default()
            })
            .collect();

        StatefulSet {
            metadata: ObjectMeta {
                name: Some(self.statefulset_name()),
                namespace: self.cluster.namespace(),
                labels: Some(labels.clone()),
                owner_references: owner_refs(self.cluster),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                service_name: Some(self.headless_service_name()),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                volume_claim_templates: Some(vec![PersistentVolumeClaim {
                    metadata: ObjectMeta {
                        name: Some("data".to_string()),
                        ..Default::default()
                    },
                    spec: Some(PersistentVolumeClaimSpec {
                        access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                        resources: Some(VolumeResourceRequirements {
                            requests: Some(BTreeMap::from([(
                                "storage".to_string(),
                                Quantity(STORAGE_REQUEST.to_string()),
                            )])),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "server".to_string(),
                            image: Some(self.image.clone()),
                            image_pull_policy: Some(self.image_pull_policy.clone()),
                            command: Some(vec![
                                "/bin/sh".to_string(),
                                "-c".to_string(),
                                SERVER_ENTRYPOINT.to_string(),
                            ]),
                            env: (!extra_env.is_empty()).then_some(extra_env),
                            ports: Some(vec![ContainerPort {
                                name: Some("k8s-api".to_string()),
                                container_port: SERVER_PORT,
                                ..Default::default()
                            }]),
                            security_context: Some(SecurityContext {
                                privileged: Some(true),
                                ..Default::default()
                            }),
                            volume_mounts: Some(vec![
                                VolumeMount {
                                    name: "config-init".to_string(),
                                    mount_path: "/etc/server/init".to_string(),
                                    read_only: Some(true),
                                    ..Default::default()
                                },
                                VolumeMount {
                                    name: "config-join".to_string(),
                                    mount_path: "/etc/server/join".to_string(),
                                    read_only: Some(true),
                                    ..Default::default()
                                },
                                VolumeMount {
                                    name: "data".to_string(),
                                    mount_path: "/var/lib/server".to_string(),
                                    ..Default::default()
                                },
                            ]),
                            ..Default::default()
                        }],
                        volumes: Some(vec![
                            Volume {
                                name: "config-init".to_string(),
                                secret: Some(SecretVolumeSource {
                                    secret_name: Some(self.config_secret_name(true)),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            },
                            Volume {
                                name: "config-join".to_string(),
                                secret: Some(SecretVolumeSource {
                                    secret_name: Some(self.config_secret_name(false)),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Create both config secrets if absent. Content is never updated in
    /// place once created.
    pub async fn create_configs(&self, client: &Client, service_ip: &str) -> Result<()> {
        let secrets: Api<Secret> = Api::namespaced(client.clone(), &self.namespace());

        for init in [true, false] {
            let secret = self.config_secret(init, service_ip)?;
            create_if_absent(&secrets, &secret).await?;
        }

        Ok(())
    }

    /// Ensure the headless service and the server workload.
    pub async fn ensure_server(&self, client: &Client) -> Result<()> {
        let namespace = self.namespace();

        let services: Api<Service> = Api::namespaced(client.clone(), &namespace);
        create_if_absent(&services, &self.headless_service()).await?;

        let desired = self.stateful_set();
        let statefulsets: Api<StatefulSet> = Api::namespaced(client.clone(), &namespace);
        let result = ensure_object(
            &statefulsets,
            &desired,
            json!({ "spec": serde_json::to_value(&desired.spec)? }),
        )
        .await?;

        if result != EnsureResult::Unchanged {
            info!("server statefulset {namespace}/{} {result}", desired.name_any());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ClusterSpec, ClusterStatus};

    fn cluster() -> Cluster {
        let mut cluster = Cluster::new(
            "tenant-a",
            ClusterSpec {
                servers: Some(3),
                ..Default::default()
            },
        );
        cluster.metadata.namespace = Some("tenants".to_string());
        cluster.status = Some(ClusterStatus {
            host_version: Some("v1.30.2-k3s1".to_string()),
            cluster_cidr: Some("10.42.0.0/16".to_string()),
            service_cidr: Some("10.43.0.0/16".to_string()),
            ..Default::default()
        });
        cluster
    }

    #[test]
    fn test_init_config_declares_cluster_init() {
        let cluster = cluster();
        let builder = ServerBuilder::new(&cluster, "tok", "rancher/k3s", "IfNotPresent");

        let secret = builder.config_secret(true, "10.43.0.15").unwrap();
        let content = String::from_utf8(secret.data.unwrap()["config.yaml"].0.clone()).unwrap();
        assert!(content.contains("cluster-init: true"));
        assert!(!content.contains("server: https://"));
        assert!(content.contains("cluster-cidr: 10.42.0.0/16"));
    }

    #[test]
    fn test_join_config_points_at_service_ip() {
        let cluster = cluster();
        let builder = ServerBuilder::new(&cluster, "tok", "rancher/k3s", "IfNotPresent");

        let secret = builder.config_secret(false, "10.43.0.15").unwrap();
        let content = String::from_utf8(secret.data.unwrap()["config.yaml"].0.clone()).unwrap();
        assert!(content.contains("server: https://10.43.0.15:6443"));
        assert!(!content.contains("cluster-init"));
    }

    #[test]
    fn test_image_tag_comes_from_resolved_version() {
        let cluster = cluster();
        let builder = ServerBuilder::new(&cluster, "tok", "rancher/k3s", "IfNotPresent");
        assert_eq!(builder.image, "rancher/k3s:v1.30.2-k3s1");
    }

    #[test]
    fn test_spec_version_wins_over_resolved() {
        let mut cluster = cluster();
        cluster.spec.version = Some("v1.29.0-k3s1".to_string());
        let builder = ServerBuilder::new(&cluster, "tok", "rancher/k3s", "IfNotPresent");
        assert_eq!(builder.image, "rancher/k3s:v1.29.0-k3s1");
    }

    #[test]
    fn test_statefulset_shape() {
        let cluster = cluster();
        let builder = ServerBuilder::new(&cluster, "tok", "rancher/k3s", "IfNotPresent");

        let sts = builder.stateful_set();
        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.service_name.as_deref(), Some("vc-tenant-a-server-headless"));

        let claims = spec.volume_claim_templates.unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].metadata.name.as_deref(), Some("data"));
    }

    #[test]
    fn test_server_pod_mounts_both_configs() {
        let cluster = cluster();
        let builder = ServerBuilder::new(&cluster, "tok", "rancher/k3s", "IfNotPresent");

        let sts = builder.stateful_set();
        let pod = sts.spec.unwrap().template.spec.unwrap();

        let volumes = pod.volumes.as_ref().unwrap();
        let secret_names: Vec<_> = volumes
            .iter()
            .filter_map(|v| v.secret.as_ref().and_then(|s| s.secret_name.clone()))
            .collect();
        assert!(secret_names.contains(&"vc-tenant-a-init-server-config".to_string()));
        assert!(secret_names.contains(&"vc-tenant-a-server-config".to_string()));

        let command = pod.containers[0].command.as_ref().unwrap();
        assert!(command[2].contains("/etc/server/init/config.yaml"));
        assert!(command[2].contains("/etc/server/join/config.yaml"));
    }

    #[test]
    fn test_headless_service_has_no_cluster_ip() {
        let cluster = cluster();
        let builder = ServerBuilder::new(&cluster, "tok", "rancher/k3s", "IfNotPresent");

        let service = builder.headless_service();
        assert_eq!(service.spec.unwrap().cluster_ip.as_deref(), Some("None"));
    }
}
