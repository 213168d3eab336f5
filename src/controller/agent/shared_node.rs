//! Shared-node agent: a kubelet shim scheduling virtual cluster pods onto
//! host nodes. Runs under a dedicated service account that the controller
//! binds into the cluster-scoped node and priority-class roles. With
//! host-node mirroring the pod joins the host network and binds its
//! allocated kubelet and webhook ports there.

use super::{agent_service_account_name, AgentContext, SHARED_NODE_AGENT_NAME};
use crate::controller::reconciler::{create_if_absent, ensure_object, owner_refs};
use crate::controller::safe_concat_name_with_prefix;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, Secret, SecretVolumeSource,
    Service, ServiceAccount, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::api::Api;
use kube::{Client, ResourceExt};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::info;

/// Shim configuration mounted into the agent pod.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SharedAgentConfig<'a> {
    cluster_name: String,
    cluster_namespace: String,
    server_ip: &'a str,
    token: &'a str,
    kubelet_port: i32,
    webhook_port: i32,
}

#[derive(Debug)]
pub struct SharedNodeAgent {
    ctx: AgentContext,
    kubelet_port: i32,
    webhook_port: i32,
}

impl SharedNodeAgent {
    #[must_use]
    pub fn new(ctx: AgentContext, kubelet_port: i32, webhook_port: i32) -> Self {
        Self {
            ctx,
            kubelet_port,
            webhook_port,
        }
    }

    fn name(&self) -> String {
        agent_service_account_name(&self.ctx.cluster.name_any())
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("cluster".to_string(), self.ctx.cluster.name_any()),
            ("role".to_string(), SHARED_NODE_AGENT_NAME.to_string()),
        ])
    }

    fn service_account(&self) -> ServiceAccount {
        ServiceAccount {
            metadata: ObjectMeta {
                name: Some(self.name()),
                namespace: self.ctx.cluster.namespace(),
                owner_references: owner_refs(&self.ctx.cluster),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn config_secret(&self) -> anyhow::Result<Secret> {
        let config = SharedAgentConfig {
            cluster_name: self.ctx.cluster.name_any(),
            cluster_namespace: self
                .ctx
                .cluster
                .namespace()
                .unwrap_or_else(|| "default".to_string()),
            server_ip: &self.ctx.service_ip,
            token: &self.ctx.token,
            kubelet_port: self.kubelet_port,
            webhook_port: self.webhook_port,
        };
        let content = serde_yaml::to_string(&config)?;

        Ok(Secret {
            metadata: ObjectMeta {
                name: Some(safe_concat_name_with_prefix(&[
                    &self.ctx.cluster.name_any(),
                    SHARED_NODE_AGENT_NAME,
                    "config",
                ])),
                namespace: self.ctx.cluster.namespace(),
                owner_references: owner_refs(&self.ctx.cluster),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "config.yaml".to_string(),
                ByteString(content.into_bytes()),
            )])),
            ..Default::default()
        })
    }

    fn deployment(&self, config_secret_name: &str) -> Deployment {
        let labels = self.labels();
        let mirror = self.ctx.cluster.spec.mirror_host_nodes;

        let extra_env: Vec<EnvVar> = self
            .ctx
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

        Deployment {
            metadata: ObjectMeta {
                name: Some(self.name()),
                namespace: self.ctx.cluster.namespace(),
                labels: Some(labels.clone()),
                owner_references: owner_refs(&self.ctx.cluster),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        service_account_name: Some(self.name()),
                        host_network: mirror.then_some(true),
                        containers: vec![Container {
                            name: SHARED_NODE_AGENT_NAME.to_string(),
                            image: Some(self.ctx.image.clone()),
                            image_pull_policy: Some(self.ctx.image_pull_policy.clone()),
                            args: Some(vec![
                                "--config".to_string(),
                                "/etc/kubelet/config.yaml".to_string(),
                            ]),
                            env: (!extra_env.is_empty()).then_some(extra_env),
                            ports: Some(vec![
                                ContainerPort {
                                    name: Some("kubelet".to_string()),
                                    container_port: self.kubelet_port,
                                    host_port: mirror.then_some(self.kubelet_port),
                                    ..Default::default()
                                },
                                ContainerPort {
                                    name: Some("webhook".to_string()),
                                    container_port: self.webhook_port,
                                    host_port: mirror.then_some(self.webhook_port),
                                    ..Default::default()
                                },
                            ]),
                            volume_mounts: Some(vec![VolumeMount {
                                name: "config".to_string(),
                                mount_path: "/etc/kubelet".to_string(),
                                read_only: Some(true),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        volumes: Some(vec![Volume {
                            name: "config".to_string(),
                            secret: Some(SecretVolumeSource {
                                secret_name: Some(config_secret_name.to_string()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn webhook_service(&self) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(self.name()),
                namespace: self.ctx.cluster.namespace(),
                owner_references: owner_refs(&self.ctx.cluster),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(self.labels()),
                ports: Some(vec![ServicePort {
                    name: Some("webhook".to_string()),
                    port: self.webhook_port,
                    target_port: Some(IntOrString::String("webhook".to_string())),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub async fn ensure_resources(&self, client: &Client) -> anyhow::Result<()> {
        let namespace = self
            .ctx
            .cluster
            .namespace()
            .unwrap_or_else(|| "default".to_string());
        let name = self.ctx.cluster.name_any();

        let accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), &namespace);
        create_if_absent(&accounts, &self.service_account()).await?;

        let secret = self.config_secret()?;
        let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);
        let secret_result = ensure_object(
            &secrets,
            &secret,
            json!({ "data": serde_json::to_value(&secret.data)? }),
        )
        .await?;

        let deployment = self.deployment(&secret.name_any());
        let deployments: Api<Deployment> = Api::namespaced(client.clone(), &namespace);
        let deploy_result = ensure_object(
            &deployments,
            &deployment,
            json!({ "spec": serde_json::to_value(&deployment.spec)? }),
        )
        .await?;

        let service = self.webhook_service();
        let services: Api<Service> = Api::namespaced(client.clone(), &namespace);
        let service_result = ensure_object(
            &services,
            &service,
            json!({ "spec": {
                "selector": service.spec.as_ref().and_then(|s| s.selector.clone()),
                "ports": service.spec.as_ref().and_then(|s| s.ports.clone()),
            }}),
        )
        .await?;

        if secret_result.changed() || deploy_result.changed() || service_result.changed() {
            info!(
                "shared agent for {namespace}/{name}: config {secret_result}, \
                 deployment {deploy_result}, service {service_result}"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Cluster, ClusterSpec};

    fn agent(mirror: bool) -> SharedNodeAgent {
        let mut cluster = Cluster::new(
            "tenant-a",
            ClusterSpec {
                mirror_host_nodes: mirror,
                ..Default::default()
            },
        );
        cluster.metadata.namespace = Some("tenants".to_string());

        SharedNodeAgent::new(
            AgentContext {
                cluster,
                service_ip: "10.43.0.15".to_string(),
                token: "s3cret".to_string(),
                image: "ghcr.io/microscaler/vc-kubelet:latest".to_string(),
                image_pull_policy: "IfNotPresent".to_string(),
            },
            50001,
            51001,
        )
    }

    #[test]
    fn test_config_carries_allocated_ports() {
        let secret = agent(true).config_secret().unwrap();
        let content =
            String::from_utf8(secret.data.unwrap()["config.yaml"].0.clone()).unwrap();
        assert!(content.contains("kubeletPort: 50001"));
        assert!(content.contains("webhookPort: 51001"));
        assert!(content.contains("serverIp: 10.43.0.15"));
    }

    #[test]
    fn test_mirroring_joins_host_network() {
        let deployment = agent(true).deployment("cfg");
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.host_network, Some(true));

        let ports = pod.containers[0].ports.as_ref().unwrap();
        assert_eq!(ports[0].host_port, Some(50001));
    }

    #[test]
    fn test_without_mirroring_stays_off_host_network() {
        let deployment = agent(false).deployment("cfg");
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.host_network, None);
        assert_eq!(pod.containers[0].ports.as_ref().unwrap()[0].host_port, None);
    }

    #[test]
    fn test_runs_under_bound_service_account() {
        let deployment = agent(false).deployment("cfg");
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("vc-tenant-a-kubelet"));
    }
}
