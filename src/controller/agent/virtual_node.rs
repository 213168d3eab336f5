//! Virtual-node agent: a full agent process emulating a node inside the
//! cluster's own namespace. No port allocation is involved; the agent only
//! talks to the cluster service.

use super::{AgentContext, VIRTUAL_NODE_AGENT_NAME};
use crate::controller::reconciler::{ensure_object, owner_refs};
use crate::controller::safe_concat_name_with_prefix;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PodSpec, PodTemplateSpec, Secret, SecretVolumeSource, SecurityContext,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::ByteString;
use kube::api::Api;
use kube::{Client, ResourceExt};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::info;

/// Join configuration mounted into the agent pod.
#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct AgentJoinConfig<'a> {
    server: String,
    token: &'a str,
}

#[derive(Debug)]
pub struct VirtualNodeAgent {
    ctx: AgentContext,
}

impl VirtualNodeAgent {
    #[must_use]
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }

    fn name(&self) -> String {
        safe_concat_name_with_prefix(&[&self.ctx.cluster.name_any(), VIRTUAL_NODE_AGENT_NAME])
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("cluster".to_string(), self.ctx.cluster.name_any()),
            ("role".to_string(), VIRTUAL_NODE_AGENT_NAME.to_string()),
        ])
    }

    fn config_secret(&self) -> anyhow::Result<Secret> {
        let config = AgentJoinConfig {
            server: format!("https://{}:6443", self.ctx.service_ip),
            token: &self.ctx.token,
        };
        let content = serde_yaml::to_string(&config)?;

        Ok(Secret {
            metadata: ObjectMeta {
                name: Some(safe_concat_name_with_prefix(&[
                    &self.ctx.cluster.name_any(),
                    VIRTUAL_NODE_AGENT_NAME,
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
                        containers: vec![Container {
                            name: VIRTUAL_NODE_AGENT_NAME.to_string(),
                            image: Some(self.ctx.image.clone()),
                            image_pull_policy: Some(self.ctx.image_pull_policy.clone()),
                            args: Some(vec![
                                "agent".to_string(),
                                "--config".to_string(),
                                "/etc/agent/config.yaml".to_string(),
                            ]),
                            env: (!extra_env.is_empty()).then_some(extra_env),
                            // the agent manages container runtimes itself
                            security_context: Some(SecurityContext {
                                privileged: Some(true),
                                ..Default::default()
                            }),
                            volume_mounts: Some(vec![VolumeMount {
                                name: "config".to_string(),
                                mount_path: "/etc/agent".to_string(),
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

    pub async fn ensure_resources(&self, client: &Client) -> anyhow::Result<()> {
        let namespace = self
            .ctx
            .cluster
            .namespace()
            .unwrap_or_else(|| "default".to_string());

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

        if secret_result.changed() || deploy_result.changed() {
            info!(
                "virtual agent for {namespace}/{}: config {secret_result}, deployment {deploy_result}",
                self.ctx.cluster.name_any()
            );
        }

        Ok(())
    }
}
