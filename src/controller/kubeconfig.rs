//! # Kubeconfig
//!
//! Generation of the admin credentials file for a virtual cluster, stored in
//! a secret next to the cluster. The structure mirrors the standard
//! credentials-file format so it can be consumed by any standard client.

use crate::controller::network::SERVER_PORT;
use crate::controller::reconciler::{ensure_object, owner_refs, ReconcilerError};
use crate::controller::safe_concat_name_with_prefix;
use crate::crd::Cluster;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::Api;
use kube::{Client, ResourceExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

const KUBECONFIG_KEY: &str = "kubeconfig.yaml";

/// Standard credentials-file layout. Field names follow the wire format,
/// which is kebab-cased.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kubeconfig {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub clusters: Vec<NamedCluster>,
    pub contexts: Vec<NamedContext>,
    #[serde(rename = "current-context")]
    pub current_context: String,
    pub users: Vec<NamedUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: ClusterEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEndpoint {
    pub server: String,
    #[serde(rename = "insecure-skip-tls-verify")]
    pub insecure_skip_tls_verify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: Context,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub cluster: String,
    pub user: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedUser {
    pub name: String,
    pub user: UserCredentials,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCredentials {
    pub token: String,
}

/// Build the admin credentials for a cluster reachable at `service_ip`.
#[must_use]
pub fn generate(cluster: &Cluster, service_ip: &str, token: &str) -> Kubeconfig {
    let name = cluster.name_any();
    let context_name = format!("{name}-admin");

    Kubeconfig {
        api_version: "v1".to_string(),
        kind: "Config".to_string(),
        clusters: vec![NamedCluster {
            name: name.clone(),
            cluster: ClusterEndpoint {
                server: format!("https://{service_ip}:{SERVER_PORT}"),
                insecure_skip_tls_verify: true,
            },
        }],
        contexts: vec![NamedContext {
            name: context_name.clone(),
            context: Context {
                cluster: name,
                user: "admin".to_string(),
            },
        }],
        current_context: context_name,
        users: vec![NamedUser {
            name: "admin".to_string(),
            user: UserCredentials {
                token: token.to_string(),
            },
        }],
    }
}

/// Name of the kubeconfig secret for a cluster.
#[must_use]
pub fn kubeconfig_secret_name(cluster_name: &str) -> String {
    safe_concat_name_with_prefix(&[cluster_name, "kubeconfig"])
}

/// Serialize the admin credentials and converge the secret holding them.
pub async fn ensure_kubeconfig_secret(
    client: &Client,
    cluster: &Cluster,
    service_ip: &str,
    token: &str,
) -> Result<(), ReconcilerError> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let config = generate(cluster, service_ip, token);
    let content = serde_yaml::to_string(&config).map_err(anyhow::Error::from)?;

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(kubeconfig_secret_name(&cluster.name_any())),
            namespace: Some(namespace.clone()),
            owner_references: owner_refs(cluster),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            KUBECONFIG_KEY.to_string(),
            ByteString(content.into_bytes()),
        )])),
        ..Default::default()
    };

    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);
    let patch = json!({ "data": serde_json::to_value(&secret.data).map_err(kube::Error::SerdeError)? });
    ensure_object(&secrets, &secret, patch).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ClusterSpec;

    fn cluster() -> Cluster {
        let mut cluster = Cluster::new("tenant-a", ClusterSpec::default());
        cluster.metadata.namespace = Some("tenants".to_string());
        cluster
    }

    #[test]
    fn test_generate_points_at_service_ip() {
        let config = generate(&cluster(), "10.43.0.15", "tok");
        assert_eq!(config.clusters[0].cluster.server, "https://10.43.0.15:6443");
        assert_eq!(config.current_context, "tenant-a-admin");
        assert_eq!(config.users[0].user.token, "tok");
    }

    #[test]
    fn test_serialized_form_uses_wire_keys() {
        let config = generate(&cluster(), "10.43.0.15", "tok");
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("current-context: tenant-a-admin"));
        assert!(yaml.contains("insecure-skip-tls-verify: true"));
        assert!(yaml.contains("kind: Config"));
    }

    #[test]
    fn test_roundtrip() {
        let config = generate(&cluster(), "10.43.0.15", "tok");
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Kubeconfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.clusters[0].name, "tenant-a");
    }

    #[test]
    fn test_secret_name() {
        assert_eq!(kubeconfig_secret_name("tenant-a"), "vc-tenant-a-kubeconfig");
    }
}
