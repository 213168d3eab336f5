//! # Bootstrap
//!
//! Join token management and retrieval of the server's bootstrap data.
//!
//! The token either comes from a user-provided secret or is generated once
//! and stored alongside the cluster. Bootstrap data is fetched from the
//! virtual server itself; until the server answers, the pass yields the
//! distinguished not-ready error and is retried on a short fixed delay.

use crate::controller::network::SERVER_PORT;
use crate::controller::reconciler::{ensure_object, owner_refs, ReconcilerError};
use crate::controller::safe_concat_name_with_prefix;
use crate::crd::Cluster;
use anyhow::anyhow;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

const TOKEN_KEY: &str = "token";
const BOOTSTRAP_PATH: &str = "v1-k3s/server-bootstrap";
const BOOTSTRAP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Name of the generated token secret for a cluster.
#[must_use]
pub fn token_secret_name(cluster_name: &str) -> String {
    safe_concat_name_with_prefix(&[cluster_name, "token"])
}

/// Resolve the cluster's join token: read the referenced secret when the
/// spec names one, otherwise generate a random token once and persist it.
pub async fn ensure_token(client: &Client, cluster: &Cluster) -> Result<String, ReconcilerError> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);

    if let Some(ref_name) = &cluster.spec.token_secret_ref {
        let secret = secrets.get(ref_name).await?;
        return token_from_secret(&secret).ok_or_else(|| {
            ReconcilerError::Validation(format!(
                "token secret {namespace}/{ref_name} has no {TOKEN_KEY:?} key"
            ))
        });
    }

    let name = token_secret_name(&cluster.name_any());
    if let Some(existing) = secrets.get_opt(&name).await? {
        return token_from_secret(&existing)
            .ok_or_else(|| ReconcilerError::Other(anyhow!("token secret {namespace}/{name} is corrupt")));
    }

    let token = uuid::Uuid::new_v4().simple().to_string();
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            owner_references: owner_refs(cluster),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            TOKEN_KEY.to_string(),
            ByteString(token.clone().into_bytes()),
        )])),
        ..Default::default()
    };

    match secrets.create(&PostParams::default(), &secret).await {
        Ok(_) => {
            info!("generated join token secret {namespace}/{name}");
            Ok(token)
        }
        // lost a create race against a concurrent writer; adopt theirs
        Err(kube::Error::Api(api_err)) if api_err.code == 409 => {
            let existing = secrets.get(&name).await?;
            token_from_secret(&existing)
                .ok_or_else(|| ReconcilerError::Other(anyhow!("token secret {namespace}/{name} is corrupt")))
        }
        Err(err) => Err(err.into()),
    }
}

fn token_from_secret(secret: &Secret) -> Option<String> {
    let data = secret.data.as_ref()?;
    let value = data.get(TOKEN_KEY)?;
    String::from_utf8(value.0.clone()).ok()
}

/// Fetch bootstrap data (CA material and credentials) from the virtual
/// server over its internal service address. The server presents a
/// self-signed certificate at this stage, so verification is skipped.
pub async fn generate_bootstrap_data(
    service_ip: &str,
    token: &str,
) -> Result<Vec<u8>, ReconcilerError> {
    let url = format!("https://{service_ip}:{SERVER_PORT}/{BOOTSTRAP_PATH}");
    debug!("fetching bootstrap data from {url}");

    let http = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(BOOTSTRAP_REQUEST_TIMEOUT)
        .build()
        .map_err(|err| ReconcilerError::Other(err.into()))?;

    let response = http
        .get(&url)
        .basic_auth("server", Some(token))
        .send()
        .await
        .map_err(|err| {
            if err.is_connect() || err.is_timeout() {
                ReconcilerError::ServerNotReady
            } else {
                ReconcilerError::Other(err.into())
            }
        })?;

    if !response.status().is_success() {
        // the endpoint exists only once the server has finished initializing
        return Err(ReconcilerError::ServerNotReady);
    }

    let body = response
        .bytes()
        .await
        .map_err(|err| ReconcilerError::Other(err.into()))?;

    Ok(body.to_vec())
}

/// Wrap the bootstrap data in a secret owned by the cluster.
pub async fn ensure_bootstrap_secret(
    client: &Client,
    cluster: &Cluster,
    service_ip: &str,
    token: &str,
) -> Result<(), ReconcilerError> {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let data = generate_bootstrap_data(service_ip, token).await?;

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(safe_concat_name_with_prefix(&[
                &cluster.name_any(),
                "bootstrap",
            ])),
            namespace: Some(namespace),
            owner_references: owner_refs(cluster),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "bootstrap".to_string(),
            ByteString(data),
        )])),
        ..Default::default()
    };

    let secrets: Api<Secret> = Api::namespaced(client.clone(), &secret.namespace().unwrap_or_default());
    let patch = json!({ "data": serde_json::to_value(&secret.data).map_err(kube::Error::SerdeError)? });
    ensure_object(&secrets, &secret, patch).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret_with(key: &str, value: &[u8]) -> Secret {
        Secret {
            data: Some(BTreeMap::from([(
                key.to_string(),
                ByteString(value.to_vec()),
            )])),
            ..Default::default()
        }
    }

    #[test]
    fn test_token_extraction() {
        assert_eq!(
            token_from_secret(&secret_with("token", b"s3cret")),
            Some("s3cret".to_string())
        );
    }

    #[test]
    fn test_token_missing_key() {
        assert_eq!(token_from_secret(&secret_with("other", b"s3cret")), None);
        assert_eq!(token_from_secret(&Secret::default()), None);
    }

    #[test]
    fn test_token_invalid_utf8() {
        assert_eq!(token_from_secret(&secret_with("token", &[0xff, 0xfe])), None);
    }

    #[test]
    fn test_token_secret_name() {
        assert_eq!(token_secret_name("tenant-a"), "vc-tenant-a-token");
    }

    #[tokio::test]
    async fn test_unreachable_server_maps_to_not_ready() {
        // 192.0.2.0/24 is reserved for documentation and never routable
        let err = generate_bootstrap_data("192.0.2.1", "tok").await.unwrap_err();
        assert!(matches!(err, ReconcilerError::ServerNotReady));
    }
}
