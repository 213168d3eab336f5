//! # CIDR Resolver
//!
//! Best-effort discovery of the host cluster's service address range, used
//! only when a shared-mode Cluster does not declare its own service CIDR.
//!
//! Two fallback strategies:
//!
//! 1. Create a Service with a deliberately invalid cluster IP and extract the
//!    valid range from the API server's rejection message. This is a
//!    heuristic against the upstream message format, not a contract.
//! 2. List the `kube-apiserver` pods in `kube-system` and scan their
//!    container arguments for `--service-cluster-ip-range`.
//!
//! If both strategies fail the caller falls back to a fixed default range;
//! this is a degraded outcome, not an error.

use anyhow::Result;
use ipnet::IpNet;
use k8s_openapi::api::core::v1::{Pod, Service, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use tracing::{info, warn};

const VALID_RANGE_MARKER: &str = "The range of valid IPs is ";
const SERVICE_RANGE_FLAG: &str = "--service-cluster-ip-range=";

/// Attempt to discover the host's service CIDR. Returns `Ok(None)` when
/// neither strategy produced a parseable range.
pub async fn lookup_service_cidr(client: &Client) -> Result<Option<String>> {
    info!("looking up service CIDR from a failing service creation");

    let services: Api<Service> = Api::namespaced(client.clone(), "default");
    let failing = Service {
        metadata: ObjectMeta {
            name: Some("vc-cidr-probe".to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("1.1.1.1".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };

    match services.create(&PostParams::default(), &failing).await {
        Err(err) => {
            if let Some(cidr) = cidr_from_rejection(&err.to_string()) {
                info!("found service CIDR from failing service creation: {cidr}");
                return Ok(Some(cidr));
            }
        }
        Ok(_) => {
            // The probe should never be admitted; if it was, clean it up.
            let _ = services
                .delete("vc-cidr-probe", &DeleteParams::default())
                .await;
        }
    }

    info!("looking up service CIDR from kube-apiserver pod");

    let pods: Api<Pod> = Api::namespaced(client.clone(), "kube-system");
    let lp = ListParams::default().labels("component=kube-apiserver,tier=control-plane");

    let pod_list = match pods.list(&lp).await {
        Ok(list) => list,
        Err(kube::Error::Api(api_err)) if api_err.code == 404 => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    if let Some(pod) = pod_list.items.first() {
        let args: Vec<String> = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.containers.first())
            .map(|c| {
                c.args
                    .clone()
                    .unwrap_or_default()
                    .into_iter()
                    .chain(c.command.clone().unwrap_or_default())
                    .collect()
            })
            .unwrap_or_default();

        if let Some(cidr) = cidr_from_apiserver_args(&args) {
            info!("found service CIDR from kube-apiserver pod: {cidr}");
            return Ok(Some(cidr));
        }
    }

    warn!("cannot find service CIDR from lookup");
    Ok(None)
}

/// Extract the valid service range hint from an admission rejection message.
/// Returns the normalized network address of the parsed block.
fn cidr_from_rejection(message: &str) -> Option<String> {
    let (_, tail) = message.split_once(VALID_RANGE_MARKER)?;

    // the hint is the first token after the marker
    let candidate = tail.split_whitespace().next()?.trim_matches(|c: char| {
        !(c.is_ascii_alphanumeric() || c == '.' || c == ':' || c == '/')
    });

    candidate.parse::<IpNet>().ok().map(|net| net.trunc().to_string())
}

/// Scan kube-apiserver container arguments for the service range flag.
fn cidr_from_apiserver_args(args: &[String]) -> Option<String> {
    for arg in args {
        if let Some(value) = arg.strip_prefix(SERVICE_RANGE_FLAG) {
            match value.parse::<IpNet>() {
                Ok(net) => return Some(net.trunc().to_string()),
                Err(err) => {
                    warn!("service CIDR flag value {value:?} is not valid: {err}");
                    return None;
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_from_rejection_message() {
        let message = "Service \"vc-cidr-probe\" is invalid: spec.clusterIPs: Invalid value: \
                       [\"1.1.1.1\"]: failed to allocate IP 1.1.1.1: the provided IP (1.1.1.1) \
                       is not in the valid range. The range of valid IPs is 10.96.0.0/12";
        assert_eq!(
            cidr_from_rejection(message),
            Some("10.96.0.0/12".to_string())
        );
    }

    #[test]
    fn test_cidr_from_rejection_normalizes_host_bits() {
        let message = format!("{VALID_RANGE_MARKER}10.43.0.1/16");
        assert_eq!(cidr_from_rejection(&message), Some("10.43.0.0/16".to_string()));
    }

    #[test]
    fn test_cidr_from_rejection_without_marker() {
        assert_eq!(cidr_from_rejection("connection refused"), None);
    }

    #[test]
    fn test_cidr_from_rejection_with_garbage_hint() {
        let message = format!("{VALID_RANGE_MARKER}not-a-cidr");
        assert_eq!(cidr_from_rejection(&message), None);
    }

    #[test]
    fn test_cidr_from_apiserver_args() {
        let args = vec![
            "--advertise-address=192.168.1.10".to_string(),
            "--service-cluster-ip-range=10.96.0.0/12".to_string(),
        ];
        assert_eq!(
            cidr_from_apiserver_args(&args),
            Some("10.96.0.0/12".to_string())
        );
    }

    #[test]
    fn test_cidr_from_apiserver_args_missing_flag() {
        let args = vec!["--etcd-servers=https://127.0.0.1:2379".to_string()];
        assert_eq!(cidr_from_apiserver_args(&args), None);
    }

    #[test]
    fn test_cidr_from_apiserver_args_invalid_value() {
        let args = vec!["--service-cluster-ip-range=bogus".to_string()];
        assert_eq!(cidr_from_apiserver_args(&args), None);
    }
}
