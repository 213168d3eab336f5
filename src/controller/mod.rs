//! # Controller
//!
//! Core controller modules for the virtual cluster controller.
//!
//! - `agent`: agent provisioning strategies (virtual-node / shared-node)
//! - `backoff`: Fibonacci backoff mechanism for retries
//! - `bootstrap`: join token and bootstrap data generation
//! - `cidr`: best-effort host service CIDR discovery
//! - `kubeconfig`: admin kubeconfig generation
//! - `network`: network policy, cluster service and ingress convergence
//! - `reconciler`: the reconciliation engine and state machine
//! - `server`: virtual server workload and configuration convergence

pub mod agent;
pub mod backoff;
pub mod bootstrap;
pub mod cidr;
pub mod kubeconfig;
pub mod network;
pub mod reconciler;
pub mod server;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Prefix stamped on every owned resource name.
pub const NAME_PREFIX: &str = "vc";

/// Kubernetes object names are capped at 63 characters.
const MAX_NAME_LENGTH: usize = 63;

/// Concatenate name parts under the controller prefix, staying within the
/// Kubernetes 63-character name limit. Over-long names are truncated and
/// suffixed with a short hash of the full name so distinct inputs stay
/// distinct.
#[must_use]
pub fn safe_concat_name_with_prefix(parts: &[&str]) -> String {
    let mut all = vec![NAME_PREFIX];
    all.extend(parts.iter().filter(|p| !p.is_empty()));
    safe_concat_name(&all.join("-"))
}

fn safe_concat_name(name: &str) -> String {
    if name.len() <= MAX_NAME_LENGTH {
        return name.to_string();
    }

    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    let digest = format!("{:08x}", hasher.finish() as u32);

    // keep room for "-<8 char hash>"
    let keep = MAX_NAME_LENGTH - digest.len() - 1;
    let truncated = name[..keep].trim_end_matches('-');

    format!("{truncated}-{digest}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_and_joining() {
        assert_eq!(safe_concat_name_with_prefix(&["mycluster"]), "vc-mycluster");
        assert_eq!(
            safe_concat_name_with_prefix(&["mycluster", "bootstrap"]),
            "vc-mycluster-bootstrap"
        );
    }

    #[test]
    fn test_empty_parts_are_skipped() {
        assert_eq!(safe_concat_name_with_prefix(&["a", "", "b"]), "vc-a-b");
    }

    #[test]
    fn test_long_names_are_truncated_with_hash() {
        let long = "x".repeat(80);
        let name = safe_concat_name_with_prefix(&[&long, "kubeconfig"]);
        assert!(name.len() <= 63);

        // distinct long inputs must stay distinct
        let other_long = "y".repeat(80);
        let other = safe_concat_name_with_prefix(&[&other_long, "kubeconfig"]);
        assert_ne!(name, other);
    }

    #[test]
    fn test_truncation_is_deterministic() {
        let long = "z".repeat(100);
        assert_eq!(
            safe_concat_name_with_prefix(&[&long]),
            safe_concat_name_with_prefix(&[&long])
        );
    }
}
