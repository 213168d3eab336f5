//! Prints the CustomResourceDefinitions for this controller as YAML.
//!
//! Usage: `cargo run --bin crdgen > deploy/crds.yaml`

use kube::CustomResourceExt;
use virtual_cluster_controller::crd::{Cluster, VirtualClusterPolicy};

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Cluster::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&VirtualClusterPolicy::crd())?);

    Ok(())
}
