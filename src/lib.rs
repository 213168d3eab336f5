//! Virtual Cluster Controller Library
//!
//! A Kubernetes controller that provisions nested ("virtual") Kubernetes
//! control planes from `Cluster` custom resources.
//!
//! ## Overview
//!
//! For every `Cluster` the controller converges a full set of owned
//! infrastructure: namespace isolation, a stable cluster service, server
//! configuration, a replicated server workload, an agent (virtual-node or
//! shared-node strategy), optional ingress exposure, and the bootstrap and
//! kubeconfig secrets clients need to reach the virtual API server.
//!
//! Namespaces can be bound to a `VirtualClusterPolicy` that restricts which
//! provisioning mode Clusters in that namespace may use.

pub mod controller;
pub mod crd;
pub mod observability;
pub mod server;
