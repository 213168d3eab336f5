//! Port allocation for host-node mirroring.
//!
//! When a shared-node agent mirrors a real host node it binds a kubelet port
//! and a webhook port on that node, so every mirroring cluster needs a
//! distinct pair. Allocations are keyed by the cluster's configuration
//! identity: asking again for the same identity returns the same port, and a
//! port recorded in status before a restart is re-adopted instead of
//! re-allocated.

use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PortAllocatorError {
    #[error("port range {low}-{high} is exhausted")]
    Exhausted { low: i32, high: i32 },
}

#[derive(Debug, Default)]
struct Pool {
    // identity -> allocated port
    allocations: HashMap<String, i32>,
}

impl Pool {
    fn allocate(
        &mut self,
        identity: &str,
        recorded: Option<i32>,
        low: i32,
        high: i32,
    ) -> Result<i32, PortAllocatorError> {
        if let Some(port) = self.allocations.get(identity) {
            return Ok(*port);
        }

        // Re-adopt a port already persisted in status (controller restart).
        if let Some(port) = recorded {
            if (low..=high).contains(&port) && !self.in_use(port) {
                self.allocations.insert(identity.to_string(), port);
                return Ok(port);
            }
        }

        for port in low..=high {
            if !self.in_use(port) {
                self.allocations.insert(identity.to_string(), port);
                return Ok(port);
            }
        }

        Err(PortAllocatorError::Exhausted { low, high })
    }

    fn in_use(&self, port: i32) -> bool {
        self.allocations.values().any(|p| *p == port)
    }

    fn release(&mut self, identity: &str) {
        self.allocations.remove(identity);
    }
}

/// Allocator for the kubelet and webhook port pools. Shared across
/// reconciliation workers; all methods take `&self`.
#[derive(Debug)]
pub struct PortAllocator {
    kubelet_range: (i32, i32),
    webhook_range: (i32, i32),
    kubelet: Mutex<Pool>,
    webhook: Mutex<Pool>,
}

impl PortAllocator {
    #[must_use]
    pub fn new(kubelet_range: (i32, i32), webhook_range: (i32, i32)) -> Self {
        Self {
            kubelet_range,
            webhook_range,
            kubelet: Mutex::new(Pool::default()),
            webhook: Mutex::new(Pool::default()),
        }
    }

    /// Allocate (or re-adopt) the kubelet port for an identity.
    pub fn allocate_kubelet_port(
        &self,
        identity: &str,
        recorded: Option<i32>,
    ) -> Result<i32, PortAllocatorError> {
        let (low, high) = self.kubelet_range;
        self.kubelet
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .allocate(identity, recorded, low, high)
    }

    /// Allocate (or re-adopt) the webhook port for an identity.
    pub fn allocate_webhook_port(
        &self,
        identity: &str,
        recorded: Option<i32>,
    ) -> Result<i32, PortAllocatorError> {
        let (low, high) = self.webhook_range;
        self.webhook
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .allocate(identity, recorded, low, high)
    }

    /// Return both ports of a deleted cluster to the pools.
    pub fn release(&self, identity: &str) {
        self.kubelet
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .release(identity);
        self.webhook
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .release(identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> PortAllocator {
        PortAllocator::new((50000, 50002), (51000, 51002))
    }

    #[test]
    fn test_allocation_is_idempotent_per_identity() {
        let allocator = allocator();
        let first = allocator.allocate_kubelet_port("tenants/a", None).unwrap();
        let second = allocator.allocate_kubelet_port("tenants/a", None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_distinct_identities_get_distinct_ports() {
        let allocator = allocator();
        let a = allocator.allocate_kubelet_port("tenants/a", None).unwrap();
        let b = allocator.allocate_kubelet_port("tenants/b", None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_recorded_port_is_re_adopted() {
        let allocator = allocator();
        let port = allocator
            .allocate_kubelet_port("tenants/a", Some(50001))
            .unwrap();
        assert_eq!(port, 50001);

        // another identity cannot take the re-adopted port
        let other = allocator.allocate_kubelet_port("tenants/b", None).unwrap();
        assert_ne!(other, 50001);
    }

    #[test]
    fn test_recorded_port_outside_range_is_ignored() {
        let allocator = allocator();
        let port = allocator
            .allocate_kubelet_port("tenants/a", Some(9999))
            .unwrap();
        assert_ne!(port, 9999);
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let allocator = allocator();
        for identity in ["a", "b", "c"] {
            allocator.allocate_kubelet_port(identity, None).unwrap();
        }
        let err = allocator.allocate_kubelet_port("d", None).unwrap_err();
        assert!(matches!(err, PortAllocatorError::Exhausted { .. }));
    }

    #[test]
    fn test_release_frees_the_pair() {
        let allocator = allocator();
        let kubelet = allocator.allocate_kubelet_port("a", None).unwrap();
        let webhook = allocator.allocate_webhook_port("a", None).unwrap();

        allocator.release("a");

        assert_eq!(allocator.allocate_kubelet_port("b", None).unwrap(), kubelet);
        assert_eq!(allocator.allocate_webhook_port("b", None).unwrap(), webhook);
    }

    #[test]
    fn test_kubelet_and_webhook_pools_are_independent() {
        let allocator = allocator();
        let kubelet = allocator.allocate_kubelet_port("a", None).unwrap();
        let webhook = allocator.allocate_webhook_port("a", None).unwrap();
        assert_ne!(kubelet, webhook);
    }
}
