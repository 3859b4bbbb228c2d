//! Deterministic identity→worker routing.
//!
//! Every worker in a fleet loads the same worker list from config, so any
//! instance (or a stateless front tier) resolves the same placement for a
//! given identity without shared state. Two strategies: plain hash-modulo,
//! and a consistent-hash ring with virtual nodes for deployments that want
//! minimal redistribution when the fleet is resized.

use std::collections::BTreeMap;

use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Virtual nodes per worker on the consistent-hash ring.
pub const DEFAULT_VIRTUAL_NODES: usize = 128;

/// Placement strategy for [`WorkerRouter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteStrategy {
    /// SHA-256 of the identity, modulo the worker count.
    #[default]
    Modulo,
    /// Consistent-hash ring with virtual nodes.
    Ring,
}

/// Maps identities onto a fixed set of worker endpoints.
#[derive(Debug, Clone)]
pub struct WorkerRouter {
    workers: Vec<String>,
    strategy: RouteStrategy,
    /// Ring point → index into `workers`. Empty under `Modulo`.
    ring: BTreeMap<u64, usize>,
}

impl WorkerRouter {
    pub fn new(workers: Vec<String>, strategy: RouteStrategy, virtual_nodes: usize) -> Self {
        let mut ring = BTreeMap::new();
        if strategy == RouteStrategy::Ring {
            for (index, worker) in workers.iter().enumerate() {
                for vnode in 0..virtual_nodes.max(1) {
                    ring.insert(hash64(&format!("{worker}#{vnode}")), index);
                }
            }
        }
        Self {
            workers,
            strategy,
            ring,
        }
    }

    /// Resolve the worker endpoint for an identity.
    ///
    /// Pure: the same identity against the same worker set always resolves
    /// to the same endpoint. Returns `None` when no workers are configured.
    pub fn route(&self, identity: &str) -> Option<&str> {
        if self.workers.is_empty() {
            return None;
        }
        let index = match self.strategy {
            RouteStrategy::Modulo => (hash64(identity) % self.workers.len() as u64) as usize,
            RouteStrategy::Ring => {
                let point = hash64(identity);
                self.ring
                    .range(point..)
                    .next()
                    .or_else(|| self.ring.iter().next())
                    .map(|(_, &index)| index)?
            }
        };
        Some(&self.workers[index])
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }
}

/// First 8 bytes of SHA-256, big-endian.
fn hash64(input: &str) -> u64 {
    let digest = Sha256::digest(input.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fleet(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("https://worker-{i}.internal")).collect()
    }

    #[test]
    fn route_is_deterministic() {
        let router = WorkerRouter::new(fleet(10), RouteStrategy::Modulo, 0);
        let first = router.route("alice@example.com").unwrap().to_string();
        let second = router.route("alice@example.com").unwrap().to_string();
        assert_eq!(first, second);
    }

    #[test]
    fn ring_is_deterministic() {
        let a = WorkerRouter::new(fleet(10), RouteStrategy::Ring, DEFAULT_VIRTUAL_NODES);
        let b = WorkerRouter::new(fleet(10), RouteStrategy::Ring, DEFAULT_VIRTUAL_NODES);
        for i in 0..100 {
            let identity = format!("user-{i}@example.com");
            assert_eq!(a.route(&identity), b.route(&identity));
        }
    }

    #[test]
    fn modulo_covers_all_workers() {
        let router = WorkerRouter::new(fleet(4), RouteStrategy::Modulo, 0);
        let mut seen = std::collections::HashSet::new();
        for i in 0..500 {
            seen.insert(router.route(&format!("user-{i}")).unwrap().to_string());
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn ring_growth_moves_keys_only_to_the_new_worker() {
        let before = WorkerRouter::new(fleet(5), RouteStrategy::Ring, DEFAULT_VIRTUAL_NODES);
        let mut workers = fleet(5);
        workers.push("https://worker-5.internal".to_string());
        let after = WorkerRouter::new(workers, RouteStrategy::Ring, DEFAULT_VIRTUAL_NODES);

        for i in 0..1000 {
            let identity = format!("user-{i}@example.com");
            let old = before.route(&identity).unwrap();
            let new = after.route(&identity).unwrap();
            if old != new {
                assert_eq!(new, "https://worker-5.internal");
            }
        }
    }

    #[test]
    fn empty_fleet_routes_nowhere() {
        let router = WorkerRouter::new(Vec::new(), RouteStrategy::Modulo, 0);
        assert!(router.route("anyone").is_none());
        assert!(router.is_empty());
    }
}
