//! Accept-time assignment of connections to sub-reactors.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use crate::net::NetAddr;

/// Policy selecting the target sub-reactor for each accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalancing {
    /// Cycle through sub-reactor indices.
    #[default]
    RoundRobin,
    /// Pick the loop with the fewest live connections, ties by index.
    LeastConnections,
    /// Hash the peer address to an index; reconnecting clients keep
    /// landing on the same loop.
    SourceAddrHash,
}

/// Selects a sub-reactor index at accept time. Never blocks acceptance.
pub(crate) struct Balancer {
    policy: LoadBalancing,
    next: AtomicUsize,
    loads: Vec<Arc<AtomicI32>>,
}

impl Balancer {
    pub fn new(policy: LoadBalancing, loads: Vec<Arc<AtomicI32>>) -> Balancer {
        Balancer {
            policy,
            next: AtomicUsize::new(0),
            loads,
        }
    }

    pub fn len(&self) -> usize {
        self.loads.len()
    }

    /// Pick the loop index for a connection from `peer`.
    pub fn next(&self, peer: Option<&NetAddr>) -> usize {
        let n = self.loads.len();
        match self.policy {
            LoadBalancing::RoundRobin => self.next.fetch_add(1, Ordering::Relaxed) % n,
            LoadBalancing::LeastConnections => {
                let mut best = 0usize;
                let mut best_load = i32::MAX;
                for (idx, load) in self.loads.iter().enumerate() {
                    let l = load.load(Ordering::Relaxed);
                    if l < best_load {
                        best = idx;
                        best_load = l;
                    }
                }
                best
            }
            LoadBalancing::SourceAddrHash => {
                let mut hasher = DefaultHasher::new();
                match peer {
                    Some(NetAddr::Inet(sa)) => sa.hash(&mut hasher),
                    Some(NetAddr::Unix(p)) => p.hash(&mut hasher),
                    None => {}
                }
                (hasher.finish() as usize) % n
            }
        }
    }
}
