use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

use crate::node_addr::NodeAddr;
use crate::routing::path::Path;

struct CachedRoute {
    path: Path,
    discovered_at: Instant,
}

/// Holds the most recently discovered path per destination, keyed by the destination's route
///  hash. Addresses sharing a hash slot evict each other, and a slot whose path ends at a
///  different node counts as a miss.
pub struct RouteCache {
    routes: FxHashMap<u16, CachedRoute>,
    ttl: Option<Duration>,
}

impl RouteCache {
    pub fn new(ttl: Option<Duration>) -> RouteCache {
        RouteCache {
            routes: FxHashMap::default(),
            ttl,
        }
    }

    pub fn get(&self, destination: NodeAddr, now: Instant) -> Option<&Path> {
        let route = self.routes.get(&destination.route_hash())?;
        if route.path.terminal() != Some(destination) {
            return None;
        }
        if self.is_expired(route, now) {
            return None;
        }
        Some(&route.path)
    }

    pub fn insert(&mut self, path: Path, now: Instant) {
        let Some(terminal) = path.terminal() else {
            return;
        };
        self.purge_expired(now);
        self.routes.insert(terminal.route_hash(), CachedRoute {
            path,
            discovered_at: now,
        });
    }

    pub fn remove(&mut self, destination: NodeAddr) {
        let slot = destination.route_hash();
        if let Some(route) = self.routes.get(&slot) {
            if route.path.terminal() == Some(destination) {
                self.routes.remove(&slot);
            }
        }
    }

    pub fn purge_expired(&mut self, now: Instant) {
        if let Some(ttl) = self.ttl {
            self.routes.retain(|_, route| now.duration_since(route.discovered_at) < ttl);
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    fn is_expired(&self, route: &CachedRoute, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.duration_since(route.discovered_at) >= ttl,
            None => false,
        }
    }
}
