//! Relay ranking (§4.5): prefer lowest `currentLoad/maxCapacity`, break
//! ties by most-recently-seen-healthy.

use std::collections::HashMap;

/// One relay-capable peer known to the coordinator.
#[derive(Debug, Clone)]
pub struct RelayCandidate {
    /// Relay's stable peer id.
    pub peer_id: String,
    /// Dialable addresses advertised for this relay.
    pub addresses: Vec<String>,
    /// Currently reported in-flight session count.
    pub current_load: u32,
    /// Maximum sessions this relay advertises it can carry.
    pub max_capacity: u32,
    /// Unix timestamp of the last successful health check.
    pub last_seen_healthy: u64,
}

impl RelayCandidate {
    /// `currentLoad / maxCapacity`, treated as fully loaded (`1.0`) when
    /// `maxCapacity` is zero to avoid selecting a relay that cannot
    /// actually advertise capacity.
    #[must_use]
    pub fn load_ratio(&self) -> f64 {
        if self.max_capacity == 0 {
            return 1.0;
        }
        f64::from(self.current_load) / f64::from(self.max_capacity)
    }
}

/// Ranked registry of known relays, refreshed by DHT/gossip discovery and
/// periodic health checks (§4.5).
#[derive(Debug, Default)]
pub struct RelayRegistry {
    relays: HashMap<String, RelayCandidate>,
}

impl RelayRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            relays: HashMap::new(),
        }
    }

    /// Insert or replace a relay's current state.
    pub fn upsert(&mut self, candidate: RelayCandidate) {
        self.relays.insert(candidate.peer_id.clone(), candidate);
    }

    /// Drop a relay, e.g. after it fails a health check repeatedly.
    pub fn remove(&mut self, peer_id: &str) {
        self.relays.remove(peer_id);
    }

    /// Relays ranked best-first: lowest load ratio, ties broken by most
    /// recent `last_seen_healthy`.
    #[must_use]
    pub fn ranked(&self) -> Vec<&RelayCandidate> {
        let mut relays: Vec<&RelayCandidate> = self.relays.values().collect();
        relays.sort_by(|a, b| {
            a.load_ratio()
                .partial_cmp(&b.load_ratio())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.last_seen_healthy.cmp(&a.last_seen_healthy))
        });
        relays
    }

    /// The single best relay, if any are registered.
    #[must_use]
    pub fn best(&self) -> Option<&RelayCandidate> {
        self.ranked().into_iter().next()
    }

    /// Number of relays currently registered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.relays.len()
    }

    /// Whether the registry holds no relays.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, load: u32, cap: u32, seen: u64) -> RelayCandidate {
        RelayCandidate {
            peer_id: id.to_string(),
            addresses: vec![],
            current_load: load,
            max_capacity: cap,
            last_seen_healthy: seen,
        }
    }

    #[test]
    fn ranks_by_lowest_load_ratio() {
        let mut registry = RelayRegistry::new();
        registry.upsert(candidate("busy", 8, 10, 100));
        registry.upsert(candidate("idle", 1, 10, 100));
        assert_eq!(registry.best().unwrap().peer_id, "idle");
    }

    #[test]
    fn ties_break_by_most_recently_healthy() {
        let mut registry = RelayRegistry::new();
        registry.upsert(candidate("stale", 2, 10, 50));
        registry.upsert(candidate("fresh", 2, 10, 200));
        assert_eq!(registry.best().unwrap().peer_id, "fresh");
    }

    #[test]
    fn zero_capacity_relay_is_never_preferred() {
        let mut registry = RelayRegistry::new();
        registry.upsert(candidate("broken", 0, 0, 500));
        registry.upsert(candidate("ok", 5, 10, 1));
        assert_eq!(registry.best().unwrap().peer_id, "ok");
    }

    #[test]
    fn empty_registry_has_no_best() {
        let registry = RelayRegistry::new();
        assert!(registry.best().is_none());
    }
}
