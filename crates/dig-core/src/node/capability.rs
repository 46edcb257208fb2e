//! Capability Tracker (§4.3).
//!
//! Maintains a reachability/relay-capability profile for every
//! `verified-overlay` peer, refreshed through three redundant paths
//! (gossip, DHT, on-demand query) and periodically retested.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::node::fabric::{DirectTransport, Fabric, PeerId};
use crate::node::store::now_unix;

/// How a peer is currently believed to be reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReachabilityClass {
    /// Loopback address (same host).
    Loopback,
    /// Private LAN address.
    Lan,
    /// Publicly routable address.
    Public,
    /// Only reachable through a relay.
    ViaRelay,
    /// Only reachable through a WebRTC data channel.
    ViaWebRtc,
}

/// A peer's capability profile (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityProfile {
    /// Can receive unsolicited inbound connections.
    #[serde(rename = "acceptsDirectConnections")]
    pub accepts_direct_connections: bool,
    /// Accepts relaying store bytes for other peers.
    #[serde(rename = "canActAsRelay")]
    pub can_act_as_relay: bool,
    /// Traversal methods observed to have worked for this peer.
    #[serde(rename = "observedTraversalMethods")]
    pub observed_traversal_methods: Vec<ReachabilityClass>,
    /// Unix timestamp of the last successful retest.
    #[serde(rename = "lastTested")]
    pub last_tested: u64,
}

impl CapabilityProfile {
    fn fresh(accepts_direct: bool) -> Self {
        Self {
            accepts_direct_connections: accepts_direct,
            can_act_as_relay: accepts_direct,
            observed_traversal_methods: Vec::new(),
            last_tested: now_unix(),
        }
    }
}

fn is_loopback_or_private(addr: &str) -> bool {
    let host = addr.split(':').next().unwrap_or(addr);
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return match ip {
            std::net::IpAddr::V4(v4) => {
                v4.is_loopback() || v4.is_private() || v4.is_link_local()
            }
            std::net::IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
        };
    }
    host == "localhost"
}

/// Tracks capability profiles for this node's peers and for itself.
pub struct CapabilityTracker {
    profiles: Arc<DashMap<PeerId, CapabilityProfile>>,
    self_profile: Arc<tokio::sync::RwLock<CapabilityProfile>>,
    self_retest_interval: Duration,
    peer_retest_interval: Duration,
}

impl CapabilityTracker {
    /// Build a tracker with the spec's default cadence (5 min self, 10 min
    /// others).
    #[must_use]
    pub fn new() -> Self {
        Self {
            profiles: Arc::new(DashMap::new()),
            self_profile: Arc::new(tokio::sync::RwLock::new(CapabilityProfile::fresh(false))),
            self_retest_interval: Duration::from_secs(5 * 60),
            peer_retest_interval: Duration::from_secs(10 * 60),
        }
    }

    /// Compute this node's own capability from its fabric-reported
    /// addresses: `acceptsDirect = ∃ public, non-loopback, non-private
    /// listen address`; `canActAsRelay = acceptsDirect` (§4.3).
    pub async fn recompute_self(&self, fabric: &dyn Fabric) -> CapabilityProfile {
        let addresses = fabric.local_addresses();
        let accepts_direct = addresses.iter().any(|a| !is_loopback_or_private(a));
        let profile = CapabilityProfile::fresh(accepts_direct);
        *self.self_profile.write().await = profile.clone();
        profile
    }

    /// This node's current self-profile.
    pub async fn self_profile(&self) -> CapabilityProfile {
        self.self_profile.read().await.clone()
    }

    /// Merge in a profile learned from gossip, DHT, or `GET_PEER_INFO` for
    /// `peer_id`.
    pub fn observe(&self, peer_id: PeerId, profile: CapabilityProfile) {
        self.profiles.insert(peer_id, profile);
    }

    /// Current profile for `peer_id`, if one has been observed.
    #[must_use]
    pub fn get(&self, peer_id: &PeerId) -> Option<CapabilityProfile> {
        self.profiles.get(peer_id).map(|p| p.clone())
    }

    /// All peers currently believed relay-capable.
    #[must_use]
    pub fn relay_capable_peers(&self) -> Vec<PeerId> {
        self.profiles
            .iter()
            .filter(|e| e.value().can_act_as_relay)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Whether `peer_id`'s profile is due for a retest, given `is_self`.
    #[must_use]
    pub fn needs_retest(&self, peer_id: &PeerId, is_self: bool) -> bool {
        let interval = if is_self {
            self.self_retest_interval
        } else {
            self.peer_retest_interval
        };
        match self.profiles.get(peer_id) {
            Some(profile) => now_unix().saturating_sub(profile.last_tested) >= interval.as_secs(),
            None => true,
        }
    }

    /// Drop a peer's profile, e.g. on disconnect.
    pub fn remove(&self, peer_id: &PeerId) {
        self.profiles.remove(peer_id);
    }
}

impl Default for CapabilityTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::fabric::test_double::TestFabric;

    #[tokio::test]
    async fn self_capability_false_with_only_private_addresses() {
        let tracker = CapabilityTracker::new();
        let fabric = TestFabric::new("local").with_addresses(vec!["192.168.1.5:4001".to_string()]);
        let profile = tracker.recompute_self(&fabric).await;
        assert!(!profile.accepts_direct_connections);
        assert!(!profile.can_act_as_relay);
    }

    #[tokio::test]
    async fn self_capability_true_with_public_address() {
        let tracker = CapabilityTracker::new();
        let fabric = TestFabric::new("local").with_addresses(vec!["203.0.113.5:4001".to_string()]);
        let profile = tracker.recompute_self(&fabric).await;
        assert!(profile.accepts_direct_connections);
        assert!(profile.can_act_as_relay);
    }

    #[test]
    fn needs_retest_true_for_unknown_peer() {
        let tracker = CapabilityTracker::new();
        assert!(tracker.needs_retest(&"peer-a".to_string(), false));
    }

    #[test]
    fn observed_profile_is_queryable_and_removable() {
        let tracker = CapabilityTracker::new();
        tracker.observe("peer-a".to_string(), CapabilityProfile::fresh(true));
        assert!(tracker.get(&"peer-a".to_string()).is_some());
        assert_eq!(tracker.relay_capable_peers(), vec!["peer-a".to_string()]);
        tracker.remove(&"peer-a".to_string());
        assert!(tracker.get(&"peer-a".to_string()).is_none());
    }
}
