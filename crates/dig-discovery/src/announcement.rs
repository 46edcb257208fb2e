//! Wire shapes for discovery announcements (§4.4, §6).
//!
//! Consumed from both the DHT record at `/dig-network-v1/peers/<peerId>`
//! and the gossip topic `dig-network-announcements`; both carry the same
//! payload shape.

use serde::{Deserialize, Serialize};

/// `{peerId, networkId, overlayAddress, capabilities, stores, timestamp}`
/// (§4.4). Consumers filter by `networkId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    /// Announcing peer's stable id.
    #[serde(rename = "peerId")]
    pub peer_id: String,
    /// Overlay network id the peer claims membership in.
    #[serde(rename = "networkId")]
    pub network_id: String,
    /// Peer's derived overlay address, colon-hex form.
    #[serde(rename = "overlayAddress")]
    pub overlay_address: String,
    /// Capability tags the peer advertises.
    pub capabilities: Vec<String>,
    /// Store ids the peer advertises as locally available.
    pub stores: Vec<String>,
    /// Unix timestamp the announcement was produced.
    pub timestamp: u64,
}

impl PeerAnnouncement {
    /// True if this announcement is for the given overlay network.
    #[must_use]
    pub fn matches_network(&self, network_id: &str) -> bool {
        self.network_id == network_id
    }
}

/// DHT record stored at `/dig-store/<storeId>` (§3 invariant 8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreRecord {
    /// Hosting peer's stable id.
    #[serde(rename = "peerId")]
    pub peer_id: String,
    /// Hosting peer's overlay address.
    #[serde(rename = "overlayAddress")]
    pub overlay_address: String,
    /// Unix timestamp of the announcement.
    pub timestamp: u64,
}

/// DHT/gossip capability announcement at `/dig-capabilities/<peerId>` and
/// topic `dig-peer-connection-capabilities`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityAnnouncement {
    /// Announcing peer's stable id.
    #[serde(rename = "peerId")]
    pub peer_id: String,
    /// Can receive unsolicited inbound connections.
    #[serde(rename = "acceptsDirectConnections")]
    pub accepts_direct_connections: bool,
    /// Accepts relaying for others.
    #[serde(rename = "canActAsRelay")]
    pub can_act_as_relay: bool,
    /// Unix timestamp of the announcement.
    pub timestamp: u64,
}

/// Relay registry announcement at DHT key `/dig-relay-servers/registry`
/// and gossip topic `dig-relay-announcements`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayAnnouncement {
    /// Relay's stable peer id.
    #[serde(rename = "peerId")]
    pub peer_id: String,
    /// Dialable addresses for the relay.
    pub addresses: Vec<String>,
    /// Reported in-flight session count.
    #[serde(rename = "currentLoad")]
    pub current_load: u32,
    /// Reported maximum session capacity.
    #[serde(rename = "maxCapacity")]
    pub max_capacity: u32,
    /// Unix timestamp of the announcement.
    pub timestamp: u64,
}
