//! Peer Registry & Security Classifier (§4.2).
//!
//! Runs, exactly once per new connection and before any overlay-specific
//! exchange beyond the identification probe, a deterministic decision tree
//! that assigns one of four classifications and an associated trust level.
//! Enforcement of the resulting policy happens at the `dig/1` dispatch
//! point in [`crate::node::node`]; this module only computes and stores the
//! verdict.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::node::error::{NodeError, Result};
use crate::node::fabric::{Fabric, PeerId};
use crate::node::protocol::{
    parse_request, IdentificationResponse, Request, VerifyMembershipResponse,
};
use crate::node::store::now_unix;
use dig_identity::OverlayAddress;

/// One of the four classifications a connected peer can receive (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// A well-known infrastructure peer (e.g. a bootstrap/relay-only node
    /// operated by the network itself). Never exchanges `dig/1` beyond
    /// fabric-level liveness.
    PublicInfrastructure,
    /// Responds to the fabric but does not speak `dig/1`, or fails the
    /// identification probe.
    Unknown,
    /// Passed both identification and membership verification.
    VerifiedOverlay,
    /// Speaks `dig/1` but failed membership verification.
    Suspicious,
}

/// Trust level associated with a [`Classification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trust {
    /// No `dig/1` access.
    None,
    /// Identification only.
    Minimal,
    /// Identification only (distinct trust tag from `Minimal`, same access
    /// surface, per §4.2's `unknown` row).
    Limited,
    /// Full `dig/1` surface.
    Full,
}

impl Classification {
    /// The trust level this classification carries.
    #[must_use]
    pub fn trust(self) -> Trust {
        match self {
            Classification::PublicInfrastructure => Trust::Minimal,
            Classification::Unknown => Trust::Limited,
            Classification::VerifiedOverlay => Trust::Full,
            Classification::Suspicious => Trust::None,
        }
    }

    /// True if `op` is permitted for peers with this classification, per
    /// the §4.2 policy table. `op` is `None` for the identification probe
    /// itself, which `unknown` peers may still perform.
    #[must_use]
    pub fn allows(self, op: Option<&str>) -> bool {
        match self {
            Classification::PublicInfrastructure | Classification::Suspicious => false,
            Classification::Unknown => op.is_none() || op == Some("DIG_NETWORK_IDENTIFICATION"),
            Classification::VerifiedOverlay => true,
        }
    }
}

/// Privacy level a peer has negotiated or been assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivacyLevel {
    /// No special handling.
    None,
    /// Basic: advertised data is shared but diagnostics are minimized.
    Basic,
    /// Maximum: advertised data withheld beyond the protocol minimum.
    Maximum,
}

/// A registry entry for one connected remote peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Stable peer id from the fabric.
    pub peer_id: PeerId,
    /// Overlay address, once known (derived from the peer's public key).
    pub overlay_address: Option<OverlayAddress>,
    /// Unix timestamp of first connection.
    pub first_seen: u64,
    /// Unix timestamp of the most recent activity.
    pub last_seen: u64,
    /// Current classification.
    pub classification: Classification,
    /// Current trust level (mirrors `classification.trust()` but kept
    /// explicit since it can be independently observed).
    pub trust: Trust,
    /// Operation tags explicitly allowed beyond the classification default.
    pub allow_set: HashSet<String>,
    /// Operation tags explicitly denied regardless of classification.
    pub deny_set: HashSet<String>,
    /// Negotiated privacy level.
    pub privacy: PrivacyLevel,
    /// Unix timestamp of the last classification run.
    pub last_classified: u64,
    /// Whether the most recent membership verification succeeded.
    pub verified: bool,
    /// Store ids the peer has advertised, if any.
    pub advertised_stores: Vec<String>,
    /// Capability tags the peer has advertised, if any.
    pub advertised_capabilities: Vec<String>,
    /// Relay endpoint the peer has advertised, if it claims relay
    /// capability.
    pub advertised_relay_endpoint: Option<String>,
}

impl PeerRecord {
    fn new(peer_id: PeerId, classification: Classification) -> Self {
        let now = now_unix();
        Self {
            peer_id,
            overlay_address: None,
            first_seen: now,
            last_seen: now,
            classification,
            trust: classification.trust(),
            allow_set: HashSet::new(),
            deny_set: HashSet::new(),
            privacy: PrivacyLevel::None,
            last_classified: now,
            verified: matches!(classification, Classification::VerifiedOverlay),
            advertised_stores: Vec::new(),
            advertised_capabilities: Vec::new(),
            advertised_relay_endpoint: None,
        }
    }

    /// Whether `op` is permitted, folding in per-peer overrides over the
    /// classification default.
    #[must_use]
    pub fn is_allowed(&self, op: &str) -> bool {
        if self.deny_set.contains(op) {
            return false;
        }
        if self.allow_set.contains(op) {
            return true;
        }
        self.classification.allows(Some(op))
    }
}

/// Timeouts the classifier uses while running the decision tree.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Deadline for the `DIG_NETWORK_IDENTIFICATION` round trip.
    pub identification_timeout: Duration,
    /// Overlay network id peers must confirm to pass step 2.
    pub network_id: String,
    /// Stable ids of known public-infrastructure peers.
    pub public_infrastructure: HashSet<PeerId>,
}

/// Peer registry: a concurrent map from peer id to [`PeerRecord`].
pub struct Registry {
    peers: Arc<DashMap<PeerId, PeerRecord>>,
    config: ClassifierConfig,
}

impl Registry {
    /// Build an empty registry using `config` for classification.
    #[must_use]
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Current record for `peer_id`, if connected.
    #[must_use]
    pub fn get(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.peers.get(peer_id).map(|r| r.clone())
    }

    /// All peers currently classified `verified-overlay`.
    #[must_use]
    pub fn verified_overlay_peers(&self) -> Vec<PeerRecord> {
        self.peers
            .iter()
            .filter(|r| r.classification == Classification::VerifiedOverlay)
            .map(|r| r.clone())
            .collect()
    }

    /// Remove a peer's record, e.g. on disconnect (§4.2: "every peer
    /// disconnection removes the record").
    pub fn remove(&self, peer_id: &PeerId) {
        self.peers.remove(peer_id);
    }

    /// Run the classifier's decision tree for a newly connected peer and
    /// store the resulting record, per §4.2.
    ///
    /// # Errors
    ///
    /// Classification failures are modeled as outcomes, not propagated
    /// errors (§7: "classification failures for a peer are silently
    /// isolating"); this only errors if `fabric` itself cannot be reached
    /// at all protocol layers in a way the caller must know about.
    pub async fn classify(
        &self,
        fabric: &dyn Fabric,
        peer_id: PeerId,
    ) -> Classification {
        if self.config.public_infrastructure.contains(&peer_id) {
            let record = PeerRecord::new(peer_id.clone(), Classification::PublicInfrastructure);
            self.peers.insert(peer_id, record);
            return Classification::PublicInfrastructure;
        }

        let identification = self.try_identify(fabric, &peer_id).await;
        let Some(identification) = identification else {
            let record = PeerRecord::new(peer_id.clone(), Classification::Unknown);
            self.peers.insert(peer_id, record);
            return Classification::Unknown;
        };

        if !identification.is_overlay_node || identification.network_id != self.config.network_id
        {
            let record = PeerRecord::new(peer_id.clone(), Classification::Unknown);
            self.peers.insert(peer_id, record);
            return Classification::Unknown;
        }

        let verified = self.try_verify_membership(fabric, &peer_id).await;
        let classification = if verified.is_some() {
            Classification::VerifiedOverlay
        } else {
            Classification::Suspicious
        };

        let mut record = PeerRecord::new(peer_id.clone(), classification);
        if let Some(response) = verified {
            record.overlay_address = OverlayAddress::parse(&response.overlay_address).ok();
            record.advertised_stores = response.stores;
            record.advertised_capabilities = response.capabilities;
        }
        self.peers.insert(peer_id, record);
        classification
    }

    async fn try_identify(
        &self,
        fabric: &dyn Fabric,
        peer_id: &PeerId,
    ) -> Option<IdentificationResponse> {
        let mut stream = tokio::time::timeout(
            self.config.identification_timeout,
            fabric.dial(peer_id, "dig/1", self.config.identification_timeout),
        )
        .await
        .ok()?
        .ok()?;

        let req = Request::DigNetworkIdentification {};
        write_request(&mut stream, &req).await.ok()?;
        let line = tokio::time::timeout(
            self.config.identification_timeout,
            read_line(&mut stream),
        )
        .await
        .ok()?
        .ok()?;
        serde_json::from_str(&line).ok()
    }

    async fn try_verify_membership(
        &self,
        fabric: &dyn Fabric,
        peer_id: &PeerId,
    ) -> Option<VerifyMembershipResponse> {
        let nonce = dig_identity::random::random_16().ok()?;

        let mut stream = fabric.dial(peer_id, "dig/1", self.config.identification_timeout).await.ok()?;
        let req = Request::VerifyOverlayMembership {
            challenge_nonce: hex::encode(nonce),
            requested: vec!["stores".to_string(), "capabilities".to_string()],
        };
        write_request(&mut stream, &req).await.ok()?;
        let line = read_line(&mut stream).await.ok()?;
        let response: VerifyMembershipResponse = serde_json::from_str(&line).ok()?;
        OverlayAddress::parse(&response.overlay_address).ok()?;
        Some(response)
    }
}

async fn write_request(
    stream: &mut crate::node::fabric::BoxedStream,
    req: &Request,
) -> Result<()> {
    let mut line = serde_json::to_vec(req)?;
    line.push(b'\n');
    stream
        .write_all(&line)
        .await
        .map_err(|e| NodeError::StreamClosed(e.to_string().into()))?;
    stream
        .flush()
        .await
        .map_err(|e| NodeError::StreamClosed(e.to_string().into()))
}

async fn read_line(stream: &mut crate::node::fabric::BoxedStream) -> Result<String> {
    let mut reader = BufReader::new(&mut *stream);
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|e| NodeError::StreamClosed(e.to_string().into()))?;
    if n == 0 {
        return Err(NodeError::stream_closed("peer closed before responding"));
    }
    Ok(line)
}

/// Ensure a parsed [`Request`] matches the expected tag; used by the
/// dispatch point (§4.1) to reject mismatched ops before they reach a
/// handler. Kept here since it shares the registry's notion of op naming.
#[must_use]
pub fn op_name_of(raw: &str) -> Option<&'static str> {
    parse_request(raw).map(|r| r.op_name())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClassifierConfig {
        ClassifierConfig {
            identification_timeout: Duration::from_secs(3),
            network_id: "mainnet".to_string(),
            public_infrastructure: HashSet::new(),
        }
    }

    #[tokio::test]
    async fn public_infrastructure_short_circuits() {
        let mut cfg = config();
        cfg.public_infrastructure.insert("bootstrap-1".to_string());
        let registry = Registry::new(cfg);
        let fabric = crate::node::fabric::test_double::TestFabric::new("local");

        let classification = registry.classify(&fabric, "bootstrap-1".to_string()).await;
        assert_eq!(classification, Classification::PublicInfrastructure);
        assert_eq!(
            registry.get(&"bootstrap-1".to_string()).unwrap().trust,
            Trust::Minimal
        );
    }

    #[tokio::test]
    async fn unreachable_peer_is_unknown() {
        let registry = Registry::new(config());
        let fabric = crate::node::fabric::test_double::TestFabric::new("local");

        let classification = registry.classify(&fabric, "ghost".to_string()).await;
        assert_eq!(classification, Classification::Unknown);
    }

    #[test]
    fn policy_table_matches_spec() {
        assert!(!Classification::PublicInfrastructure.allows(Some("GET_STORE_CONTENT")));
        assert!(Classification::Unknown.allows(Some("DIG_NETWORK_IDENTIFICATION")));
        assert!(!Classification::Unknown.allows(Some("GET_STORE_CONTENT")));
        assert!(Classification::VerifiedOverlay.allows(Some("GET_STORE_CONTENT")));
        assert!(!Classification::Suspicious.allows(Some("GET_STORE_CONTENT")));
    }

    #[test]
    fn record_deny_set_overrides_classification() {
        let mut record = PeerRecord::new("peer-a".to_string(), Classification::VerifiedOverlay);
        record.deny_set.insert("relay-use".to_string());
        assert!(!record.is_allowed("relay-use"));
        assert!(record.is_allowed("store-read"));
    }

    #[test]
    fn disconnect_removes_record() {
        let registry = Registry::new(config());
        registry
            .peers
            .insert("peer-a".to_string(), PeerRecord::new("peer-a".to_string(), Classification::Unknown));
        registry.remove(&"peer-a".to_string());
        assert!(registry.get(&"peer-a".to_string()).is_none());
    }
}
