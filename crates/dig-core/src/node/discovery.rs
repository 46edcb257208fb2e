//! Discovery (§4.4): bootstrap, ongoing DHT/gossip discovery, and the
//! directory fallback, delegated to the fabric and to `dig-discovery`'s
//! announcement schemas and directory client.

use std::time::Duration;

use dig_discovery::{DirectoryClient, PeerAnnouncement};

use crate::node::fabric::Fabric;
use crate::node::registry::Registry;

/// DHT key prefix peers are announced under (§6).
pub const PEERS_DHT_PREFIX: &str = "/dig-network-v1/peers/";

/// Gossip topic ongoing peer announcements are published on (§4.4).
pub const ANNOUNCEMENTS_TOPIC: &str = "dig-network-announcements";

/// Discovery coordinator: owns the bootstrap list and, when the fabric
/// reports zero `verified-overlay` peers after the configured grace
/// period, the optional external-directory fallback client.
pub struct Discovery {
    bootstrap_peers: Vec<String>,
    network_id: String,
    directory: Option<DirectoryClient>,
    directory_grace_period: Duration,
}

impl Discovery {
    /// Build a discovery coordinator. `directory_endpoint` is `None` when
    /// no fallback is configured.
    #[must_use]
    pub fn new(
        bootstrap_peers: Vec<String>,
        network_id: String,
        directory_endpoint: Option<String>,
        directory_timeout: Duration,
    ) -> Self {
        Self {
            bootstrap_peers,
            network_id,
            directory: directory_endpoint.map(|url| DirectoryClient::new(url, directory_timeout)),
            directory_grace_period: Duration::from_secs(30),
        }
    }

    /// Addresses to dial at startup, before any DHT/gossip state exists.
    #[must_use]
    pub fn bootstrap_peers(&self) -> &[String] {
        &self.bootstrap_peers
    }

    /// The configured directory client, if any, for the downloader's
    /// last-resort relay path.
    #[must_use]
    pub fn directory(&self) -> Option<&DirectoryClient> {
        self.directory.as_ref()
    }

    /// Publish this node's announcement on the gossip topic and DHT key,
    /// per §4.4.
    ///
    /// # Errors
    ///
    /// Returns an error if the fabric's gossip publish or DHT put fails.
    pub async fn announce(
        &self,
        fabric: &dyn Fabric,
        announcement: &PeerAnnouncement,
    ) -> crate::node::error::Result<()> {
        let payload = serde_json::to_vec(announcement)?;
        fabric
            .publish(ANNOUNCEMENTS_TOPIC, payload.clone())
            .await?;
        let key = format!("{PEERS_DHT_PREFIX}{}", announcement.peer_id);
        fabric.put(&key, payload).await?;
        Ok(())
    }

    /// Drain newly gossiped announcements for `network_id`, discarding any
    /// for a different overlay.
    ///
    /// # Errors
    ///
    /// Returns an error if draining the gossip topic fails.
    pub async fn poll_gossip(
        &self,
        fabric: &dyn Fabric,
    ) -> crate::node::error::Result<Vec<PeerAnnouncement>> {
        let raw = fabric.drain(ANNOUNCEMENTS_TOPIC).await?;
        Ok(raw
            .iter()
            .filter_map(|bytes| serde_json::from_slice::<PeerAnnouncement>(bytes).ok())
            .filter(|a| a.matches_network(&self.network_id))
            .collect())
    }

    /// Query the external directory for peers, only meaningful once the
    /// grace period has elapsed with zero verified peers (§4.4). Returns
    /// an empty list if no directory is configured.
    ///
    /// # Errors
    ///
    /// Returns [`crate::node::NodeError::DirectoryUnavailable`] if the
    /// directory is configured but unreachable.
    pub async fn query_directory(
        &self,
    ) -> crate::node::error::Result<Vec<dig_discovery::DirectoryPeer>> {
        let Some(directory) = &self.directory else {
            return Ok(Vec::new());
        };
        directory.get_peers().await.map_err(|e| {
            crate::node::error::NodeError::DirectoryUnavailable(e.to_string().into())
        })
    }

    /// Whether the directory fallback should be consulted right now,
    /// given how long the registry has reported zero verified peers.
    #[must_use]
    pub fn should_consult_directory(&self, registry: &Registry, zero_since: Duration) -> bool {
        self.directory.is_some()
            && registry.verified_overlay_peers().is_empty()
            && zero_since >= self.directory_grace_period
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::fabric::test_double::TestFabric;
    use crate::node::registry::{ClassifierConfig, Registry};
    use std::collections::HashSet;

    fn registry() -> Registry {
        Registry::new(ClassifierConfig {
            identification_timeout: Duration::from_secs(3),
            network_id: "mainnet".to_string(),
            public_infrastructure: HashSet::new(),
        })
    }

    #[tokio::test]
    async fn announce_publishes_and_puts() {
        let discovery = Discovery::new(vec![], "mainnet".to_string(), None, Duration::from_secs(5));
        let fabric = TestFabric::new("local");
        let announcement = PeerAnnouncement {
            peer_id: "local".to_string(),
            network_id: "mainnet".to_string(),
            overlay_address: "fd00:0:0:0:0:0:0:1".to_string(),
            capabilities: vec![],
            stores: vec![],
            timestamp: 0,
        };
        discovery.announce(&fabric, &announcement).await.unwrap();

        let gossiped = discovery.poll_gossip(&fabric).await.unwrap();
        assert_eq!(gossiped.len(), 1);
    }

    #[tokio::test]
    async fn poll_gossip_filters_other_networks() {
        let discovery = Discovery::new(vec![], "mainnet".to_string(), None, Duration::from_secs(5));
        let fabric = TestFabric::new("local");
        let other = PeerAnnouncement {
            peer_id: "peer-x".to_string(),
            network_id: "testnet".to_string(),
            overlay_address: "fd00:0:0:0:0:0:0:2".to_string(),
            capabilities: vec![],
            stores: vec![],
            timestamp: 0,
        };
        fabric
            .publish(ANNOUNCEMENTS_TOPIC, serde_json::to_vec(&other).unwrap())
            .await
            .unwrap();

        let gossiped = discovery.poll_gossip(&fabric).await.unwrap();
        assert!(gossiped.is_empty());
    }

    #[test]
    fn directory_not_consulted_without_endpoint() {
        let discovery = Discovery::new(vec![], "mainnet".to_string(), None, Duration::from_secs(5));
        assert!(!discovery.should_consult_directory(&registry(), Duration::from_secs(600)));
    }
}
