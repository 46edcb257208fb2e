//! Shared test support: an in-process, multi-node [`Fabric`] that really
//! dials into other test nodes' [`Node::dispatch`], plus helpers for
//! building nodes and stores.
//!
//! This mirrors the two-node fixture idiom the teacher's own integration
//! crate used (a shared harness object wired into every scenario test),
//! generalized so any number of nodes can dial each other without
//! scenario-specific plumbing.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dig_core::node::{BoxedStream, DhtClient, DirectTransport, Fabric, GossipClient, NodeError, PeerId, Result};
use dig_core::{Node, NodeConfig};

/// Registry of every node participating in a test network, plus the shared
/// DHT and gossip state every node's [`NetworkFabric`] view reads and
/// writes. `dial` looks up the target's [`Node`] and hands it the server
/// half of a fresh in-memory duplex via [`Node::dispatch`], so classification,
/// identification, and every `dig/1` op run against the real handler code,
/// not a scripted stand-in.
#[derive(Clone)]
pub struct Network {
    nodes: Arc<DashMap<PeerId, Arc<Node>>>,
    dht: Arc<DashMap<String, Vec<u8>>>,
    gossip: Arc<DashMap<String, Vec<Vec<u8>>>>,
    /// Per-local-peer set of remotes that have been successfully dialed at
    /// least once, so `is_connected` reflects real dial history instead of
    /// mere network membership (letting tests distinguish "direct, already
    /// connected" from "direct, needs a fresh dial").
    connections: Arc<DashMap<PeerId, Arc<DashMap<PeerId, ()>>>>,
}

impl Network {
    /// Build an empty test network.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Arc::new(DashMap::new()),
            dht: Arc::new(DashMap::new()),
            gossip: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Register `node` under its own peer id and return the [`NetworkFabric`]
    /// view it should be driven with (for `Node::start`/`Node::dispatch`
    /// callers and for direct use as a dial source in tests).
    pub fn join(&self, node: Arc<Node>) -> Arc<NetworkFabric> {
        let peer_id = node.local_peer_id().clone();
        self.nodes.insert(peer_id.clone(), node);
        Arc::new(NetworkFabric {
            local_peer_id: peer_id,
            network: self.clone(),
        })
    }

    /// The fabric view for an already-joined peer, e.g. to dial from a
    /// synthetic peer id that isn't backed by a real [`Node`].
    #[must_use]
    pub fn fabric_for(&self, local_peer_id: impl Into<PeerId>) -> Arc<NetworkFabric> {
        Arc::new(NetworkFabric {
            local_peer_id: local_peer_id.into(),
            network: self.clone(),
        })
    }
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's view of a [`Network`]: dialing, the shared DHT, and shared
/// gossip topics, all scoped by `local_peer_id`.
pub struct NetworkFabric {
    local_peer_id: PeerId,
    network: Network,
}

#[async_trait]
impl DirectTransport for NetworkFabric {
    async fn dial(&self, peer: &PeerId, _protocol: &str, timeout: Duration) -> Result<BoxedStream> {
        let target = self
            .network
            .nodes
            .get(peer)
            .map(|r| r.clone())
            .ok_or_else(|| NodeError::PeerNotConnected(peer.clone()))?;

        let (client, server) = tokio::io::duplex(64 * 1024);
        let target_fabric = self.network.fabric_for(peer.clone());
        let caller = self.local_peer_id.clone();
        let dial = async move {
            let _ = target.dispatch(target_fabric.as_ref(), caller, Box::pin(server)).await;
        };
        tokio::spawn(tokio::time::timeout(timeout, dial));

        self.network
            .connections
            .entry(self.local_peer_id.clone())
            .or_insert_with(|| Arc::new(DashMap::new()))
            .insert(peer.clone(), ());

        Ok(Box::pin(client))
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.network
            .connections
            .get(&self.local_peer_id)
            .is_some_and(|set| set.contains_key(peer))
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.network
            .connections
            .get(&self.local_peer_id)
            .map(|set| set.iter().map(|r| r.key().clone()).collect())
            .unwrap_or_default()
    }

    fn local_addresses(&self) -> Vec<String> {
        vec![format!("mem://{}", self.local_peer_id)]
    }
}

#[async_trait]
impl DhtClient for NetworkFabric {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.network.dht.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.network.dht.get(key).map(|v| v.clone()))
    }
}

#[async_trait]
impl GossipClient for NetworkFabric {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.network.gossip.entry(topic.to_string()).or_default().push(payload);
        Ok(())
    }

    async fn drain(&self, topic: &str) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .network
            .gossip
            .get_mut(topic)
            .map(|mut v| std::mem::take(v.value_mut()))
            .unwrap_or_default())
    }
}

impl Fabric for NetworkFabric {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id.clone()
    }
}

/// Build a [`NodeConfig`] pointed at `store_dir` with a fixed identity
/// derived from `seed_byte` (repeated 32 times), so tests get a stable,
/// reproducible peer id without touching OS randomness.
#[must_use]
pub fn test_config(store_dir: &Path, seed_byte: u8) -> NodeConfig {
    NodeConfig {
        store_dir: store_dir.to_path_buf(),
        network_id: "mainnet".to_string(),
        private_key: Some(hex::encode([seed_byte; 32])),
        timeouts: dig_core::node::config::TimeoutConfig {
            dial: Duration::from_secs(2),
            chunk_read: Duration::from_secs(2),
            identification: Duration::from_secs(2),
            relay_setup: Duration::from_secs(2),
            directory_heartbeat: Duration::from_secs(2),
        },
        ..Default::default()
    }
}

/// Write `bytes` as store `store_id.bin` directly under `store_dir`,
/// bypassing the downloader — for seeding a server node's local holdings.
pub async fn seed_store(store_dir: &Path, store_id: &str, bytes: &[u8]) {
    dig_core::node::store::ensure_store_dir(store_dir).await.unwrap();
    let path = dig_core::node::store::final_path(store_dir, store_id, "bin");
    tokio::fs::write(&path, bytes).await.unwrap();
}

/// A client-side peer's registry, capability tracker, and orchestrator,
/// assembled by hand the way `dig-core`'s own `sync.rs`/`node.rs` unit tests
/// build these pieces, but wired against a real [`NetworkFabric`] so
/// classification and downloads run against other real `Node`s in the
/// [`Network`] rather than scripted responses.
pub struct ClientHarness {
    pub registry: Arc<dig_core::node::registry::Registry>,
    pub orchestrator: Arc<dig_core::node::orchestrator::Orchestrator>,
    pub relay: Arc<dig_core::node::relay::RelayCoordinator>,
    pub fabric: Arc<NetworkFabric>,
    network: Network,
}

impl ClientHarness {
    /// Build a harness for a synthetic client peer id, storing downloads
    /// under `store_dir`.
    #[must_use]
    pub fn new(network: &Network, peer_id: impl Into<PeerId>, store_dir: &Path) -> Self {
        let peer_id = peer_id.into();
        let fabric = network.fabric_for(peer_id.clone());

        let registry = Arc::new(dig_core::node::registry::Registry::new(
            dig_core::node::registry::ClassifierConfig {
                identification_timeout: Duration::from_secs(2),
                network_id: "mainnet".to_string(),
                public_infrastructure: std::collections::HashSet::new(),
            },
        ));
        let capability = Arc::new(dig_core::node::capability::CapabilityTracker::new());
        let discovery = Arc::new(dig_core::node::discovery::Discovery::new(
            vec![],
            "mainnet".to_string(),
            None,
            Duration::from_secs(2),
        ));
        let relay = Arc::new(dig_core::node::relay::RelayCoordinator::new(
            peer_id,
            Duration::from_secs(2),
            Duration::from_secs(2),
        ));
        let downloader = Arc::new(dig_core::node::downloader::Downloader::new(
            relay.clone(),
            Duration::from_secs(2),
            Duration::from_secs(2),
            Duration::from_secs(2),
            3,
        ));
        let orchestrator = Arc::new(dig_core::node::orchestrator::Orchestrator::new(
            registry.clone(),
            capability,
            discovery,
            relay.clone(),
            downloader,
            store_dir.to_path_buf(),
            64 * 1024,
            4,
            Duration::from_secs(2),
        ));

        Self {
            registry,
            orchestrator,
            relay,
            fabric,
            network: network.clone(),
        }
    }

    /// Run the classifier against `peer_id`, over this harness's fabric.
    pub async fn classify(&self, peer_id: impl Into<PeerId>) -> dig_core::node::registry::Classification {
        self.registry.classify(self.fabric.as_ref(), peer_id.into()).await
    }

    /// Run the classifier against `peer_id` over a throwaway fabric view
    /// identifying as `shadow_peer_id`, so the resulting dial is not
    /// recorded against this harness's own peer id. Use this to populate
    /// the registry with a candidate (for `advertised_stores` purposes)
    /// without making it look directly connected, e.g. to force the
    /// orchestrator past the direct strategies and into a relay attempt.
    pub async fn classify_via_shadow(
        &self,
        shadow_peer_id: impl Into<PeerId>,
        peer_id: impl Into<PeerId>,
    ) -> dig_core::node::registry::Classification {
        let shadow = self.network.fabric_for(shadow_peer_id);
        self.registry.classify(shadow.as_ref(), peer_id.into()).await
    }

    /// Download `store_id`, trying every strategy in order.
    pub async fn download(&self, store_id: &str) -> dig_core::node::orchestrator::DownloadOutcome {
        self.orchestrator.download_store(self.fabric.clone(), store_id).await
    }
}
