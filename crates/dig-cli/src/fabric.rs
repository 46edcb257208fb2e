//! Minimal TCP-dial fabric used by the `dig` binary.
//!
//! `dig-core` depends only on the [`dig_core::node::Fabric`] trait family —
//! the real DHT, gossip, and NAT-traversal stack is explicitly out of the
//! core's scope and left to "the embedding application" (§9). This is the
//! simplest embedding: peer ids are literal `host:port` dial addresses,
//! direct transport is a plain TCP socket carrying `dig/1` frames, and the
//! DHT/gossip surfaces are in-process maps seeded from bootstrap peers and
//! the external directory. A deployment that needs real peer-to-peer
//! rendezvous swaps this module for one backed by an actual DHT/gossip
//! network; nothing above the `Fabric` trait needs to change.

use async_trait::async_trait;
use dashmap::DashMap;
use dig_core::node::{BoxedStream, DhtClient, DirectTransport, Fabric, GossipClient, NodeError, PeerId, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

/// TCP-dial [`Fabric`]: peer ids are `host:port` addresses, dialed directly.
pub struct TcpFabric {
    local_peer_id: PeerId,
    local_addresses: Vec<String>,
    connected: DashMap<PeerId, ()>,
    dht: DashMap<String, Vec<u8>>,
    gossip: DashMap<String, Vec<Vec<u8>>>,
}

impl TcpFabric {
    /// Build a fabric identifying as `local_peer_id`, advertising
    /// `local_addresses` as this node's dialable endpoints.
    #[must_use]
    pub fn new(local_peer_id: impl Into<PeerId>, local_addresses: Vec<String>) -> Self {
        Self {
            local_peer_id: local_peer_id.into(),
            local_addresses,
            connected: DashMap::new(),
            dht: DashMap::new(),
            gossip: DashMap::new(),
        }
    }

    /// Mark `peer` as dialable without waiting for a successful dial first,
    /// e.g. when seeded from a bootstrap list or the external directory.
    pub fn register_peer(&self, peer: impl Into<PeerId>) {
        self.connected.insert(peer.into(), ());
    }
}

#[async_trait]
impl DirectTransport for TcpFabric {
    async fn dial(&self, peer: &PeerId, _protocol: &str, timeout: Duration) -> Result<BoxedStream> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(peer.as_str()))
            .await
            .map_err(|_| NodeError::timeout("tcp dial"))?
            .map_err(|e| NodeError::PeerNotConnected(format!("{peer}: {e}")))?;
        self.connected.insert(peer.clone(), ());
        Ok(Box::pin(stream))
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.connected.contains_key(peer)
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.connected.iter().map(|e| e.key().clone()).collect()
    }

    fn local_addresses(&self) -> Vec<String> {
        self.local_addresses.clone()
    }
}

#[async_trait]
impl DhtClient for TcpFabric {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.dht.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.dht.get(key).map(|v| v.clone()))
    }
}

#[async_trait]
impl GossipClient for TcpFabric {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.gossip.entry(topic.to_string()).or_default().push(payload);
        Ok(())
    }

    async fn drain(&self, topic: &str) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .gossip
            .get_mut(topic)
            .map(|mut v| std::mem::take(v.value_mut()))
            .unwrap_or_default())
    }
}

impl Fabric for TcpFabric {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id.clone()
    }
}

/// Accept loop: binds `listen_port` and hands every inbound connection to
/// `node.dispatch`, using the remote socket address as the peer id until a
/// `HANDSHAKE`/`DIG_NETWORK_IDENTIFICATION` exchange tells the registry who
/// it really is.
pub async fn serve(
    node: Arc<dig_core::Node>,
    fabric: Arc<TcpFabric>,
    listen_port: u16,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", listen_port)).await?;
    tracing::info!(port = listen_port, "fabric listening");
    loop {
        let (stream, addr) = listener.accept().await?;
        let node = node.clone();
        let fabric = fabric.clone();
        tokio::spawn(async move {
            let peer_id = addr.to_string();
            let boxed: BoxedStream = Box::pin(stream);
            if let Err(e) = node.dispatch(fabric.as_ref(), peer_id, boxed).await {
                tracing::debug!(peer = %addr, error = %e, "dig/1 session ended");
            }
        });
    }
}
