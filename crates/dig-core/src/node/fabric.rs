//! Capability traits standing in for the underlying p2p fabric.
//!
//! The transport, multiplexing, encryption, DHT, gossip, pub/sub, and NAT
//! traversal primitives (UPnP, hole punching, circuit relay, WebRTC) are all
//! out of scope here — only their interfaces are modeled. Every subsystem
//! above this module depends on these traits, never on a concrete fabric
//! implementation, so the orchestrator, downloader, relay coordinator, and
//! registry can all be exercised against an in-memory double in tests.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::node::error::Result;

/// A stable peer identifier as handed out by the fabric. Opaque to this
/// crate beyond equality and display.
pub type PeerId = String;

/// One open bidirectional stream on a named protocol (`dig/1` or
/// `dig-discovery/1`). Readers consume a JSON header line followed
/// optionally by a raw binary body; writers do the reverse.
pub trait ProtocolStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> ProtocolStream for T {}

/// A boxed, type-erased protocol stream, the shape every transport method
/// below returns.
pub type BoxedStream = std::pin::Pin<Box<dyn ProtocolStream>>;

/// Direct (stream-oriented) transport to named peers.
#[async_trait]
pub trait DirectTransport: Send + Sync {
    /// Open a new stream to `peer` on the named protocol (`dig/1` or
    /// `dig-discovery/1`), subject to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::node::NodeError::Timeout`] if the dial does not
    /// complete in time, or [`crate::node::NodeError::PeerNotConnected`] if
    /// the peer is unreachable by any known address.
    async fn dial(&self, peer: &PeerId, protocol: &str, timeout: Duration) -> Result<BoxedStream>;

    /// True if `peer` already has an open session (no dial needed).
    fn is_connected(&self, peer: &PeerId) -> bool;

    /// Peers currently connected, regardless of overlay classification.
    fn connected_peers(&self) -> Vec<PeerId>;

    /// Best-known listen addresses for this local node, used to infer
    /// `acceptsDirect` (§4.3).
    fn local_addresses(&self) -> Vec<String>;
}

/// Distributed hash table access, keyed by UTF-8 strings per §6.
#[async_trait]
pub trait DhtClient: Send + Sync {
    /// Store `value` under `key`.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Fetch the value at `key`, if any peer has published one.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

/// Gossip/pub-sub access, keyed by topic name per §6.
#[async_trait]
pub trait GossipClient: Send + Sync {
    /// Publish `payload` on `topic`.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Drain messages received on `topic` since the last call. Returns an
    /// empty vector if none arrived; never blocks.
    async fn drain(&self, topic: &str) -> Result<Vec<Vec<u8>>>;
}

/// The small shared context handle threaded through every subsystem, per
/// the §9 design note: no ambient mutable "node" object, only the
/// capabilities each subsystem actually needs.
#[async_trait]
pub trait Fabric: DirectTransport + DhtClient + GossipClient {
    /// This node's stable peer id, as assigned by the fabric.
    fn local_peer_id(&self) -> PeerId;
}

impl fmt::Debug for dyn Fabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fabric({})", self.local_peer_id())
    }
}

#[cfg(any(test, feature = "test-fabric"))]
pub mod test_double {
    //! An in-memory fabric double used by unit and integration tests. Not
    //! part of the public API surface consumed by `dig-cli`.

    use super::{DhtClient, DirectTransport, Fabric, GossipClient, PeerId};
    use crate::node::error::{NodeError, Result};
    use async_trait::async_trait;
    use dashmap::DashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, BufReader};

    /// An in-memory [`Fabric`] with no real networking: DHT and gossip are
    /// backed by maps, dialing always fails unless a peer was registered as
    /// "connected" via [`TestFabric::connect`]. A peer with a canned
    /// response (set via [`TestFabric::respond_with`]) echoes it back after
    /// one request line; a peer with none just holds the stream open
    /// without answering, modeling a connection that never speaks `dig/1`.
    #[derive(Clone)]
    pub struct TestFabric {
        local: PeerId,
        dht: Arc<DashMap<String, Vec<u8>>>,
        gossip: Arc<DashMap<String, Vec<Vec<u8>>>>,
        connected: Arc<DashMap<PeerId, ()>>,
        responses: Arc<DashMap<PeerId, Vec<u8>>>,
        addresses: Vec<String>,
    }

    impl TestFabric {
        /// Build a new double identifying as `local`.
        #[must_use]
        pub fn new(local: impl Into<PeerId>) -> Self {
            Self {
                local: local.into(),
                dht: Arc::new(DashMap::new()),
                gossip: Arc::new(DashMap::new()),
                connected: Arc::new(DashMap::new()),
                responses: Arc::new(DashMap::new()),
                addresses: Vec::new(),
            }
        }

        /// Mark `peer` as already connected, so `dial` succeeds against it.
        pub fn connect(&self, peer: impl Into<PeerId>) {
            self.connected.insert(peer.into(), ());
        }

        /// Script `peer` to answer the next request it receives on any
        /// dialed stream with `response_line` (a single JSON line,
        /// newline-terminated or not).
        pub fn respond_with(&self, peer: impl Into<PeerId>, mut response_line: Vec<u8>) {
            if response_line.last() != Some(&b'\n') {
                response_line.push(b'\n');
            }
            self.responses.insert(peer.into(), response_line);
        }

        /// Set the public addresses this node reports for itself.
        #[must_use]
        pub fn with_addresses(mut self, addrs: Vec<String>) -> Self {
            self.addresses = addrs;
            self
        }
    }

    #[async_trait]
    impl DirectTransport for TestFabric {
        async fn dial(
            &self,
            peer: &PeerId,
            _protocol: &str,
            _timeout: Duration,
        ) -> Result<super::BoxedStream> {
            if !self.connected.contains_key(peer) {
                return Err(NodeError::PeerNotConnected(peer.clone()));
            }
            let (a, mut b) = duplex(64 * 1024);
            let scripted = self.responses.get(peer).map(|r| r.clone());
            tokio::spawn(async move {
                match scripted {
                    Some(response) => {
                        let mut reader = BufReader::new(&mut b);
                        let mut line = Vec::new();
                        if tokio::io::AsyncBufReadExt::read_until(&mut reader, b'\n', &mut line)
                            .await
                            .is_ok()
                        {
                            let _ = b.write_all(&response).await;
                            let _ = b.flush().await;
                        }
                    }
                    None => {
                        // No script: hold the peer half open (so writes on
                        // our side never see a broken pipe) but never
                        // answer, until the dialer drops its end.
                        let mut sink = Vec::new();
                        let _ = b.read_to_end(&mut sink).await;
                    }
                }
            });
            Ok(Box::pin(a))
        }

        fn is_connected(&self, peer: &PeerId) -> bool {
            self.connected.contains_key(peer)
        }

        fn connected_peers(&self) -> Vec<PeerId> {
            self.connected.iter().map(|e| e.key().clone()).collect()
        }

        fn local_addresses(&self) -> Vec<String> {
            self.addresses.clone()
        }
    }

    #[async_trait]
    impl DhtClient for TestFabric {
        async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
            self.dht.insert(key.to_string(), value);
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.dht.get(key).map(|v| v.clone()))
        }
    }

    #[async_trait]
    impl GossipClient for TestFabric {
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

    impl Fabric for TestFabric {
        fn local_peer_id(&self) -> PeerId {
            self.local.clone()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn dial_fails_for_unconnected_peer() {
            let fabric = TestFabric::new("local");
            let err = fabric
                .dial(&"ghost".to_string(), "dig/1", Duration::from_secs(1))
                .await
                .unwrap_err();
            assert!(matches!(err, NodeError::PeerNotConnected(_)));
        }

        #[tokio::test]
        async fn dial_succeeds_once_connected() {
            let fabric = TestFabric::new("local");
            fabric.connect("peer-a");
            assert!(
                fabric
                    .dial(&"peer-a".to_string(), "dig/1", Duration::from_secs(1))
                    .await
                    .is_ok()
            );
        }

        #[tokio::test]
        async fn dht_put_get_roundtrip() {
            let fabric = TestFabric::new("local");
            fabric.put("/dig-store/abc", b"hello".to_vec()).await.unwrap();
            let got = fabric.get("/dig-store/abc").await.unwrap();
            assert_eq!(got, Some(b"hello".to_vec()));
        }

        #[tokio::test]
        async fn gossip_drain_empties_queue() {
            let fabric = TestFabric::new("local");
            fabric
                .publish("dig-network-announcements", b"x".to_vec())
                .await
                .unwrap();
            let first = fabric.drain("dig-network-announcements").await.unwrap();
            assert_eq!(first.len(), 1);
            let second = fabric.drain("dig-network-announcements").await.unwrap();
            assert!(second.is_empty());
        }
    }
}
