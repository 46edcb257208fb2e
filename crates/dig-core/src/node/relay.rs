//! Relay Coordinator (§4.5): ranks known relays and drives two-sided
//! relay-session setup for a NAT-restricted source.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use dig_discovery::{RelayCandidate, RelayRegistry};
use tokio::sync::RwLock;

use crate::node::error::{NodeError, Result};
use crate::node::fabric::{BoxedStream, Fabric, PeerId};
use crate::node::protocol::{
    RelayCoordinateResponse, RelayDataResponse, Request,
};
use crate::node::store::now_unix;

/// DHT key a relay signal for `peer_id` is queued under (§6).
fn signal_key(peer_id: &str) -> String {
    format!("/dig-relay-signal/{peer_id}")
}

/// Gossip topic relay coordination signals are broadcast on.
pub const SIGNAL_TOPIC: &str = "dig-relay-coordination-signals";

/// Gossip topic relay registry updates are broadcast on.
pub const RELAY_ANNOUNCEMENTS_TOPIC: &str = "dig-relay-announcements";

/// DHT key the relay registry snapshot is published under.
pub const RELAY_REGISTRY_KEY: &str = "/dig-relay-servers/registry";

/// A live, established relay session: the relay's id and the session id it
/// minted in response to `RELAY_COORDINATE_REQUEST`.
#[derive(Debug, Clone)]
pub struct RelaySession {
    /// The relay's stable peer id.
    pub relay_peer_id: PeerId,
    /// Session id scoped to this relay and transfer.
    pub session_id: String,
}

/// Coordinates relay discovery, ranking, and per-transfer session setup.
pub struct RelayCoordinator {
    registry: RwLock<RelayRegistry>,
    setup_window: Duration,
    identification_timeout: Duration,
    local_peer_id: PeerId,
}

impl RelayCoordinator {
    /// Build a coordinator for a node identifying as `local_peer_id`.
    #[must_use]
    pub fn new(local_peer_id: PeerId, setup_window: Duration, identification_timeout: Duration) -> Self {
        Self {
            registry: RwLock::new(RelayRegistry::new()),
            setup_window,
            identification_timeout,
            local_peer_id,
        }
    }

    /// Record or refresh a relay's advertised state, e.g. from a gossip
    /// announcement or DHT read of [`RELAY_REGISTRY_KEY`].
    pub async fn upsert(&self, candidate: RelayCandidate) {
        self.registry.write().await.upsert(candidate);
    }

    /// Drop a relay that has failed repeated health checks.
    pub async fn remove(&self, peer_id: &str) {
        self.registry.write().await.remove(peer_id);
    }

    /// Number of known relays.
    pub async fn len(&self) -> usize {
        self.registry.read().await.len()
    }

    /// Try, in ranked order, to establish a relay session that gets
    /// `source` reachable through some relay, for the benefit of this
    /// (the receiving) node. Returns the first relay to successfully
    /// coordinate a session (§4.5 steps 1-3).
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::RelayUnavailable`] if every known relay is
    /// exhausted without a successful handshake.
    pub async fn establish(
        &self,
        fabric: &dyn Fabric,
        source: &PeerId,
        store_id: Option<&str>,
    ) -> Result<RelaySession> {
        let ranked: Vec<RelayCandidate> = {
            let registry = self.registry.read().await;
            registry.ranked().into_iter().cloned().collect()
        };

        for relay in &ranked {
            let attempt = tokio::time::timeout(
                self.setup_window,
                self.try_relay(fabric, relay, source, store_id),
            )
            .await;

            match attempt {
                Ok(Ok(session)) => return Ok(session),
                Ok(Err(_)) | Err(_) => continue,
            }
        }

        Err(NodeError::relay_unavailable(
            "no relay completed session setup within the bounded window",
        ))
    }

    async fn try_relay(
        &self,
        fabric: &dyn Fabric,
        relay: &RelayCandidate,
        source: &PeerId,
        store_id: Option<&str>,
    ) -> Result<RelaySession> {
        let signalled = self.signal_source(fabric, relay, source).await;
        if !signalled {
            return Err(NodeError::relay_unavailable(
                "could not reach the source on any channel to name the relay",
            ));
        }

        let mut stream = fabric
            .dial(&relay.peer_id, "dig/1", self.identification_timeout)
            .await?;
        let request = Request::RelayCoordinateRequest {
            from_peer_id: self.local_peer_id.clone(),
            target_peer_id: source.clone(),
            store_id: store_id.map(str::to_string),
        };
        write_request(&mut stream, &request).await?;
        let line = read_line(&mut stream).await?;
        let response: RelayCoordinateResponse = serde_json::from_str(&line)?;

        Ok(RelaySession {
            relay_peer_id: response.relay_peer_id,
            session_id: response.session_id,
        })
    }

    /// §4.5 step 2: name the relay to `source` over every available
    /// channel concurrently; any one succeeding is sufficient.
    async fn signal_source(
        &self,
        fabric: &dyn Fabric,
        relay: &RelayCandidate,
        source: &PeerId,
    ) -> bool {
        let direct = self.signal_direct(fabric, relay, source);
        let dht = self.signal_dht(fabric, relay, source);
        let gossip = self.signal_gossip(fabric, relay);

        let (direct, dht, gossip) = tokio::join!(direct, dht, gossip);
        direct || dht || gossip
    }

    async fn signal_direct(&self, fabric: &dyn Fabric, relay: &RelayCandidate, source: &PeerId) -> bool {
        let Ok(mut stream) = fabric.dial(source, "dig/1", self.identification_timeout).await else {
            return false;
        };
        let request = Request::RelayConnectionSignal {
            turn_server_peer_id: relay.peer_id.clone(),
            turn_server_addresses: relay.addresses.clone(),
        };
        write_request(&mut stream, &request).await.is_ok()
    }

    async fn signal_dht(&self, fabric: &dyn Fabric, relay: &RelayCandidate, source: &PeerId) -> bool {
        let payload = Request::RelayConnectionSignal {
            turn_server_peer_id: relay.peer_id.clone(),
            turn_server_addresses: relay.addresses.clone(),
        };
        let Ok(bytes) = serde_json::to_vec(&payload) else {
            return false;
        };
        fabric.put(&signal_key(source), bytes).await.is_ok()
    }

    async fn signal_gossip(&self, fabric: &dyn Fabric, relay: &RelayCandidate) -> bool {
        let payload = Request::RelayConnectionSignal {
            turn_server_peer_id: relay.peer_id.clone(),
            turn_server_addresses: relay.addresses.clone(),
        };
        let Ok(bytes) = serde_json::to_vec(&payload) else {
            return false;
        };
        fabric.publish(SIGNAL_TOPIC, bytes).await.is_ok()
    }

    /// Fetch relayed bytes for `store_id` (optionally a byte range) against
    /// a previously established [`RelaySession`] (§4.5 step 4).
    ///
    /// # Errors
    ///
    /// Returns an error if the relay cannot be dialed, closes the stream,
    /// or answers with `session-unknown`.
    pub async fn fetch(
        &self,
        fabric: &dyn Fabric,
        session: &RelaySession,
        store_id: &str,
        range: Option<(u64, u64)>,
    ) -> Result<Vec<u8>> {
        let mut stream = fabric
            .dial(&session.relay_peer_id, "dig/1", self.identification_timeout)
            .await?;
        let request = Request::RelayData {
            session_id: session.session_id.clone(),
            store_id: store_id.to_string(),
            range_start: range.map(|(start, _)| start),
            range_end: range.map(|(_, end)| end),
        };
        write_request(&mut stream, &request).await?;
        let line = read_line(&mut stream).await?;

        if let Ok(error) = serde_json::from_str::<crate::node::protocol::ErrorResponse>(&line) {
            if !error.success {
                return Err(if error.error == "session-unknown" {
                    NodeError::SessionUnknown(session.session_id.clone())
                } else {
                    NodeError::relay_unavailable("store-unavailable")
                });
            }
        }

        let response: RelayDataResponse = serde_json::from_str(&line)?;
        base64::engine::general_purpose::STANDARD
            .decode(response.data)
            .map_err(|_| NodeError::decode_failed("relay data was not valid base64"))
    }
}

async fn write_request(stream: &mut BoxedStream, req: &Request) -> Result<()> {
    use tokio::io::AsyncWriteExt;
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

async fn read_line(stream: &mut BoxedStream) -> Result<String> {
    use tokio::io::{AsyncBufReadExt, BufReader};
    let mut reader = BufReader::new(&mut *stream);
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|e| NodeError::StreamClosed(e.to_string().into()))?;
    if n == 0 {
        return Err(NodeError::stream_closed("relay closed before responding"));
    }
    Ok(line)
}

/// A relay announcement received over DHT or gossip, ready to fold into
/// the registry, stamped with the observation time.
#[must_use]
pub fn candidate_from_announcement(announcement: &dig_discovery::RelayAnnouncement) -> RelayCandidate {
    RelayCandidate {
        peer_id: announcement.peer_id.clone(),
        addresses: announcement.addresses.clone(),
        current_load: announcement.current_load,
        max_capacity: announcement.max_capacity,
        last_seen_healthy: announcement.timestamp.max(now_unix().saturating_sub(60)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::fabric::test_double::TestFabric;

    fn relay(id: &str) -> RelayCandidate {
        RelayCandidate {
            peer_id: id.to_string(),
            addresses: vec!["203.0.113.9:4001".to_string()],
            current_load: 1,
            max_capacity: 10,
            last_seen_healthy: now_unix(),
        }
    }

    #[tokio::test]
    async fn establish_fails_with_no_known_relays() {
        let coordinator = RelayCoordinator::new(
            "local".to_string(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let fabric = TestFabric::new("local");
        let err = coordinator
            .establish(&fabric, &"source".to_string(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::RelayUnavailable(_)));
    }

    #[tokio::test]
    async fn establish_fails_when_source_unreachable() {
        let coordinator = RelayCoordinator::new(
            "local".to_string(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        coordinator.upsert(relay("relay-1")).await;
        let fabric = TestFabric::new("local");
        fabric.connect("relay-1");
        // source is never connected, so every signal channel fails.
        let err = coordinator
            .establish(&fabric, &"source".to_string(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::RelayUnavailable(_)));
    }

    #[tokio::test]
    async fn dht_signal_succeeds_even_without_direct_connection() {
        let coordinator = RelayCoordinator::new(
            "local".to_string(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let fabric = TestFabric::new("local");
        let signalled = coordinator
            .signal_source(&fabric, &relay("relay-1"), &"source".to_string())
            .await;
        assert!(signalled, "DHT put should succeed against the test double");
    }

    #[test]
    fn candidate_from_announcement_copies_fields() {
        let announcement = dig_discovery::RelayAnnouncement {
            peer_id: "relay-9".to_string(),
            addresses: vec!["198.51.100.2:4001".to_string()],
            current_load: 3,
            max_capacity: 20,
            timestamp: 1_000,
        };
        let candidate = candidate_from_announcement(&announcement);
        assert_eq!(candidate.peer_id, "relay-9");
        assert_eq!(candidate.max_capacity, 20);
    }
}
