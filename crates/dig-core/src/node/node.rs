//! Node Runtime (§4.1): wires every subsystem together, drives the
//! background sync/capability/relay loops, and dispatches inbound `dig/1`
//! requests to the right handler once the peer registry has cleared them.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use dashmap::DashMap;
use rand_core::OsRng;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use dig_identity::Identity;

use crate::node::capability::{CapabilityProfile, CapabilityTracker};
use crate::node::config::NodeConfig;
use crate::node::discovery::Discovery;
use crate::node::downloader::Downloader;
use crate::node::error::{NodeError, Result};
use crate::node::fabric::{BoxedStream, Fabric, PeerId};
use crate::node::orchestrator::{self, DownloadOutcome, Orchestrator};
use crate::node::protocol::{
    parse_request, ErrorResponse, FileRangeHeader, HandshakeResponse, IdentificationResponse,
    PeerInfoResponse, RelayCoordinateResponse, RelayDataResponse, RelaySignalResponse, Request,
    StoreContentHeader, VerifyMembershipResponse,
};
use crate::node::registry::{ClassifierConfig, Registry};
use crate::node::relay::{self, RelayCoordinator};
use crate::node::session;
use crate::node::store;
use crate::node::sync::SyncLoop;

/// Largest single write issued while streaming a store body or range.
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Capacity this node advertises for relayed sessions, absent any other
/// signal. The fabric has no notion of host resource limits to consult.
const RELAY_MAX_CAPACITY: u32 = 64;

/// Server-side bookkeeping for a relay session this node is coordinating on
/// behalf of a source peer, distinct from [`relay::RelaySession`] (the
/// client-side record a node holds when it is the one being relayed for).
#[derive(Debug, Clone)]
struct RelayServingSession {
    source_peer_id: PeerId,
    #[allow(dead_code)]
    store_id: Option<String>,
    #[allow(dead_code)]
    created_at: u64,
}

/// A running dig node: owns its identity, every subsystem, and the
/// background tasks driving them.
pub struct Node {
    identity: Identity,
    config: NodeConfig,
    local_peer_id: PeerId,
    registry: Arc<Registry>,
    capability: Arc<CapabilityTracker>,
    discovery: Arc<Discovery>,
    relay: Arc<RelayCoordinator>,
    downloader: Arc<Downloader>,
    orchestrator: Arc<Orchestrator>,
    sync_loop: Arc<SyncLoop>,
    relay_sessions: Arc<DashMap<String, RelayServingSession>>,
    shutdown: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Build a node from `config`: load or generate its identity, and wire
    /// up the registry, capability tracker, discovery, relay coordinator,
    /// downloader, orchestrator, and sync loop.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::ConfigInvalid`] if `config` fails validation.
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;

        let identity = match &config.private_key {
            Some(hex_seed) => {
                let bytes = hex::decode(hex_seed)
                    .map_err(|_| NodeError::config_invalid("privateKey is not valid hex"))?;
                if bytes.len() != dig_identity::ED25519_SECRET_KEY_SIZE {
                    return Err(NodeError::config_invalid(
                        "privateKey must be 32 bytes (64 hex characters)",
                    ));
                }
                let mut seed = [0u8; 32];
                seed.copy_from_slice(&bytes);
                Identity::from_bytes(&seed)
            }
            None => Identity::generate(&mut OsRng),
        };
        let local_peer_id: PeerId = hex::encode(identity.public_key());

        let registry = Arc::new(Registry::new(ClassifierConfig {
            identification_timeout: config.timeouts.identification,
            network_id: config.network_id.clone(),
            public_infrastructure: HashSet::new(),
        }));
        let capability = Arc::new(CapabilityTracker::new());
        let discovery = Arc::new(Discovery::new(
            dig_discovery::parse_bootstrap_peers(&config.bootstrap_peers),
            config.network_id.clone(),
            config.discovery_servers.first().cloned(),
            config.timeouts.directory_heartbeat,
        ));
        let relay = Arc::new(RelayCoordinator::new(
            local_peer_id.clone(),
            config.timeouts.relay_setup,
            config.timeouts.identification,
        ));
        let downloader = Arc::new(Downloader::new(
            relay.clone(),
            config.timeouts.dial,
            config.timeouts.chunk_read,
            config.timeouts.directory_heartbeat,
            config.transfer.source_failure_threshold,
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            capability.clone(),
            discovery.clone(),
            relay.clone(),
            downloader.clone(),
            config.store_dir.clone(),
            config.transfer.chunk_size,
            config.transfer.max_concurrent_chunks,
            config.timeouts.dial,
        ));
        let sync_loop = Arc::new(SyncLoop::new(
            registry.clone(),
            orchestrator.clone(),
            config.store_dir.clone(),
            config.intervals.sync_max_per_sweep,
            config.intervals.sync_max_retries_per_sweep as usize,
        ));

        Ok(Self {
            identity,
            config,
            local_peer_id,
            registry,
            capability,
            discovery,
            relay,
            downloader,
            orchestrator,
            sync_loop,
            relay_sessions: Arc::new(DashMap::new()),
            shutdown: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// This node's stable peer id, derived from its public key.
    #[must_use]
    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    /// This node's identity.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// This node's configuration.
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Download `store_id`, delegating to the orchestrator's strategy
    /// ladder. Exposed directly so a caller (e.g. `dig-cli`) doesn't need
    /// its own handle on the orchestrator.
    pub async fn download_store(&self, fabric: Arc<dyn Fabric>, store_id: &str) -> DownloadOutcome {
        self.orchestrator.download_store(fabric, store_id).await
    }

    /// Bring the node up: ensure the store directory exists, compute this
    /// node's own capability profile, resume any interrupted downloads
    /// found on disk, announce every locally-held store, and start the
    /// background sync, capability, and relay loops.
    ///
    /// # Errors
    ///
    /// Returns an error if the store directory cannot be created/scanned or
    /// the initial announcement fails.
    pub async fn start(self: &Arc<Self>, fabric: Arc<dyn Fabric>) -> Result<()> {
        store::ensure_store_dir(&self.config.store_dir).await?;
        self.capability.recompute_self(fabric.as_ref()).await;

        for mut resumed in session::scan_resumable(&self.config.store_dir).await? {
            let downloader = self.downloader.clone();
            let fabric = fabric.clone();
            let cancel = Arc::new(AtomicBool::new(false));
            let handle = tokio::spawn(async move {
                let store_id = resumed.store_id.clone();
                if let Err(e) = downloader.run(fabric, &mut resumed, cancel).await {
                    tracing::warn!(store_id = %store_id, error = %e, "resumed download did not complete");
                }
            });
            self.tasks.lock().unwrap().push(handle);
        }

        self.announce_all_stores(fabric.as_ref()).await?;

        if self.discovery.bootstrap_peers().is_empty() {
            tracing::debug!("no bootstrap peers configured; relying on the fabric's own rendezvous");
        } else {
            tracing::info!(
                count = self.discovery.bootstrap_peers().len(),
                "bootstrap peers configured; dialing them is delegated to the fabric"
            );
        }

        self.spawn_sync_loop(fabric.clone());
        self.spawn_capability_loop(fabric.clone());
        self.spawn_relay_loop(fabric);

        Ok(())
    }

    /// Stop every background loop and await its task, e.g. on graceful
    /// process shutdown.
    pub async fn shutdown(&self) {
        self.shutdown.notify_waiters();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn announce_all_stores(&self, fabric: &dyn Fabric) -> Result<()> {
        let stores = store::scan(&self.config.store_dir).await?;
        for s in &stores {
            let record = dig_discovery::StoreRecord {
                peer_id: self.local_peer_id.clone(),
                overlay_address: self.identity.overlay_address().to_string(),
                timestamp: store::now_unix(),
            };
            let payload = serde_json::to_vec(&record)?;
            fabric.put(&orchestrator::store_dht_key(&s.store_id), payload).await?;
        }

        let profile = self.capability.self_profile().await;
        let announcement = dig_discovery::PeerAnnouncement {
            peer_id: self.local_peer_id.clone(),
            network_id: self.config.network_id.clone(),
            overlay_address: self.identity.overlay_address().to_string(),
            capabilities: capability_tags(&profile),
            stores: stores.into_iter().map(|s| s.store_id).collect(),
            timestamp: store::now_unix(),
        };
        self.discovery.announce(fabric, &announcement).await
    }

    /// Drain peer announcements gossiped since the last poll (§4.4) and run
    /// the classifier against any peer id not already in the registry, so
    /// the sync loop and orchestrator can see candidates this node has
    /// never been dialed by.
    async fn discover_peers(&self, fabric: &dyn Fabric) {
        let announcements = match self.discovery.poll_gossip(fabric).await {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(error = %e, "failed to poll peer gossip");
                return;
            }
        };
        for announcement in announcements {
            if announcement.peer_id == self.local_peer_id {
                continue;
            }
            if self.registry.get(&announcement.peer_id).is_some() {
                continue;
            }
            self.registry.classify(fabric, announcement.peer_id).await;
        }
    }

    fn spawn_sync_loop(self: &Arc<Self>, fabric: Arc<dyn Fabric>) {
        let node = self.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(node.config.intervals.sync_initial_delay) => {}
                () = shutdown.notified() => return,
            }
            let mut ticker = tokio::time::interval(node.config.intervals.sync_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = node.announce_all_stores(fabric.as_ref()).await {
                            tracing::warn!(error = %e, "failed to re-announce stores");
                        }
                        node.discover_peers(fabric.as_ref()).await;
                        match node.sync_loop.run_sweep(fabric.clone()).await {
                            Ok(summary) => tracing::debug!(
                                missing = summary.missing_count,
                                attempted = summary.results.len(),
                                "sync sweep complete"
                            ),
                            Err(e) => tracing::warn!(error = %e, "sync sweep failed"),
                        }
                    }
                    () = shutdown.notified() => return,
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    fn spawn_capability_loop(self: &Arc<Self>, fabric: Arc<dyn Fabric>) {
        let node = self.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut self_ticker = tokio::time::interval(node.config.intervals.capability_self_retest);
            let mut peer_ticker = tokio::time::interval(node.config.intervals.capability_peer_retest);
            loop {
                tokio::select! {
                    _ = self_ticker.tick() => {
                        node.capability.recompute_self(fabric.as_ref()).await;
                    }
                    _ = peer_ticker.tick() => {
                        for peer in node.registry.verified_overlay_peers() {
                            if node.capability.needs_retest(&peer.peer_id, false) {
                                node.refresh_peer_capability(fabric.as_ref(), &peer.peer_id).await;
                            }
                        }
                    }
                    () = shutdown.notified() => return,
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    async fn refresh_peer_capability(&self, fabric: &dyn Fabric, peer_id: &PeerId) {
        let Ok(mut stream) = fabric.dial(peer_id, "dig/1", self.config.timeouts.dial).await else {
            return;
        };
        let request = Request::GetPeerInfo {
            requested_info: vec!["capabilities".to_string()],
        };
        if write_response(&mut stream, &request).await.is_err() {
            return;
        }
        let Ok(line) = read_line(&mut stream).await else {
            return;
        };
        let Ok(response) = serde_json::from_str::<PeerInfoResponse>(&line) else {
            return;
        };
        let caps = response.capabilities.unwrap_or_default();
        let profile = CapabilityProfile {
            accepts_direct_connections: caps.iter().any(|c| c == "accepts-direct"),
            can_act_as_relay: caps.iter().any(|c| c == "relay-capable"),
            observed_traversal_methods: Vec::new(),
            last_tested: store::now_unix(),
        };
        self.capability.observe(peer_id.clone(), profile);
    }

    fn spawn_relay_loop(self: &Arc<Self>, fabric: Arc<dyn Fabric>) {
        let node = self.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(node.config.intervals.relay_health_check);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = node.announce_relay_capability(fabric.as_ref()).await {
                            tracing::warn!(error = %e, "failed to announce relay capability");
                        }
                        if let Err(e) = node.poll_relay_announcements(fabric.as_ref()).await {
                            tracing::warn!(error = %e, "failed to poll relay announcements");
                        }
                    }
                    () = shutdown.notified() => return,
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    async fn announce_relay_capability(&self, fabric: &dyn Fabric) -> Result<()> {
        let profile = self.capability.self_profile().await;
        if !profile.can_act_as_relay {
            return Ok(());
        }
        let announcement = dig_discovery::RelayAnnouncement {
            peer_id: self.local_peer_id.clone(),
            addresses: fabric.local_addresses(),
            current_load: self.relay_sessions.len() as u32,
            max_capacity: RELAY_MAX_CAPACITY,
            timestamp: store::now_unix(),
        };
        let payload = serde_json::to_vec(&announcement)?;
        fabric
            .publish(relay::RELAY_ANNOUNCEMENTS_TOPIC, payload)
            .await?;

        // The DHT is a single last-write-wins key, so the registry snapshot
        // must be read, merged, and written back rather than overwritten.
        let mut snapshot: Vec<dig_discovery::RelayAnnouncement> = fabric
            .get(relay::RELAY_REGISTRY_KEY)
            .await?
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        snapshot.retain(|a| a.peer_id != self.local_peer_id);
        snapshot.push(announcement);
        fabric
            .put(relay::RELAY_REGISTRY_KEY, serde_json::to_vec(&snapshot)?)
            .await
    }

    async fn poll_relay_announcements(&self, fabric: &dyn Fabric) -> Result<()> {
        for bytes in fabric.drain(relay::RELAY_ANNOUNCEMENTS_TOPIC).await? {
            if let Ok(announcement) = serde_json::from_slice::<dig_discovery::RelayAnnouncement>(&bytes) {
                self.relay.upsert(relay::candidate_from_announcement(&announcement)).await;
            }
        }
        if let Some(bytes) = fabric.get(relay::RELAY_REGISTRY_KEY).await? {
            if let Ok(snapshot) = serde_json::from_slice::<Vec<dig_discovery::RelayAnnouncement>>(&bytes) {
                for announcement in &snapshot {
                    self.relay.upsert(relay::candidate_from_announcement(announcement)).await;
                }
            }
        }
        Ok(())
    }

    /// Handle one inbound `dig/1` stream: read a single request line,
    /// gate it through the peer registry, and dispatch to the matching
    /// handler.
    ///
    /// `DIG_NETWORK_IDENTIFICATION` and `VERIFY_OVERLAY_MEMBERSHIP` bypass
    /// the registry lookup entirely: they are the probes a classifier uses
    /// *on* a peer, so the peer being probed must answer them regardless of
    /// its own opinion of the prober — gating them on a fresh `classify()`
    /// call would have each side's classifier dial the other's in a loop
    /// that never terminates.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream closes before a request line arrives
    /// or a response cannot be written back.
    pub async fn dispatch(&self, fabric: &dyn Fabric, peer_id: PeerId, mut stream: BoxedStream) -> Result<()> {
        let line = read_line(&mut stream).await?;

        let Some(request) = parse_request(&line) else {
            return write_response(&mut stream, &ErrorResponse::unknown_op()).await;
        };
        let op = request.op_name();

        let bypasses_gate = matches!(
            request,
            Request::DigNetworkIdentification {} | Request::VerifyOverlayMembership { .. }
        );
        if !bypasses_gate {
            if self.registry.get(&peer_id).is_none() {
                self.registry.classify(fabric, peer_id.clone()).await;
            }
            let allowed = self.registry.get(&peer_id).is_some_and(|r| r.is_allowed(op));
            if !allowed {
                return write_response(&mut stream, &ErrorResponse::new("peer-denied")).await;
            }
        }

        match request {
            Request::GetStoreContent { store_id } => {
                self.serve_get_store_content(&mut stream, &store_id).await
            }
            Request::GetFileRange { store_id, range_start, range_end, chunk_id } => {
                self.serve_get_file_range(&mut stream, &store_id, range_start, range_end, chunk_id)
                    .await
            }
            Request::Handshake { .. } => self.serve_handshake(&mut stream).await,
            Request::DigNetworkIdentification {} => self.serve_identification(&mut stream).await,
            Request::VerifyOverlayMembership { requested, .. } => {
                self.serve_verify_membership(&mut stream, &requested).await
            }
            Request::GetPeerInfo { requested_info } => {
                self.serve_peer_info(&mut stream, &requested_info).await
            }
            Request::RelayCoordinateRequest { target_peer_id, store_id, .. } => {
                self.serve_relay_coordinate(fabric, &mut stream, target_peer_id, store_id).await
            }
            Request::RelayData { session_id, store_id, range_start, range_end } => {
                self.serve_relay_data(fabric, &mut stream, &session_id, &store_id, range_start, range_end)
                    .await
            }
            Request::RelayConnectionSignal { turn_server_peer_id, .. } => {
                self.serve_relay_signal(fabric, &mut stream, &turn_server_peer_id).await
            }
        }
    }

    async fn serve_get_store_content(&self, stream: &mut BoxedStream, store_id: &str) -> Result<()> {
        let Some(meta) = store::find(&self.config.store_dir, store_id).await? else {
            return write_response(stream, &ErrorResponse::new("store-not-found")).await;
        };
        let header = StoreContentHeader {
            success: true,
            size: meta.size,
            mime: meta.mime.clone(),
        };
        write_response(stream, &header).await?;
        let file = tokio::fs::File::open(&meta.path).await?;
        stream_body(stream, file, meta.size).await
    }

    async fn serve_get_file_range(
        &self,
        stream: &mut BoxedStream,
        store_id: &str,
        range_start: u64,
        range_end: u64,
        chunk_id: Option<usize>,
    ) -> Result<()> {
        let Some(meta) = store::find(&self.config.store_dir, store_id).await? else {
            return write_response(stream, &ErrorResponse::new("store-not-found")).await;
        };
        if range_start > range_end || range_end >= meta.size {
            return write_response(stream, &ErrorResponse::invalid_range(meta.size)).await;
        }

        let mut file = tokio::fs::File::open(&meta.path).await?;
        {
            use tokio::io::AsyncSeekExt;
            file.seek(std::io::SeekFrom::Start(range_start)).await?;
        }
        let len = range_end - range_start + 1;
        let header = FileRangeHeader {
            success: true,
            size: len,
            total_size: meta.size,
            range_start,
            range_end,
            chunk_id,
            is_partial: true,
        };
        write_response(stream, &header).await?;
        stream_body(stream, file, len).await
    }

    async fn serve_handshake(&self, stream: &mut BoxedStream) -> Result<()> {
        let stores = store::scan(&self.config.store_dir).await?;
        let profile = self.capability.self_profile().await;
        let response = HandshakeResponse {
            protocol_version: 1,
            supported_features: vec!["dig/1".to_string()],
            public_key: hex::encode(self.identity.public_key()),
            node_capabilities: capability_tags(&profile),
            store_count: stores.len(),
            accepts_direct: profile.accepts_direct_connections,
        };
        write_response(stream, &response).await
    }

    async fn serve_identification(&self, stream: &mut BoxedStream) -> Result<()> {
        let response = IdentificationResponse {
            network_id: self.config.network_id.clone(),
            is_overlay_node: true,
            protocol_version: 1,
            timestamp: store::now_unix(),
        };
        write_response(stream, &response).await
    }

    async fn serve_verify_membership(&self, stream: &mut BoxedStream, requested: &[String]) -> Result<()> {
        let stores = if requested.iter().any(|r| r == "stores") {
            store::scan(&self.config.store_dir)
                .await?
                .into_iter()
                .map(|s| s.store_id)
                .collect()
        } else {
            Vec::new()
        };
        let capabilities = if requested.iter().any(|r| r == "capabilities") {
            capability_tags(&self.capability.self_profile().await)
        } else {
            Vec::new()
        };
        let response = VerifyMembershipResponse {
            overlay_address: self.identity.overlay_address().to_string(),
            capabilities,
            stores,
            timestamp: store::now_unix(),
        };
        write_response(stream, &response).await
    }

    async fn serve_peer_info(&self, stream: &mut BoxedStream, requested_info: &[String]) -> Result<()> {
        let mut response = PeerInfoResponse::default();
        if requested_info.iter().any(|r| r == "stores") {
            response.stores = Some(
                store::scan(&self.config.store_dir)
                    .await?
                    .into_iter()
                    .map(|s| s.store_id)
                    .collect(),
            );
        }
        if requested_info.iter().any(|r| r == "capabilities") {
            response.capabilities = Some(capability_tags(&self.capability.self_profile().await));
        }
        if requested_info.iter().any(|r| r == "overlayAddress") {
            response.overlay_address = Some(self.identity.overlay_address().to_string());
        }
        if requested_info.iter().any(|r| r == "nodeType") {
            response.node_type = Some("dig-node".to_string());
        }
        write_response(stream, &response).await
    }

    async fn serve_relay_coordinate(
        &self,
        fabric: &dyn Fabric,
        stream: &mut BoxedStream,
        target_peer_id: PeerId,
        store_id: Option<String>,
    ) -> Result<()> {
        let profile = self.capability.self_profile().await;
        if !profile.can_act_as_relay {
            return write_response(stream, &ErrorResponse::new("not-relay-capable")).await;
        }
        let session_id = hex::encode(dig_identity::random::random_16()?);
        self.relay_sessions.insert(
            session_id.clone(),
            RelayServingSession {
                source_peer_id: target_peer_id,
                store_id,
                created_at: store::now_unix(),
            },
        );
        let response = RelayCoordinateResponse {
            session_id,
            relay_peer_id: self.local_peer_id.clone(),
            external_address: fabric.local_addresses().first().cloned().unwrap_or_default(),
            relay_port: self.config.listen_port,
        };
        write_response(stream, &response).await
    }

    async fn serve_relay_data(
        &self,
        fabric: &dyn Fabric,
        stream: &mut BoxedStream,
        session_id: &str,
        store_id: &str,
        range_start: Option<u64>,
        range_end: Option<u64>,
    ) -> Result<()> {
        // One RELAY_DATA request per coordinated session: the session is
        // consumed here regardless of outcome.
        let Some((_, session)) = self.relay_sessions.remove(session_id) else {
            return write_response(stream, &ErrorResponse::new("session-unknown")).await;
        };

        let range = match (range_start, range_end) {
            (Some(start), Some(end)) => Some((start, end)),
            _ => None,
        };
        let fetched = match range {
            Some(r) => {
                fetch_range_from_source(fabric, &session.source_peer_id, store_id, r, self.config.timeouts.dial)
                    .await
            }
            None => {
                fetch_whole_from_source(fabric, &session.source_peer_id, store_id, self.config.timeouts.dial).await
            }
        };
        let Ok(data) = fetched else {
            return write_response(stream, &ErrorResponse::new("store-unavailable")).await;
        };

        let response = RelayDataResponse {
            store_id: store_id.to_string(),
            size: data.len() as u64,
            data: base64::engine::general_purpose::STANDARD.encode(&data),
        };
        write_response(stream, &response).await
    }

    async fn serve_relay_signal(
        &self,
        fabric: &dyn Fabric,
        stream: &mut BoxedStream,
        turn_server_peer_id: &str,
    ) -> Result<()> {
        let ok = fabric
            .dial(&turn_server_peer_id.to_string(), "dig/1", self.config.timeouts.dial)
            .await
            .is_ok();
        write_response(stream, &RelaySignalResponse { ok }).await
    }
}

fn capability_tags(profile: &CapabilityProfile) -> Vec<String> {
    let mut tags = Vec::new();
    if profile.accepts_direct_connections {
        tags.push("accepts-direct".to_string());
    }
    if profile.can_act_as_relay {
        tags.push("relay-capable".to_string());
    }
    tags
}

async fn stream_body(stream: &mut BoxedStream, mut file: tokio::fs::File, mut remaining: u64) -> Result<()> {
    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
    while remaining > 0 {
        let take = remaining.min(STREAM_CHUNK_SIZE as u64) as usize;
        file.read_exact(&mut buf[..take])
            .await
            .map_err(|e| NodeError::StreamClosed(e.to_string().into()))?;
        stream
            .write_all(&buf[..take])
            .await
            .map_err(|e| NodeError::StreamClosed(e.to_string().into()))?;
        remaining -= take as u64;
    }
    stream
        .flush()
        .await
        .map_err(|e| NodeError::StreamClosed(e.to_string().into()))
}

async fn fetch_whole_from_source(
    fabric: &dyn Fabric,
    peer_id: &str,
    store_id: &str,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let mut stream = fabric.dial(&peer_id.to_string(), "dig/1", timeout).await?;
    let request = Request::GetStoreContent {
        store_id: store_id.to_string(),
    };
    write_response(&mut stream, &request).await?;
    let line = read_line(&mut stream).await?;
    let header: StoreContentHeader = serde_json::from_str(&line)?;
    let mut body = vec![0u8; header.size as usize];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| NodeError::StreamClosed(e.to_string().into()))?;
    Ok(body)
}

async fn fetch_range_from_source(
    fabric: &dyn Fabric,
    peer_id: &str,
    store_id: &str,
    range: (u64, u64),
    timeout: Duration,
) -> Result<Vec<u8>> {
    let mut stream = fabric.dial(&peer_id.to_string(), "dig/1", timeout).await?;
    let request = Request::GetFileRange {
        store_id: store_id.to_string(),
        range_start: range.0,
        range_end: range.1,
        chunk_id: None,
    };
    write_response(&mut stream, &request).await?;
    let line = read_line(&mut stream).await?;
    let header: FileRangeHeader = serde_json::from_str(&line)?;
    let mut body = vec![0u8; header.size as usize];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| NodeError::StreamClosed(e.to_string().into()))?;
    Ok(body)
}

async fn read_line(stream: &mut BoxedStream) -> Result<String> {
    let mut reader = BufReader::new(&mut *stream);
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|e| NodeError::StreamClosed(e.to_string().into()))?;
    if n == 0 {
        return Err(NodeError::stream_closed("peer closed before sending a request"));
    }
    Ok(line)
}

async fn write_response<T: serde::Serialize>(stream: &mut BoxedStream, value: &T) -> Result<()> {
    let mut line = serde_json::to_vec(value)?;
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
