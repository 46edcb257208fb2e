//! Download Orchestrator (§4.6): for a given store, tries connection
//! strategies in strict priority order against a candidate set derived from
//! the registry, the external directory, and the DHT. The first strategy
//! that returns bytes wins; earlier failures are diagnostic only.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::node::capability::CapabilityTracker;
use crate::node::discovery::Discovery;
use crate::node::downloader::Downloader;
use crate::node::error::{NodeError, Result};
use crate::node::fabric::{BoxedStream, Fabric};
use crate::node::protocol::{ErrorResponse, FileRangeHeader, Request};
use crate::node::registry::Registry;
use crate::node::relay::RelayCoordinator;
use crate::node::session::{Session, Source};
use crate::node::store;

/// DHT key candidate peers for a store are announced under (§6).
#[must_use]
pub fn store_dht_key(store_id: &str) -> String {
    format!("/dig-store/{store_id}")
}

/// Up to this many candidates are tried per relay-via-candidate attempt.
const MAX_RELAY_CANDIDATES: usize = 2;

/// One of the four ordered transfer paths the orchestrator tries (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// A candidate with an existing open session.
    DirectConnected,
    /// A candidate reachable only after a fresh dial.
    DirectAfterDial,
    /// Relayed through a relay-capable peer.
    RelayViaCandidate,
    /// The external directory's own relay endpoint.
    ExternalDirectory,
}

/// One attempted strategy's diagnostic record, kept for the session.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    /// Strategy that was tried.
    pub strategy: Strategy,
    /// Number of candidates the strategy had available.
    pub candidates_tried: usize,
    /// Failure reason, absent if the strategy won.
    pub error: Option<String>,
}

/// Outcome of a full `downloadStore` run, per the orchestrator's documented
/// `(bool, strategy-or-error)` contract.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    /// Whether any strategy succeeded.
    pub success: bool,
    /// Winning strategy, if `success`.
    pub strategy: Option<Strategy>,
    /// Path to the finalized store file, if `success`.
    pub final_path: Option<PathBuf>,
    /// Last error encountered, if every strategy failed.
    pub error: Option<NodeError>,
    /// Structured attempt log (diagnostic only).
    pub attempts: Vec<AttemptRecord>,
}

/// Drives the strategy ladder for store downloads.
pub struct Orchestrator {
    registry: Arc<Registry>,
    capability: Arc<CapabilityTracker>,
    discovery: Arc<Discovery>,
    relay: Arc<RelayCoordinator>,
    downloader: Arc<Downloader>,
    store_dir: PathBuf,
    chunk_size: u64,
    max_concurrent_chunks: usize,
    probe_timeout: Duration,
    /// One entry per store id with a download in flight (§5 invariant 9:
    /// at most one session per store id; concurrent callers share it).
    in_flight: DashMap<String, watch::Sender<Option<DownloadOutcome>>>,
}

impl Orchestrator {
    /// Build an orchestrator sharing the node's registry, capability
    /// tracker, discovery coordinator, relay coordinator, and downloader.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        capability: Arc<CapabilityTracker>,
        discovery: Arc<Discovery>,
        relay: Arc<RelayCoordinator>,
        downloader: Arc<Downloader>,
        store_dir: PathBuf,
        chunk_size: u64,
        max_concurrent_chunks: usize,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            capability,
            discovery,
            relay,
            downloader,
            store_dir,
            chunk_size,
            max_concurrent_chunks,
            probe_timeout,
            in_flight: DashMap::new(),
        }
    }

    /// Download `store_id`, trying every strategy in order. Concurrent
    /// calls for the same `store_id` share a single run: the first caller
    /// becomes the leader and runs [`Self::run_strategies`], the rest wait
    /// for its outcome and get a clone of it. Once the leader finishes the
    /// entry is cleared, so a later call starts a fresh run rather than
    /// replaying a stale result forever.
    pub async fn download_store(&self, fabric: Arc<dyn Fabric>, store_id: &str) -> DownloadOutcome {
        let mut rx = match self.in_flight.entry(store_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => entry.get().subscribe(),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                entry.insert(tx.clone());
                drop(rx);
                let outcome = self.run_strategies(fabric, store_id).await;
                let _ = tx.send(Some(outcome.clone()));
                self.in_flight.remove(store_id);
                return outcome;
            }
        };
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return DownloadOutcome {
                    success: false,
                    strategy: None,
                    final_path: None,
                    error: Some(NodeError::cancelled("in-flight download was abandoned")),
                    attempts: Vec::new(),
                };
            }
        }
    }

    /// Try every strategy in order for `store_id`, returning on the first
    /// that succeeds. Callers should go through [`Self::download_store`];
    /// this is the part that actually does the work once elected leader.
    async fn run_strategies(&self, fabric: Arc<dyn Fabric>, store_id: &str) -> DownloadOutcome {
        let mut attempts = Vec::new();
        let candidates = self.candidates(fabric.as_ref(), store_id).await;

        let connected: Vec<String> = candidates
            .iter()
            .filter(|p| fabric.is_connected(p))
            .cloned()
            .collect();
        if !connected.is_empty() {
            match self.try_direct(fabric.clone(), store_id, &connected).await {
                Ok(final_path) => {
                    attempts.push(record(Strategy::DirectConnected, connected.len(), None));
                    return success(Strategy::DirectConnected, final_path, attempts);
                }
                Err(e) => attempts.push(record(Strategy::DirectConnected, connected.len(), Some(&e))),
            }
        }

        let dialable: Vec<String> = candidates
            .iter()
            .filter(|p| !connected.contains(p))
            .filter(|p| {
                self.capability
                    .get(p)
                    .is_some_and(|c| c.accepts_direct_connections)
            })
            .cloned()
            .collect();
        if !dialable.is_empty() {
            match self.try_direct(fabric.clone(), store_id, &dialable).await {
                Ok(final_path) => {
                    attempts.push(record(Strategy::DirectAfterDial, dialable.len(), None));
                    return success(Strategy::DirectAfterDial, final_path, attempts);
                }
                Err(e) => attempts.push(record(Strategy::DirectAfterDial, dialable.len(), Some(&e))),
            }
        }

        let relay_targets: Vec<&String> = candidates.iter().take(MAX_RELAY_CANDIDATES).collect();
        let mut last_relay_err = None;
        for target in &relay_targets {
            match self.try_relay(fabric.clone(), store_id, target.as_str()).await {
                Ok(final_path) => {
                    attempts.push(record(Strategy::RelayViaCandidate, relay_targets.len(), None));
                    return success(Strategy::RelayViaCandidate, final_path, attempts);
                }
                Err(e) => last_relay_err = Some(e),
            }
        }
        if !relay_targets.is_empty() {
            attempts.push(record(
                Strategy::RelayViaCandidate,
                relay_targets.len(),
                last_relay_err.as_ref(),
            ));
        }

        if self.discovery.directory().is_some() {
            match self.try_directory(store_id).await {
                Ok(final_path) => {
                    attempts.push(record(Strategy::ExternalDirectory, 1, None));
                    return success(Strategy::ExternalDirectory, final_path, attempts);
                }
                Err(e) => {
                    attempts.push(record(Strategy::ExternalDirectory, 1, Some(&e)));
                    return DownloadOutcome {
                        success: false,
                        strategy: None,
                        final_path: None,
                        error: Some(e),
                        attempts,
                    };
                }
            }
        }

        let error = attempts
            .last()
            .and_then(|a| a.error.clone())
            .map(|msg| NodeError::Other(msg.into()))
            .unwrap_or_else(|| NodeError::relay_unavailable("no candidate held this store"));
        DownloadOutcome {
            success: false,
            strategy: None,
            final_path: None,
            error: Some(error),
            attempts,
        }
    }

    /// Candidate set: (registry advertised stores) ∪ (directory query) ∪
    /// (DHT `/dig-store/<storeId>`), sorted for deterministic ordering.
    async fn candidates(&self, fabric: &dyn Fabric, store_id: &str) -> Vec<String> {
        let mut set = HashSet::new();

        for peer in self.registry.verified_overlay_peers() {
            if peer.advertised_stores.iter().any(|s| s == store_id) {
                set.insert(peer.peer_id);
            }
        }

        if let Ok(peers) = self.discovery.query_directory().await {
            for peer in peers {
                if peer.stores.iter().any(|s| s == store_id) {
                    set.insert(peer.peer_id);
                }
            }
        }

        if let Ok(Some(bytes)) = fabric.get(&store_dht_key(store_id)).await {
            if let Ok(record) = serde_json::from_slice::<dig_discovery::StoreRecord>(&bytes) {
                set.insert(record.peer_id);
            }
        }

        let mut candidates: Vec<String> = set.into_iter().collect();
        candidates.sort();
        candidates
    }

    /// Probe one of `peers` for the store's declared size, then hand a
    /// chunked session covering all of `peers` to the downloader.
    async fn try_direct(
        &self,
        fabric: Arc<dyn Fabric>,
        store_id: &str,
        peers: &[String],
    ) -> Result<PathBuf> {
        let mut total_size = None;
        for peer in peers {
            if let Ok(size) = probe_total_size(fabric.as_ref(), peer, store_id, self.probe_timeout).await
            {
                total_size = Some(size);
                break;
            }
        }
        let total_size = total_size
            .ok_or_else(|| NodeError::Other("no direct candidate answered the size probe".into()))?;

        let sources: Vec<Source> = peers
            .iter()
            .enumerate()
            .map(|(i, p)| Source::direct(p.clone(), i as u32))
            .collect();
        let mut session = Session::new(
            &self.store_dir,
            store_id,
            total_size,
            self.chunk_size,
            self.max_concurrent_chunks,
            sources,
        );
        let cancel = Arc::new(AtomicBool::new(false));
        self.downloader.run(fabric, &mut session, cancel).await
    }

    /// Coordinate a relay session for `target` and pull the whole store
    /// through it in one exchange (§4.5 step 4).
    async fn try_relay(&self, fabric: Arc<dyn Fabric>, store_id: &str, target: &str) -> Result<PathBuf> {
        let relay_session = self
            .relay
            .establish(fabric.as_ref(), &target.to_string(), Some(store_id))
            .await?;
        let data = self
            .relay
            .fetch(fabric.as_ref(), &relay_session, store_id, None)
            .await?;
        write_whole_store(&self.store_dir, store_id, &data).await
    }

    /// Last resort: POST to the external directory's relay endpoint and
    /// write the returned bytes directly.
    async fn try_directory(&self, store_id: &str) -> Result<PathBuf> {
        let client = self
            .discovery
            .directory()
            .ok_or_else(|| NodeError::directory_unavailable("no directory configured"))?;
        let request = dig_discovery::RelayStoreRequest {
            store_id: store_id.to_string(),
            range_start: None,
            range_end: None,
        };
        let data = client
            .relay_store(&request)
            .await
            .map_err(|e| NodeError::DirectoryUnavailable(e.to_string().into()))?;
        write_whole_store(&self.store_dir, store_id, &data).await
    }
}

fn record(strategy: Strategy, candidates_tried: usize, error: Option<&NodeError>) -> AttemptRecord {
    AttemptRecord {
        strategy,
        candidates_tried,
        error: error.map(ToString::to_string),
    }
}

fn success(strategy: Strategy, final_path: PathBuf, attempts: Vec<AttemptRecord>) -> DownloadOutcome {
    DownloadOutcome {
        success: true,
        strategy: Some(strategy),
        final_path: Some(final_path),
        error: None,
        attempts,
    }
}

async fn write_whole_store(store_dir: &std::path::Path, store_id: &str, data: &[u8]) -> Result<PathBuf> {
    tokio::fs::create_dir_all(store_dir).await?;
    let final_path = store::final_path(store_dir, store_id, "");
    let tmp_path = final_path.with_extension("tmp");
    tokio::fs::write(&tmp_path, data).await?;
    tokio::fs::rename(&tmp_path, &final_path).await?;
    Ok(final_path)
}

async fn probe_total_size(
    fabric: &dyn Fabric,
    peer_id: &str,
    store_id: &str,
    timeout: Duration,
) -> Result<u64> {
    let mut stream = fabric.dial(&peer_id.to_string(), "dig/1", timeout).await?;
    let request = Request::GetFileRange {
        store_id: store_id.to_string(),
        range_start: 0,
        range_end: 0,
        chunk_id: None,
    };
    write_request(&mut stream, &request).await?;
    tokio::time::timeout(timeout, read_total_size(&mut stream))
        .await
        .map_err(|_| NodeError::timeout("size probe timed out"))?
}

/// Probing `[0, 0]` is the only way to learn a store's declared size without
/// already knowing it, but it is itself an invalid range for a genuinely
/// empty store — the server rejects it with `invalid-range`, which still
/// carries `totalSize` (always `0` in that case, since `[0, 0]` is in
/// bounds for every non-empty store). Read that case out of the error
/// response rather than the success header.
async fn read_total_size(stream: &mut BoxedStream) -> Result<u64> {
    use tokio::io::{AsyncBufReadExt, BufReader};
    let mut reader = BufReader::new(&mut *stream);
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|e| NodeError::StreamClosed(e.to_string().into()))?;
    if n == 0 {
        return Err(NodeError::stream_closed("peer closed before responding"));
    }
    if let Ok(header) = serde_json::from_str::<FileRangeHeader>(&line) {
        return Ok(header.total_size);
    }
    let error: ErrorResponse = serde_json::from_str(&line)?;
    error
        .total_size
        .ok_or_else(|| NodeError::decode_failed("size probe response carried no size"))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::capability::CapabilityTracker;
    use crate::node::discovery::Discovery;
    use crate::node::fabric::test_double::TestFabric;
    use crate::node::protocol::FileRangeHeader;
    use crate::node::registry::{ClassifierConfig, Registry};
    use std::collections::HashSet as StdHashSet;
    use tempfile::TempDir;

    fn header_line(total_size: u64, data: &[u8]) -> Vec<u8> {
        let header = FileRangeHeader {
            success: true,
            size: data.len() as u64,
            total_size,
            range_start: 0,
            range_end: data.len() as u64 - 1,
            chunk_id: None,
            is_partial: true,
        };
        let mut line = serde_json::to_vec(&header).unwrap();
        line.push(b'\n');
        line.extend_from_slice(data);
        line
    }

    fn orchestrator(dir: &std::path::Path) -> (Orchestrator, Arc<Registry>) {
        let registry = Arc::new(Registry::new(ClassifierConfig {
            identification_timeout: Duration::from_secs(1),
            network_id: "mainnet".to_string(),
            public_infrastructure: StdHashSet::new(),
        }));
        let capability = Arc::new(CapabilityTracker::new());
        let discovery = Arc::new(Discovery::new(vec![], "mainnet".to_string(), None, Duration::from_secs(1)));
        let relay = Arc::new(RelayCoordinator::new(
            "local".to_string(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        ));
        let downloader = Arc::new(Downloader::new(
            relay.clone(),
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(1),
            3,
        ));
        let orchestrator = Orchestrator::new(
            registry.clone(),
            capability,
            discovery,
            relay,
            downloader,
            dir.to_path_buf(),
            64 * 1024,
            4,
            Duration::from_secs(1),
        );
        (orchestrator, registry)
    }

    #[tokio::test]
    async fn empty_candidate_set_fails_cleanly() {
        let dir = TempDir::new().unwrap();
        store::ensure_store_dir(dir.path()).await.unwrap();
        let (orchestrator, _registry) = orchestrator(dir.path());
        let fabric = TestFabric::new("local");

        let outcome = orchestrator.download_store(Arc::new(fabric), "store-missing").await;
        assert!(!outcome.success);
        assert!(outcome.strategy.is_none());
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn direct_strategy_succeeds_via_dht_candidate() {
        let dir = TempDir::new().unwrap();
        store::ensure_store_dir(dir.path()).await.unwrap();
        let (orchestrator, _registry) = orchestrator(dir.path());

        let data = vec![0x22u8; 1024];
        let fabric = TestFabric::new("local");
        fabric.connect("peer-b");
        fabric.respond_with("peer-b", header_line(1024, &data));
        let record = dig_discovery::StoreRecord {
            peer_id: "peer-b".to_string(),
            overlay_address: "fd00:0000:0000:0000:0000:0000:0000:0002".to_string(),
            timestamp: 0,
        };
        fabric
            .put(&store_dht_key("store-2"), serde_json::to_vec(&record).unwrap())
            .await
            .unwrap();

        let outcome = orchestrator.download_store(Arc::new(fabric), "store-2").await;
        assert!(outcome.success);
        assert_eq!(outcome.strategy, Some(Strategy::DirectConnected));
        let written = tokio::fs::read(outcome.final_path.unwrap()).await.unwrap();
        assert_eq!(written, data);
    }

    #[tokio::test]
    async fn concurrent_downloads_of_the_same_store_share_one_outcome() {
        let dir = TempDir::new().unwrap();
        store::ensure_store_dir(dir.path()).await.unwrap();
        let (orchestrator, _registry) = orchestrator(dir.path());
        let orchestrator = Arc::new(orchestrator);

        let data = vec![0x33u8; 2048];
        let fabric = TestFabric::new("local");
        fabric.connect("peer-c");
        fabric.respond_with("peer-c", header_line(2048, &data));
        let record = dig_discovery::StoreRecord {
            peer_id: "peer-c".to_string(),
            overlay_address: "fd00:0000:0000:0000:0000:0000:0000:0003".to_string(),
            timestamp: 0,
        };
        fabric
            .put(&store_dht_key("store-3"), serde_json::to_vec(&record).unwrap())
            .await
            .unwrap();
        let fabric = Arc::new(fabric);

        let a = orchestrator.clone();
        let fa = fabric.clone();
        let b = orchestrator.clone();
        let fb = fabric.clone();
        let (outcome_a, outcome_b) = tokio::join!(
            async move { a.download_store(fa, "store-3").await },
            async move { b.download_store(fb, "store-3").await },
        );

        assert!(outcome_a.success);
        assert!(outcome_b.success);
        assert_eq!(outcome_a.final_path, outcome_b.final_path);
        assert!(orchestrator.in_flight.is_empty());
    }
}
