//! Chunked Downloader (§4.7): batch-schedules chunk fetches for an active
//! [`Session`] across its configured sources, persists progress after every
//! batch, retries failed chunks against a rotated source, and finalizes the
//! file once every chunk is captured.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dig_discovery::DirectoryClient;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinSet;

use crate::node::error::{NodeError, Result};
use crate::node::fabric::{BoxedStream, Fabric};
use crate::node::protocol::{ErrorResponse, FileRangeHeader, Request};
use crate::node::relay::{RelayCoordinator, RelaySession};
use crate::node::session::{Session, Source, SourceKind};
use crate::node::store;

/// Drives one [`Session`] to completion or a terminal failure.
pub struct Downloader {
    relay: Arc<RelayCoordinator>,
    dial_timeout: Duration,
    chunk_read_timeout: Duration,
    directory_timeout: Duration,
    source_failure_threshold: u32,
    directory_clients: DashMap<String, DirectoryClient>,
}

impl Downloader {
    /// Build a downloader sharing the node's relay coordinator.
    #[must_use]
    pub fn new(
        relay: Arc<RelayCoordinator>,
        dial_timeout: Duration,
        chunk_read_timeout: Duration,
        directory_timeout: Duration,
        source_failure_threshold: u32,
    ) -> Self {
        Self {
            relay,
            dial_timeout,
            chunk_read_timeout,
            directory_timeout,
            source_failure_threshold,
            directory_clients: DashMap::new(),
        }
    }

    /// Run `session` to completion, persisting progress after every batch
    /// and honoring `cancel` between batches.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::RelayUnavailable`] (reused to mean "no usable
    /// source remains") if every configured source becomes exhausted before
    /// the session completes, or [`NodeError::Cancelled`] if `cancel` is set
    /// between batches.
    pub async fn run(
        &self,
        fabric: Arc<dyn Fabric>,
        session: &mut Session,
        cancel: Arc<AtomicBool>,
    ) -> Result<PathBuf> {
        session.status = crate::node::session::SessionStatus::Downloading;
        let mut attempts: HashMap<usize, u32> = HashMap::new();

        while !session.is_complete() {
            if cancel.load(Ordering::Relaxed) {
                session.status = crate::node::session::SessionStatus::Cancelled;
                session.persist().await?;
                return Err(NodeError::cancelled("download cancelled"));
            }

            let mut batch = session.schedulable_chunks();
            if batch.is_empty() {
                let retry = session.drain_failed_for_retry();
                if retry.is_empty() {
                    break;
                }
                batch = retry;
            }
            batch.truncate(session.max_concurrent_chunks.max(1));

            let mut joinset = JoinSet::new();
            for i in batch {
                session.begin_chunk(i);
                let attempt = *attempts.get(&i).unwrap_or(&0);
                let source_idx = match session.pick_source(i, attempt, self.source_failure_threshold)
                {
                    Ok(idx) => idx,
                    Err(_) => {
                        session.fail_chunk(i, 0);
                        continue;
                    }
                };
                let source = session.sources[source_idx].clone();
                let range = session.chunk_range(i);
                let store_id = session.store_id.clone();
                let fabric = fabric.clone();
                let relay = self.relay.clone();
                let dial_timeout = self.dial_timeout;
                let chunk_read_timeout = self.chunk_read_timeout;
                let directory_client = self.directory_client_for(&source);

                joinset.spawn(async move {
                    let result = fetch_chunk(
                        fabric.as_ref(),
                        relay.as_ref(),
                        &source,
                        &store_id,
                        i,
                        range,
                        dial_timeout,
                        chunk_read_timeout,
                        directory_client.as_ref(),
                    )
                    .await;
                    (i, source_idx, result)
                });
            }

            while let Some(joined) = joinset.join_next().await {
                let Ok((i, source_idx, result)) = joined else {
                    continue;
                };
                match result {
                    Ok(data) => {
                        let len = data.len() as u64;
                        write_chunk(&session.temp_path, session.chunk_range(i).0, &data).await?;
                        session.complete_chunk(i, len, source_idx);
                    }
                    Err(_) => {
                        session.fail_chunk(i, source_idx);
                        *attempts.entry(i).or_insert(0) += 1;
                    }
                }
            }

            session.persist().await?;

            if !session.is_complete() && session.all_sources_exhausted(self.source_failure_threshold)
            {
                session.status = crate::node::session::SessionStatus::Failed;
                session.persist().await?;
                return Err(NodeError::relay_unavailable(
                    "every source exhausted before the session completed",
                ));
            }
        }

        self.finalize(session).await
    }

    fn directory_client_for(&self, source: &Source) -> Option<DirectoryClient> {
        if source.kind != SourceKind::Directory {
            return None;
        }
        let endpoint = source.endpoint.clone()?;
        if let Some(existing) = self.directory_clients.get(&endpoint) {
            return Some(existing.clone());
        }
        let client = DirectoryClient::new(endpoint.clone(), self.directory_timeout);
        self.directory_clients.insert(endpoint, client.clone());
        Some(client)
    }

    async fn finalize(&self, session: &Session) -> Result<PathBuf> {
        // A zero-byte store never schedules a chunk fetch, so the temp file
        // is never created; write it directly rather than reading a path
        // that was never written to.
        let data = if session.total_size == 0 {
            if let Some(parent) = session.temp_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&session.temp_path, []).await?;
            Vec::new()
        } else {
            tokio::fs::read(&session.temp_path).await?
        };
        if data.len() as u64 != session.total_size {
            return Err(NodeError::SizeMismatch {
                expected: session.total_size,
                actual: data.len() as u64,
            });
        }
        let content_hash = dig_files::hasher::hash_file(&data);
        tracing::info!(
            store_id = %session.store_id,
            hash = %hex::encode(content_hash),
            "store download finalized"
        );

        let store_dir = session
            .temp_path
            .parent()
            .and_then(|p| p.parent())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let final_path = store::final_path(&store_dir, &session.store_id, "");
        tokio::fs::rename(&session.temp_path, &final_path).await?;
        tokio::fs::remove_file(&session.meta_path).await.ok();
        Ok(final_path)
    }
}

#[allow(clippy::too_many_arguments)]
async fn fetch_chunk(
    fabric: &dyn Fabric,
    relay: &RelayCoordinator,
    source: &Source,
    store_id: &str,
    chunk_id: usize,
    range: (u64, u64),
    dial_timeout: Duration,
    chunk_read_timeout: Duration,
    directory_client: Option<&DirectoryClient>,
) -> Result<Vec<u8>> {
    match source.kind {
        SourceKind::Direct => {
            let peer_id = source
                .peer_id
                .as_ref()
                .ok_or_else(|| NodeError::peer_denied("direct source missing peer id"))?;
            fetch_direct(fabric, peer_id, store_id, chunk_id, range, dial_timeout, chunk_read_timeout)
                .await
        }
        SourceKind::Relay => {
            let relay_peer_id = source
                .peer_id
                .as_ref()
                .ok_or_else(|| NodeError::peer_denied("relay source missing peer id"))?;
            let session_id = source
                .relay_session_id
                .clone()
                .ok_or_else(|| NodeError::relay_unavailable("relay source has no established session"))?;
            let relay_session = RelaySession {
                relay_peer_id: relay_peer_id.clone(),
                session_id,
            };
            relay.fetch(fabric, &relay_session, store_id, Some(range)).await
        }
        SourceKind::Directory => {
            let client = directory_client
                .ok_or_else(|| NodeError::directory_unavailable("no directory client configured"))?;
            let request = dig_discovery::RelayStoreRequest {
                store_id: store_id.to_string(),
                range_start: Some(range.0),
                range_end: Some(range.1),
            };
            client
                .relay_store(&request)
                .await
                .map_err(|e| NodeError::DirectoryUnavailable(e.to_string().into()))
        }
    }
}

async fn fetch_direct(
    fabric: &dyn Fabric,
    peer_id: &str,
    store_id: &str,
    chunk_id: usize,
    range: (u64, u64),
    dial_timeout: Duration,
    chunk_read_timeout: Duration,
) -> Result<Vec<u8>> {
    let mut stream = fabric.dial(&peer_id.to_string(), "dig/1", dial_timeout).await?;
    let request = Request::GetFileRange {
        store_id: store_id.to_string(),
        range_start: range.0,
        range_end: range.1,
        chunk_id: Some(chunk_id),
    };
    write_request(&mut stream, &request).await?;

    tokio::time::timeout(chunk_read_timeout, read_chunk_response(&mut stream, range))
        .await
        .map_err(|_| NodeError::timeout("chunk read timed out"))?
}

async fn read_chunk_response(stream: &mut BoxedStream, range: (u64, u64)) -> Result<Vec<u8>> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|e| NodeError::StreamClosed(e.to_string().into()))?;
    if n == 0 {
        return Err(NodeError::stream_closed("peer closed before responding"));
    }

    if let Ok(error) = serde_json::from_str::<ErrorResponse>(&line) {
        if !error.success {
            return Err(NodeError::DecodeFailed(
                format!("peer returned error: {}", error.error).into(),
            ));
        }
    }

    let header: FileRangeHeader = serde_json::from_str(&line)?;
    let expected = range.1 - range.0 + 1;
    if header.size != expected || header.range_start != range.0 || header.range_end != range.1 {
        return Err(NodeError::SizeMismatch {
            expected,
            actual: header.size,
        });
    }

    let mut body = vec![0u8; header.size as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| NodeError::StreamClosed(e.to_string().into()))?;
    Ok(body)
}

async fn write_request(stream: &mut BoxedStream, req: &Request) -> Result<()> {
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

/// Write one chunk's bytes at `offset` into the session's temp file,
/// supporting out-of-order arrival from concurrent fetches.
async fn write_chunk(temp_path: &std::path::Path, offset: u64, data: &[u8]) -> Result<()> {
    use tokio::io::AsyncSeekExt;

    if let Some(parent) = temp_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .open(temp_path)
        .await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::fabric::test_double::TestFabric;
    use crate::node::protocol::FileRangeHeader;
    use crate::node::session::Session;
    use tempfile::TempDir;

    fn header_line(range: (u64, u64), data: &[u8]) -> Vec<u8> {
        let header = FileRangeHeader {
            success: true,
            size: data.len() as u64,
            total_size: 1024,
            range_start: range.0,
            range_end: range.1,
            chunk_id: Some(0),
            is_partial: true,
        };
        let mut line = serde_json::to_vec(&header).unwrap();
        line.push(b'\n');
        line.extend_from_slice(data);
        line
    }

    #[tokio::test]
    async fn direct_small_store_downloads_and_finalizes() {
        let dir = TempDir::new().unwrap();
        store::ensure_store_dir(dir.path()).await.unwrap();

        let data = vec![0xABu8; 256];
        let fabric = TestFabric::new("local");
        fabric.connect("peer-a");
        fabric.respond_with("peer-a", header_line((0, 255), &data));

        let relay = Arc::new(RelayCoordinator::new(
            "local".to_string(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        ));
        let downloader = Downloader::new(
            relay,
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(5),
            3,
        );

        let mut session = Session::new(
            dir.path(),
            "store-1",
            256,
            256,
            4,
            vec![Source::direct("peer-a", 0)],
        );

        let cancel = Arc::new(AtomicBool::new(false));
        let final_path = downloader
            .run(Arc::new(fabric), &mut session, cancel)
            .await
            .unwrap();

        let written = tokio::fs::read(&final_path).await.unwrap();
        assert_eq!(written, data);
    }

    #[tokio::test]
    async fn zero_size_store_finalizes_to_an_empty_file_with_no_chunk_fetch() {
        let dir = TempDir::new().unwrap();
        store::ensure_store_dir(dir.path()).await.unwrap();

        // No peer is connected; if a chunk fetch were attempted it would
        // fail outright, so success here proves zero chunks were scheduled.
        let fabric = TestFabric::new("local");
        let relay = Arc::new(RelayCoordinator::new(
            "local".to_string(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        ));
        let downloader = Downloader::new(
            relay,
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(5),
            3,
        );

        let mut session = Session::new(
            dir.path(),
            "store-empty",
            0,
            256,
            4,
            vec![Source::direct("ghost", 0)],
        );

        let cancel = Arc::new(AtomicBool::new(false));
        let final_path = downloader
            .run(Arc::new(fabric), &mut session, cancel)
            .await
            .unwrap();

        let written = tokio::fs::read(&final_path).await.unwrap();
        assert!(written.is_empty());
        assert!(!session.meta_path.exists());
    }

    #[tokio::test]
    async fn exhausted_sources_fail_the_session() {
        let dir = TempDir::new().unwrap();
        store::ensure_store_dir(dir.path()).await.unwrap();

        let fabric = TestFabric::new("local");
        // peer never connected: every dial fails immediately.
        let relay = Arc::new(RelayCoordinator::new(
            "local".to_string(),
            Duration::from_millis(50),
            Duration::from_millis(50),
        ));
        let downloader = Downloader::new(
            relay,
            Duration::from_millis(50),
            Duration::from_millis(50),
            Duration::from_millis(50),
            1,
        );

        let mut session = Session::new(
            dir.path(),
            "store-2",
            256,
            256,
            4,
            vec![Source::direct("ghost", 0)],
        );

        let cancel = Arc::new(AtomicBool::new(false));
        let err = downloader
            .run(Arc::new(fabric), &mut session, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::RelayUnavailable(_)));
    }

    #[tokio::test]
    async fn cancellation_stops_before_completion() {
        let dir = TempDir::new().unwrap();
        store::ensure_store_dir(dir.path()).await.unwrap();

        let fabric = TestFabric::new("local");
        fabric.connect("peer-a");
        // no scripted response: dial succeeds but never answers, so the
        // chunk read will hang until cancellation is observed on the next
        // batch boundary. Use a tiny chunk_read_timeout so the batch fails
        // fast and the loop re-checks cancel.
        let relay = Arc::new(RelayCoordinator::new(
            "local".to_string(),
            Duration::from_millis(20),
            Duration::from_millis(20),
        ));
        let downloader = Downloader::new(
            relay,
            Duration::from_millis(20),
            Duration::from_millis(20),
            Duration::from_millis(20),
            1,
        );

        let mut session = Session::new(
            dir.path(),
            "store-3",
            256,
            256,
            4,
            vec![Source::direct("peer-a", 0)],
        );

        let cancel = Arc::new(AtomicBool::new(true));
        let err = downloader
            .run(Arc::new(fabric), &mut session, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Cancelled(_)));
    }
}
