//! Download session state (§3, §4.7): chunk bookkeeping and crash-safe
//! metadata persistence.
//!
//! Grounded on the teacher's resume-state/resume-manager pattern
//! (write-to-temp-then-rename persistence, a `<id>.meta` sidecar file per
//! in-flight transfer), generalized to the chunk-set and source-rotation
//! model this spec requires.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::node::error::{NodeError, Result};
use crate::node::store::{download_paths, now_unix, DOWNLOADS_SUBDIR};

/// Where a chunk is fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// A directly-dialable peer.
    Direct,
    /// A relay-capable peer forwarding another source's bytes.
    Relay,
    /// The external directory's relay fallback endpoint.
    Directory,
}

/// One candidate the downloader can pull chunks from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    /// Transport kind.
    pub kind: SourceKind,
    /// Peer id for `direct`/`relay` sources.
    #[serde(rename = "peerId", skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    /// HTTPS endpoint for `directory` sources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Scheduling priority; lower values are preferred when ties need
    /// breaking outside the round-robin rotation.
    pub priority: u32,
    /// Consecutive-failure counter. Reset to 0 on any success.
    pub failures: u32,
    /// Unix timestamp of the last attempt against this source.
    #[serde(rename = "lastUsed", skip_serializing_if = "Option::is_none")]
    pub last_used: Option<u64>,
    /// Session id from a prior `RELAY_COORDINATE_REQUEST`, for `relay`
    /// sources. Absent for `direct`/`directory` sources.
    #[serde(rename = "relaySessionId", skip_serializing_if = "Option::is_none")]
    pub relay_session_id: Option<String>,
}

impl Source {
    /// Build a direct source for `peer_id`.
    #[must_use]
    pub fn direct(peer_id: impl Into<String>, priority: u32) -> Self {
        Self {
            kind: SourceKind::Direct,
            peer_id: Some(peer_id.into()),
            endpoint: None,
            priority,
            failures: 0,
            last_used: None,
            relay_session_id: None,
        }
    }

    /// Build a relay source forwarded through `relay_peer_id`.
    #[must_use]
    pub fn relay(relay_peer_id: impl Into<String>, priority: u32) -> Self {
        Self {
            kind: SourceKind::Relay,
            peer_id: Some(relay_peer_id.into()),
            endpoint: None,
            priority,
            failures: 0,
            last_used: None,
            relay_session_id: None,
        }
    }

    /// Attach a previously established relay session id, for `relay`
    /// sources.
    #[must_use]
    pub fn with_relay_session(mut self, session_id: impl Into<String>) -> Self {
        self.relay_session_id = Some(session_id.into());
        self
    }

    /// Build a directory-fallback source.
    #[must_use]
    pub fn directory(endpoint: impl Into<String>, priority: u32) -> Self {
        Self {
            kind: SourceKind::Directory,
            peer_id: None,
            endpoint: Some(endpoint.into()),
            priority,
            failures: 0,
            last_used: None,
            relay_session_id: None,
        }
    }

    /// A source is exhausted once it has accumulated `threshold` or more
    /// consecutive failures (§4.7: default 3).
    #[must_use]
    pub fn is_exhausted(&self, threshold: u32) -> bool {
        self.failures >= threshold
    }

    fn record_success(&mut self) {
        self.failures = 0;
        self.last_used = Some(now_unix());
    }

    fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
        self.last_used = Some(now_unix());
    }
}

/// Session lifecycle state (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Just created, sources not yet confirmed.
    Initializing,
    /// Chunk fetches are actively scheduled.
    Downloading,
    /// Suspended (e.g. rehydrated from disk, awaiting reachable sources).
    Paused,
    /// Finalized: file written, temp/metadata removed.
    Completed,
    /// Every source exhausted with no progress in a full sweep, or a
    /// surfaced per-session error (§7).
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

/// On-disk shape of a session's metadata sidecar, per §4.7: `{storeId,
/// totalSize, downloadedBytes, completedChunks[], failedChunks[], sources,
/// lastActivity, chunkSize}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(rename = "storeId")]
    pub store_id: String,
    #[serde(rename = "totalSize")]
    pub total_size: u64,
    #[serde(rename = "downloadedBytes")]
    pub downloaded_bytes: u64,
    #[serde(rename = "completedChunks")]
    pub completed_chunks: Vec<usize>,
    #[serde(rename = "failedChunks")]
    pub failed_chunks: Vec<usize>,
    pub sources: Vec<Source>,
    #[serde(rename = "lastActivity")]
    pub last_activity: u64,
    #[serde(rename = "chunkSize")]
    pub chunk_size: u64,
    /// Schema version, additive field: lets a future format change detect
    /// and reject stale metadata rather than misparse it.
    #[serde(rename = "formatVersion", default = "default_format_version")]
    pub format_version: u32,
}

fn default_format_version() -> u32 {
    1
}

/// Runtime state for one in-flight store download.
#[derive(Debug, Clone)]
pub struct Session {
    /// Hex store id this session downloads.
    pub store_id: String,
    /// Declared total size in bytes.
    pub total_size: u64,
    /// Bytes durably captured so far (sum of completed chunk lengths).
    pub downloaded_bytes: u64,
    /// Fixed chunk size in bytes.
    pub chunk_size: u64,
    /// Upper bound on simultaneously active chunk fetches.
    pub max_concurrent_chunks: usize,
    /// Current lifecycle state.
    pub status: SessionStatus,
    /// Chunk ordinals fully received and verified.
    pub completed_chunks: HashSet<usize>,
    /// Chunk ordinals currently in flight.
    pub active_chunks: HashSet<usize>,
    /// Chunk ordinals that failed their most recent attempt.
    pub failed_chunks: HashSet<usize>,
    /// Ordered candidate sources.
    pub sources: Vec<Source>,
    /// Path to the raw byte buffer under `.downloads/`.
    pub temp_path: PathBuf,
    /// Path to the metadata sidecar under `.downloads/`.
    pub meta_path: PathBuf,
    /// Unix timestamp the session was created.
    pub started_at: u64,
    /// Unix timestamp of the most recent chunk completion or failure.
    pub last_activity: u64,
}

impl Session {
    /// Create a brand-new session for `store_id`.
    #[must_use]
    pub fn new(
        store_dir: &Path,
        store_id: impl Into<String>,
        total_size: u64,
        chunk_size: u64,
        max_concurrent_chunks: usize,
        sources: Vec<Source>,
    ) -> Self {
        let store_id = store_id.into();
        let (temp_path, meta_path) = download_paths(store_dir, &store_id);
        let now = now_unix();
        Self {
            store_id,
            total_size,
            downloaded_bytes: 0,
            chunk_size,
            max_concurrent_chunks,
            status: SessionStatus::Initializing,
            completed_chunks: HashSet::new(),
            active_chunks: HashSet::new(),
            failed_chunks: HashSet::new(),
            sources,
            temp_path,
            meta_path,
            started_at: now,
            last_activity: now,
        }
    }

    /// Total number of fixed-size chunks, per §4.7: `⌈totalSize /
    /// chunkSize⌉`, with the boundary case `totalSize == 0` producing zero
    /// chunks (property 10).
    #[must_use]
    pub fn total_chunks(&self) -> usize {
        if self.total_size == 0 {
            return 0;
        }
        self.total_size.div_ceil(self.chunk_size) as usize
    }

    /// Inclusive byte range `[start, end]` covered by `chunk[i]`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= total_chunks()`.
    #[must_use]
    pub fn chunk_range(&self, i: usize) -> (u64, u64) {
        assert!(i < self.total_chunks(), "chunk index out of range");
        let start = i as u64 * self.chunk_size;
        let end = ((i as u64 + 1) * self.chunk_size).min(self.total_size) - 1;
        (start, end)
    }

    /// True once every chunk ordinal is in `completed_chunks`.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed_chunks.len() == self.total_chunks()
    }

    /// Chunk ordinals not yet completed and not currently active.
    #[must_use]
    pub fn schedulable_chunks(&self) -> Vec<usize> {
        (0..self.total_chunks())
            .filter(|i| !self.completed_chunks.contains(i) && !self.active_chunks.contains(i))
            .collect()
    }

    /// Choose the source for chunk `i` on attempt number `attempt`,
    /// rotating past exhausted sources (§4.7).
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::RelayUnavailable`] if every source is exhausted
    /// (reusing this tag loosely to mean "no usable source remains" — the
    /// caller maps it to a session failure per §7).
    pub fn pick_source(&self, i: usize, attempt: u32, failure_threshold: u32) -> Result<usize> {
        if self.sources.is_empty() {
            return Err(NodeError::relay_unavailable("no sources configured"));
        }
        let len = self.sources.len();
        for offset in 0..len {
            let idx = (i + attempt as usize + offset) % len;
            if !self.sources[idx].is_exhausted(failure_threshold) {
                return Ok(idx);
            }
        }
        Err(NodeError::relay_unavailable("all sources exhausted"))
    }

    /// Begin a chunk fetch: move `i` into `active_chunks`.
    pub fn begin_chunk(&mut self, i: usize) {
        self.active_chunks.insert(i);
    }

    /// Record a successful chunk fetch of `len` bytes from source `idx`.
    pub fn complete_chunk(&mut self, i: usize, len: u64, source_idx: usize) {
        self.active_chunks.remove(&i);
        self.failed_chunks.remove(&i);
        self.completed_chunks.insert(i);
        self.downloaded_bytes += len;
        if let Some(source) = self.sources.get_mut(source_idx) {
            source.record_success();
        }
        self.last_activity = now_unix();
    }

    /// Record a failed chunk fetch from source `idx`.
    pub fn fail_chunk(&mut self, i: usize, source_idx: usize) {
        self.active_chunks.remove(&i);
        self.failed_chunks.insert(i);
        if let Some(source) = self.sources.get_mut(source_idx) {
            source.record_failure();
        }
        self.last_activity = now_unix();
    }

    /// Drain `failed_chunks` back into the schedulable set for another
    /// pass, per §4.7's retry-with-rotation step.
    pub fn drain_failed_for_retry(&mut self) -> Vec<usize> {
        self.failed_chunks.drain().collect()
    }

    /// True if every configured source has accumulated `threshold` or more
    /// consecutive failures — the session has nowhere left to make
    /// progress.
    #[must_use]
    pub fn all_sources_exhausted(&self, threshold: u32) -> bool {
        !self.sources.is_empty() && self.sources.iter().all(|s| s.is_exhausted(threshold))
    }

    fn to_metadata(&self) -> SessionMetadata {
        let mut completed: Vec<usize> = self.completed_chunks.iter().copied().collect();
        completed.sort_unstable();
        let mut failed: Vec<usize> = self.failed_chunks.iter().copied().collect();
        failed.sort_unstable();
        SessionMetadata {
            store_id: self.store_id.clone(),
            total_size: self.total_size,
            downloaded_bytes: self.downloaded_bytes,
            completed_chunks: completed,
            failed_chunks: failed,
            sources: self.sources.clone(),
            last_activity: self.last_activity,
            chunk_size: self.chunk_size,
            format_version: 1,
        }
    }

    /// Persist metadata atomically via write-to-temp-then-rename.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Io`] if the filesystem write or rename fails,
    /// or [`NodeError::DecodeFailed`] if serialization somehow fails.
    pub async fn persist(&self) -> Result<()> {
        if let Some(parent) = self.meta_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let metadata = self.to_metadata();
        let json = serde_json::to_vec_pretty(&metadata)?;
        let tmp_path = self.meta_path.with_extension("meta.tmp");
        fs::write(&tmp_path, json).await?;
        fs::rename(&tmp_path, &self.meta_path).await?;
        Ok(())
    }

    /// Remove this session's temp buffer and metadata sidecar, e.g. after
    /// finalize or cancel.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Io`] if removal fails for a reason other than
    /// the file already being absent.
    pub async fn remove_artifacts(&self) -> Result<()> {
        for path in [&self.temp_path, &self.meta_path] {
            match fs::remove_file(path).await {
                Ok(()) | Err(_) if !path.exists() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Reconstruct a [`Session`] from a persisted metadata sidecar, status
    /// forced to `paused` per §4.7's resume-on-startup behavior.
    #[must_use]
    pub fn from_metadata(store_dir: &Path, metadata: SessionMetadata) -> Self {
        let (temp_path, meta_path) = download_paths(store_dir, &metadata.store_id);
        let max_concurrent_chunks = 4;
        Self {
            store_id: metadata.store_id,
            total_size: metadata.total_size,
            downloaded_bytes: metadata.downloaded_bytes,
            chunk_size: metadata.chunk_size,
            max_concurrent_chunks,
            status: SessionStatus::Paused,
            completed_chunks: metadata.completed_chunks.into_iter().collect(),
            active_chunks: HashSet::new(),
            failed_chunks: metadata.failed_chunks.into_iter().collect(),
            sources: metadata.sources,
            temp_path,
            meta_path,
            started_at: metadata.last_activity,
            last_activity: metadata.last_activity,
        }
    }
}

/// Scan `<store_dir>/.downloads/*.meta` and rehydrate every resumable
/// session, per §4.7's startup resume step.
///
/// # Errors
///
/// Returns [`NodeError::Io`] if the downloads directory cannot be read.
pub async fn scan_resumable(store_dir: &Path) -> Result<Vec<Session>> {
    let downloads_dir = store_dir.join(DOWNLOADS_SUBDIR);
    if !downloads_dir.exists() {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    let mut entries = fs::read_dir(&downloads_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("meta") {
            continue;
        }
        let Ok(raw) = fs::read(&path).await else {
            continue;
        };
        let Ok(metadata) = serde_json::from_slice::<SessionMetadata>(&raw) else {
            continue;
        };
        out.push(Session::from_metadata(store_dir, metadata));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sources() -> Vec<Source> {
        vec![Source::direct("peer-a", 0), Source::direct("peer-b", 1)]
    }

    #[test]
    fn total_chunks_zero_size_is_zero_chunks() {
        let dir = TempDir::new().unwrap();
        let session = Session::new(dir.path(), "s1", 0, 256 * 1024, 4, sources());
        assert_eq!(session.total_chunks(), 0);
        assert!(session.is_complete());
    }

    #[test]
    fn total_chunks_undersized_is_one_chunk() {
        let dir = TempDir::new().unwrap();
        let session = Session::new(dir.path(), "s1", 100, 256 * 1024, 4, sources());
        assert_eq!(session.total_chunks(), 1);
        assert_eq!(session.chunk_range(0), (0, 99));
    }

    #[test]
    fn total_chunks_exact_multiple() {
        let dir = TempDir::new().unwrap();
        let session = Session::new(dir.path(), "s1", 2 * 1024 * 1024, 256 * 1024, 4, sources());
        assert_eq!(session.total_chunks(), 8);
        assert_eq!(session.chunk_range(7), (7 * 256 * 1024, 2 * 1024 * 1024 - 1));
    }

    #[test]
    fn chunk_sets_stay_disjoint_through_lifecycle() {
        let dir = TempDir::new().unwrap();
        let mut session = Session::new(dir.path(), "s1", 1024 * 1024, 256 * 1024, 4, sources());
        session.begin_chunk(0);
        session.complete_chunk(0, 256 * 1024, 0);
        session.begin_chunk(1);
        session.fail_chunk(1, 0);

        assert!(session.completed_chunks.contains(&0));
        assert!(session.failed_chunks.contains(&1));
        assert!(session.active_chunks.is_empty());
        assert!(session
            .completed_chunks
            .intersection(&session.failed_chunks)
            .next()
            .is_none());
    }

    #[test]
    fn source_exhaustion_after_threshold() {
        let mut source = Source::direct("peer-a", 0);
        for _ in 0..3 {
            source.record_failure();
        }
        assert!(source.is_exhausted(3));
    }

    #[test]
    fn pick_source_rotates_past_exhausted() {
        let dir = TempDir::new().unwrap();
        let mut session = Session::new(dir.path(), "s1", 1024, 256, 4, sources());
        session.sources[0].failures = 3;
        let idx = session.pick_source(0, 0, 3).unwrap();
        assert_eq!(idx, 1);
    }

    #[test]
    fn pick_source_errors_when_all_exhausted() {
        let dir = TempDir::new().unwrap();
        let mut session = Session::new(dir.path(), "s1", 1024, 256, 4, sources());
        for s in &mut session.sources {
            s.failures = 3;
        }
        assert!(session.pick_source(0, 0, 3).is_err());
    }

    #[tokio::test]
    async fn persist_then_scan_resumable_roundtrips() {
        let dir = TempDir::new().unwrap();
        crate::node::store::ensure_store_dir(dir.path()).await.unwrap();
        let mut session = Session::new(dir.path(), "abc", 1024 * 1024, 256 * 1024, 4, sources());
        session.begin_chunk(0);
        session.complete_chunk(0, 256 * 1024, 0);
        session.persist().await.unwrap();

        let resumed = scan_resumable(dir.path()).await.unwrap();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].store_id, "abc");
        assert!(resumed[0].completed_chunks.contains(&0));
        assert_eq!(resumed[0].status, SessionStatus::Paused);
    }

    #[tokio::test]
    async fn remove_artifacts_is_idempotent() {
        let dir = TempDir::new().unwrap();
        crate::node::store::ensure_store_dir(dir.path()).await.unwrap();
        let session = Session::new(dir.path(), "abc", 10, 256, 4, sources());
        session.remove_artifacts().await.unwrap();
        session.remove_artifacts().await.unwrap();
    }
}
