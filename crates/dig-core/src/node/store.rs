//! Local store directory: scanning, naming, and metadata (§3, §4.1).
//!
//! A store is an immutable byte artifact named `<storeId>.<ext>` directly
//! under the configured store directory. This module only reads the
//! directory; writing a finalized file is the downloader's job
//! ([`crate::node::downloader`]).

use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;

use crate::node::error::{NodeError, Result};

/// Subdirectory holding in-progress downloads (`.temp`/`.meta` pairs).
pub const DOWNLOADS_SUBDIR: &str = ".downloads";

/// Metadata about a locally-held store, computed from its file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMetadata {
    /// Hex store id.
    pub store_id: String,
    /// Size in bytes.
    pub size: u64,
    /// Best-effort MIME hint, derived from the file extension.
    pub mime: String,
    /// Path to the backing file.
    pub path: PathBuf,
}

/// Guess a MIME type from a file extension. Unknown extensions map to the
/// generic binary type; stores carry no authoritative content-type.
#[must_use]
pub fn guess_mime(ext: &str) -> String {
    match ext.to_ascii_lowercase().as_str() {
        "json" => "application/json",
        "txt" => "text/plain",
        "dat" | "bin" | "store" => "application/octet-stream",
        other if !other.is_empty() => return format!("application/x-{other}"),
        _ => "application/octet-stream",
    }
    .to_string()
}

/// Ensure the store directory and its `.downloads` subdirectory exist.
///
/// # Errors
///
/// Returns [`NodeError::Io`] if directory creation fails.
pub async fn ensure_store_dir(store_dir: &Path) -> Result<()> {
    fs::create_dir_all(store_dir).await?;
    fs::create_dir_all(store_dir.join(DOWNLOADS_SUBDIR)).await?;
    Ok(())
}

/// The path a finalized store file would occupy.
#[must_use]
pub fn final_path(store_dir: &Path, store_id: &str, ext: &str) -> PathBuf {
    if ext.is_empty() {
        store_dir.join(store_id)
    } else {
        store_dir.join(format!("{store_id}.{ext}"))
    }
}

/// The temp and metadata paths used while a store with `store_id` is being
/// downloaded.
#[must_use]
pub fn download_paths(store_dir: &Path, store_id: &str) -> (PathBuf, PathBuf) {
    let dir = store_dir.join(DOWNLOADS_SUBDIR);
    (
        dir.join(format!("{store_id}.temp")),
        dir.join(format!("{store_id}.meta")),
    )
}

/// Scan `store_dir` for store files, returning one [`StoreMetadata`] per
/// entry. Entries inside `.downloads/` are never treated as stores.
///
/// # Errors
///
/// Returns [`NodeError::Io`] if the directory cannot be read.
pub async fn scan(store_dir: &Path) -> Result<Vec<StoreMetadata>> {
    let mut out = Vec::new();
    let mut entries = fs::read_dir(store_dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let file_type = entry.file_type().await?;
        if !file_type.is_file() {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let meta = entry.metadata().await?;
        out.push(StoreMetadata {
            store_id: stem.to_string(),
            size: meta.len(),
            mime: guess_mime(ext),
            path,
        });
    }

    Ok(out)
}

/// Look up a single store's metadata by id, trying every extension found
/// under the store directory. Returns `None` if no matching file exists.
///
/// # Errors
///
/// Returns [`NodeError::Io`] if the directory cannot be read.
pub async fn find(store_dir: &Path, store_id: &str) -> Result<Option<StoreMetadata>> {
    let stores = scan(store_dir).await?;
    Ok(stores.into_iter().find(|s| s.store_id == store_id))
}

/// Open a store file for reading, erroring with `store-not-found` if
/// absent.
///
/// # Errors
///
/// Returns [`NodeError::StoreNotFound`] if no file matches, or
/// [`NodeError::Io`] on a filesystem error.
pub async fn open(store_dir: &Path, store_id: &str) -> Result<(StoreMetadata, fs::File)> {
    let meta = find(store_dir, store_id)
        .await?
        .ok_or_else(|| NodeError::StoreNotFound(store_id.to_string()))?;
    let file = fs::File::open(&meta.path).await?;
    Ok((meta, file))
}

/// Wall-clock seconds since the Unix epoch, used for timestamps in wire
/// messages and DHT records.
#[must_use]
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn scan_finds_store_files_and_skips_downloads_dir() {
        let dir = TempDir::new().unwrap();
        ensure_store_dir(dir.path()).await.unwrap();
        fs::write(dir.path().join("abc123.dat"), b"hello")
            .await
            .unwrap();
        fs::write(
            dir.path().join(DOWNLOADS_SUBDIR).join("def456.temp"),
            b"partial",
        )
        .await
        .unwrap();

        let stores = scan(dir.path()).await.unwrap();
        assert_eq!(stores.len(), 1);
        assert_eq!(stores[0].store_id, "abc123");
        assert_eq!(stores[0].size, 5);
    }

    #[tokio::test]
    async fn find_returns_none_for_missing_store() {
        let dir = TempDir::new().unwrap();
        ensure_store_dir(dir.path()).await.unwrap();
        let found = find(dir.path(), "nope").await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn open_errors_store_not_found() {
        let dir = TempDir::new().unwrap();
        ensure_store_dir(dir.path()).await.unwrap();
        let err = open(dir.path(), "nope").await.unwrap_err();
        assert!(matches!(err, NodeError::StoreNotFound(_)));
    }

    #[test]
    fn mime_guess_covers_known_extensions() {
        assert_eq!(guess_mime("json"), "application/json");
        assert_eq!(guess_mime(""), "application/octet-stream");
    }
}
