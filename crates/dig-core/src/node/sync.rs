//! Sync Loop (§4.9): periodically reconciles locally-held stores against
//! what verified-overlay peers advertise, handing anything missing to the
//! orchestrator.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::node::fabric::Fabric;
use crate::node::orchestrator::Orchestrator;
use crate::node::registry::Registry;
use crate::node::store;

/// Outcome of downloading one store during a sweep.
#[derive(Debug, Clone)]
pub struct SweepResult {
    /// Store id attempted.
    pub store_id: String,
    /// Whether it was successfully downloaded.
    pub success: bool,
    /// Number of attempts spent before giving up or succeeding.
    pub attempts: usize,
    /// Last error message, if every attempt failed.
    pub error: Option<String>,
}

/// Summary logged after each sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepSummary {
    /// Stores considered missing this sweep.
    pub missing_count: usize,
    /// Results for the stores actually attempted (capped at
    /// [`SyncLoop::max_per_sweep`](SyncLoop)).
    pub results: Vec<SweepResult>,
}

/// Drives the periodic reconciliation sweep.
pub struct SyncLoop {
    registry: Arc<Registry>,
    orchestrator: Arc<Orchestrator>,
    store_dir: PathBuf,
    max_per_sweep: usize,
    max_retries_per_sweep: usize,
}

impl SyncLoop {
    /// Build a sync loop over `registry` and `orchestrator`, reading the
    /// local store set from `store_dir`. `max_per_sweep` bounds how many
    /// missing stores are pulled per sweep; `max_retries_per_sweep` bounds
    /// retries for each of those within the same sweep (§4.1/§4.9).
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        orchestrator: Arc<Orchestrator>,
        store_dir: PathBuf,
        max_per_sweep: usize,
        max_retries_per_sweep: usize,
    ) -> Self {
        Self {
            registry,
            orchestrator,
            store_dir,
            max_per_sweep,
            max_retries_per_sweep,
        }
    }

    /// Run one sweep: compute missing stores, download up to
    /// `max_per_sweep` of them, retrying each up to `max_retries_per_sweep`
    /// times within this sweep.
    ///
    /// # Errors
    ///
    /// Returns an error only if the local store directory cannot be read;
    /// individual download failures are captured in the returned summary,
    /// never propagated.
    pub async fn run_sweep(&self, fabric: Arc<dyn Fabric>) -> crate::node::error::Result<SweepSummary> {
        let local: HashSet<String> = store::scan(&self.store_dir)
            .await?
            .into_iter()
            .map(|s| s.store_id)
            .collect();

        let mut advertised: HashSet<String> = HashSet::new();
        for peer in self.registry.verified_overlay_peers() {
            advertised.extend(peer.advertised_stores);
        }

        let mut missing: Vec<String> = advertised.difference(&local).cloned().collect();
        missing.sort();
        let missing_count = missing.len();
        missing.truncate(self.max_per_sweep);

        let mut results = Vec::with_capacity(missing.len());
        for store_id in missing {
            let mut attempts = 0;
            let mut last_error = None;
            let mut success = false;
            while attempts < self.max_retries_per_sweep {
                attempts += 1;
                let outcome = self.orchestrator.download_store(fabric.clone(), &store_id).await;
                if outcome.success {
                    success = true;
                    break;
                }
                last_error = outcome.error.map(|e| e.to_string());
                tracing::warn!(
                    store_id = %store_id,
                    attempt = attempts,
                    error = ?last_error,
                    "sync sweep failed to pull store"
                );
            }
            results.push(SweepResult {
                store_id,
                success,
                attempts,
                error: last_error,
            });
        }

        let summary = SweepSummary {
            missing_count,
            results,
        };
        tracing::info!(
            missing = summary.missing_count,
            attempted = summary.results.len(),
            succeeded = summary.results.iter().filter(|r| r.success).count(),
            "sync sweep complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::capability::CapabilityTracker;
    use crate::node::discovery::Discovery;
    use crate::node::downloader::Downloader;
    use crate::node::fabric::test_double::TestFabric;
    use crate::node::registry::{ClassifierConfig, Registry};
    use crate::node::relay::RelayCoordinator;
    use std::collections::HashSet as StdHashSet;
    use tempfile::TempDir;

    /// Classifies `peer_id` as `verified-overlay`, advertising `store_ids`,
    /// by scripting a fabric response that satisfies both the
    /// identification and membership-verification round trips.
    async fn verified_overlay_peer(registry: &Registry, fabric: &TestFabric, peer_id: &str, store_ids: &[&str]) {
        fabric.connect(peer_id);
        let stores = serde_json::to_string(store_ids).unwrap();
        let response = format!(
            "{{\"networkId\":\"mainnet\",\"isOverlayNode\":true,\"protocolVersion\":1,\
             \"timestamp\":0,\"overlayAddress\":\"fd00:0000:0000:0000:0000:0000:0000:0001\",\
             \"capabilities\":[],\"stores\":{stores}}}"
        );
        fabric.respond_with(peer_id, response.into_bytes());
        registry.classify(fabric, peer_id.to_string()).await;
    }

    fn orchestrator(store_dir: &std::path::Path, registry: Arc<Registry>) -> Arc<Orchestrator> {
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
        Arc::new(Orchestrator::new(
            registry,
            capability,
            discovery,
            relay,
            downloader,
            store_dir.to_path_buf(),
            64 * 1024,
            4,
            Duration::from_secs(1),
        ))
    }

    #[tokio::test]
    async fn sweep_reports_zero_missing_with_no_peers() {
        let dir = TempDir::new().unwrap();
        store::ensure_store_dir(dir.path()).await.unwrap();
        let registry = Arc::new(Registry::new(ClassifierConfig {
            identification_timeout: Duration::from_secs(1),
            network_id: "mainnet".to_string(),
            public_infrastructure: StdHashSet::new(),
        }));
        let orchestrator = orchestrator(dir.path(), registry.clone());
        let sync = SyncLoop::new(registry, orchestrator, dir.path().to_path_buf(), 5, 2);

        let fabric = TestFabric::new("local");
        let summary = sync.run_sweep(Arc::new(fabric)).await.unwrap();
        assert_eq!(summary.missing_count, 0);
        assert!(summary.results.is_empty());
    }

    #[tokio::test]
    async fn sweep_retries_up_to_the_per_sweep_cap() {
        let dir = TempDir::new().unwrap();
        store::ensure_store_dir(dir.path()).await.unwrap();
        let registry = Arc::new(Registry::new(ClassifierConfig {
            identification_timeout: Duration::from_secs(1),
            network_id: "mainnet".to_string(),
            public_infrastructure: StdHashSet::new(),
        }));
        let fabric = TestFabric::new("local");
        verified_overlay_peer(&registry, &fabric, "peer-a", &["store-x"]).await;
        // Drop the script so the download itself fails: the peer still
        // advertises the store but no longer answers `GET_FILE_RANGE`.
        let fabric = TestFabric::new("local");
        fabric.connect("peer-a");

        let orchestrator = orchestrator(dir.path(), registry.clone());
        let sync = SyncLoop::new(registry, orchestrator, dir.path().to_path_buf(), 5, 2);

        let summary = sync.run_sweep(Arc::new(fabric)).await.unwrap();
        assert_eq!(summary.missing_count, 1);
        assert_eq!(summary.results.len(), 1);
        assert!(!summary.results[0].success);
        assert_eq!(summary.results[0].attempts, 2);
    }
}
