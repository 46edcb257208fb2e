//! Node configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for a node, assembled from a config file by the
/// CLI layer (`dig-cli`) and validated before a node starts.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Root directory for store files. Downloads in progress live under
    /// `<store_dir>/.downloads/`.
    pub store_dir: PathBuf,

    /// Base transport port the p2p fabric listens on.
    pub listen_port: u16,

    /// Additional bootstrap rendezvous addresses, beyond any built-in
    /// defaults the fabric carries.
    pub bootstrap_peers: Vec<String>,

    /// Optional external directory endpoints, consulted only as a
    /// last-resort fallback (§6).
    pub discovery_servers: Vec<String>,

    /// Hex-encoded Ed25519 public key. Populated from `private_key` when
    /// absent.
    pub public_key: Option<String>,

    /// Hex-encoded Ed25519 private key (32-byte seed). Required to run a
    /// node; `dig-cli keygen` produces one.
    pub private_key: Option<String>,

    /// Overlay network identifier; peers with a different id are ignored.
    pub network_id: String,

    /// Whether to announce/discover over local multicast in addition to
    /// DHT and gossip.
    pub enable_local_discovery: bool,

    /// Chunking and transfer tuning.
    pub transfer: TransferConfig,

    /// Protocol timeouts (§5).
    pub timeouts: TimeoutConfig,

    /// Sync loop and capability-tracker cadence.
    pub intervals: IntervalConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
            listen_port: 4001,
            bootstrap_peers: Vec::new(),
            discovery_servers: Vec::new(),
            public_key: None,
            private_key: None,
            network_id: "mainnet".to_string(),
            enable_local_discovery: true,
            transfer: TransferConfig::default(),
            timeouts: TimeoutConfig::default(),
            intervals: IntervalConfig::default(),
        }
    }
}

fn default_store_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dig")
        .join("stores")
}

/// Chunking and concurrency tuning for the downloader (§4.7).
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Fixed chunk size in bytes.
    pub chunk_size: u64,

    /// Maximum number of chunk fetches active at once within one session.
    pub max_concurrent_chunks: usize,

    /// Number of consecutive failures on one source before it is excluded
    /// from further scheduling for the session.
    pub source_failure_threshold: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 256 * 1024,
            max_concurrent_chunks: 4,
            source_failure_threshold: 3,
        }
    }
}

/// Protocol-level timeouts (§5).
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Connection dial timeout.
    pub dial: Duration,

    /// Per-chunk read timeout.
    pub chunk_read: Duration,

    /// `DIG_NETWORK_IDENTIFICATION` response deadline.
    pub identification: Duration,

    /// Relay session setup window.
    pub relay_setup: Duration,

    /// External directory heartbeat timeout.
    pub directory_heartbeat: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            dial: Duration::from_secs(60),
            chunk_read: Duration::from_secs(30),
            identification: Duration::from_secs(3),
            relay_setup: Duration::from_secs(15),
            directory_heartbeat: Duration::from_secs(10),
        }
    }
}

/// Background-loop cadence: sync sweeps, capability retests, relay health
/// checks.
#[derive(Debug, Clone)]
pub struct IntervalConfig {
    /// Delay before the first sync loop sweep after startup.
    pub sync_initial_delay: Duration,

    /// Steady-state interval between sync loop sweeps.
    pub sync_interval: Duration,

    /// Maximum missing stores handed to the orchestrator per sweep.
    pub sync_max_per_sweep: usize,

    /// Maximum retries for one store within a single sweep.
    pub sync_max_retries_per_sweep: u32,

    /// Retest interval for this node's own capability profile.
    pub capability_self_retest: Duration,

    /// Retest interval for remote peers' capability profiles.
    pub capability_peer_retest: Duration,

    /// Health recheck interval for known relays.
    pub relay_health_check: Duration,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            sync_initial_delay: Duration::from_secs(5),
            sync_interval: Duration::from_secs(30),
            sync_max_per_sweep: 5,
            sync_max_retries_per_sweep: 2,
            capability_self_retest: Duration::from_secs(5 * 60),
            capability_peer_retest: Duration::from_secs(10 * 60),
            relay_health_check: Duration::from_secs(60),
        }
    }
}

impl NodeConfig {
    /// Validate cross-field invariants that a TOML deserializer alone
    /// cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`crate::node::NodeError::ConfigInvalid`] if `store_dir` is
    /// empty, `network_id` is empty, or `private_key` (when present) is not
    /// valid hex of the expected length.
    pub fn validate(&self) -> crate::node::error::Result<()> {
        use crate::node::error::NodeError;

        if self.store_dir.as_os_str().is_empty() {
            return Err(NodeError::config_invalid("storeDir must not be empty"));
        }
        if self.network_id.trim().is_empty() {
            return Err(NodeError::config_invalid("networkId must not be empty"));
        }
        if let Some(ref key) = self.private_key {
            let bytes = hex::decode(key)
                .map_err(|_| NodeError::config_invalid("privateKey is not valid hex"))?;
            if bytes.len() != dig_identity::ED25519_SECRET_KEY_SIZE {
                return Err(NodeError::config_invalid(
                    "privateKey must be 32 bytes (64 hex characters)",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = NodeConfig::default();
        assert_eq!(config.listen_port, 4001);
        assert_eq!(config.network_id, "mainnet");
        assert!(config.enable_local_discovery);
        assert_eq!(config.transfer.chunk_size, 256 * 1024);
        assert_eq!(config.transfer.max_concurrent_chunks, 4);
        assert_eq!(config.intervals.sync_interval, Duration::from_secs(30));
    }

    #[test]
    fn validate_rejects_empty_network_id() {
        let mut config = NodeConfig::default();
        config.network_id = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_private_key() {
        let mut config = NodeConfig::default();
        config.private_key = Some("not-hex".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_well_formed_key() {
        let mut config = NodeConfig::default();
        config.private_key = Some(hex::encode([1u8; 32]));
        assert!(config.validate().is_ok());
    }
}
