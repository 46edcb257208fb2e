//! On-disk configuration for the `dig` CLI, translated into a
//! [`dig_core::NodeConfig`] once loaded (§6).

use dig_core::node::{IntervalConfig, TimeoutConfig, TransferConfig};
use dig_core::NodeConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level on-disk configuration, mirroring [`NodeConfig`]'s sub-config
/// split so each section can be edited independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node identity and storage.
    #[serde(default)]
    pub node: NodeSection,
    /// Transfer tuning.
    #[serde(default)]
    pub transfer: TransferSection,
    /// Protocol timeouts.
    #[serde(default)]
    pub timeouts: TimeoutSection,
    /// Background-loop cadence.
    #[serde(default)]
    pub intervals: IntervalSection,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeSection::default(),
            transfer: TransferSection::default(),
            timeouts: TimeoutSection::default(),
            intervals: IntervalSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

/// Node identity, storage, and discovery endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Root directory store files live under.
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    /// Base transport port.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Overlay network id; peers on another network id are ignored.
    #[serde(default = "default_network_id")]
    pub network_id: String,
    /// Hex-encoded Ed25519 public key. Derived from `private_key` if absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Hex-encoded Ed25519 private key (32-byte seed). `dig keygen` writes one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    /// Additional bootstrap rendezvous addresses (`host:port`).
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    /// External directory endpoints, last-resort fallback only (§6).
    #[serde(default)]
    pub discovery_servers: Vec<String>,
    /// Whether to announce/discover over local multicast too.
    #[serde(default = "default_true")]
    pub enable_local_discovery: bool,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
            listen_port: default_listen_port(),
            network_id: default_network_id(),
            public_key: None,
            private_key: None,
            bootstrap_peers: Vec::new(),
            discovery_servers: Vec::new(),
            enable_local_discovery: true,
        }
    }
}

/// Chunking and concurrency tuning (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSection {
    /// Fixed chunk size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Maximum concurrent chunk fetches per download session.
    #[serde(default = "default_max_concurrent_chunks")]
    pub max_concurrent_chunks: usize,
    /// Consecutive per-source failures before exclusion from scheduling.
    #[serde(default = "default_source_failure_threshold")]
    pub source_failure_threshold: u32,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_concurrent_chunks: default_max_concurrent_chunks(),
            source_failure_threshold: default_source_failure_threshold(),
        }
    }
}

/// Protocol-level timeouts, in whole seconds on disk (§5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSection {
    /// Connection dial timeout, seconds.
    #[serde(default = "default_dial_secs")]
    pub dial_secs: u64,
    /// Per-chunk read timeout, seconds.
    #[serde(default = "default_chunk_read_secs")]
    pub chunk_read_secs: u64,
    /// `DIG_NETWORK_IDENTIFICATION` response deadline, seconds.
    #[serde(default = "default_identification_secs")]
    pub identification_secs: u64,
    /// Relay session setup window, seconds.
    #[serde(default = "default_relay_setup_secs")]
    pub relay_setup_secs: u64,
    /// External directory heartbeat timeout, seconds.
    #[serde(default = "default_directory_heartbeat_secs")]
    pub directory_heartbeat_secs: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            dial_secs: default_dial_secs(),
            chunk_read_secs: default_chunk_read_secs(),
            identification_secs: default_identification_secs(),
            relay_setup_secs: default_relay_setup_secs(),
            directory_heartbeat_secs: default_directory_heartbeat_secs(),
        }
    }
}

/// Background-loop cadence, in whole seconds on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalSection {
    /// Delay before the first sync sweep, seconds.
    #[serde(default = "default_sync_initial_delay_secs")]
    pub sync_initial_delay_secs: u64,
    /// Steady-state interval between sync sweeps, seconds.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// Maximum missing stores handed to the orchestrator per sweep.
    #[serde(default = "default_sync_max_per_sweep")]
    pub sync_max_per_sweep: usize,
    /// Maximum retries for one store within a single sweep.
    #[serde(default = "default_sync_max_retries_per_sweep")]
    pub sync_max_retries_per_sweep: u32,
    /// Retest interval for this node's own capability profile, seconds.
    #[serde(default = "default_capability_self_retest_secs")]
    pub capability_self_retest_secs: u64,
    /// Retest interval for remote peers' capability profiles, seconds.
    #[serde(default = "default_capability_peer_retest_secs")]
    pub capability_peer_retest_secs: u64,
    /// Health recheck interval for known relays, seconds.
    #[serde(default = "default_relay_health_check_secs")]
    pub relay_health_check_secs: u64,
}

impl Default for IntervalSection {
    fn default() -> Self {
        Self {
            sync_initial_delay_secs: default_sync_initial_delay_secs(),
            sync_interval_secs: default_sync_interval_secs(),
            sync_max_per_sweep: default_sync_max_per_sweep(),
            sync_max_retries_per_sweep: default_sync_max_retries_per_sweep(),
            capability_self_retest_secs: default_capability_self_retest_secs(),
            capability_peer_retest_secs: default_capability_peer_retest_secs(),
            relay_health_check_secs: default_relay_health_check_secs(),
        }
    }
}

/// Logging configuration, translated into a `tracing-subscriber` env filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Default log level, overridden by `-v/--verbose` or `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_store_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dig")
        .join("stores")
}
fn default_listen_port() -> u16 {
    4001
}
fn default_network_id() -> String {
    "mainnet".to_string()
}
fn default_true() -> bool {
    true
}
fn default_chunk_size() -> u64 {
    256 * 1024
}
fn default_max_concurrent_chunks() -> usize {
    4
}
fn default_source_failure_threshold() -> u32 {
    3
}
fn default_dial_secs() -> u64 {
    60
}
fn default_chunk_read_secs() -> u64 {
    30
}
fn default_identification_secs() -> u64 {
    3
}
fn default_relay_setup_secs() -> u64 {
    15
}
fn default_directory_heartbeat_secs() -> u64 {
    10
}
fn default_sync_initial_delay_secs() -> u64 {
    5
}
fn default_sync_interval_secs() -> u64 {
    30
}
fn default_sync_max_per_sweep() -> usize {
    5
}
fn default_sync_max_retries_per_sweep() -> u32 {
    2
}
fn default_capability_self_retest_secs() -> u64 {
    5 * 60
}
fn default_capability_peer_retest_secs() -> u64 {
    10 * 60
}
fn default_relay_health_check_secs() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed as TOML.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Write configuration to `path`, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// The default config file location, `$XDG_CONFIG_HOME/dig/config.toml`
    /// (or platform equivalent).
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("dig/config.toml")
    }

    /// Load from the default path, writing a fresh default config there if
    /// none exists yet.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Translate into the runtime's typed [`NodeConfig`].
    #[must_use]
    pub fn to_node_config(&self) -> NodeConfig {
        NodeConfig {
            store_dir: self.node.store_dir.clone(),
            listen_port: self.node.listen_port,
            bootstrap_peers: self.node.bootstrap_peers.clone(),
            discovery_servers: self.node.discovery_servers.clone(),
            public_key: self.node.public_key.clone(),
            private_key: self.node.private_key.clone(),
            network_id: self.node.network_id.clone(),
            enable_local_discovery: self.node.enable_local_discovery,
            transfer: TransferConfig {
                chunk_size: self.transfer.chunk_size,
                max_concurrent_chunks: self.transfer.max_concurrent_chunks,
                source_failure_threshold: self.transfer.source_failure_threshold,
            },
            timeouts: TimeoutConfig {
                dial: Duration::from_secs(self.timeouts.dial_secs),
                chunk_read: Duration::from_secs(self.timeouts.chunk_read_secs),
                identification: Duration::from_secs(self.timeouts.identification_secs),
                relay_setup: Duration::from_secs(self.timeouts.relay_setup_secs),
                directory_heartbeat: Duration::from_secs(self.timeouts.directory_heartbeat_secs),
            },
            intervals: IntervalConfig {
                sync_initial_delay: Duration::from_secs(self.intervals.sync_initial_delay_secs),
                sync_interval: Duration::from_secs(self.intervals.sync_interval_secs),
                sync_max_per_sweep: self.intervals.sync_max_per_sweep,
                sync_max_retries_per_sweep: self.intervals.sync_max_retries_per_sweep,
                capability_self_retest: Duration::from_secs(self.intervals.capability_self_retest_secs),
                capability_peer_retest: Duration::from_secs(self.intervals.capability_peer_retest_secs),
                relay_health_check: Duration::from_secs(self.intervals.relay_health_check_secs),
            },
        }
    }
}
