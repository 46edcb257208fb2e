//! # dig-discovery
//!
//! The discovery, relay-ranking, and external-directory pieces of a dig
//! node that are concrete rather than delegated to the underlying p2p
//! fabric (§4.4, §4.5, §6). The fabric itself (DHT storage, gossip
//! transport, NAT traversal primitives) is out of scope and represented
//! only by the capability traits in `dig-core::node::fabric`; this crate
//! supplies the message schemas those traits carry, the bootstrap-list
//! handling, the relay ranking algorithm, and the HTTPS client for the
//! optional external directory fallback.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod announcement;
pub mod bootstrap;
pub mod directory;
pub mod relay;

pub use announcement::{CapabilityAnnouncement, PeerAnnouncement, RelayAnnouncement, StoreRecord};
pub use bootstrap::parse_bootstrap_peers;
pub use directory::{DirectoryClient, DirectoryError, DirectoryPeer, RegisterRequest, RelayStoreRequest};
pub use relay::{RelayCandidate, RelayRegistry};
