//! # dig-core
//!
//! Core orchestration for a dig node: the peer registry and security
//! classifier, the capability tracker, discovery, the chunked resumable
//! downloader, the relay coordinator, the download orchestrator's strategy
//! ladder, the periodic sync loop, and the `dig/1` wire protocol and
//! dispatch point.
//!
//! The underlying p2p fabric (DHT storage, gossip transport, direct
//! dialing, NAT traversal) is represented only by the capability traits in
//! [`node::fabric`]; a concrete fabric is supplied by the embedding
//! application.
//!
//! ## Quick Start
//!
//! ```no_run
//! use dig_core::{Fabric, Node, NodeConfig};
//! use std::sync::Arc;
//!
//! # async fn example(fabric: Arc<dyn Fabric>) -> dig_core::node::Result<()> {
//! let config = NodeConfig {
//!     store_dir: "/var/lib/dig/stores".into(),
//!     ..Default::default()
//! };
//! let node = Arc::new(Node::new(config)?);
//! node.start(fabric).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Structure
//!
//! - [`node`]: the node runtime, every subsystem it wires together, and the
//!   `dig/1` wire protocol.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod node;

pub use node::{Fabric, Node, NodeConfig, NodeError};
