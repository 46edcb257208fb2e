//! Error types for node operations.
//!
//! Errors are categorized to support retry logic and proper error handling.
//!
//! # Error Categories
//!
//! - **Transient**: Temporary failures that may succeed on retry (timeouts, unreachable relay)
//! - **Permanent**: Failures that will not succeed without intervention (invalid config, not found)
//!
//! # Example
//!
//! ```no_run
//! use dig_core::node::{NodeError, Result};
//!
//! fn handle_error(err: NodeError) {
//!     if err.is_transient() {
//!         println!("Transient error, may retry: {}", err);
//!     } else {
//!         println!("Permanent error: {}", err);
//!     }
//! }
//! ```

use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in node operations.
#[derive(Debug, Error, Clone)]
pub enum NodeError {
    // ============ Configuration & Identity Errors ============
    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(Cow<'static, str>),

    /// Node identity (keypair) could not be loaded or constructed.
    #[error("Invalid identity: {0}")]
    IdentityInvalid(Cow<'static, str>),

    // ============ Store Errors ============
    /// Requested store does not exist locally.
    #[error("Store not found: {0}")]
    StoreNotFound(String),

    /// Requested byte range falls outside the store's declared size.
    #[error("Invalid range: {start}-{end} exceeds total size {total_size}")]
    InvalidRange {
        /// Requested inclusive start offset.
        start: u64,
        /// Requested inclusive end offset.
        end: u64,
        /// Store's actual total size.
        total_size: u64,
    },

    // ============ Peer Errors ============
    /// No open connection to the named peer.
    #[error("Peer not connected: {0}")]
    PeerNotConnected(String),

    /// Peer was classified as a non-member and its request was refused.
    #[error("Peer denied: {0}")]
    PeerDenied(Cow<'static, str>),

    /// The underlying fabric stream closed before the exchange completed.
    #[error("Stream closed unexpectedly: {0}")]
    StreamClosed(Cow<'static, str>),

    /// A wire message failed to decode as JSON or failed schema validation.
    #[error("Decode failed: {0}")]
    DecodeFailed(Cow<'static, str>),

    /// Downloaded bytes did not match the size the source declared.
    #[error("Size mismatch: expected {expected}, got {actual}")]
    SizeMismatch {
        /// Size declared by the source.
        expected: u64,
        /// Size actually received.
        actual: u64,
    },

    // ============ Relay Errors ============
    /// A relay session id was referenced but is unknown to the relay.
    #[error("Unknown relay session: {0}")]
    SessionUnknown(String),

    /// No relay-capable peer was available to coordinate a transfer.
    #[error("No relay available: {0}")]
    RelayUnavailable(Cow<'static, str>),

    // ============ Operational Errors ============
    /// Operation exceeded its deadline.
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// Operation was cancelled by the caller (e.g. node shutdown).
    #[error("Operation cancelled: {0}")]
    Cancelled(Cow<'static, str>),

    /// The external store directory could not be reached or returned an
    /// error; only relevant when directory fallback is configured.
    #[error("Directory unavailable: {0}")]
    DirectoryUnavailable(Cow<'static, str>),

    /// Local filesystem I/O failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// Generic error for edge cases that do not fit another variant.
    #[error("{0}")]
    Other(Cow<'static, str>),
}

impl NodeError {
    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// Transient errors include timeouts, closed streams, relay
    /// unavailability, and directory-fallback failures — all conditions a
    /// later attempt, possibly against a different peer, may clear.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NodeError::Timeout(_)
                | NodeError::StreamClosed(_)
                | NodeError::RelayUnavailable(_)
                | NodeError::DirectoryUnavailable(_)
                | NodeError::PeerNotConnected(_)
        )
    }

    /// Returns true if this error is permanent and will not succeed on retry.
    ///
    /// Permanent errors include invalid configuration/identity, not-found
    /// stores or sessions, malformed ranges, size mismatches (corruption),
    /// and policy denials.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            NodeError::ConfigInvalid(_)
                | NodeError::IdentityInvalid(_)
                | NodeError::StoreNotFound(_)
                | NodeError::InvalidRange { .. }
                | NodeError::PeerDenied(_)
                | NodeError::SizeMismatch { .. }
                | NodeError::SessionUnknown(_)
                | NodeError::Cancelled(_)
        )
    }

    /// Returns true if this error should trigger a retry with backoff.
    #[must_use]
    pub fn should_retry(&self) -> bool {
        self.is_transient() && !matches!(self, NodeError::Timeout(_))
    }

    /// Create a config-invalid error with static context (zero allocation).
    #[must_use]
    pub const fn config_invalid(context: &'static str) -> Self {
        NodeError::ConfigInvalid(Cow::Borrowed(context))
    }

    /// Create an identity-invalid error with static context (zero allocation).
    #[must_use]
    pub const fn identity_invalid(context: &'static str) -> Self {
        NodeError::IdentityInvalid(Cow::Borrowed(context))
    }

    /// Create a peer-denied error with static context (zero allocation).
    #[must_use]
    pub const fn peer_denied(context: &'static str) -> Self {
        NodeError::PeerDenied(Cow::Borrowed(context))
    }

    /// Create a stream-closed error with static context (zero allocation).
    #[must_use]
    pub const fn stream_closed(context: &'static str) -> Self {
        NodeError::StreamClosed(Cow::Borrowed(context))
    }

    /// Create a decode-failed error with static context (zero allocation).
    #[must_use]
    pub const fn decode_failed(context: &'static str) -> Self {
        NodeError::DecodeFailed(Cow::Borrowed(context))
    }

    /// Create a relay-unavailable error with static context (zero allocation).
    #[must_use]
    pub const fn relay_unavailable(context: &'static str) -> Self {
        NodeError::RelayUnavailable(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation).
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        NodeError::Timeout(Cow::Borrowed(context))
    }

    /// Create a cancelled error with static context (zero allocation).
    #[must_use]
    pub const fn cancelled(context: &'static str) -> Self {
        NodeError::Cancelled(Cow::Borrowed(context))
    }

    /// Create a directory-unavailable error with static context (zero allocation).
    #[must_use]
    pub const fn directory_unavailable(context: &'static str) -> Self {
        NodeError::DirectoryUnavailable(Cow::Borrowed(context))
    }
}

impl From<dig_identity::IdentityError> for NodeError {
    fn from(err: dig_identity::IdentityError) -> Self {
        NodeError::IdentityInvalid(Cow::Owned(err.to_string()))
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::DecodeFailed(Cow::Owned(err.to_string()))
    }
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(NodeError::Timeout(Cow::Borrowed("test")).is_transient());
        assert!(NodeError::StreamClosed(Cow::Borrowed("test")).is_transient());
        assert!(NodeError::RelayUnavailable(Cow::Borrowed("test")).is_transient());
        assert!(NodeError::DirectoryUnavailable(Cow::Borrowed("test")).is_transient());
        assert!(NodeError::PeerNotConnected("peer1".into()).is_transient());
    }

    #[test]
    fn test_permanent_errors() {
        assert!(NodeError::ConfigInvalid(Cow::Borrowed("test")).is_permanent());
        assert!(NodeError::StoreNotFound("abc".into()).is_permanent());
        assert!(NodeError::InvalidRange {
            start: 0,
            end: 10,
            total_size: 5
        }
        .is_permanent());
        assert!(NodeError::SizeMismatch {
            expected: 10,
            actual: 5
        }
        .is_permanent());
        assert!(NodeError::SessionUnknown("s1".into()).is_permanent());
    }

    #[test]
    fn test_should_retry() {
        assert!(NodeError::StreamClosed(Cow::Borrowed("test")).should_retry());
        assert!(NodeError::RelayUnavailable(Cow::Borrowed("test")).should_retry());
        assert!(!NodeError::Timeout(Cow::Borrowed("test")).should_retry());
        assert!(!NodeError::ConfigInvalid(Cow::Borrowed("test")).should_retry());
    }

    #[test]
    fn test_error_display() {
        let err = NodeError::InvalidRange {
            start: 0,
            end: 100,
            total_size: 50,
        };
        assert!(err.to_string().contains("50"));

        let err = NodeError::SizeMismatch {
            expected: 10,
            actual: 5,
        };
        assert!(err.to_string().contains("expected 10"));
    }

    #[test]
    fn test_convenience_constructors() {
        assert!(matches!(
            NodeError::config_invalid("missing storeDir"),
            NodeError::ConfigInvalid(_)
        ));
        assert!(matches!(
            NodeError::timeout("handshake"),
            NodeError::Timeout(_)
        ));
        assert!(matches!(
            NodeError::peer_denied("not a member"),
            NodeError::PeerDenied(_)
        ));
        assert!(matches!(
            NodeError::relay_unavailable("no candidates"),
            NodeError::RelayUnavailable(_)
        ));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let node_err: NodeError = io_err.into();
        assert!(matches!(node_err, NodeError::Io(_)));
    }

    #[test]
    fn test_mutual_exclusivity() {
        let transient_errors = [
            NodeError::Timeout(Cow::Borrowed("test")),
            NodeError::StreamClosed(Cow::Borrowed("test")),
            NodeError::RelayUnavailable(Cow::Borrowed("test")),
        ];

        for err in &transient_errors {
            assert!(err.is_transient());
            assert!(!err.is_permanent());
        }

        let permanent_errors = [
            NodeError::ConfigInvalid(Cow::Borrowed("test")),
            NodeError::StoreNotFound("abc".into()),
            NodeError::SessionUnknown("s1".into()),
        ];

        for err in &permanent_errors {
            assert!(err.is_permanent());
            assert!(!err.is_transient());
        }
    }
}
