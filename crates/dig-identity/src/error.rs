//! Identity and signature error types.

use thiserror::Error;

/// Errors produced by identity and signature operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Signature verification failed.
    #[error("signature verification failed")]
    InvalidSignature,

    /// Bytes do not decode to a valid Ed25519 public key.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Bytes do not decode to a valid Ed25519 private key.
    #[error("invalid private key")]
    InvalidPrivateKey,

    /// OS CSPRNG failed to produce randomness.
    #[error("random number generation failed")]
    RandomFailed,

    /// Hex-encoded key material was malformed.
    #[error("invalid hex encoding: {0}")]
    InvalidHex(String),
}
