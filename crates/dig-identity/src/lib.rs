//! # dig-identity
//!
//! Node identity and overlay-address derivation for the dig-node overlay.
//!
//! This crate provides:
//! - An Ed25519 node identity (signing key, public key, stable peer id)
//! - Deterministic derivation of the 128-bit overlay address from a public key
//! - BLAKE3 content hashing used for diagnostics and corruption detection
//! - Secure random number generation (challenge nonces, transfer/session ids)
//!
//! Stores are treated as opaque, unauthenticated byte strings, so this
//! crate deliberately does not provide session encryption, key exchange,
//! or AEAD — those belong to the underlying p2p fabric, out of scope here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod hash;
pub mod identity;
pub mod random;
pub mod signatures;

pub use error::IdentityError;
pub use identity::{overlay_address_for, Identity, OverlayAddress};

/// Ed25519 public key size.
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 secret key size.
pub const ED25519_SECRET_KEY_SIZE: usize = 32;

/// Ed25519 signature size.
pub const ED25519_SIGNATURE_SIZE: usize = 64;

/// BLAKE3 output size.
pub const BLAKE3_OUTPUT_SIZE: usize = 32;

/// Size in bytes of a derived overlay address.
pub const OVERLAY_ADDRESS_SIZE: usize = 16;

/// Size in bytes of the classifier's challenge nonce (§4.2).
pub const CHALLENGE_NONCE_SIZE: usize = 16;
