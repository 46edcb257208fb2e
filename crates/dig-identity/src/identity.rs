//! Node identity and the overlay address derived from it.

use crate::error::IdentityError;
use crate::signatures::{SigningKey, VerifyingKey};
use rand_core::{CryptoRng, RngCore};
use std::fmt;

/// First group of every overlay address, forced to a fixed private-range
/// prefix (mirrors the IPv6 unique-local prefix `fd00::/8`) so overlay
/// addresses are visually distinguishable from routable addresses.
const OVERLAY_PREFIX: [u8; 2] = [0xfd, 0x00];

/// A 128-bit identifier derived deterministically from a node's public key.
///
/// Rendered as eight colon-separated 4-hex-digit groups, with the first
/// group forced to [`OVERLAY_PREFIX`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OverlayAddress([u8; 16]);

impl OverlayAddress {
    /// Derive the overlay address for a given Ed25519 public key.
    ///
    /// Takes the first 16 bytes of SHA-256(public key) and overwrites the
    /// first two bytes with the fixed private-range prefix.
    #[must_use]
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        use sha2::{Digest, Sha256};

        let digest = Sha256::digest(public_key);
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        bytes[0] = OVERLAY_PREFIX[0];
        bytes[1] = OVERLAY_PREFIX[1];
        Self(bytes)
    }

    /// Raw 16 bytes of the address.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Parse an address from its colon-separated hex-group string form.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidHex`] if the string is not exactly
    /// eight groups of four hex digits separated by colons.
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        let groups: Vec<&str> = s.split(':').collect();
        if groups.len() != 8 {
            return Err(IdentityError::InvalidHex(format!(
                "expected 8 groups, got {}",
                groups.len()
            )));
        }
        let mut bytes = [0u8; 16];
        for (i, group) in groups.iter().enumerate() {
            if group.len() != 4 {
                return Err(IdentityError::InvalidHex(format!(
                    "group {i} has length {}, expected 4",
                    group.len()
                )));
            }
            let value = u16::from_str_radix(group, 16)
                .map_err(|e| IdentityError::InvalidHex(e.to_string()))?;
            bytes[i * 2..i * 2 + 2].copy_from_slice(&value.to_be_bytes());
        }
        Ok(Self(bytes))
    }

    /// Returns true if this address carries the fixed private-range prefix.
    #[must_use]
    pub fn has_valid_prefix(&self) -> bool {
        self.0[0] == OVERLAY_PREFIX[0] && self.0[1] == OVERLAY_PREFIX[1]
    }
}

impl fmt::Display for OverlayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, chunk) in self.0.chunks(2).enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02x}{:02x}", chunk[0], chunk[1])?;
        }
        Ok(())
    }
}

impl fmt::Debug for OverlayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OverlayAddress({self})")
    }
}

/// Node identity: an Ed25519 keypair plus the overlay address it derives.
///
/// The signing key is held only long enough to be generated or loaded; in
/// line with the spec's immutable, unauthenticated stores, the identity is
/// used purely to name the node and answer `HANDSHAKE`/`VERIFY_OVERLAY_MEMBERSHIP`
/// probes, never to encrypt or sign store content.
#[derive(Clone)]
pub struct Identity {
    signing_key: std::sync::Arc<SigningKey>,
    verifying_key: VerifyingKey,
    overlay_address: OverlayAddress,
}

impl Identity {
    /// Generate a new random identity.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let signing_key = SigningKey::generate(rng);
        Self::from_signing_key(signing_key)
    }

    /// Build an identity from an already-loaded signing key (e.g. read from
    /// the node's configured `privateKey`).
    #[must_use]
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        let overlay_address = OverlayAddress::from_public_key(&verifying_key.to_bytes());
        Self {
            signing_key: std::sync::Arc::new(signing_key),
            verifying_key,
            overlay_address,
        }
    }

    /// Load an identity from a raw 32-byte Ed25519 seed.
    #[must_use]
    pub fn from_bytes(seed: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(seed))
    }

    /// The node's Ed25519 public key — doubles as its stable peer id.
    #[must_use]
    pub fn public_key(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// This node's deterministically-derived overlay address.
    #[must_use]
    pub fn overlay_address(&self) -> OverlayAddress {
        self.overlay_address
    }

    /// Sign a message with this identity's private key.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> crate::signatures::Signature {
        self.signing_key.sign(message)
    }

    /// Verifying key for this identity, usable without access to the secret.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.verifying_key
    }

    /// Export the raw 32-byte Ed25519 seed backing this identity, e.g. to
    /// persist it as a node's configured `privateKey`.
    ///
    /// # Security
    ///
    /// This is the node's entire secret key material; handle the result
    /// with the same care as any other private key.
    #[must_use]
    pub fn to_seed_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &hex::encode(self.public_key()))
            .field("overlay_address", &self.overlay_address.to_string())
            .finish()
    }
}

/// Derive an [`OverlayAddress`] directly from raw public-key bytes, without
/// constructing a full [`Identity`]. Used by the peer registry when
/// classifying a remote peer from its advertised public key.
#[must_use]
pub fn overlay_address_for(public_key: &[u8; 32]) -> OverlayAddress {
    OverlayAddress::from_public_key(public_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn generated_identity_has_prefixed_overlay_address() {
        let identity = Identity::generate(&mut OsRng);
        assert!(identity.overlay_address().has_valid_prefix());
    }

    #[test]
    fn overlay_address_is_deterministic() {
        let identity = Identity::generate(&mut OsRng);
        let again = overlay_address_for(&identity.public_key());
        assert_eq!(identity.overlay_address(), again);
    }

    #[test]
    fn distinct_keys_yield_distinct_addresses() {
        let a = Identity::generate(&mut OsRng);
        let b = Identity::generate(&mut OsRng);
        assert_ne!(a.overlay_address(), b.overlay_address());
    }

    #[test]
    fn display_and_parse_roundtrip() {
        let identity = Identity::generate(&mut OsRng);
        let rendered = identity.overlay_address().to_string();
        let groups: Vec<&str> = rendered.split(':').collect();
        assert_eq!(groups.len(), 8);
        let parsed = OverlayAddress::parse(&rendered).unwrap();
        assert_eq!(parsed, identity.overlay_address());
    }

    #[test]
    fn parse_rejects_wrong_group_count() {
        assert!(OverlayAddress::parse("fd00:0102").is_err());
    }

    #[test]
    fn identity_sign_and_verify() {
        let identity = Identity::generate(&mut OsRng);
        let sig = identity.sign(b"hello overlay");
        assert!(
            identity
                .verifying_key()
                .verify(b"hello overlay", &sig)
                .is_ok()
        );
    }

    #[test]
    fn seed_bytes_roundtrip_through_from_bytes() {
        let identity = Identity::generate(&mut OsRng);
        let seed = identity.to_seed_bytes();
        let reloaded = Identity::from_bytes(&seed);
        assert_eq!(identity.public_key(), reloaded.public_key());
    }

    #[test]
    fn from_bytes_is_deterministic() {
        let seed = [7u8; 32];
        let a = Identity::from_bytes(&seed);
        let b = Identity::from_bytes(&seed);
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.overlay_address(), b.overlay_address());
    }
}
