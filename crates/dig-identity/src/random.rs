//! Secure random number generation.
//!
//! All randomness comes from the operating system CSPRNG.

use crate::IdentityError;

/// Fill a buffer with random bytes from the OS CSPRNG.
pub fn fill_random(buf: &mut [u8]) -> Result<(), IdentityError> {
    getrandom::getrandom(buf).map_err(|_| IdentityError::RandomFailed)
}

/// Generate a random 32-byte array.
pub fn random_32() -> Result<[u8; 32], IdentityError> {
    let mut buf = [0u8; 32];
    fill_random(&mut buf)?;
    Ok(buf)
}

/// Generate a random 16-byte array (used for the classifier's challenge nonce).
pub fn random_16() -> Result<[u8; 16], IdentityError> {
    let mut buf = [0u8; 16];
    fill_random(&mut buf)?;
    Ok(buf)
}

/// Generate a random 8-byte array.
pub fn random_8() -> Result<[u8; 8], IdentityError> {
    let mut buf = [0u8; 8];
    fill_random(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_values_differ() {
        assert_ne!(random_32().unwrap(), random_32().unwrap());
        assert_ne!(random_16().unwrap(), random_16().unwrap());
    }
}
