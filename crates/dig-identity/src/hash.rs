//! BLAKE3 cryptographic hashing for store content and chunk verification.
//!
//! Stores are opaque, unauthenticated byte strings, so hashing here is used
//! purely for diagnostics and crash/corruption detection — never as part of
//! the wire protocol's trust decisions.

/// BLAKE3 hash output (32 bytes).
pub type HashOutput = [u8; 32];

/// Compute the BLAKE3 hash of a byte slice.
#[must_use]
pub fn hash(data: &[u8]) -> HashOutput {
    *blake3::hash(data).as_bytes()
}

/// Incremental BLAKE3 hasher for large files assembled from many chunks.
pub struct TreeHasher {
    hasher: blake3::Hasher,
    total_len: usize,
}

impl TreeHasher {
    /// Create a new, empty hasher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
            total_len: 0,
        }
    }

    /// Feed more data into the hasher.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.total_len += data.len();
    }

    /// Feed a batch of chunks in order; more efficient than repeated `update`.
    pub fn update_batch(&mut self, chunks: &[&[u8]]) {
        for chunk in chunks {
            self.hasher.update(chunk);
            self.total_len += chunk.len();
        }
    }

    /// Total bytes hashed so far.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.total_len
    }

    /// Finalize and return the hash without consuming the hasher.
    #[must_use]
    pub fn finalize(&self) -> HashOutput {
        *self.hasher.finalize().as_bytes()
    }
}

impl Default for TreeHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blake3_basic() {
        let data = b"hello world";
        let hash1 = hash(data);
        let hash2 = hash(data);
        assert_eq!(hash1, hash2);
        assert_ne!(hash1, [0u8; 32]);
    }

    #[test]
    fn test_blake3_different_inputs() {
        let hash1 = hash(b"input1");
        let hash2 = hash(b"input2");
        assert_ne!(hash1, hash2);
    }

    #[test]
    fn test_tree_hasher_incremental() {
        let hash_combined = hash(b"hello world");

        let mut hasher = TreeHasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        let hash_incremental = hasher.finalize();

        assert_eq!(hash_combined, hash_incremental);
    }

    #[test]
    fn test_batch_vs_sequential_identical() {
        let chunks = [b"chunk1" as &[u8], b"chunk2", b"chunk3", b"chunk4"];

        let mut hasher_batch = TreeHasher::new();
        hasher_batch.update_batch(&chunks);

        let mut hasher_seq = TreeHasher::new();
        for chunk in &chunks {
            hasher_seq.update(chunk);
        }

        assert_eq!(hasher_batch.finalize(), hasher_seq.finalize());
        assert_eq!(hasher_batch.total_len(), hasher_seq.total_len());
    }

    #[test]
    fn test_blake3_empty_string() {
        let hash_output = hash(b"");
        let expected = [
            0xaf, 0x13, 0x49, 0xb9, 0xf5, 0xf9, 0xa1, 0xa6, 0xa0, 0x40, 0x4d, 0xea, 0x36, 0xdc,
            0xc9, 0x49, 0x9b, 0xcb, 0x25, 0xc9, 0xad, 0xc1, 0x12, 0xb7, 0xcc, 0x9a, 0x93, 0xca,
            0xe4, 0x1f, 0x32, 0x62,
        ];
        assert_eq!(hash_output, expected);
    }
}
