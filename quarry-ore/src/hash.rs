//! Hashing utilities.

use quarry_types::Xxh64Hash;

/// Streaming xxh3 hasher used for memoization and cache keys.
///
/// Not cryptographically secure, content addressing uses blake3 instead.
pub struct Xxh3Hasher {
    inner: xxhash_rust::xxh3::Xxh3,
}

impl Xxh3Hasher {
    /// Create a new [`Xxh3Hasher`].
    pub const fn new() -> Self {
        Xxh3Hasher {
            inner: xxhash_rust::xxh3::Xxh3::new(),
        }
    }

    pub fn reset(&mut self) {
        self.inner.reset();
    }

    pub fn update(&mut self, input: &[u8]) {
        self.inner.update(input);
    }

    pub fn digest(&self) -> Xxh64Hash {
        Xxh64Hash::new(self.inner.digest())
    }
}

impl Default for Xxh3Hasher {
    fn default() -> Self {
        Xxh3Hasher::new()
    }
}
