//! Types used throughout `quarry`.
//!
//! The goal of this crate is to be very lightweight, so take care with adding dependencies.

use std::fmt;

/// A raw 32-byte content hash.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Fingerprint(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// Content fingerprint identifying an immutable blob or directory tree.
///
/// Identical content always maps to an identical [`Digest`]. Digests are never
/// mutated, only combined into new digests by the content store.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest {
    hash: Fingerprint,
    size: u64,
}

impl Digest {
    pub const fn new(hash: Fingerprint, size: u64) -> Self {
        Digest { hash, size }
    }

    pub const fn hash(&self) -> &Fingerprint {
        &self.hash
    }

    /// Size in bytes of the content behind this digest.
    ///
    /// For a directory tree this is the total size of all files beneath it.
    pub const fn size(&self) -> u64 {
        self.size
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({} {} bytes)", self.hash, self.size)
    }
}

/// A 64-bit xxh3 hash, used for non-cryptographic keys like memoization
/// and process-cache entries.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Xxh64Hash(u64);

impl Xxh64Hash {
    pub const fn new(val: u64) -> Self {
        Xxh64Hash(val)
    }

    pub const fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Xxh64Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for Xxh64Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xxh64Hash({self})")
    }
}
