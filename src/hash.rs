//! Pluggable hash functions for the shared hash index.
//!
//! The hash function is selected once at region creation and stored in
//! the region header **by identifier**, never by function pointer: every
//! process attaching to the same region must resolve the exact same
//! function, and the mapping may land at a different base address in
//! each of them.
//!
//! All functions here are deterministic and seed-free. Randomized
//! hashers (ahash and friends) are deliberately not offered - a
//! per-process seed would scatter the same key across different buckets
//! in different attachers.

/// Identifier-selected hash function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashKind {
    /// djb2-style times-33 hash. Cheap and well-distributed for short
    /// text keys; matches the classic `simple_hash` most shmcache
    /// deployments use.
    #[default]
    Times33,
    /// FNV-1a, 64-bit.
    Fnv1a,
}

impl HashKind {
    /// Stable identifier stored in the region header.
    pub(crate) fn to_id(self) -> u32 {
        match self {
            Self::Times33 => 1,
            Self::Fnv1a => 2,
        }
    }

    /// Resolve a header identifier back to a hash function.
    pub(crate) fn from_id(id: u32) -> Option<Self> {
        match id {
            1 => Some(Self::Times33),
            2 => Some(Self::Fnv1a),
            _ => None,
        }
    }

    /// Hash a key.
    #[inline]
    pub fn hash(self, key: &[u8]) -> u64 {
        match self {
            Self::Times33 => times33(key),
            Self::Fnv1a => fnv1a(key),
        }
    }
}

#[inline]
fn times33(key: &[u8]) -> u64 {
    let mut h: u64 = 5381;
    for &b in key {
        h = h.wrapping_mul(33).wrapping_add(b as u64);
    }
    h
}

#[inline]
fn fnv1a(key: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut h = OFFSET;
    for &b in key {
        h ^= b as u64;
        h = h.wrapping_mul(PRIME);
    }
    h
}
