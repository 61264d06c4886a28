//! Error types for cache operations.

use std::fmt;

/// Errors that can occur during cache operations.
#[derive(Debug)]
pub enum CacheError {
    /// The key is too long (max 64 bytes).
    KeyTooLong,

    /// The value exceeds the configured `max_value_size`.
    ValueTooLong,

    /// The configuration is malformed (zero sizes, segment larger than
    /// the region, value ceiling that cannot fit a segment, ...).
    InvalidConfig(&'static str),

    /// No memory or hashtable capacity available, even after one
    /// recycle pass.
    CapacityExhausted,

    /// Key not found (for GET/DELETE misses). A normal negative
    /// result, not a failure.
    KeyNotFound,

    /// The segment allocator has no block large enough.
    /// Internal: the engine converts this to `CapacityExhausted`
    /// after its single recycle attempt.
    NoSpace,

    /// The hashtable has no free entry slots.
    /// Internal: converted to `CapacityExhausted` like `NoSpace`.
    TableFull,

    /// Lock acquisition exceeded the caller's attempt budget without
    /// deadlock detection resolving it.
    LockTimeout,

    /// Invariant violation detected in the shared region (bad magic,
    /// allocator accounting mismatch, dangling offset). Fatal: the
    /// operation is aborted and nothing is repaired.
    Corrupted(&'static str),

    /// Failure creating, sizing, or mapping the backing store.
    Io(std::io::Error),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyTooLong => write!(f, "key too long (max 64 bytes)"),
            Self::ValueTooLong => write!(f, "value too long"),
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::CapacityExhausted => write!(f, "capacity exhausted"),
            Self::KeyNotFound => write!(f, "key not found"),
            Self::NoSpace => write!(f, "no space in segment allocator"),
            Self::TableFull => write!(f, "hashtable full"),
            Self::LockTimeout => write!(f, "lock acquisition timed out"),
            Self::Corrupted(msg) => write!(f, "shared region corrupted: {msg}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

impl CacheError {
    /// Whether this error is one of the internal capacity signals that
    /// the engine resolves with a recycle pass.
    pub(crate) fn is_capacity_signal(&self) -> bool {
        matches!(self, Self::NoSpace | Self::TableFull)
    }
}
