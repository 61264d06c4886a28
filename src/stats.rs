//! Cache statistics snapshots.
//!
//! All statistics are derived from live region state when requested;
//! nothing is persisted separately. Snapshots are taken without the
//! exclusive lock, so they are eventually consistent: diagnostic, never
//! an input to correctness decisions.

/// Memory accounting for the region.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    /// Total region size in bytes (fixed at creation).
    pub total: u64,
    /// Bytes currently handed out by the segment allocator,
    /// including per-block headers.
    pub allocated: u64,
    /// Bytes occupied by live values.
    pub used: u64,
}

/// Hash index occupancy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HashTableStats {
    /// Configured capacity in live entries.
    pub max_key_count: u32,
    /// Live entries right now.
    pub current_key_count: u32,
}

/// Cross-process lock activity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LockStats {
    /// Successful exclusive acquisitions.
    pub total_count: u64,
    /// Failed acquisition attempts that led to a retry.
    pub retry_count: u64,
    /// Times a stale lock with a dead holder was detected. Counts
    /// exclusive-holder recovery only.
    pub detect_deadlock_count: u64,
    /// Times a stale lock was forcibly cleared. Counts
    /// exclusive-holder recovery only.
    pub unlock_deadlock_count: u64,
    /// Times a stale shared-reader count was cleared.
    pub reader_recovery_count: u64,
}

/// Operation counters. Read-side counters are best-effort: they are
/// bumped with relaxed atomics and may undercount under contention
/// rather than ever blocking readers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OpStats {
    /// Total GET operations.
    pub gets: u64,
    /// GET operations that found a live, unexpired entry.
    pub get_hits: u64,
    /// Total successful SET operations.
    pub sets: u64,
    /// Total successful DELETE operations.
    pub deletes: u64,
    /// Recycle passes run.
    pub recycle_passes: u64,
    /// Entries evicted by recycle passes (expired or forced).
    pub entries_recycled: u64,
}

/// Combined snapshot of region, allocator, index, and lock counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Memory accounting.
    pub memory: MemoryStats,
    /// Hash index occupancy.
    pub hash_table: HashTableStats,
    /// Lock activity.
    pub lock: LockStats,
    /// Operation counters.
    pub ops: OpStats,
}

impl CacheStats {
    /// GET hit ratio (0.0 - 1.0); 0.0 when no GETs were recorded.
    pub fn hit_ratio(&self) -> f64 {
        if self.ops.gets == 0 {
            0.0
        } else {
            self.ops.get_hits as f64 / self.ops.gets as f64
        }
    }

    /// Allocator utilization as a fraction of total memory.
    pub fn utilization(&self) -> f64 {
        if self.memory.total == 0 {
            0.0
        } else {
            self.memory.allocated as f64 / self.memory.total as f64
        }
    }
}
