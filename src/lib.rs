//! Cross-process shared-memory key/value cache.
//!
//! All cache state - the hash index, the entry table, the segment
//! allocator's free lists, the lock record, and every counter - lives
//! inside one contiguous memory region mapped by every participating
//! process. The region may land at a different base address in each
//! process, so no pointer is ever stored in it: every cross-reference
//! is a byte offset or an entry index.
//!
//! # Architecture
//!
//! ```text
//! +---------------------------------------------------+
//! |                    ShmCache                       |
//! |                                                   |
//! |  +---------------------------------------------+  |
//! |  | Region (anonymous / POSIX shm / file mmap)  |  |
//! |  |                                             |  |
//! |  |  RegionHeader                               |  |
//! |  |   - config fingerprint, ready flag          |  |
//! |  |   - LockState (cross-process lock record)   |  |
//! |  |   - counters                                |  |
//! |  |  bucket array     (hash index)              |  |
//! |  |  entry table      (fixed slots, inline key) |  |
//! |  |  segment arena    (value blocks)            |  |
//! |  +---------------------------------------------+  |
//! |        ^                ^                ^        |
//! |   HashTable      SegmentAllocator  LockManager    |
//! |        ^                ^                         |
//! |        +---- RecyclePolicy (under pressure) ------+
//! +---------------------------------------------------+
//! ```
//!
//! Writers serialize on a single exclusive lock stored in the header;
//! readers take a shared count. The lock survives holder crashes: a
//! stale holder whose process is gone is detected and force-unlocked.
//! When a write runs out of block space or entry slots, one recycle
//! pass reclaims expired entries and, under sustained pressure, the
//! oldest valid ones.
//!
//! # Example
//!
//! ```ignore
//! use shmcache::{CacheConfig, ShmCache, StoreType};
//!
//! let config = CacheConfig::builder()
//!     .filename("/my-cache")
//!     .store(StoreType::Shm)
//!     .max_memory(64 * 1024 * 1024)
//!     .build()?;
//! let cache = ShmCache::new(config)?;
//!
//! cache.set(b"key", b"value", 3600)?;
//! if let Some(value) = cache.get(b"key")? {
//!     println!("value: {value:?}");
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod alloc;
mod cache;
mod config;
mod error;
mod hash;
mod lock;
mod recycle;
mod region;
mod stats;
mod table;

pub use cache::ShmCache;
pub use config::{
    CacheConfig, CacheConfigBuilder, LockPolicy, StoreType, ValueRecyclePolicy, MAX_KEY_SIZE,
};
pub use error::{CacheError, CacheResult};
pub use hash::HashKind;
pub use lock::{KernelLiveness, ProcessLiveness};
pub use stats::{CacheStats, HashTableStats, LockStats, MemoryStats, OpStats};
