//! The cache engine: the single public contract over the shared region.
//!
//! Every mutating operation acquires the exclusive cross-process lock,
//! consults the hash index, allocates or frees through the segment
//! allocator (running one recycle pass when allocation fails), and
//! releases the lock when its guard drops. Reads take the shared lock.
//! Multi-step sequences (allocate+insert, remove+free) complete under
//! one guard - no partial writes are ever visible to another holder.

use crate::alloc::SegmentAllocator;
use crate::config::{CacheConfig, MAX_KEY_SIZE};
use crate::error::{CacheError, CacheResult};
use crate::lock::{KernelLiveness, LockManager, ProcessLiveness};
use crate::recycle::RecyclePolicy;
use crate::region::{now_secs, Region, INVALID};
use crate::stats::{CacheStats, HashTableStats, MemoryStats, OpStats};
use crate::table::HashTable;
use std::sync::atomic::Ordering;

/// Shared-memory key/value cache.
///
/// One `ShmCache` value is one attachment to a region. Any number of
/// processes (and threads within them) may attach to the same named
/// store; they all serialize through the lock record inside the region.
///
/// # Example
///
/// ```ignore
/// use shmcache::{CacheConfig, ShmCache};
///
/// let cache = ShmCache::new(CacheConfig::default())?;
/// cache.set(b"key", b"value", 3600)?;
/// assert_eq!(cache.get(b"key")?.as_deref(), Some(&b"value"[..]));
/// ```
pub struct ShmCache {
    region: Region,
    config: CacheConfig,
    lock: LockManager,
    recycle: RecyclePolicy,
}

impl ShmCache {
    /// Create or attach the region described by `config`.
    pub fn new(config: CacheConfig) -> CacheResult<Self> {
        Self::with_liveness(config, Box::new(KernelLiveness))
    }

    /// Like [`ShmCache::new`] with a custom holder-liveness probe.
    /// Intended for tests and for deployments with their own process
    /// registry or heartbeat.
    pub fn with_liveness(
        config: CacheConfig,
        liveness: Box<dyn ProcessLiveness>,
    ) -> CacheResult<Self> {
        let (region, fresh) = Region::open(&config)?;
        if fresh {
            HashTable::new(&region, config.hash).init()?;
            SegmentAllocator::new(&region).reset()?;
            region.mark_ready();
            log::debug!(
                "initialized region: {} bytes, {} segments, {} entry slots",
                config.max_memory,
                region.header().segment_count,
                config.max_key_count
            );
        }
        let lock = LockManager::new(config.lock_policy, liveness);
        let recycle = RecyclePolicy::new(config.va_policy, config.recycle_key_once);
        Ok(Self {
            region,
            config,
            lock,
            recycle,
        })
    }

    /// Remove the backing store of a named region. Existing mappings
    /// stay valid until those processes detach.
    pub fn remove_store(config: &CacheConfig) -> CacheResult<()> {
        Region::remove_store(config)
    }

    /// The configuration this attachment was opened with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[inline]
    fn table(&self) -> HashTable<'_> {
        HashTable::new(&self.region, self.config.hash)
    }

    #[inline]
    fn allocator(&self) -> SegmentAllocator<'_> {
        SegmentAllocator::new(&self.region)
    }

    fn check_key(key: &[u8]) -> CacheResult<()> {
        if key.len() > MAX_KEY_SIZE {
            return Err(CacheError::KeyTooLong);
        }
        Ok(())
    }

    /// Look up a key and return a copy of its value.
    ///
    /// Expired entries read as absent; their memory is reclaimed later
    /// by a recycle pass or an overwrite, never under the shared lock.
    pub fn get(&self, key: &[u8]) -> CacheResult<Option<Vec<u8>>> {
        Self::check_key(key)?;
        let header = self.region.header();
        header.counters.gets.fetch_add(1, Ordering::Relaxed);

        let _guard = self.lock.acquire_shared(&header.lock)?;
        let table = self.table();
        let index = match table.lookup(key)? {
            Some(index) => index,
            None => return Ok(None),
        };
        let entry = table.entry(index)?;
        if entry.is_expired(now_secs()) {
            return Ok(None);
        }
        let value = if entry.value_len == 0 {
            Vec::new()
        } else {
            self.region
                .read_bytes(entry.value_offset, entry.value_len as usize)?
        };
        header.counters.get_hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(value))
    }

    /// Store a value under a key, replacing any existing entry.
    ///
    /// `ttl_secs == 0` means the entry never expires. On capacity
    /// failure one recycle pass runs and the failing step is retried
    /// once; a second failure surfaces as `CapacityExhausted`.
    pub fn set(&self, key: &[u8], value: &[u8], ttl_secs: u32) -> CacheResult<()> {
        Self::check_key(key)?;
        if value.len() > self.config.max_value_size as usize {
            return Err(CacheError::ValueTooLong);
        }

        let header = self.region.header();
        let _guard = self.lock.acquire_exclusive(&header.lock)?;
        let table = self.table();
        let alloc = self.allocator();
        let now = now_secs();

        // Overwrite frees the old block before the new allocation, so
        // a same-size replacement can never fail on a full arena.
        if let Some(index) = table.lookup(key)? {
            let (old_offset, old_len) = table.remove_index(index)?;
            if old_offset != INVALID {
                alloc.free(old_offset)?;
            }
            header
                .used_bytes
                .fetch_sub(old_len as u64, Ordering::Relaxed);
        }

        let value_offset = if value.is_empty() {
            INVALID
        } else {
            match self.allocate_with_recycle(&table, &alloc, value.len() as u32, now)? {
                Some(offset) => offset,
                None => return Err(CacheError::CapacityExhausted),
            }
        };
        if value_offset != INVALID {
            self.region.write_bytes(value_offset, value)?;
        }

        match self.insert_with_recycle(&table, &alloc, key, value_offset, value, ttl_secs, now) {
            Ok(()) => {
                header
                    .used_bytes
                    .fetch_add(value.len() as u64, Ordering::Relaxed);
                header.counters.sets.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                // Don't leak the freshly written block.
                if value_offset != INVALID {
                    alloc.free(value_offset)?;
                }
                Err(e)
            }
        }
    }

    fn allocate_with_recycle(
        &self,
        table: &HashTable<'_>,
        alloc: &SegmentAllocator<'_>,
        len: u32,
        now: u32,
    ) -> CacheResult<Option<u32>> {
        match alloc.allocate(len) {
            Ok(offset) => Ok(Some(offset)),
            Err(e) if e.is_capacity_signal() => {
                self.recycle.run_pass(&self.region, table, alloc, now)?;
                match alloc.allocate(len) {
                    Ok(offset) => Ok(Some(offset)),
                    Err(e) if e.is_capacity_signal() => Ok(None),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_with_recycle(
        &self,
        table: &HashTable<'_>,
        alloc: &SegmentAllocator<'_>,
        key: &[u8],
        value_offset: u32,
        value: &[u8],
        ttl_secs: u32,
        now: u32,
    ) -> CacheResult<()> {
        let value_len = value.len() as u32;
        match table.insert(key, value_offset, value_len, ttl_secs, now) {
            Ok(_) => Ok(()),
            Err(e) if e.is_capacity_signal() => {
                self.recycle.run_pass(&self.region, table, alloc, now)?;
                match table.insert(key, value_offset, value_len, ttl_secs, now) {
                    Ok(_) => Ok(()),
                    Err(e) if e.is_capacity_signal() => Err(CacheError::CapacityExhausted),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a key. `KeyNotFound` on a miss; never double-frees.
    pub fn delete(&self, key: &[u8]) -> CacheResult<()> {
        Self::check_key(key)?;
        let header = self.region.header();
        let _guard = self.lock.acquire_exclusive(&header.lock)?;
        let table = self.table();
        match table.remove(key)? {
            Some((value_offset, value_len)) => {
                if value_offset != INVALID {
                    self.allocator().free(value_offset)?;
                }
                header
                    .used_bytes
                    .fetch_sub(value_len as u64, Ordering::Relaxed);
                header.counters.deletes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => Err(CacheError::KeyNotFound),
        }
    }

    /// Remove every entry and reset all segments to fully free.
    pub fn clear(&self) -> CacheResult<()> {
        let header = self.region.header();
        let _guard = self.lock.acquire_exclusive(&header.lock)?;
        self.table().clear()?;
        self.allocator().reset()?;
        header.used_bytes.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Whether a live, unexpired entry exists for the key.
    pub fn contains(&self, key: &[u8]) -> CacheResult<bool> {
        Self::check_key(key)?;
        let header = self.region.header();
        let _guard = self.lock.acquire_shared(&header.lock)?;
        let table = self.table();
        match table.lookup(key)? {
            Some(index) => Ok(!table.entry(index)?.is_expired(now_secs())),
            None => Ok(false),
        }
    }

    /// Remaining TTL in seconds; `u32::MAX` for entries that never
    /// expire, `None` for missing or expired keys.
    pub fn ttl(&self, key: &[u8]) -> CacheResult<Option<u32>> {
        Self::check_key(key)?;
        let header = self.region.header();
        let _guard = self.lock.acquire_shared(&header.lock)?;
        let table = self.table();
        match table.lookup(key)? {
            Some(index) => Ok(table.entry(index)?.remaining_ttl(now_secs())),
            None => Ok(None),
        }
    }

    /// Snapshot the region's counters without taking the lock.
    ///
    /// The snapshot is eventually consistent: diagnostic only, never an
    /// input to correctness decisions.
    pub fn stats(&self) -> CacheStats {
        let header = self.region.header();
        CacheStats {
            memory: MemoryStats {
                total: self.region.len() as u64,
                allocated: header.allocated_bytes.load(Ordering::Relaxed),
                used: header.used_bytes.load(Ordering::Relaxed),
            },
            hash_table: HashTableStats {
                max_key_count: header.max_key_count,
                current_key_count: header.live_entries.load(Ordering::Relaxed),
            },
            lock: header.lock.snapshot(),
            ops: OpStats {
                gets: header.counters.gets.load(Ordering::Relaxed),
                get_hits: header.counters.get_hits.load(Ordering::Relaxed),
                sets: header.counters.sets.load(Ordering::Relaxed),
                deletes: header.counters.deletes.load(Ordering::Relaxed),
                recycle_passes: header.counters.recycle_passes.load(Ordering::Relaxed),
                entries_recycled: header.counters.entries_recycled.load(Ordering::Relaxed),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cache() -> ShmCache {
        let config = CacheConfig::builder()
            .max_memory(1024 * 1024)
            .segment_size(8192)
            .max_key_count(64)
            .max_value_size(1024)
            .build()
            .unwrap();
        ShmCache::new(config).unwrap()
    }

    #[test]
    fn test_set_get_round_trip() {
        let cache = small_cache();
        cache.set(b"key", b"value", 60).unwrap();
        assert_eq!(cache.get(b"key").unwrap().as_deref(), Some(&b"value"[..]));
        assert_eq!(cache.get(b"missing").unwrap(), None);
    }

    #[test]
    fn test_empty_value() {
        let cache = small_cache();
        cache.set(b"empty", b"", 60).unwrap();
        assert_eq!(cache.get(b"empty").unwrap().as_deref(), Some(&b""[..]));
    }

    #[test]
    fn test_key_too_long() {
        let cache = small_cache();
        let key = [0u8; MAX_KEY_SIZE + 1];
        assert!(matches!(
            cache.set(&key, b"v", 60),
            Err(CacheError::KeyTooLong)
        ));
        assert!(matches!(cache.get(&key), Err(CacheError::KeyTooLong)));
    }

    #[test]
    fn test_value_too_long() {
        let cache = small_cache();
        let value = vec![0u8; 1025];
        assert!(matches!(
            cache.set(b"k", &value, 60),
            Err(CacheError::ValueTooLong)
        ));
    }

    #[test]
    fn test_delete_idempotence() {
        let cache = small_cache();
        cache.set(b"k", b"v", 60).unwrap();
        assert!(cache.delete(b"k").is_ok());
        assert!(matches!(cache.delete(b"k"), Err(CacheError::KeyNotFound)));
        assert_eq!(cache.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_overwrite_frees_old_block() {
        let cache = small_cache();
        cache.set(b"k", b"first", 60).unwrap();
        let after_first = cache.stats().memory.allocated;
        cache.set(b"k", b"world", 60).unwrap();
        assert_eq!(cache.get(b"k").unwrap().as_deref(), Some(&b"world"[..]));
        // Same-size overwrite reuses the freed block.
        assert_eq!(cache.stats().memory.allocated, after_first);
        assert_eq!(cache.stats().hash_table.current_key_count, 1);
    }

    #[test]
    fn test_clear_zeroes_stats() {
        let cache = small_cache();
        for i in 0..10u8 {
            cache.set(&[i], b"some value", 60).unwrap();
        }
        cache.clear().unwrap();
        let stats = cache.stats();
        assert_eq!(stats.hash_table.current_key_count, 0);
        assert_eq!(stats.memory.allocated, 0);
        assert_eq!(stats.memory.used, 0);
        assert_eq!(cache.get(&[3u8]).unwrap(), None);
    }

    #[test]
    fn test_contains_and_ttl() {
        let cache = small_cache();
        cache.set(b"k", b"v", 60).unwrap();
        assert!(cache.contains(b"k").unwrap());
        assert!(!cache.contains(b"other").unwrap());
        let remaining = cache.ttl(b"k").unwrap().unwrap();
        assert!(remaining <= 60 && remaining >= 58);

        cache.set(b"forever", b"v", 0).unwrap();
        assert_eq!(cache.ttl(b"forever").unwrap(), Some(u32::MAX));
        assert_eq!(cache.ttl(b"missing").unwrap(), None);
    }

    #[test]
    fn test_stats_counters_advance() {
        let cache = small_cache();
        cache.set(b"k", b"v", 60).unwrap();
        cache.get(b"k").unwrap();
        cache.get(b"miss").unwrap();
        let stats = cache.stats();
        assert_eq!(stats.ops.sets, 1);
        assert_eq!(stats.ops.gets, 2);
        assert_eq!(stats.ops.get_hits, 1);
        assert_eq!(stats.memory.total, 1024 * 1024);
        assert!(stats.lock.total_count >= 2);
        assert!((stats.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }
}
