//! Shared hash index mapping keys to value blocks.
//!
//! The index is two sections of the region: a bucket array of entry
//! indices (capacity rounded up to a power of two) and a fixed-size
//! entry table of `max_key_count` records. Collisions chain through
//! `hash_next`; free entries form a list through the same link.
//!
//! Entries additionally thread a doubly-linked creation-order list
//! (oldest first), which is the scan order of the recycle policy.
//!
//! Capacity is strict: inserting past `max_key_count` fails with
//! `TableFull` and never evicts. Eviction is the recycle policy's
//! exclusive responsibility.
//!
//! All mutation happens under the exclusive region lock. Lookups under
//! the shared lock see a stable structure because writers are excluded.

use crate::config::MAX_KEY_SIZE;
use crate::error::{CacheError, CacheResult};
use crate::hash::HashKind;
use crate::region::{Region, ENTRY_SIZE, INVALID};
use std::sync::atomic::Ordering;

/// The entry has already received its one pre-eviction grace sleep.
pub(crate) const FLAG_RECYCLE_ATTEMPTED: u32 = 1;

/// One record of the shared entry table.
#[repr(C)]
pub(crate) struct Entry {
    pub key_len: u32,
    pub value_len: u32,
    /// Region offset of the value payload, `INVALID` for empty values.
    pub value_offset: u32,
    /// TTL in seconds; 0 never expires.
    pub ttl_secs: u32,
    /// Creation time, coarse seconds since the epoch.
    pub created: u32,
    /// Allocation failures this entry has absorbed.
    pub fail_count: u32,
    pub flags: u32,
    /// Bucket chain link while live; free list link while free.
    pub hash_next: u32,
    pub order_prev: u32,
    pub order_next: u32,
    pub key: [u8; MAX_KEY_SIZE],
}

impl Entry {
    #[inline]
    pub(crate) fn key_bytes(&self) -> &[u8] {
        &self.key[..self.key_len.min(MAX_KEY_SIZE as u32) as usize]
    }

    /// Whether the entry's TTL has elapsed.
    #[inline]
    pub(crate) fn is_expired(&self, now: u32) -> bool {
        self.ttl_secs > 0 && now.saturating_sub(self.created) >= self.ttl_secs
    }

    /// Remaining TTL in seconds; `None` when expired, `Some(0)` is not
    /// produced (0 means "never expires" on the way in, so an entry
    /// with `ttl_secs == 0` reports `u32::MAX` remaining).
    pub(crate) fn remaining_ttl(&self, now: u32) -> Option<u32> {
        if self.ttl_secs == 0 {
            return Some(u32::MAX);
        }
        let age = now.saturating_sub(self.created);
        if age >= self.ttl_secs {
            None
        } else {
            Some(self.ttl_secs - age)
        }
    }
}

/// Hash index over the region's bucket array and entry table.
pub(crate) struct HashTable<'r> {
    region: &'r Region,
    hash: HashKind,
}

impl<'r> HashTable<'r> {
    pub(crate) fn new(region: &'r Region, hash: HashKind) -> Self {
        Self { region, hash }
    }

    #[inline]
    fn bucket_count(&self) -> u32 {
        self.region.header().bucket_count
    }

    #[inline]
    fn max_entries(&self) -> u32 {
        self.region.header().max_key_count
    }

    fn bucket_offset(&self, bucket: u32) -> u32 {
        self.region.layout().buckets_offset + bucket * 4
    }

    fn read_bucket(&self, bucket: u32) -> CacheResult<u32> {
        let offset = self.bucket_offset(bucket);
        self.region.check_range(offset, 4)?;
        // SAFETY: range checked, 4-aligned section.
        Ok(unsafe { *(self.region.ptr_at(offset) as *const u32) })
    }

    fn write_bucket(&self, bucket: u32, value: u32) -> CacheResult<()> {
        let offset = self.bucket_offset(bucket);
        self.region.check_range(offset, 4)?;
        // SAFETY: range checked; caller holds the exclusive lock.
        unsafe { *(self.region.ptr_at(offset) as *mut u32) = value };
        Ok(())
    }

    fn entry_offset(&self, index: u32) -> CacheResult<u32> {
        if index >= self.max_entries() {
            return Err(CacheError::Corrupted("entry index out of table"));
        }
        Ok(self.region.layout().entries_offset + index * ENTRY_SIZE)
    }

    /// Shared view of an entry.
    pub(crate) fn entry(&self, index: u32) -> CacheResult<&Entry> {
        let offset = self.entry_offset(index)?;
        self.region.check_range(offset, ENTRY_SIZE as usize)?;
        // SAFETY: range checked; writers are serialized by the lock.
        Ok(unsafe { &*(self.region.ptr_at(offset) as *const Entry) })
    }

    /// Mutable view of an entry. Caller must hold the exclusive lock
    /// and must not hold another reference to the same entry.
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn entry_mut(&self, index: u32) -> CacheResult<&mut Entry> {
        let offset = self.entry_offset(index)?;
        self.region.check_range(offset, ENTRY_SIZE as usize)?;
        // SAFETY: range checked; exclusive lock serializes mutation.
        Ok(unsafe { &mut *(self.region.ptr_at(offset) as *mut Entry) })
    }

    #[inline]
    fn bucket_for(&self, key: &[u8]) -> u32 {
        (self.hash.hash(key) & (self.bucket_count() as u64 - 1)) as u32
    }

    /// Initialize a fresh region's index structures.
    pub(crate) fn init(&self) -> CacheResult<()> {
        for bucket in 0..self.bucket_count() {
            self.write_bucket(bucket, INVALID)?;
        }
        let max = self.max_entries();
        for index in 0..max {
            let entry = self.entry_mut(index)?;
            entry.hash_next = if index + 1 < max { index + 1 } else { INVALID };
        }
        let header = self.region.header();
        header.entry_free_head.store(0, Ordering::Relaxed);
        header.order_head.store(INVALID, Ordering::Relaxed);
        header.order_tail.store(INVALID, Ordering::Relaxed);
        header.live_entries.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Find the entry index for a key.
    pub(crate) fn lookup(&self, key: &[u8]) -> CacheResult<Option<u32>> {
        let mut cur = self.read_bucket(self.bucket_for(key))?;
        let mut steps = 0;
        while cur != INVALID {
            steps += 1;
            if steps > self.max_entries() {
                return Err(CacheError::Corrupted("bucket chain cycle"));
            }
            let entry = self.entry(cur)?;
            if entry.key_bytes() == key {
                return Ok(Some(cur));
            }
            cur = entry.hash_next;
        }
        Ok(None)
    }

    /// Insert a key that is known to be absent.
    ///
    /// Returns the new entry index, or `TableFull` without evicting.
    pub(crate) fn insert(
        &self,
        key: &[u8],
        value_offset: u32,
        value_len: u32,
        ttl_secs: u32,
        now: u32,
    ) -> CacheResult<u32> {
        debug_assert!(key.len() <= MAX_KEY_SIZE);
        let header = self.region.header();
        let index = header.entry_free_head.load(Ordering::Relaxed);
        if index == INVALID {
            return Err(CacheError::TableFull);
        }
        let bucket = self.bucket_for(key);
        let chain_head = self.read_bucket(bucket)?;

        {
            let entry = self.entry_mut(index)?;
            header
                .entry_free_head
                .store(entry.hash_next, Ordering::Relaxed);
            entry.key_len = key.len() as u32;
            entry.key[..key.len()].copy_from_slice(key);
            entry.key[key.len()..].fill(0);
            entry.value_offset = value_offset;
            entry.value_len = value_len;
            entry.ttl_secs = ttl_secs;
            entry.created = now;
            entry.fail_count = 0;
            entry.flags = 0;
            entry.hash_next = chain_head;
            entry.order_prev = INVALID;
            entry.order_next = INVALID;
        }
        self.write_bucket(bucket, index)?;
        self.order_push_back(index)?;
        header.live_entries.fetch_add(1, Ordering::Relaxed);
        Ok(index)
    }

    /// Remove a key. Returns `(value_offset, value_len)` so the caller
    /// can free the block; the index never touches the allocator.
    pub(crate) fn remove(&self, key: &[u8]) -> CacheResult<Option<(u32, u32)>> {
        match self.lookup(key)? {
            Some(index) => self.remove_index(index).map(Some),
            None => Ok(None),
        }
    }

    /// Remove an entry by index (recycle path).
    pub(crate) fn remove_index(&self, index: u32) -> CacheResult<(u32, u32)> {
        let (key_bucket, value) = {
            let entry = self.entry(index)?;
            (
                self.bucket_for(entry.key_bytes()),
                (entry.value_offset, entry.value_len),
            )
        };

        // Unlink from the bucket chain.
        let mut prev = INVALID;
        let mut cur = self.read_bucket(key_bucket)?;
        let mut steps = 0;
        while cur != INVALID && cur != index {
            steps += 1;
            if steps > self.max_entries() {
                return Err(CacheError::Corrupted("bucket chain cycle"));
            }
            prev = cur;
            cur = self.entry(cur)?.hash_next;
        }
        if cur == INVALID {
            return Err(CacheError::Corrupted("entry missing from its bucket"));
        }
        let next = self.entry(index)?.hash_next;
        if prev == INVALID {
            self.write_bucket(key_bucket, next)?;
        } else {
            self.entry_mut(prev)?.hash_next = next;
        }

        self.order_unlink(index)?;

        // Push onto the free list.
        let header = self.region.header();
        let free_head = header.entry_free_head.load(Ordering::Relaxed);
        {
            let entry = self.entry_mut(index)?;
            entry.hash_next = free_head;
            entry.value_offset = INVALID;
            entry.value_len = 0;
            entry.key_len = 0;
        }
        header.entry_free_head.store(index, Ordering::Relaxed);
        header.live_entries.fetch_sub(1, Ordering::Relaxed);
        Ok(value)
    }

    /// Drop every entry. The caller resets the allocator; the index
    /// only rebuilds its own lists.
    pub(crate) fn clear(&self) -> CacheResult<()> {
        self.init()
    }

    /// Oldest entry in creation order, if any.
    pub(crate) fn order_head(&self) -> u32 {
        self.region.header().order_head.load(Ordering::Relaxed)
    }

    fn order_push_back(&self, index: u32) -> CacheResult<()> {
        let header = self.region.header();
        let tail = header.order_tail.load(Ordering::Relaxed);
        if tail == INVALID {
            header.order_head.store(index, Ordering::Relaxed);
            header.order_tail.store(index, Ordering::Relaxed);
            return Ok(());
        }
        self.entry_mut(tail)?.order_next = index;
        self.entry_mut(index)?.order_prev = tail;
        header.order_tail.store(index, Ordering::Relaxed);
        Ok(())
    }

    fn order_unlink(&self, index: u32) -> CacheResult<()> {
        let header = self.region.header();
        let (prev, next) = {
            let entry = self.entry(index)?;
            (entry.order_prev, entry.order_next)
        };
        if prev == INVALID {
            header.order_head.store(next, Ordering::Relaxed);
        } else {
            self.entry_mut(prev)?.order_next = next;
        }
        if next == INVALID {
            header.order_tail.store(prev, Ordering::Relaxed);
        } else {
            self.entry_mut(next)?.order_prev = prev;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    fn test_region(max_keys: u32) -> Region {
        let config = CacheConfig::builder()
            .max_memory(1024 * 1024)
            .segment_size(4096)
            .max_key_count(max_keys)
            .max_value_size(1024)
            .build()
            .unwrap();
        let (region, _) = Region::open(&config).unwrap();
        region
    }

    #[test]
    fn test_entry_record_size_matches_layout() {
        assert_eq!(std::mem::size_of::<Entry>() as u32, ENTRY_SIZE);
    }

    #[test]
    fn test_insert_lookup_remove() {
        let region = test_region(16);
        let table = HashTable::new(&region, HashKind::Times33);
        table.init().unwrap();

        let idx = table.insert(b"alpha", 128, 5, 60, 1000).unwrap();
        assert_eq!(table.lookup(b"alpha").unwrap(), Some(idx));
        assert_eq!(table.lookup(b"beta").unwrap(), None);

        let entry = table.entry(idx).unwrap();
        assert_eq!(entry.key_bytes(), b"alpha");
        assert_eq!(entry.value_offset, 128);
        assert_eq!(entry.value_len, 5);
        assert_eq!(entry.ttl_secs, 60);

        assert_eq!(table.remove(b"alpha").unwrap(), Some((128, 5)));
        assert_eq!(table.lookup(b"alpha").unwrap(), None);
        assert_eq!(table.remove(b"alpha").unwrap(), None);
    }

    #[test]
    fn test_table_full_without_eviction() {
        let region = test_region(2);
        let table = HashTable::new(&region, HashKind::Times33);
        table.init().unwrap();

        table.insert(b"a", INVALID, 0, 0, 0).unwrap();
        table.insert(b"b", INVALID, 0, 0, 0).unwrap();
        let err = table.insert(b"c", INVALID, 0, 0, 0).unwrap_err();
        assert!(matches!(err, CacheError::TableFull));
        // The existing entries were not touched.
        assert!(table.lookup(b"a").unwrap().is_some());
        assert!(table.lookup(b"b").unwrap().is_some());
    }

    #[test]
    fn test_collision_chains() {
        // One bucket forces every key onto the same chain.
        let region = test_region(1);
        assert_eq!(region.header().bucket_count, 1);
        let table = HashTable::new(&region, HashKind::Times33);
        table.init().unwrap();
        table.insert(b"only", INVALID, 0, 0, 0).unwrap();
        assert!(table.lookup(b"only").unwrap().is_some());

        // With a larger table but identical bucket, chains must work.
        let region = test_region(4);
        let table = HashTable::new(&region, HashKind::Times33);
        table.init().unwrap();
        for key in [b"k1".as_slice(), b"k2", b"k3", b"k4"] {
            table.insert(key, INVALID, 0, 0, 0).unwrap();
        }
        for key in [b"k1".as_slice(), b"k2", b"k3", b"k4"] {
            assert!(table.lookup(key).unwrap().is_some(), "missing {key:?}");
        }
        // Remove from the middle of a chain and re-check the rest.
        table.remove(b"k2").unwrap().unwrap();
        assert!(table.lookup(b"k1").unwrap().is_some());
        assert!(table.lookup(b"k3").unwrap().is_some());
        assert!(table.lookup(b"k4").unwrap().is_some());
    }

    #[test]
    fn test_creation_order_list() {
        let region = test_region(8);
        let table = HashTable::new(&region, HashKind::Times33);
        table.init().unwrap();

        let a = table.insert(b"a", INVALID, 0, 0, 1).unwrap();
        let b = table.insert(b"b", INVALID, 0, 0, 2).unwrap();
        let c = table.insert(b"c", INVALID, 0, 0, 3).unwrap();

        assert_eq!(table.order_head(), a);
        assert_eq!(table.entry(a).unwrap().order_next, b);
        assert_eq!(table.entry(b).unwrap().order_next, c);

        // Removing the middle preserves order around it.
        table.remove_index(b).unwrap();
        assert_eq!(table.order_head(), a);
        assert_eq!(table.entry(a).unwrap().order_next, c);
        assert_eq!(table.entry(c).unwrap().order_prev, a);

        // Removing the head advances it.
        table.remove_index(a).unwrap();
        assert_eq!(table.order_head(), c);
    }

    #[test]
    fn test_clear_resets_everything() {
        let region = test_region(8);
        let table = HashTable::new(&region, HashKind::Times33);
        table.init().unwrap();
        for key in [b"a".as_slice(), b"b", b"c"] {
            table.insert(key, INVALID, 0, 0, 0).unwrap();
        }
        table.clear().unwrap();
        assert_eq!(region.header().live_entries.load(Ordering::Relaxed), 0);
        assert_eq!(table.order_head(), INVALID);
        for key in [b"a".as_slice(), b"b", b"c"] {
            assert_eq!(table.lookup(key).unwrap(), None);
        }
        // Full capacity is available again.
        for i in 0..8u8 {
            table.insert(&[i], INVALID, 0, 0, 0).unwrap();
        }
    }

    #[test]
    fn test_expiry_helpers() {
        let region = test_region(2);
        let table = HashTable::new(&region, HashKind::Times33);
        table.init().unwrap();
        let idx = table.insert(b"k", INVALID, 0, 10, 1000).unwrap();
        let entry = table.entry(idx).unwrap();
        assert!(!entry.is_expired(1005));
        assert_eq!(entry.remaining_ttl(1005), Some(5));
        assert!(entry.is_expired(1010));
        assert_eq!(entry.remaining_ttl(1010), None);

        let idx = table.insert(b"forever", INVALID, 0, 0, 1000).unwrap();
        let entry = table.entry(idx).unwrap();
        assert!(!entry.is_expired(u32::MAX));
        assert_eq!(entry.remaining_ttl(u32::MAX), Some(u32::MAX));
    }
}
