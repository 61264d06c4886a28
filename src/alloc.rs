//! Segment allocator for variable-length value blocks.
//!
//! The arena portion of the region is partitioned into fixed-size
//! segments. Each segment manages its own free list of variable-length
//! blocks, kept sorted by offset so freeing can coalesce adjacent
//! blocks. Segment-local free lists bound the fragmentation search and
//! let the recycle policy reclaim in segment-sized strides instead of
//! scanning the whole arena.
//!
//! Allocation is first-fit within the current segment, advancing to the
//! next segment with free capacity, failing with `NoSpace` when every
//! segment is exhausted. The region never grows.
//!
//! # Segment layout
//!
//! ```text
//! +-----------+--------+--------+-----+----------------+
//! | SegHeader | block  | block  | ... | [free block]   |
//! | (16B)     |        |        |     |                |
//! +-----------+--------+--------+-----+----------------+
//! ```
//!
//! Every block starts with an 8-byte header: total size (header
//! included) and, while free, the segment-relative offset of the next
//! free block. Invariant per segment: free bytes on the list plus
//! allocated bytes equal the capacity behind the segment header.
//!
//! All mutation happens under the exclusive region lock; the segment
//! header fields are atomic only so `stats()` can read them without it.

use crate::error::{CacheError, CacheResult};
use crate::region::{Region, INVALID};
use std::sync::atomic::{AtomicU32, Ordering};

/// Size of the per-segment header.
pub(crate) const SEG_HEADER_SIZE: u32 = 16;

/// Size of the per-block header.
pub(crate) const BLOCK_HEADER_SIZE: u32 = 8;

/// Smallest block the allocator will carve (header included).
pub(crate) const MIN_BLOCK_SIZE: u32 = 16;

/// Largest value payload a single segment of this size can hold.
pub(crate) fn max_block_payload(segment_size: u32) -> u64 {
    (segment_size as u64)
        .saturating_sub(SEG_HEADER_SIZE as u64)
        .saturating_sub(BLOCK_HEADER_SIZE as u64)
}

#[inline]
fn align8(v: u32) -> u32 {
    (v + 7) & !7
}

/// Header at the start of each segment.
#[repr(C)]
struct SegHeader {
    /// Segment-relative offset of the first free block, `INVALID` if none.
    free_head: AtomicU32,
    /// Bytes on the free list (block headers included).
    free_bytes: AtomicU32,
    /// Live allocated blocks in this segment.
    live_blocks: AtomicU32,
    _reserved: AtomicU32,
}

/// Offset-based allocator over the region's segment arena.
pub(crate) struct SegmentAllocator<'r> {
    region: &'r Region,
}

impl<'r> SegmentAllocator<'r> {
    pub(crate) fn new(region: &'r Region) -> Self {
        Self { region }
    }

    #[inline]
    fn segment_size(&self) -> u32 {
        self.region.header().segment_size
    }

    #[inline]
    fn segment_count(&self) -> u32 {
        self.region.header().segment_count
    }

    #[inline]
    fn segment_base(&self, index: u32) -> u32 {
        self.region.layout().arena_offset + index * self.segment_size()
    }

    fn seg_header(&self, index: u32) -> CacheResult<&SegHeader> {
        let base = self.segment_base(index);
        self.region
            .check_range(base, std::mem::size_of::<SegHeader>())?;
        // SAFETY: range checked; SegHeader is all-atomic and the arena
        // base is 64-byte aligned with 8-aligned segment sizes.
        Ok(unsafe { &*(self.region.ptr_at(base) as *const SegHeader) })
    }

    fn read_u32(&self, offset: u32) -> CacheResult<u32> {
        self.region.check_range(offset, 4)?;
        // SAFETY: range checked; 4-byte aligned by block alignment.
        Ok(unsafe { *(self.region.ptr_at(offset) as *const u32) })
    }

    fn write_u32(&self, offset: u32, value: u32) -> CacheResult<()> {
        self.region.check_range(offset, 4)?;
        // SAFETY: range checked; caller holds the exclusive lock.
        unsafe { *(self.region.ptr_at(offset) as *mut u32) = value };
        Ok(())
    }

    #[inline]
    fn block_size_at(&self, seg_base: u32, rel: u32) -> CacheResult<u32> {
        self.read_u32(seg_base + rel)
    }

    #[inline]
    fn block_next_at(&self, seg_base: u32, rel: u32) -> CacheResult<u32> {
        self.read_u32(seg_base + rel + 4)
    }

    fn set_block(&self, seg_base: u32, rel: u32, size: u32, next: u32) -> CacheResult<()> {
        self.write_u32(seg_base + rel, size)?;
        self.write_u32(seg_base + rel + 4, next)
    }

    /// Reset every segment to a single fully-free block. Used both for
    /// fresh-region initialization and `clear()`.
    pub(crate) fn reset(&self) -> CacheResult<()> {
        let size = self.segment_size();
        for index in 0..self.segment_count() {
            let base = self.segment_base(index);
            let header = self.seg_header(index)?;
            self.set_block(base, SEG_HEADER_SIZE, size - SEG_HEADER_SIZE, INVALID)?;
            header.free_head.store(SEG_HEADER_SIZE, Ordering::Relaxed);
            header
                .free_bytes
                .store(size - SEG_HEADER_SIZE, Ordering::Relaxed);
            header.live_blocks.store(0, Ordering::Relaxed);
        }
        let region_header = self.region.header();
        region_header.allocated_bytes.store(0, Ordering::Relaxed);
        region_header.alloc_cursor.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Allocate a block with room for `len` payload bytes.
    ///
    /// Returns the region-absolute offset of the payload. Fails with
    /// `NoSpace` when no segment has a fitting block; the region is
    /// never grown.
    pub(crate) fn allocate(&self, len: u32) -> CacheResult<u32> {
        let need = align8(len + BLOCK_HEADER_SIZE).max(MIN_BLOCK_SIZE);
        if need as u64 > max_block_payload(self.segment_size()) + BLOCK_HEADER_SIZE as u64 {
            return Err(CacheError::NoSpace);
        }
        let count = self.segment_count();
        let start = self.region.header().alloc_cursor.load(Ordering::Relaxed) % count;
        for step in 0..count {
            let index = (start + step) % count;
            if self.seg_header(index)?.free_bytes.load(Ordering::Relaxed) < need {
                continue;
            }
            if let Some(offset) = self.allocate_in_segment(index, need)? {
                self.region
                    .header()
                    .alloc_cursor
                    .store(index, Ordering::Relaxed);
                self.region
                    .header()
                    .allocated_bytes
                    .fetch_add(need as u64, Ordering::Relaxed);
                return Ok(offset);
            }
        }
        Err(CacheError::NoSpace)
    }

    /// First-fit scan of one segment's free list.
    fn allocate_in_segment(&self, index: u32, need: u32) -> CacheResult<Option<u32>> {
        let seg_base = self.segment_base(index);
        let header = self.seg_header(index)?;
        let max_steps = self.segment_size() / MIN_BLOCK_SIZE + 1;

        let mut prev = INVALID;
        let mut cur = header.free_head.load(Ordering::Relaxed);
        let mut steps = 0;
        while cur != INVALID {
            steps += 1;
            if steps > max_steps {
                return Err(CacheError::Corrupted("free list cycle"));
            }
            self.check_block_bounds(cur, MIN_BLOCK_SIZE)?;
            let size = self.block_size_at(seg_base, cur)?;
            self.check_block_bounds(cur, size)?;
            let next = self.block_next_at(seg_base, cur)?;

            if size >= need {
                let taken = if size - need >= MIN_BLOCK_SIZE {
                    // Split: the remainder stays on the list in place.
                    let rest = cur + need;
                    self.set_block(seg_base, rest, size - need, next)?;
                    self.relink(header, seg_base, prev, rest)?;
                    need
                } else {
                    self.relink(header, seg_base, prev, next)?;
                    size
                };
                header.free_bytes.fetch_sub(taken, Ordering::Relaxed);
                header.live_blocks.fetch_add(1, Ordering::Relaxed);
                self.set_block(seg_base, cur, taken, INVALID)?;
                if taken != need {
                    // Whole-block grab was larger than requested.
                    self.region
                        .header()
                        .allocated_bytes
                        .fetch_add((taken - need) as u64, Ordering::Relaxed);
                }
                return Ok(Some(seg_base + cur + BLOCK_HEADER_SIZE));
            }
            prev = cur;
            cur = next;
        }
        Ok(None)
    }

    fn relink(&self, header: &SegHeader, seg_base: u32, prev: u32, next: u32) -> CacheResult<()> {
        if prev == INVALID {
            header.free_head.store(next, Ordering::Relaxed);
            Ok(())
        } else {
            self.write_u32(seg_base + prev + 4, next)
        }
    }

    fn check_block_bounds(&self, rel: u32, size: u32) -> CacheResult<()> {
        if rel < SEG_HEADER_SIZE
            || rel % 8 != 0
            || size < MIN_BLOCK_SIZE
            || size % 8 != 0
            || rel.saturating_add(size) > self.segment_size()
        {
            return Err(CacheError::Corrupted("allocator block out of bounds"));
        }
        Ok(())
    }

    /// Return a block to its segment's free list, coalescing with
    /// adjacent free blocks. Returns the number of bytes freed.
    pub(crate) fn free(&self, payload_offset: u32) -> CacheResult<u32> {
        let arena = self.region.layout().arena_offset;
        let seg_size = self.segment_size();
        if payload_offset < arena + SEG_HEADER_SIZE + BLOCK_HEADER_SIZE {
            return Err(CacheError::Corrupted("free of non-arena offset"));
        }
        let rel_arena = payload_offset - arena;
        let index = rel_arena / seg_size;
        if index >= self.segment_count() {
            return Err(CacheError::Corrupted("free past last segment"));
        }
        let seg_base = self.segment_base(index);
        let block = payload_offset - seg_base - BLOCK_HEADER_SIZE;
        self.check_block_bounds(block, MIN_BLOCK_SIZE)?;
        let size = self.block_size_at(seg_base, block)?;
        self.check_block_bounds(block, size)?;

        let header = self.seg_header(index)?;
        let max_steps = seg_size / MIN_BLOCK_SIZE + 1;

        // Find the insertion point: last free block before `block`.
        let mut prev = INVALID;
        let mut cur = header.free_head.load(Ordering::Relaxed);
        let mut steps = 0;
        while cur != INVALID && cur < block {
            steps += 1;
            if steps > max_steps {
                return Err(CacheError::Corrupted("free list cycle"));
            }
            prev = cur;
            cur = self.block_next_at(seg_base, cur)?;
        }
        if cur == block {
            return Err(CacheError::Corrupted("double free"));
        }
        if cur != INVALID && block + size > cur {
            return Err(CacheError::Corrupted("freed block overlaps free list"));
        }

        // Coalesce forward into `cur` when adjacent.
        let mut new_size = size;
        let mut new_next = cur;
        if cur != INVALID && block + size == cur {
            let cur_size = self.block_size_at(seg_base, cur)?;
            new_size += cur_size;
            new_next = self.block_next_at(seg_base, cur)?;
        }

        // Coalesce backward into `prev` when adjacent.
        if prev != INVALID {
            let prev_size = self.block_size_at(seg_base, prev)?;
            if prev + prev_size > block {
                return Err(CacheError::Corrupted("freed block overlaps free list"));
            }
            if prev + prev_size == block {
                self.set_block(seg_base, prev, prev_size + new_size, new_next)?;
                header.free_bytes.fetch_add(size, Ordering::Relaxed);
                header.live_blocks.fetch_sub(1, Ordering::Relaxed);
                self.region
                    .header()
                    .allocated_bytes
                    .fetch_sub(size as u64, Ordering::Relaxed);
                return Ok(size);
            }
        }

        self.set_block(seg_base, block, new_size, new_next)?;
        self.relink(header, seg_base, prev, block)?;
        header.free_bytes.fetch_add(size, Ordering::Relaxed);
        header.live_blocks.fetch_sub(1, Ordering::Relaxed);
        self.region
            .header()
            .allocated_bytes
            .fetch_sub(size as u64, Ordering::Relaxed);
        Ok(size)
    }

    /// Free bytes across all segments (diagnostic).
    #[cfg(test)]
    fn total_free_bytes(&self) -> CacheResult<u64> {
        let mut total = 0u64;
        for index in 0..self.segment_count() {
            total += self.seg_header(index)?.free_bytes.load(Ordering::Relaxed) as u64;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    fn test_region() -> Region {
        let config = CacheConfig::builder()
            .max_memory(1024 * 1024)
            .segment_size(4096)
            .max_key_count(64)
            .max_value_size(1024)
            .build()
            .unwrap();
        let (region, fresh) = Region::open(&config).unwrap();
        assert!(fresh);
        SegmentAllocator::new(&region).reset().unwrap();
        region
    }

    #[test]
    fn test_allocate_and_free_round_trip() {
        let region = test_region();
        let alloc = SegmentAllocator::new(&region);
        let before = alloc.total_free_bytes().unwrap();

        let a = alloc.allocate(100).unwrap();
        let b = alloc.allocate(200).unwrap();
        assert_ne!(a, b);
        assert!(region.header().allocated_bytes.load(Ordering::Relaxed) > 0);

        alloc.free(a).unwrap();
        alloc.free(b).unwrap();
        assert_eq!(alloc.total_free_bytes().unwrap(), before);
        assert_eq!(region.header().allocated_bytes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_freed_block_is_reused() {
        let region = test_region();
        let alloc = SegmentAllocator::new(&region);

        let a = alloc.allocate(512).unwrap();
        let allocated = region.header().allocated_bytes.load(Ordering::Relaxed);
        alloc.free(a).unwrap();

        // An equal-size allocation must succeed without growing usage.
        let b = alloc.allocate(512).unwrap();
        assert_eq!(
            region.header().allocated_bytes.load(Ordering::Relaxed),
            allocated
        );
        // First-fit from the same cursor lands on the same block.
        assert_eq!(a, b);
    }

    #[test]
    fn test_coalescing_allows_larger_allocation() {
        let region = test_region();
        let alloc = SegmentAllocator::new(&region);

        let a = alloc.allocate(504).unwrap();
        let b = alloc.allocate(504).unwrap();
        let c = alloc.allocate(504).unwrap();
        // a and b are adjacent; freeing both must merge them.
        alloc.free(b).unwrap();
        alloc.free(a).unwrap();

        let merged = alloc.allocate(1016).unwrap();
        assert_eq!(merged, a);
        alloc.free(merged).unwrap();
        alloc.free(c).unwrap();
    }

    #[test]
    fn test_no_space_when_exhausted() {
        let region = test_region();
        let alloc = SegmentAllocator::new(&region);
        let mut blocks = Vec::new();
        loop {
            match alloc.allocate(1000) {
                Ok(offset) => blocks.push(offset),
                Err(CacheError::NoSpace) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(!blocks.is_empty());
        // Freeing one block makes an equal allocation succeed again.
        alloc.free(blocks.pop().unwrap()).unwrap();
        assert!(alloc.allocate(1000).is_ok());
    }

    #[test]
    fn test_oversized_allocation_fails_fast() {
        let region = test_region();
        let alloc = SegmentAllocator::new(&region);
        assert!(matches!(alloc.allocate(8192), Err(CacheError::NoSpace)));
    }

    #[test]
    fn test_double_free_is_corruption() {
        let region = test_region();
        let alloc = SegmentAllocator::new(&region);
        let a = alloc.allocate(64).unwrap();
        alloc.free(a).unwrap();
        assert!(matches!(alloc.free(a), Err(CacheError::Corrupted(_))));
    }

    #[test]
    fn test_reset_restores_full_capacity() {
        let region = test_region();
        let alloc = SegmentAllocator::new(&region);
        let before = alloc.total_free_bytes().unwrap();
        for _ in 0..10 {
            alloc.allocate(128).unwrap();
        }
        alloc.reset().unwrap();
        assert_eq!(alloc.total_free_bytes().unwrap(), before);
        assert_eq!(region.header().allocated_bytes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_spills_to_next_segment() {
        let region = test_region();
        let alloc = SegmentAllocator::new(&region);
        // Nearly fill segment 0, then ask for more than its remainder.
        let a = alloc.allocate(3000).unwrap();
        let b = alloc.allocate(3000).unwrap();
        let seg = region.header().segment_size;
        assert_ne!(
            (a - region.layout().arena_offset) / seg,
            (b - region.layout().arena_offset) / seg
        );
    }
}
