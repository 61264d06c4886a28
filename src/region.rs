//! The shared memory region backing one cache instance.
//!
//! A region is a single contiguous mapping with a fixed size, created
//! once and attached by any number of processes. Because each process
//! may map it at a different base address, nothing inside the region is
//! ever a pointer: all cross-references are 32-bit byte offsets from
//! the region base, or indices into the entry table.
//!
//! # Memory layout
//!
//! ```text
//! +--------------+---------------------+--------------------+------------------+
//! | RegionHeader | bucket array        | entry table        | segment arena    |
//! | (cacheline-  | u32 * bucket_count  | Entry * max_keys   | n * segment_size |
//! |  aligned)    |                     |                    |                  |
//! +--------------+---------------------+--------------------+------------------+
//! ```
//!
//! The header carries a fingerprint of the layout-affecting settings.
//! Attaching with a different configuration is refused: the table and
//! arena geometry are baked into shared state.
//!
//! Creation of a shared store is claimed atomically through the magic
//! word: exactly one opener initializes the region, every other opener
//! waits for the `ready` flag.

use crate::config::{CacheConfig, StoreType, MAX_KEY_SIZE};
use crate::error::{CacheError, CacheResult};
use crate::lock::LockState;
use std::fs::OpenOptions;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Magic value marking an initialized region ("SHMCACHE").
const MAGIC: u64 = 0x5348_4d43_4143_4845;

/// Magic value while the creating process lays the region out
/// ("SHMCINIT"). Losers of the creation claim see this and wait.
const MAGIC_INIT: u64 = 0x5348_4d43_494e_4954;

/// Layout version. Bump on any incompatible header/entry change.
const LAYOUT_VERSION: u32 = 1;

/// Value of `RegionHeader::ready` once initialization is complete.
const REGION_READY: u32 = 0x5244_5921;

/// Null offset / null entry index.
pub(crate) const INVALID: u32 = u32::MAX;

/// Size of one entry record in the shared entry table.
/// 10 u32 fields plus the inline key.
pub(crate) const ENTRY_SIZE: u32 = 40 + MAX_KEY_SIZE as u32;

/// Coarse wall-clock seconds since the epoch.
#[inline]
pub(crate) fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Wall-clock milliseconds since the epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Best-effort operation counters, all relaxed.
#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct OpCounters {
    pub gets: AtomicU64,
    pub get_hits: AtomicU64,
    pub sets: AtomicU64,
    pub deletes: AtomicU64,
    pub recycle_passes: AtomicU64,
    pub entries_recycled: AtomicU64,
}

/// Header at offset 0 of the region.
///
/// Plain fields are written once during initialization (before `ready`
/// is published) and read-only afterwards. Everything mutated at
/// runtime is atomic: non-lock-holding processes read these fields for
/// `stats()`, and the lock words themselves are the synchronization.
#[repr(C, align(64))]
pub(crate) struct RegionHeader {
    /// `MAGIC_INIT` while the winning opener lays the region out,
    /// `MAGIC` afterwards. The creation claim is a CAS on this word.
    pub magic: AtomicU64,

    // -- fingerprint, immutable once `ready` is published --
    pub version: u32,
    pub hash_kind: u32,
    pub max_memory: u32,
    pub segment_size: u32,
    pub max_key_count: u32,
    pub max_value_size: u32,
    pub recycle_key_once: u32,
    pub bucket_count: u32,
    pub segment_count: u32,
    pub buckets_offset: u32,
    pub entries_offset: u32,
    pub arena_offset: u32,

    // -- entry management, mutated under the exclusive lock --
    pub entry_free_head: AtomicU32,
    pub order_head: AtomicU32,
    pub order_tail: AtomicU32,
    pub live_entries: AtomicU32,
    /// Segment index where the next allocation scan starts.
    pub alloc_cursor: AtomicU32,

    // -- allocator accounting --
    pub allocated_bytes: AtomicU64,
    pub used_bytes: AtomicU64,

    // -- cross-process lock --
    pub lock: LockState,

    // -- diagnostics --
    pub counters: OpCounters,

    /// `REGION_READY` once initialization completed.
    pub ready: AtomicU32,
}

/// Computed section geometry for a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RegionLayout {
    pub bucket_count: u32,
    pub buckets_offset: u32,
    pub entries_offset: u32,
    pub arena_offset: u32,
    pub segment_count: u32,
}

#[inline]
fn align_up(v: u64, align: u64) -> u64 {
    (v + align - 1) & !(align - 1)
}

impl RegionLayout {
    /// Compute the layout for a configuration, or fail if the region
    /// cannot hold the metadata plus at least one segment.
    pub(crate) fn compute(config: &CacheConfig) -> CacheResult<Self> {
        let bucket_count = config.max_key_count.next_power_of_two();
        let header_size = align_up(std::mem::size_of::<RegionHeader>() as u64, 64);
        let buckets_offset = header_size;
        let entries_offset = align_up(buckets_offset + bucket_count as u64 * 4, 8);
        let arena_offset = align_up(
            entries_offset + config.max_key_count as u64 * ENTRY_SIZE as u64,
            64,
        );
        if arena_offset >= config.max_memory {
            return Err(CacheError::InvalidConfig(
                "max_memory too small for index metadata",
            ));
        }
        let segment_count = (config.max_memory - arena_offset) / config.segment_size as u64;
        if segment_count == 0 {
            return Err(CacheError::InvalidConfig(
                "max_memory too small to hold one segment after metadata",
            ));
        }
        let usable = crate::alloc::max_block_payload(config.segment_size);
        if (config.max_value_size as u64) > usable {
            return Err(CacheError::InvalidConfig(
                "max_value_size does not fit in one segment",
            ));
        }
        Ok(Self {
            bucket_count,
            buckets_offset: buckets_offset as u32,
            entries_offset: entries_offset as u32,
            arena_offset: arena_offset as u32,
            segment_count: segment_count.min(u32::MAX as u64) as u32,
        })
    }
}

#[derive(Debug)]
enum Backing {
    Anonymous(memmap2::MmapMut),
    File {
        map: memmap2::MmapMut,
        _file: std::fs::File,
    },
}

/// The mapped shared region.
#[derive(Debug)]
pub(crate) struct Region {
    /// Owns the mapping; never read after `base` is taken.
    _backing: Backing,
    base: NonNull<u8>,
    len: usize,
    layout: RegionLayout,
}

// SAFETY: the mapping lives until drop; all runtime-mutable state in it
// is atomic or guarded by the cross-process lock.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Map (and, if absent, create) the region for `config`.
    ///
    /// Returns the region and whether this call created a fresh,
    /// not-yet-initialized store (the caller must build the index and
    /// allocator structures and then call [`Region::mark_ready`]).
    pub(crate) fn open(config: &CacheConfig) -> CacheResult<(Self, bool)> {
        config.validate()?;
        let layout = RegionLayout::compute(config)?;
        let len = config.max_memory as usize;

        let backing = match config.store {
            StoreType::Anonymous => {
                let map = memmap2::MmapOptions::new().len(len).map_anon()?;
                Backing::Anonymous(map)
            }
            StoreType::File => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(&config.filename)?;
                file.set_len(len as u64)?;
                let map = unsafe { memmap2::MmapOptions::new().map_mut(&file)? };
                Backing::File { map, _file: file }
            }
            StoreType::Shm => {
                let file = shm_open_file(&config.filename)?;
                file.set_len(len as u64)?;
                let map = unsafe { memmap2::MmapOptions::new().map_mut(&file)? };
                Backing::File { map, _file: file }
            }
        };

        let base = match &backing {
            Backing::Anonymous(map) => map.as_ptr() as *mut u8,
            Backing::File { map, .. } => map.as_ptr() as *mut u8,
        };
        let region = Self {
            _backing: backing,
            base: NonNull::new(base).ok_or(CacheError::Corrupted("null mapping"))?,
            len,
            layout,
        };

        let header = region.header();
        // Exactly one opener wins the creation claim; every other
        // opener waits for it to publish the initialized region.
        let fresh = match header.magic.compare_exchange(
            0,
            MAGIC_INIT,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                region.write_fingerprint(config);
                true
            }
            Err(MAGIC) | Err(MAGIC_INIT) => {
                region.wait_ready()?;
                region.check_fingerprint(config)?;
                false
            }
            Err(_) => return Err(CacheError::Corrupted("bad region magic")),
        };
        Ok((region, fresh))
    }

    /// Remove the backing store for a named region. The mapping of any
    /// still-attached process stays valid until it unmaps.
    pub(crate) fn remove_store(config: &CacheConfig) -> CacheResult<()> {
        match config.store {
            StoreType::Anonymous => Ok(()),
            StoreType::File => {
                std::fs::remove_file(&config.filename)?;
                Ok(())
            }
            StoreType::Shm => {
                let name = shm_name_cstring(&config.filename)?;
                let rc = unsafe { libc::shm_unlink(name.as_ptr()) };
                if rc != 0 {
                    return Err(std::io::Error::last_os_error().into());
                }
                Ok(())
            }
        }
    }

    fn write_fingerprint(&self, config: &CacheConfig) {
        let header = self.base.as_ptr() as *mut RegionHeader;
        // SAFETY: this process won the creation claim; no other opener
        // touches these fields before `ready` is published.
        unsafe {
            (*header).version = LAYOUT_VERSION;
            (*header).hash_kind = config.hash.to_id();
            (*header).max_memory = config.max_memory as u32;
            (*header).segment_size = config.segment_size;
            (*header).max_key_count = config.max_key_count;
            (*header).max_value_size = config.max_value_size;
            (*header).recycle_key_once = config.recycle_key_once as u32;
            (*header).bucket_count = self.layout.bucket_count;
            (*header).segment_count = self.layout.segment_count;
            (*header).buckets_offset = self.layout.buckets_offset;
            (*header).entries_offset = self.layout.entries_offset;
            (*header).arena_offset = self.layout.arena_offset;
        }
        self.header().magic.store(MAGIC, Ordering::Release);
    }

    /// Publish the region as fully initialized.
    pub(crate) fn mark_ready(&self) {
        self.header().ready.store(REGION_READY, Ordering::Release);
    }

    fn wait_ready(&self) -> CacheResult<()> {
        // An attacher can race the creator between fingerprint write
        // and index initialization; give the creator a moment.
        for _ in 0..1000 {
            if self.header().ready.load(Ordering::Acquire) == REGION_READY {
                return Ok(());
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        Err(CacheError::Corrupted("region never became ready"))
    }

    fn check_fingerprint(&self, config: &CacheConfig) -> CacheResult<()> {
        let header = self.header();
        if header.version != LAYOUT_VERSION {
            return Err(CacheError::Corrupted("layout version mismatch"));
        }
        if crate::hash::HashKind::from_id(header.hash_kind).is_none() {
            return Err(CacheError::Corrupted("unknown hash identifier"));
        }
        let matches = header.hash_kind == config.hash.to_id()
            && header.max_memory as u64 == config.max_memory
            && header.segment_size == config.segment_size
            && header.max_key_count == config.max_key_count
            && header.max_value_size == config.max_value_size
            && header.recycle_key_once == config.recycle_key_once as u32;
        if !matches {
            log::warn!("attach refused: configuration differs from region fingerprint");
            return Err(CacheError::InvalidConfig(
                "configuration does not match the existing region",
            ));
        }
        Ok(())
    }

    /// The section geometry.
    #[inline]
    pub(crate) fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    /// Total mapped size in bytes.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// The region header.
    #[inline]
    pub(crate) fn header(&self) -> &RegionHeader {
        // SAFETY: offset 0 is always mapped; header is page-aligned.
        unsafe { &*(self.base.as_ptr() as *const RegionHeader) }
    }

    /// Raw pointer to an offset. The caller is responsible for bounds
    /// (use [`Region::check_range`]) and for the lock discipline.
    #[inline]
    pub(crate) unsafe fn ptr_at(&self, offset: u32) -> *mut u8 {
        self.base.as_ptr().add(offset as usize)
    }

    /// Verify that `[offset, offset + len)` lies inside the region.
    #[inline]
    pub(crate) fn check_range(&self, offset: u32, len: usize) -> CacheResult<()> {
        let end = offset as usize + len;
        if offset == INVALID || end > self.len {
            return Err(CacheError::Corrupted("offset out of region bounds"));
        }
        Ok(())
    }

    /// Copy bytes out of the region.
    pub(crate) fn read_bytes(&self, offset: u32, len: usize) -> CacheResult<Vec<u8>> {
        self.check_range(offset, len)?;
        let mut out = vec![0u8; len];
        // SAFETY: range checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr_at(offset), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    /// Copy bytes into the region. Caller must hold the exclusive lock.
    pub(crate) fn write_bytes(&self, offset: u32, data: &[u8]) -> CacheResult<()> {
        self.check_range(offset, data.len())?;
        // SAFETY: range checked above; writers are serialized.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr_at(offset), data.len());
        }
        Ok(())
    }
}

fn shm_name_cstring(name: &str) -> CacheResult<std::ffi::CString> {
    std::ffi::CString::new(name)
        .map_err(|_| CacheError::InvalidConfig("shm name contains a NUL byte"))
}

/// Open (creating if needed) a POSIX shared memory object and wrap the
/// descriptor in a `File` so `memmap2` and `set_len` apply unchanged.
fn shm_open_file(name: &str) -> CacheResult<std::fs::File> {
    use std::os::unix::io::FromRawFd;

    let cname = shm_name_cstring(name)?;
    // SAFETY: valid NUL-terminated name; flags are plain open flags.
    let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR | libc::O_CREAT, 0o600) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: fd is owned by us and valid.
    Ok(unsafe { std::fs::File::from_raw_fd(fd) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    fn small_config() -> CacheConfig {
        CacheConfig::builder()
            .max_memory(1024 * 1024)
            .segment_size(64 * 1024)
            .max_key_count(128)
            .max_value_size(4096)
            .build()
            .unwrap()
    }

    #[test]
    fn test_layout_sections_are_ordered_and_aligned() {
        let config = small_config();
        let layout = RegionLayout::compute(&config).unwrap();
        assert!(layout.buckets_offset >= std::mem::size_of::<RegionHeader>() as u32);
        assert!(layout.entries_offset > layout.buckets_offset);
        assert!(layout.arena_offset > layout.entries_offset);
        assert_eq!(layout.arena_offset % 64, 0);
        assert_eq!(layout.entries_offset % 8, 0);
        assert!(layout.segment_count >= 1);
        assert_eq!(layout.bucket_count, 128);
    }

    #[test]
    fn test_layout_rejects_tiny_region() {
        let config = CacheConfig::builder()
            .max_memory(8192)
            .segment_size(8192)
            .max_key_count(1024)
            .max_value_size(64)
            .build()
            .unwrap();
        assert!(matches!(
            RegionLayout::compute(&config),
            Err(CacheError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_anonymous_open_is_fresh() {
        let config = small_config();
        let (region, fresh) = Region::open(&config).unwrap();
        assert!(fresh);
        assert_eq!(region.len(), 1024 * 1024);
        assert_eq!(region.header().magic.load(Ordering::Relaxed), MAGIC);
        assert_eq!(region.header().bucket_count, 128);
    }

    #[test]
    fn test_attach_never_reclaims_the_creation_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.shm");
        let mut config = small_config();
        config.store = StoreType::File;
        config.filename = path.to_str().unwrap().to_string();

        let (region, fresh) = Region::open(&config).unwrap();
        assert!(fresh);

        // The creator has not published `ready` yet. A second opener
        // must not win the creation claim a second time (which would
        // wipe the creator's work); it waits and eventually gives up.
        let err = Region::open(&config).unwrap_err();
        assert!(matches!(err, CacheError::Corrupted(_)));
        assert_eq!(region.header().magic.load(Ordering::Relaxed), MAGIC);
    }

    #[test]
    fn test_file_region_attach_checks_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.shm");
        let mut config = small_config();
        config.store = StoreType::File;
        config.filename = path.to_str().unwrap().to_string();

        let (region, fresh) = Region::open(&config).unwrap();
        assert!(fresh);
        region.mark_ready();
        drop(region);

        // Re-attach with the same config succeeds.
        let (_region, fresh) = Region::open(&config).unwrap();
        assert!(!fresh);

        // A different value ceiling is refused.
        let mut other = config.clone();
        other.max_value_size = 1024;
        assert!(matches!(
            Region::open(&other),
            Err(CacheError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_range_checks() {
        let config = small_config();
        let (region, _) = Region::open(&config).unwrap();
        assert!(region.check_range(0, 64).is_ok());
        assert!(region.check_range(1024 * 1024 - 8, 8).is_ok());
        assert!(region.check_range(1024 * 1024 - 4, 8).is_err());
        assert!(region.check_range(INVALID, 1).is_err());
    }

    #[test]
    fn test_read_write_round_trip() {
        let config = small_config();
        let (region, _) = Region::open(&config).unwrap();
        let offset = region.layout().arena_offset;
        region.write_bytes(offset, b"hello region").unwrap();
        assert_eq!(region.read_bytes(offset, 12).unwrap(), b"hello region");
    }
}
