//! Configuration types for the shared-memory cache.
//!
//! All settings are fixed at region creation. Processes attaching to an
//! existing region must present a matching configuration: the layout
//! parameters are echoed into the region header and verified on attach.

use crate::error::{CacheError, CacheResult};
use crate::hash::HashKind;

/// Maximum key length in bytes. Keys are stored inline in the shared
/// entry table, so the bound is part of the region layout.
pub const MAX_KEY_SIZE: usize = 64;

/// Default region size (64MB).
pub const DEFAULT_MAX_MEMORY: u64 = 64 * 1024 * 1024;

/// Default segment size (1MB).
pub const DEFAULT_SEGMENT_SIZE: u32 = 1024 * 1024;

/// Default maximum live key count.
pub const DEFAULT_MAX_KEY_COUNT: u32 = 65_536;

/// Default per-value size ceiling (64KB).
pub const DEFAULT_MAX_VALUE_SIZE: u32 = 64 * 1024;

/// Kind of backing store for the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreType {
    /// Anonymous private mapping. Not reachable from unrelated
    /// processes; intended for single-process use and tests.
    #[default]
    Anonymous,
    /// POSIX shared memory object (`shm_open`), named by `filename`.
    Shm,
    /// Regular file mapping, at the path in `filename`.
    File,
}

/// Tuning for the recycle (memory reclamation) policy.
#[derive(Debug, Clone, Copy)]
pub struct ValueRecyclePolicy {
    /// Expected average entry lifetime in seconds. When non-zero,
    /// valid entries younger than this are not force-evicted; the pass
    /// keeps scanning older entries instead. Zero disables the floor.
    pub avg_key_ttl: u32,
    /// Bytes to free per recycle pass before the pass stops.
    pub discard_memory_size: u64,
    /// Allocation failures a valid entry may absorb before the policy
    /// treats it as evictable under pressure.
    pub max_fail_times: u32,
    /// Pacing delay (microseconds) before force-evicting a
    /// not-yet-expired entry.
    pub sleep_us_when_recycle_valid_entries: u32,
}

impl Default for ValueRecyclePolicy {
    fn default() -> Self {
        Self {
            avg_key_ttl: 0,
            discard_memory_size: 128 * 1024,
            max_fail_times: 5,
            sleep_us_when_recycle_valid_entries: 1000,
        }
    }
}

/// Tuning for cross-process lock acquisition.
#[derive(Debug, Clone, Copy)]
pub struct LockPolicy {
    /// Polling interval per failed lock-acquisition attempt, in
    /// microseconds.
    pub trylock_interval_us: u32,
    /// How long one holder may hold the lock before waiters start
    /// liveness-checking it, in milliseconds.
    pub detect_deadlock_interval_ms: u32,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            trylock_interval_us: 200,
            detect_deadlock_interval_ms: 1000,
        }
    }
}

impl LockPolicy {
    /// Default acquisition attempt budget: enough polling to cross the
    /// deadlock-detection threshold twice.
    pub(crate) fn default_budget(&self) -> u32 {
        let interval = self.trylock_interval_us.max(1) as u64;
        let budget = (self.detect_deadlock_interval_ms as u64 * 1000 * 2) / interval;
        budget.clamp(64, u32::MAX as u64) as u32
    }
}

/// Cache configuration, supplied once at region creation/attach.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Identifies the backing store: a path for `StoreType::File`, a
    /// shared memory object name for `StoreType::Shm`, ignored for
    /// `StoreType::Anonymous`.
    pub filename: String,
    /// Total region size in bytes. Fixed; never resized while attached.
    pub max_memory: u64,
    /// Size of each allocator segment in bytes.
    pub segment_size: u32,
    /// Hash index capacity in live entries.
    pub max_key_count: u32,
    /// Per-entry value size ceiling, enforced on `set`.
    pub max_value_size: u32,
    /// Backing-store kind.
    pub store: StoreType,
    /// Grant the pre-eviction grace sleep to a key at most once per
    /// insertion lifetime.
    pub recycle_key_once: bool,
    /// Hash function for the shared index.
    pub hash: HashKind,
    /// Recycle policy tuning.
    pub va_policy: ValueRecyclePolicy,
    /// Lock acquisition tuning.
    pub lock_policy: LockPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            filename: String::new(),
            max_memory: DEFAULT_MAX_MEMORY,
            segment_size: DEFAULT_SEGMENT_SIZE,
            max_key_count: DEFAULT_MAX_KEY_COUNT,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
            store: StoreType::Anonymous,
            recycle_key_once: false,
            hash: HashKind::default(),
            va_policy: ValueRecyclePolicy::default(),
            lock_policy: LockPolicy::default(),
        }
    }
}

impl CacheConfig {
    /// Create a builder with defaults.
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validate scalar settings. Layout-level checks (does the arena
    /// hold at least one segment, does `max_value_size` fit a segment)
    /// run again with exact numbers when the region is laid out.
    pub fn validate(&self) -> CacheResult<()> {
        if self.max_memory == 0 {
            return Err(CacheError::InvalidConfig("max_memory must be non-zero"));
        }
        if self.max_memory > u32::MAX as u64 {
            return Err(CacheError::InvalidConfig(
                "max_memory must fit in 32-bit offsets (max 4GB)",
            ));
        }
        if self.segment_size == 0 || self.segment_size % 8 != 0 {
            return Err(CacheError::InvalidConfig(
                "segment_size must be non-zero and 8-byte aligned",
            ));
        }
        if self.segment_size as u64 > self.max_memory {
            return Err(CacheError::InvalidConfig(
                "segment_size must not exceed max_memory",
            ));
        }
        if self.max_key_count == 0 {
            return Err(CacheError::InvalidConfig("max_key_count must be non-zero"));
        }
        // The bucket count is max_key_count rounded up to a power of
        // two; anything past 2^31 has no u32 power of two to round to.
        if self.max_key_count > 1 << 31 {
            return Err(CacheError::InvalidConfig(
                "max_key_count must not exceed 2^31",
            ));
        }
        if self.max_value_size == 0 {
            return Err(CacheError::InvalidConfig("max_value_size must be non-zero"));
        }
        match self.store {
            StoreType::Anonymous => {}
            StoreType::Shm | StoreType::File => {
                if self.filename.is_empty() {
                    return Err(CacheError::InvalidConfig(
                        "filename required for shm/file stores",
                    ));
                }
            }
        }
        if self.lock_policy.trylock_interval_us == 0 {
            return Err(CacheError::InvalidConfig(
                "trylock_interval_us must be non-zero",
            ));
        }
        if self.lock_policy.detect_deadlock_interval_ms == 0 {
            return Err(CacheError::InvalidConfig(
                "detect_deadlock_interval_ms must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Builder for [`CacheConfig`].
#[derive(Debug, Default, Clone)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    /// Set the backing store path/name.
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.config.filename = filename.into();
        self
    }

    /// Set the total region size in bytes.
    pub fn max_memory(mut self, bytes: u64) -> Self {
        self.config.max_memory = bytes;
        self
    }

    /// Set the allocator segment size in bytes.
    pub fn segment_size(mut self, bytes: u32) -> Self {
        self.config.segment_size = bytes;
        self
    }

    /// Set the hash index capacity.
    pub fn max_key_count(mut self, count: u32) -> Self {
        self.config.max_key_count = count;
        self
    }

    /// Set the per-value size ceiling.
    pub fn max_value_size(mut self, bytes: u32) -> Self {
        self.config.max_value_size = bytes;
        self
    }

    /// Set the backing-store kind.
    pub fn store(mut self, store: StoreType) -> Self {
        self.config.store = store;
        self
    }

    /// Limit each key to one recycle grace per insertion lifetime.
    pub fn recycle_key_once(mut self, enabled: bool) -> Self {
        self.config.recycle_key_once = enabled;
        self
    }

    /// Select the hash function.
    pub fn hash(mut self, hash: HashKind) -> Self {
        self.config.hash = hash;
        self
    }

    /// Set the recycle policy tuning.
    pub fn va_policy(mut self, policy: ValueRecyclePolicy) -> Self {
        self.config.va_policy = policy;
        self
    }

    /// Set the lock tuning.
    pub fn lock_policy(mut self, policy: LockPolicy) -> Self {
        self.config.lock_policy = policy;
        self
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> CacheResult<CacheConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
