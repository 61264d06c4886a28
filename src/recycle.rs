//! Memory reclamation under pressure.
//!
//! The engine runs one recycle pass when a `set` hits `NoSpace` or
//! `TableFull`. The pass walks entries oldest-first along the
//! creation-order list:
//!
//! - expired entries are evicted unconditionally;
//! - a not-yet-expired entry is force-evicted only while the pass is
//!   still short of `discard_memory_size` freed bytes AND the entry has
//!   absorbed `max_fail_times` allocation failures, with a pacing sleep
//!   of `sleep_us_when_recycle_valid_entries` first - a deliberate
//!   trade: sacrifice a still-valid entry to keep the cache writable,
//!   but give in-flight work a grace window;
//! - a valid entry below the failure threshold absorbs the current
//!   failure (`fail_count += 1`) and survives.
//!
//! The pass stops once `discard_memory_size` bytes are freed or the
//! list is exhausted.
//!
//! With `recycle_key_once`, the first forced-eviction attempt on an
//! entry is absorbed: the entry is marked, given the grace sleep, and
//! spared; only a later pass evicts it (without sleeping again). The
//! mark lives on the entry, so re-inserting the key starts a fresh
//! lifetime with a fresh grace.

use crate::alloc::SegmentAllocator;
use crate::config::ValueRecyclePolicy;
use crate::error::CacheResult;
use crate::region::{Region, INVALID};
use crate::table::{HashTable, FLAG_RECYCLE_ATTEMPTED};
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Result of one recycle pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PassOutcome {
    /// Bytes returned to the allocator (block headers included).
    pub freed_bytes: u64,
    /// Entries evicted (expired or forced).
    pub evicted: u32,
}

/// The reclamation pass. Runs only under the exclusive lock.
pub(crate) struct RecyclePolicy {
    va: ValueRecyclePolicy,
    recycle_key_once: bool,
}

impl RecyclePolicy {
    pub(crate) fn new(va: ValueRecyclePolicy, recycle_key_once: bool) -> Self {
        Self {
            va,
            recycle_key_once,
        }
    }

    /// Run one pass, oldest entries first.
    pub(crate) fn run_pass(
        &self,
        region: &Region,
        table: &HashTable<'_>,
        alloc: &SegmentAllocator<'_>,
        now: u32,
    ) -> CacheResult<PassOutcome> {
        let header = region.header();
        let mut outcome = PassOutcome::default();
        let max_steps = header.max_key_count + 1;

        let mut cur = table.order_head();
        let mut steps = 0;
        while cur != INVALID {
            steps += 1;
            if steps > max_steps {
                return Err(crate::error::CacheError::Corrupted("order list cycle"));
            }
            let (next, expired, young, fail_count, attempted) = {
                let entry = table.entry(cur)?;
                (
                    entry.order_next,
                    entry.is_expired(now),
                    self.va.avg_key_ttl > 0
                        && now.saturating_sub(entry.created) < self.va.avg_key_ttl,
                    entry.fail_count,
                    entry.flags & FLAG_RECYCLE_ATTEMPTED != 0,
                )
            };

            if expired {
                outcome.freed_bytes += self.evict(region, table, alloc, cur)? as u64;
                outcome.evicted += 1;
                cur = next;
                continue;
            }
            if outcome.freed_bytes >= self.va.discard_memory_size {
                break;
            }
            if young {
                cur = next;
                continue;
            }

            if fail_count >= self.va.max_fail_times {
                if self.recycle_key_once && !attempted {
                    // One graced attempt per insertion lifetime: mark,
                    // sleep, and spare the entry this time.
                    table.entry_mut(cur)?.flags |= FLAG_RECYCLE_ATTEMPTED;
                    self.grace_sleep();
                } else {
                    if !self.recycle_key_once {
                        self.grace_sleep();
                    }
                    outcome.freed_bytes += self.evict(region, table, alloc, cur)? as u64;
                    outcome.evicted += 1;
                }
            } else {
                // The entry absorbs this allocation failure.
                table.entry_mut(cur)?.fail_count = fail_count + 1;
            }
            cur = next;
        }

        header.counters.recycle_passes.fetch_add(1, Ordering::Relaxed);
        header
            .counters
            .entries_recycled
            .fetch_add(outcome.evicted as u64, Ordering::Relaxed);
        log::debug!(
            "recycle pass freed {} bytes, evicted {} entries",
            outcome.freed_bytes,
            outcome.evicted
        );
        Ok(outcome)
    }

    fn grace_sleep(&self) {
        let us = self.va.sleep_us_when_recycle_valid_entries;
        if us > 0 {
            std::thread::sleep(Duration::from_micros(us as u64));
        }
    }

    fn evict(
        &self,
        region: &Region,
        table: &HashTable<'_>,
        alloc: &SegmentAllocator<'_>,
        index: u32,
    ) -> CacheResult<u32> {
        let (value_offset, value_len) = table.remove_index(index)?;
        let mut freed = 0;
        if value_offset != INVALID {
            freed = alloc.free(value_offset)?;
        }
        region
            .header()
            .used_bytes
            .fetch_sub(value_len as u64, Ordering::Relaxed);
        Ok(freed)
    }
}
