//! Cross-process lock over the shared region.
//!
//! The lock lives inside the region header, not in a kernel object:
//! holders are unrelated processes that found each other only through
//! the shared mapping. Acquisition busy-polls with a bounded sleep per
//! attempt (`trylock_interval_us`) instead of blocking on an OS
//! primitive.
//!
//! A holder can die mid-critical-section, so waiters run deadlock
//! detection: once the same holder has held the lock longer than
//! `detect_deadlock_interval_ms`, the waiter probes whether the holder
//! process is still alive and, if not, forcibly clears the lock state
//! and retries. This trades a small window of undefined ownership
//! (between the crash and the next detection check) against the cache
//! becoming permanently unusable.
//!
//! Holder tags are `(pid << 32) | generation`; the generation counter
//! prevents a recycled pid from being mistaken for the dead holder.

use crate::config::LockPolicy;
use crate::error::{CacheError, CacheResult};
use crate::region::now_ms;
use crate::stats::LockStats;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Lock record in the region header. The all-zero state is "unheld".
#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct LockState {
    /// `(pid << 32) | generation` of the exclusive holder, 0 if none.
    holder: AtomicU64,
    /// When the current exclusive holder acquired, in wall-clock ms.
    held_since_ms: AtomicU64,
    /// Number of shared holders.
    readers: AtomicU32,
    /// Source for holder tag generations.
    generation: AtomicU32,
    /// Last time any reader acquired or released, in wall-clock ms.
    /// Staleness of this timestamp is how dead readers are recovered.
    reader_active_ms: AtomicU64,
    /// Successful exclusive acquisitions.
    total_count: AtomicU64,
    /// Failed attempts that led to a retry.
    retry_count: AtomicU64,
    /// Stale locks detected with a dead holder.
    detect_deadlock_count: AtomicU64,
    /// Stale locks forcibly cleared.
    unlock_deadlock_count: AtomicU64,
    /// Stale reader counts cleared. Kept apart from the deadlock
    /// counters, which track exclusive-holder recovery only.
    reader_recovery_count: AtomicU64,
}

impl LockState {
    /// Snapshot the lock counters.
    pub(crate) fn snapshot(&self) -> LockStats {
        LockStats {
            total_count: self.total_count.load(Ordering::Relaxed),
            retry_count: self.retry_count.load(Ordering::Relaxed),
            detect_deadlock_count: self.detect_deadlock_count.load(Ordering::Relaxed),
            unlock_deadlock_count: self.unlock_deadlock_count.load(Ordering::Relaxed),
            reader_recovery_count: self.reader_recovery_count.load(Ordering::Relaxed),
        }
    }
}

/// Liveness probe for lock holders.
///
/// The lock cannot know by itself whether a holder crashed; it asks
/// this trait. The default implementation signals the holder's pid with
/// `kill(pid, 0)`. Tests substitute a mock.
pub trait ProcessLiveness: Send + Sync {
    /// Whether the process with this pid is still running.
    fn is_alive(&self, pid: u32) -> bool;
}

/// Liveness probe backed by `kill(pid, 0)`.
#[derive(Debug, Default)]
pub struct KernelLiveness;

impl ProcessLiveness for KernelLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        // SAFETY: signal 0 performs only the existence/permission check.
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        // EPERM means the process exists but is not ours.
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

/// Scoped exclusive hold; releases on drop on every exit path.
#[derive(Debug)]
pub(crate) struct ExclusiveGuard<'a> {
    state: &'a LockState,
    tag: u64,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        // Release only if we still hold it: a waiter may have declared
        // us dead and forcibly cleared the lock.
        let _ = self
            .state
            .holder
            .compare_exchange(self.tag, 0, Ordering::Release, Ordering::Relaxed);
    }
}

/// Scoped shared hold; releases on drop on every exit path.
#[derive(Debug)]
pub(crate) struct SharedGuard<'a> {
    state: &'a LockState,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.state.reader_active_ms.store(now_ms(), Ordering::Relaxed);
        // Saturating: a recovery may already have zeroed the count.
        let _ = self
            .state
            .readers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                Some(r.saturating_sub(1))
            });
    }
}

/// Acquires and recovers the region lock for one process.
pub(crate) struct LockManager {
    policy: LockPolicy,
    liveness: Box<dyn ProcessLiveness>,
}

impl LockManager {
    pub(crate) fn new(policy: LockPolicy, liveness: Box<dyn ProcessLiveness>) -> Self {
        Self { policy, liveness }
    }

    fn make_tag(&self, state: &LockState) -> u64 {
        let generation = state.generation.fetch_add(1, Ordering::Relaxed);
        ((std::process::id() as u64) << 32) | generation as u64
    }

    #[inline]
    fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.policy.trylock_interval_us as u64)
    }

    /// Acquire the exclusive lock with the default attempt budget.
    pub(crate) fn acquire_exclusive<'a>(
        &self,
        state: &'a LockState,
    ) -> CacheResult<ExclusiveGuard<'a>> {
        self.acquire_exclusive_budget(state, self.policy.default_budget())
    }

    /// Acquire the exclusive lock, giving up after `budget` failed
    /// polling attempts.
    pub(crate) fn acquire_exclusive_budget<'a>(
        &self,
        state: &'a LockState,
        budget: u32,
    ) -> CacheResult<ExclusiveGuard<'a>> {
        let tag = self.make_tag(state);
        let mut attempts = 0u32;
        loop {
            if state
                .holder
                .compare_exchange(0, tag, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                state.held_since_ms.store(now_ms(), Ordering::Relaxed);
                let guard = ExclusiveGuard { state, tag };
                self.drain_readers(state, &mut attempts, budget)?;
                state.total_count.fetch_add(1, Ordering::Relaxed);
                return Ok(guard);
            }

            if self.recover_stale_holder(state) {
                // Cleared a dead holder's lock; retry immediately.
                continue;
            }

            state.retry_count.fetch_add(1, Ordering::Relaxed);
            attempts += 1;
            if attempts >= budget {
                return Err(CacheError::LockTimeout);
            }
            std::thread::sleep(self.poll_interval());
        }
    }

    /// Acquire a shared (read) hold with the default attempt budget.
    pub(crate) fn acquire_shared<'a>(&self, state: &'a LockState) -> CacheResult<SharedGuard<'a>> {
        self.acquire_shared_budget(state, self.policy.default_budget())
    }

    /// Acquire a shared hold, giving up after `budget` failed attempts.
    /// Readers coexist with each other but never overlap a writer.
    pub(crate) fn acquire_shared_budget<'a>(
        &self,
        state: &'a LockState,
        budget: u32,
    ) -> CacheResult<SharedGuard<'a>> {
        let mut attempts = 0u32;
        loop {
            if state.holder.load(Ordering::Acquire) == 0 {
                state.readers.fetch_add(1, Ordering::AcqRel);
                if state.holder.load(Ordering::Acquire) == 0 {
                    state.reader_active_ms.store(now_ms(), Ordering::Relaxed);
                    return Ok(SharedGuard { state });
                }
                // A writer won the race; back out and wait.
                let _ = state
                    .readers
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                        Some(r.saturating_sub(1))
                    });
            } else if self.recover_stale_holder(state) {
                continue;
            }

            state.retry_count.fetch_add(1, Ordering::Relaxed);
            attempts += 1;
            if attempts >= budget {
                return Err(CacheError::LockTimeout);
            }
            std::thread::sleep(self.poll_interval());
        }
    }

    /// Wait for existing readers to drain after taking the writer tag.
    /// Reader counts left behind by crashed readers are recovered once
    /// the reader-activity timestamp goes stale.
    fn drain_readers(
        &self,
        state: &LockState,
        attempts: &mut u32,
        budget: u32,
    ) -> CacheResult<()> {
        let detect_ms = self.policy.detect_deadlock_interval_ms as u64;
        loop {
            if state.readers.load(Ordering::Acquire) == 0 {
                return Ok(());
            }
            let last_active = state.reader_active_ms.load(Ordering::Relaxed);
            if now_ms().saturating_sub(last_active) >= detect_ms {
                log::warn!("clearing stale reader count after {detect_ms}ms of inactivity");
                state.readers.store(0, Ordering::Release);
                state.reader_recovery_count.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            *attempts += 1;
            if *attempts >= budget {
                // Guard drop releases the writer tag.
                return Err(CacheError::LockTimeout);
            }
            std::thread::sleep(self.poll_interval());
        }
    }

    /// If the current holder has been in place past the detection
    /// threshold and its process is dead, clear the lock.
    ///
    /// Returns `true` if the lock was cleared by this call.
    fn recover_stale_holder(&self, state: &LockState) -> bool {
        let observed = state.holder.load(Ordering::Acquire);
        if observed == 0 {
            return false;
        }
        let held_since = state.held_since_ms.load(Ordering::Relaxed);
        let held_for = now_ms().saturating_sub(held_since);
        if held_for < self.policy.detect_deadlock_interval_ms as u64 {
            return false;
        }
        let pid = (observed >> 32) as u32;
        if self.liveness.is_alive(pid) {
            return false;
        }
        state.detect_deadlock_count.fetch_add(1, Ordering::Relaxed);
        if state
            .holder
            .compare_exchange(observed, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            state.unlock_deadlock_count.fetch_add(1, Ordering::Relaxed);
            log::warn!("forcibly unlocked region lock held by dead process {pid} for {held_for}ms");
            true
        } else {
            // Another waiter cleared it first.
            false
        }
    }
}
