//! Atomic counters for thread-runtime observability.
//!
//! All counters use relaxed ordering; they are diagnostic, not
//! synchronization. Per-thread [`ThreadStats`] live inside the owning
//! [`Thread`](crate::Thread) and are folded into a global accumulator when
//! the thread is torn down, so totals survive thread exit.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-wide lifecycle counters.
pub struct RuntimeMetrics {
    /// Contexts handed out by the registry (fresh or reused).
    pub threads_created: AtomicU64,
    /// Threads that reached the Running state.
    pub threads_started: AtomicU64,
    /// Threads that finished.
    pub threads_finished: AtomicU64,
    /// Creations served from the dead-context quarantine.
    pub tids_reused: AtomicU64,
    /// Fake stacks mapped.
    pub fake_stacks_created: AtomicU64,
    /// Fake stacks destroyed.
    pub fake_stacks_destroyed: AtomicU64,
    /// `set_user_stack` rotations.
    pub stack_switches: AtomicU64,
    /// Post-fork recoveries run in a child.
    pub fork_recoveries: AtomicU64,
}

impl RuntimeMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            threads_created: AtomicU64::new(0),
            threads_started: AtomicU64::new(0),
            threads_finished: AtomicU64::new(0),
            tids_reused: AtomicU64::new(0),
            fake_stacks_created: AtomicU64::new(0),
            fake_stacks_destroyed: AtomicU64::new(0),
            stack_switches: AtomicU64::new(0),
            fork_recoveries: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter value.
    #[inline]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let dead = dead_thread_stats().snapshot();
        MetricsSnapshot {
            threads_created: Self::get(&self.threads_created),
            threads_started: Self::get(&self.threads_started),
            threads_finished: Self::get(&self.threads_finished),
            tids_reused: Self::get(&self.tids_reused),
            fake_stacks_created: Self::get(&self.fake_stacks_created),
            fake_stacks_destroyed: Self::get(&self.fake_stacks_destroyed),
            stack_switches: Self::get(&self.stack_switches),
            fork_recoveries: Self::get(&self.fork_recoveries),
            dead_threads: dead,
        }
    }
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`RuntimeMetrics`] plus the dead-thread totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub threads_created: u64,
    pub threads_started: u64,
    pub threads_finished: u64,
    pub tids_reused: u64,
    pub fake_stacks_created: u64,
    pub fake_stacks_destroyed: u64,
    pub stack_switches: u64,
    pub fork_recoveries: u64,
    pub dead_threads: ThreadStatsSnapshot,
}

static GLOBAL_METRICS: RuntimeMetrics = RuntimeMetrics::new();

/// Access the global metrics singleton.
#[must_use]
pub fn global_metrics() -> &'static RuntimeMetrics {
    &GLOBAL_METRICS
}

// ---------------------------------------------------------------------------
// Per-thread stats
// ---------------------------------------------------------------------------

/// Counters owned by a single thread. Only the owner writes them.
pub struct ThreadStats {
    pub fake_frames_allocated: AtomicU64,
    pub fake_frames_freed: AtomicU64,
    pub stack_switches: AtomicU64,
}

impl ThreadStats {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            fake_frames_allocated: AtomicU64::new(0),
            fake_frames_freed: AtomicU64::new(0),
            stack_switches: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> ThreadStatsSnapshot {
        ThreadStatsSnapshot {
            fake_frames_allocated: self.fake_frames_allocated.load(Ordering::Relaxed),
            fake_frames_freed: self.fake_frames_freed.load(Ordering::Relaxed),
            stack_switches: self.stack_switches.load(Ordering::Relaxed),
        }
    }

    /// Move these counts into `into` and zero them.
    pub fn flush_into(&self, into: &ThreadStats) {
        let moved = [
            (&self.fake_frames_allocated, &into.fake_frames_allocated),
            (&self.fake_frames_freed, &into.fake_frames_freed),
            (&self.stack_switches, &into.stack_switches),
        ];
        for (from, to) in moved {
            to.fetch_add(from.swap(0, Ordering::Relaxed), Ordering::Relaxed);
        }
    }
}

impl Default for ThreadStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ThreadStatsSnapshot {
    pub fake_frames_allocated: u64,
    pub fake_frames_freed: u64,
    pub stack_switches: u64,
}

static DEAD_THREAD_STATS: ThreadStats = ThreadStats::new();

/// Totals accumulated from threads that have been torn down.
#[must_use]
pub fn dead_thread_stats() -> &'static ThreadStats {
    &DEAD_THREAD_STATS
}
