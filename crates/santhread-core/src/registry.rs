//! Tid registry: a fixed-capacity, never-shrinking table of contexts.
//!
//! ## Design
//!
//! - **Arena**: contexts live in one lazily mapped, `MAP_NORESERVE` array
//!   indexed by tid. Pages are committed only as tids are handed out, and a
//!   context, once written, is never freed or moved, so a `&ThreadContext`
//!   borrowed from a `'static` registry stays valid for the process.
//! - **Lock**: a single `parking_lot::Mutex` around the bookkeeping. Every
//!   lookup and lifecycle transition goes through a [`RegistryLock`], so
//!   "caller holds the registry lock" is a type-level fact.
//! - **Quarantine**: dead contexts join an intrusive FIFO threaded through
//!   `ThreadContext::next_free`. A dead tid is reused only once the FIFO
//!   holds more than `quarantine_size` entries, or when every tid has been
//!   handed out. Reuse of a context still pointing at a live Thread is an
//!   error, never silent.

use core::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use log::debug;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use crate::config::RuntimeOptions;
use crate::context::{StackId, ThreadContext, ThreadStatus, Tid};
use crate::error::ThreadError;
use crate::metrics::{RuntimeMetrics, global_metrics};
use crate::raw_memory;
use crate::thread::Thread;
use crate::{INVALID_TID, MAIN_TID, MAX_THREADS};

struct RegistryState {
    arena: Option<NonNull<ThreadContext>>,
    /// Tids `0..allocated` have an initialised context.
    allocated: u32,
    dead_head: Tid,
    dead_tail: Tid,
    dead_len: u32,
    alive: u32,
    running: u32,
    max_alive: u32,
    total_created: u64,
}

// SAFETY: the arena pointer is only dereferenced while the mutex is held or
// through `&ThreadContext`, whose fields are all atomics.
unsafe impl Send for RegistryState {}

/// Process-wide table of [`ThreadContext`]s.
pub struct ThreadRegistry {
    state: Mutex<RegistryState>,
    capacity: u32,
    quarantine_size: AtomicU32,
}

impl ThreadRegistry {
    /// A registry handing out tids below `capacity`.
    #[must_use]
    pub const fn new(capacity: u32, quarantine_size: u32) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                arena: None,
                allocated: 0,
                dead_head: INVALID_TID,
                dead_tail: INVALID_TID,
                dead_len: 0,
                alive: 0,
                running: 0,
                max_alive: 0,
                total_created: 0,
            }),
            capacity,
            quarantine_size: AtomicU32::new(quarantine_size),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[must_use]
    pub fn quarantine_size(&self) -> u32 {
        self.quarantine_size.load(Ordering::Relaxed)
    }

    pub fn set_quarantine_size(&self, size: u32) {
        self.quarantine_size.store(size, Ordering::Relaxed);
    }

    /// Take the registry lock.
    pub fn lock(&self) -> RegistryLock<'_> {
        RegistryLock {
            registry: self,
            state: self.state.lock(),
        }
    }

    /// Take the lock and keep it held past this call (fork prepare).
    pub(crate) fn lock_for_fork(&self) {
        core::mem::forget(self.state.lock());
    }

    /// Release a lock taken by [`Self::lock_for_fork`].
    ///
    /// # Safety
    ///
    /// The lock must be held through `lock_for_fork` by this thread (or, in
    /// a forked child, by the thread that called fork).
    pub(crate) unsafe fn unlock_after_fork(&self) {
        // SAFETY: guaranteed held by the caller, with its guard forgotten.
        unsafe { self.state.force_unlock() };
    }

    fn arena_bytes(&self) -> usize {
        self.capacity as usize * core::mem::size_of::<ThreadContext>()
    }
}

impl Drop for ThreadRegistry {
    fn drop(&mut self) {
        if let Some(arena) = self.state.get_mut().arena.take() {
            // SAFETY: the arena was mapped with exactly this size and no
            // borrow of it can outlive `&mut self`.
            unsafe { raw_memory::unmap_pages(arena.cast(), self.arena_bytes()) };
        }
    }
}

static GLOBAL_REGISTRY: ThreadRegistry =
    ThreadRegistry::new(MAX_THREADS, RuntimeOptions::DEFAULT.thread_quarantine_size);

/// The registry every real thread is tracked in.
#[must_use]
pub fn global_registry() -> &'static ThreadRegistry {
    &GLOBAL_REGISTRY
}

/// Registry counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total_created: u64,
    pub alive: u32,
    pub running: u32,
    pub max_alive: u32,
    pub quarantined: u32,
    pub allocated: u32,
    pub capacity: u32,
}

// ---------------------------------------------------------------------------
// Locked access
// ---------------------------------------------------------------------------

/// Proof that the registry lock is held.
pub struct RegistryLock<'a> {
    registry: &'a ThreadRegistry,
    state: MutexGuard<'a, RegistryState>,
}

impl<'a> RegistryLock<'a> {
    /// Context for `tid`, if it was ever handed out.
    #[must_use]
    pub fn context(&self, tid: Tid) -> Option<&'a ThreadContext> {
        if tid >= self.state.allocated {
            return None;
        }
        let arena = self.state.arena?;
        // SAFETY: `tid < allocated` so the slot was initialised, and contexts
        // are never freed while the registry lives.
        Some(unsafe { &*arena.as_ptr().add(tid as usize) })
    }

    fn expect_context(&self, tid: Tid) -> Result<&'a ThreadContext, ThreadError> {
        self.context(tid).ok_or(ThreadError::UnknownTid { tid })
    }

    /// Visit every context ever handed out, in tid order.
    pub fn for_each(&self, mut f: impl FnMut(&'a ThreadContext)) {
        for tid in 0..self.state.allocated {
            if let Some(ctx) = self.context(tid) {
                f(ctx);
            }
        }
    }

    /// First context matching `pred`, in tid order.
    pub fn find(&self, mut pred: impl FnMut(&ThreadContext) -> bool) -> Option<&'a ThreadContext> {
        (0..self.state.allocated)
            .filter_map(|tid| self.context(tid))
            .find(|ctx| pred(ctx))
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            total_created: self.state.total_created,
            alive: self.state.alive,
            running: self.state.running,
            max_alive: self.state.max_alive,
            quarantined: self.state.dead_len,
            allocated: self.state.allocated,
            capacity: self.registry.capacity,
        }
    }

    fn ensure_arena(&mut self) -> Result<NonNull<ThreadContext>, ThreadError> {
        if let Some(arena) = self.state.arena {
            return Ok(arena);
        }
        let arena = raw_memory::map_pages(self.registry.arena_bytes(), "thread contexts", true)?
            .cast::<ThreadContext>();
        self.state.arena = Some(arena);
        Ok(arena)
    }

    /// Pick the context for a new thread: a quarantined one if the FIFO is
    /// over budget (or the tid space is full), else a fresh tid.
    fn acquire_context(&mut self) -> Result<(&'a ThreadContext, bool), ThreadError> {
        let over_quarantine = self.state.dead_len > self.registry.quarantine_size();
        let space_full = self.state.allocated >= self.registry.capacity;
        if self.state.dead_len > 0 && (over_quarantine || space_full) {
            let head = self.expect_context(self.state.dead_head)?;
            if head.has_live_thread() {
                return Err(ThreadError::LiveBackReference { tid: head.tid() });
            }
            self.pop_dead();
            return Ok((head, true));
        }
        if space_full {
            return Err(ThreadError::TidSpaceExhausted {
                capacity: self.registry.capacity,
            });
        }
        let arena = self.ensure_arena()?;
        let tid = self.state.allocated;
        // SAFETY: tid < capacity, inside the reserved arena; the slot has
        // never been handed out so nothing else references it.
        unsafe { arena.as_ptr().add(tid as usize).write(ThreadContext::new(tid)) };
        self.state.allocated += 1;
        Ok((self.expect_context(tid)?, false))
    }

    fn push_dead(&mut self, ctx: &ThreadContext) {
        ctx.set_status(ThreadStatus::Dead);
        ctx.next_free.store(INVALID_TID, Ordering::Relaxed);
        let tail = self.state.dead_tail;
        match self.context(tail) {
            Some(prev) => prev.next_free.store(ctx.tid(), Ordering::Relaxed),
            None => self.state.dead_head = ctx.tid(),
        }
        self.state.dead_tail = ctx.tid();
        self.state.dead_len += 1;
        self.state.alive = self.state.alive.saturating_sub(1);
    }

    fn pop_dead(&mut self) {
        let Some(head) = self.context(self.state.dead_head) else {
            return;
        };
        self.state.dead_head = head.next_free.swap(INVALID_TID, Ordering::Relaxed);
        if self.state.dead_head == INVALID_TID {
            self.state.dead_tail = INVALID_TID;
        }
        self.state.dead_len -= 1;
    }

    /// Unlink `tid` from anywhere in the dead FIFO. Returns whether found.
    fn unlink_dead(&mut self, tid: Tid) -> bool {
        let mut prev = INVALID_TID;
        let mut cur = self.state.dead_head;
        while let Some(ctx) = self.context(cur) {
            let next = ctx.next_free.load(Ordering::Relaxed);
            if cur == tid {
                match self.context(prev) {
                    Some(p) => p.next_free.store(next, Ordering::Relaxed),
                    None => self.state.dead_head = next,
                }
                if self.state.dead_tail == tid {
                    self.state.dead_tail = prev;
                }
                ctx.next_free.store(INVALID_TID, Ordering::Relaxed);
                self.state.dead_len -= 1;
                return true;
            }
            prev = cur;
            cur = next;
        }
        false
    }

    /// Register a new thread and fire the creation callback.
    pub fn create_thread(
        &mut self,
        parent_tid: Tid,
        detached: bool,
        user_id: usize,
        thread: *mut Thread,
        stack_id: StackId,
    ) -> Result<Tid, ThreadError> {
        let (ctx, reused) = self.acquire_context()?;
        ctx.on_created(parent_tid, stack_id, detached, user_id, thread, reused);

        self.state.total_created += 1;
        self.state.alive += 1;
        self.state.max_alive = self.state.max_alive.max(self.state.alive);

        let metrics = global_metrics();
        RuntimeMetrics::inc(&metrics.threads_created);
        if reused {
            RuntimeMetrics::inc(&metrics.tids_reused);
        }
        debug!(
            "T{} created by T{} (stack id {}, reused: {})",
            ctx.tid(),
            parent_tid,
            stack_id,
            reused
        );
        Ok(ctx.tid())
    }

    /// `Created → Running`.
    pub fn start_thread(&mut self, tid: Tid, os_id: u64) -> Result<(), ThreadError> {
        let ctx = self.expect_context(tid)?;
        let status = ctx.status();
        if status != ThreadStatus::Created {
            return Err(ThreadError::InvalidTransition {
                tid,
                actual: status,
                expected: ThreadStatus::Created,
            });
        }
        ctx.set_os_id(os_id);
        ctx.set_status(ThreadStatus::Running);
        self.state.running += 1;
        RuntimeMetrics::inc(&global_metrics().threads_started);
        debug!("T{tid} started (os id {os_id})");
        Ok(())
    }

    /// `Running → Finished`, or straight to `Dead` if detached. Fires the
    /// completion callback, clearing the back-reference.
    pub fn finish_thread(&mut self, tid: Tid) -> Result<(), ThreadError> {
        let ctx = self.expect_context(tid)?;
        let status = ctx.status();
        match status {
            ThreadStatus::Running => self.state.running -= 1,
            ThreadStatus::Created => {}
            _ => {
                return Err(ThreadError::InvalidTransition {
                    tid,
                    actual: status,
                    expected: ThreadStatus::Running,
                });
            }
        }
        ctx.on_finished();
        RuntimeMetrics::inc(&global_metrics().threads_finished);
        if ctx.detached() {
            self.push_dead(ctx);
        } else {
            ctx.set_status(ThreadStatus::Finished);
        }
        debug!("T{tid} finished");
        Ok(())
    }

    /// Joining retires a finished thread; a running one retires when it
    /// finishes.
    pub fn join_thread(&mut self, tid: Tid) -> Result<(), ThreadError> {
        let ctx = self.expect_context(tid)?;
        match ctx.status() {
            ThreadStatus::Finished => {
                self.push_dead(ctx);
                Ok(())
            }
            ThreadStatus::Created | ThreadStatus::Running if !ctx.detached() => {
                ctx.set_detached(true);
                Ok(())
            }
            actual => Err(ThreadError::InvalidTransition {
                tid,
                actual,
                expected: ThreadStatus::Finished,
            }),
        }
    }

    /// Detaching retires a finished thread; a live one retires at finish.
    pub fn detach_thread(&mut self, tid: Tid) -> Result<(), ThreadError> {
        let ctx = self.expect_context(tid)?;
        match ctx.status() {
            ThreadStatus::Finished => {
                self.push_dead(ctx);
                Ok(())
            }
            ThreadStatus::Created | ThreadStatus::Running => {
                ctx.set_detached(true);
                Ok(())
            }
            actual => Err(ThreadError::InvalidTransition {
                tid,
                actual,
                expected: ThreadStatus::Running,
            }),
        }
    }

    /// Child-side fork recovery. Only `survivor` still exists.
    ///
    /// Every other context still bound to a Thread (created or running)
    /// loses its back-reference and retires.
    /// If the survivor is not the main tid and the main context has no live
    /// thread, the survivor's Thread is rebound to the main tid and its old
    /// context retires. Returns the survivor's tid after recovery.
    pub fn recover_after_fork(&mut self, survivor: Tid, os_id: u64) -> Result<Tid, ThreadError> {
        let survivor_ctx = self.expect_context(survivor)?;
        for tid in 0..self.state.allocated {
            let Some(ctx) = self.context(tid) else {
                continue;
            };
            if tid == survivor || !ctx.has_live_thread() {
                continue;
            }
            if ctx.status() == ThreadStatus::Running {
                self.state.running -= 1;
            }
            ctx.on_finished();
            self.push_dead(ctx);
        }
        survivor_ctx.set_os_id(os_id);
        RuntimeMetrics::inc(&global_metrics().fork_recoveries);

        let rebind = survivor != MAIN_TID
            && self
                .context(MAIN_TID)
                .is_some_and(|main| !main.has_live_thread());
        if !rebind {
            debug!("fork child keeps T{survivor}");
            return Ok(survivor);
        }

        let main = self.expect_context(MAIN_TID)?;
        if main.status() == ThreadStatus::Dead {
            self.unlink_dead(MAIN_TID);
        } else {
            self.state.alive = self.state.alive.saturating_sub(1);
            if main.status() == ThreadStatus::Running {
                self.state.running -= 1;
            }
        }
        self.state.alive += 1;
        main.bind_thread(survivor_ctx.thread(), survivor_ctx.user_id());
        main.set_detached(survivor_ctx.detached());
        main.set_os_id(os_id);
        main.set_status(ThreadStatus::Running);

        survivor_ctx.on_finished();
        if survivor_ctx.status() == ThreadStatus::Running {
            self.state.running -= 1;
        }
        self.push_dead(survivor_ctx);
        self.state.running += 1;
        debug!("fork child rebound T{survivor} to T{MAIN_TID}");
        Ok(MAIN_TID)
    }
}
