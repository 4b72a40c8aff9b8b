//! Durable per-tid records.
//!
//! A [`ThreadContext`] is created the first time its tid is handed out and
//! is never destroyed, so reports can still name a thread long after it
//! exited. While the thread lives, the context holds a back-reference to its
//! [`Thread`]; teardown clears it.
//!
//! Every field is atomic because contexts live in a shared arena. Mutation
//! happens under the registry lock or by the owning thread; other readers
//! get a possibly-stale snapshot.

use core::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

use crate::platform::PTHREAD_DESTRUCTOR_ITERATIONS;
use crate::thread::Thread;
use crate::INVALID_TID;

/// Small integer thread id, below [`MAX_THREADS`](crate::MAX_THREADS).
pub type Tid = u32;

/// Opaque id of a captured creation stack trace.
pub type StackId = u32;

/// Lifecycle state of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ThreadStatus {
    /// Never handed out.
    Invalid = 0,
    /// Registered, OS thread not yet running.
    Created = 1,
    Running = 2,
    /// Start routine returned; joinable thread not yet joined.
    Finished = 3,
    /// Retired; sits in the reuse quarantine.
    Dead = 4,
}

impl ThreadStatus {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Created,
            2 => Self::Running,
            3 => Self::Finished,
            4 => Self::Dead,
            _ => Self::Invalid,
        }
    }
}

/// Everything the runtime keeps about a tid.
pub struct ThreadContext {
    tid: Tid,
    reuse_count: AtomicU32,
    status: AtomicU8,
    detached: AtomicBool,
    announced: AtomicBool,
    destructor_iterations: AtomicU32,
    stack_id: AtomicU32,
    parent_tid: AtomicU32,
    os_id: AtomicU64,
    user_id: AtomicUsize,
    thread: AtomicPtr<Thread>,
    /// Intrusive link of the dead-context FIFO.
    pub(crate) next_free: AtomicU32,
}

impl ThreadContext {
    pub(crate) const fn new(tid: Tid) -> Self {
        Self {
            tid,
            reuse_count: AtomicU32::new(0),
            status: AtomicU8::new(ThreadStatus::Invalid as u8),
            detached: AtomicBool::new(false),
            announced: AtomicBool::new(false),
            destructor_iterations: AtomicU32::new(PTHREAD_DESTRUCTOR_ITERATIONS),
            stack_id: AtomicU32::new(0),
            parent_tid: AtomicU32::new(INVALID_TID),
            os_id: AtomicU64::new(0),
            user_id: AtomicUsize::new(0),
            thread: AtomicPtr::new(ptr::null_mut()),
            next_free: AtomicU32::new(INVALID_TID),
        }
    }

    #[must_use]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    #[must_use]
    pub fn status(&self) -> ThreadStatus {
        ThreadStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: ThreadStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// How many times this tid was handed out after its first retirement.
    #[must_use]
    pub fn reuse_count(&self) -> u32 {
        self.reuse_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn detached(&self) -> bool {
        self.detached.load(Ordering::Relaxed)
    }

    pub(crate) fn set_detached(&self, detached: bool) {
        self.detached.store(detached, Ordering::Relaxed);
    }

    #[must_use]
    pub fn parent_tid(&self) -> Tid {
        self.parent_tid.load(Ordering::Relaxed)
    }

    /// Kernel id of the running thread; 0 before start.
    #[must_use]
    pub fn os_id(&self) -> u64 {
        self.os_id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_os_id(&self, os_id: u64) {
        self.os_id.store(os_id, Ordering::Relaxed);
    }

    /// Opaque user handle (the Thread's address).
    #[must_use]
    pub fn user_id(&self) -> usize {
        self.user_id.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn stack_id(&self) -> StackId {
        self.stack_id.load(Ordering::Relaxed)
    }

    /// Live thread, or null once torn down.
    #[must_use]
    pub fn thread(&self) -> *mut Thread {
        self.thread.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn has_live_thread(&self) -> bool {
        !self.thread().is_null()
    }

    /// First call returns true, later calls false.
    pub fn mark_announced(&self) -> bool {
        !self.announced.swap(true, Ordering::AcqRel)
    }

    #[must_use]
    pub fn announced(&self) -> bool {
        self.announced.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn destructor_iterations(&self) -> u32 {
        self.destructor_iterations.load(Ordering::Relaxed)
    }

    /// Decrement the TSD-destructor budget, returning the value before.
    pub(crate) fn take_destructor_iteration(&self) -> u32 {
        let before = self.destructor_iterations.load(Ordering::Relaxed);
        if before > 0 {
            self.destructor_iterations.store(before - 1, Ordering::Relaxed);
        }
        before
    }

    /// Creation callback: bind both directions and record where it came from.
    pub(crate) fn on_created(
        &self,
        parent_tid: Tid,
        stack_id: StackId,
        detached: bool,
        user_id: usize,
        thread: *mut Thread,
        reused: bool,
    ) {
        if reused {
            self.reuse_count.fetch_add(1, Ordering::Relaxed);
        }
        self.parent_tid.store(parent_tid, Ordering::Relaxed);
        self.stack_id.store(stack_id, Ordering::Relaxed);
        self.detached.store(detached, Ordering::Relaxed);
        self.announced.store(false, Ordering::Relaxed);
        self.destructor_iterations
            .store(PTHREAD_DESTRUCTOR_ITERATIONS, Ordering::Relaxed);
        self.os_id.store(0, Ordering::Relaxed);
        self.user_id.store(user_id, Ordering::Relaxed);
        self.next_free.store(INVALID_TID, Ordering::Relaxed);
        self.thread.store(thread, Ordering::Release);
        self.set_status(ThreadStatus::Created);
    }

    /// Completion callback: the Thread is going away.
    pub(crate) fn on_finished(&self) {
        self.thread.store(ptr::null_mut(), Ordering::Release);
    }

    /// Re-point the back-reference (fork rebinding).
    pub(crate) fn bind_thread(&self, thread: *mut Thread, user_id: usize) {
        self.user_id.store(user_id, Ordering::Relaxed);
        self.thread.store(thread, Ordering::Release);
    }

    #[must_use]
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            tid: self.tid,
            status: self.status(),
            parent_tid: self.parent_tid(),
            os_id: self.os_id(),
            stack_id: self.stack_id(),
            detached: self.detached(),
            reuse_count: self.reuse_count(),
            live: self.has_live_thread(),
        }
    }
}

/// Serializable view of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContextSnapshot {
    pub tid: Tid,
    pub status: ThreadStatus,
    pub parent_tid: Tid,
    pub os_id: u64,
    pub stack_id: StackId,
    pub detached: bool,
    pub reuse_count: u32,
    pub live: bool,
}
