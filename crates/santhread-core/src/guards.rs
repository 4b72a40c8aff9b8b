//! Scoped reentrancy flags.
//!
//! Some unwinders allocate internally; the allocator checks
//! [`Thread::is_unwinding`] to avoid recursing into a stack capture. Fatal
//! signal handling sets [`Thread::is_in_deadly_signal`] so nested reports
//! are suppressed. Both guards accept `None` and then do nothing, so they
//! work before a thread is registered.

use crate::thread::Thread;

/// Marks the thread as unwinding for the guard's lifetime.
#[must_use = "the flag is cleared as soon as the guard is dropped"]
pub struct ScopedUnwinding<'a> {
    thread: Option<&'a Thread>,
}

impl<'a> ScopedUnwinding<'a> {
    pub fn new(thread: Option<&'a Thread>) -> Self {
        if let Some(t) = thread {
            t.set_unwinding(true);
        }
        Self { thread }
    }
}

impl Drop for ScopedUnwinding<'_> {
    fn drop(&mut self) {
        if let Some(t) = self.thread {
            t.set_unwinding(false);
        }
    }
}

/// Marks the thread as handling a fatal signal for the guard's lifetime.
#[must_use = "the flag is cleared as soon as the guard is dropped"]
pub struct ScopedDeadlySignal<'a> {
    thread: Option<&'a Thread>,
}

impl<'a> ScopedDeadlySignal<'a> {
    pub fn new(thread: Option<&'a Thread>) -> Self {
        if let Some(t) = thread {
            t.set_in_deadly_signal(true);
        }
        Self { thread }
    }
}

impl Drop for ScopedDeadlySignal<'_> {
    fn drop(&mut self) {
        if let Some(t) = self.thread {
            t.set_in_deadly_signal(false);
        }
    }
}
