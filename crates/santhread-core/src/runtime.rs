//! Runtime bootstrap and fork handling.
//!
//! [`init_threads`] resolves options, creates the TSD key behind the
//! last-resort teardown hook, registers fork handlers and registers the
//! calling thread as the main thread. It is guarded by an atomic state
//! machine rather than `Once`: a reentrant call from inside bootstrap (the
//! allocator calling back in) returns immediately instead of deadlocking.
//!
//! ## Fork
//!
//! `prepare` takes the registry lock so no other thread holds it across the
//! fork; the parent releases it; the child releases it and runs
//! [`recover_after_fork`]. Recovery only fixes tid identity. TLS bounds and
//! fake-stack state of the surviving thread are left as they were.

use core::ptr;
use std::sync::atomic::{AtomicU8, Ordering};

use log::{debug, warn};

use crate::config::runtime_options;
use crate::context::Tid;
use crate::current::{current_thread, current_thread_ptr, set_current_thread};
use crate::error::fatal;
use crate::platform;
use crate::registry::global_registry;
use crate::thread::{self, Thread};
use crate::{INVALID_TID, MAIN_TID};

const INIT_UNINIT: u8 = 0;
const INIT_RUNNING: u8 = 1;
const INIT_READY: u8 = 2;

static INIT_STATE: AtomicU8 = AtomicU8::new(INIT_UNINIT);

/// Whether [`init_threads`] has completed.
#[must_use]
pub fn threads_initialized() -> bool {
    INIT_STATE.load(Ordering::Acquire) == INIT_READY
}

/// Bring up thread tracking for the process. Idempotent.
///
/// Returns the calling thread's tid when this call performed the
/// bootstrap, `None` if it was already done or is in progress.
pub fn init_threads() -> Option<Tid> {
    if INIT_STATE.load(Ordering::Acquire) != INIT_UNINIT {
        return None;
    }
    if INIT_STATE
        .compare_exchange(INIT_UNINIT, INIT_RUNNING, Ordering::SeqCst, Ordering::Relaxed)
        .is_err()
    {
        return None;
    }

    let opts = runtime_options();
    let registry = global_registry();
    registry.set_quarantine_size(opts.thread_quarantine_size);

    if let Err(rc) = platform::install_tsd_destructor(thread::tsd_destructor) {
        warn!("thread teardown hook unavailable (pthread_key_create: {rc})");
    }
    if let Err(rc) = platform::register_atfork(before_fork, after_fork_parent, after_fork_child) {
        warn!("fork handlers not registered (pthread_atfork: {rc})");
    }

    let main = Thread::create(None, ptr::null_mut(), INVALID_TID, 0, true);
    // SAFETY: the main thread's Thread is never torn down by the runtime.
    let thread = unsafe { main.as_ref() };
    // SAFETY: lives for the rest of the process.
    unsafe { set_current_thread(main.as_ptr()) };
    if let Err(err) = thread.init() {
        fatal(err);
    }
    let tid = thread.tid();
    if let Err(err) = registry.lock().start_thread(tid, platform::os_thread_id()) {
        fatal(err);
    }
    if tid != MAIN_TID {
        warn!("main thread registered as T{tid}; threads were created before init");
    }
    debug!("thread runtime ready: {opts:?}");
    INIT_STATE.store(INIT_READY, Ordering::Release);
    Some(tid)
}

/// Refresh the main context's OS id if the caller is the main thread.
pub fn ensure_main_thread_id_is_correct() {
    let Some(thread) = current_thread() else {
        return;
    };
    if let Some(ctx) = thread.context() {
        if ctx.tid() == MAIN_TID {
            ctx.set_os_id(platform::os_thread_id());
        }
    }
}

/// Child-side fork recovery for `thread`, the only thread left.
///
/// Retires every other running context. If `thread` was not the main
/// thread and the main context is free, rebinds `thread` to it. Returns the
/// tid `thread` has afterwards.
pub fn recover_after_fork(thread: &Thread) -> Tid {
    let mut lock = thread.registry().lock();
    let old = thread.tid();
    let new = match lock.recover_after_fork(old, platform::os_thread_id()) {
        Ok(tid) => tid,
        Err(err) => fatal(err),
    };
    if new != old {
        if let Some(ctx) = lock.context(new) {
            thread.set_context(ctx);
        }
        drop(lock);
        if current_thread_ptr() == thread as *const Thread as *mut Thread {
            // SAFETY: re-arming the slot with the same live thread.
            unsafe { set_current_thread(current_thread_ptr()) };
        }
    }
    new
}

unsafe extern "C" fn before_fork() {
    global_registry().lock_for_fork();
}

unsafe extern "C" fn after_fork_parent() {
    // SAFETY: taken by `before_fork` on this thread.
    unsafe { global_registry().unlock_after_fork() };
}

unsafe extern "C" fn after_fork_child() {
    // SAFETY: taken by `before_fork` on the thread that is now the child's
    // only thread.
    unsafe { global_registry().unlock_after_fork() };
    if let Some(thread) = current_thread() {
        recover_after_fork(thread);
    }
}
