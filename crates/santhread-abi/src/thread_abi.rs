//! Thread registration and lookup exports.
//!
//! Thread handles cross the boundary as opaque `void *` pointing at a
//! `santhread_core::Thread`.

use std::ffi::{c_int, c_void};
use std::ptr::{self, NonNull};
use std::sync::atomic::AtomicU32;

use santhread_core::runtime::init_threads;
use santhread_core::thread::ThreadCallback;
use santhread_core::{
    StackId, Thread, Tid, current_thread, current_tid_or_invalid, find_thread_by_stack_address,
    set_current_thread,
};

/// Bootstrap thread tracking. Returns 1 if this call did the work.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __santhread_init_threads() -> c_int {
    c_int::from(init_threads().is_some())
}

/// Register a thread about to be created. The result is handed to the new
/// OS thread, which passes it to [`__santhread_thread_start`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __santhread_thread_create(
    start_routine: Option<ThreadCallback>,
    arg: *mut c_void,
    parent_tid: Tid,
    stack_id: StackId,
    detached: c_int,
) -> *mut c_void {
    Thread::create(start_routine, arg, parent_tid, stack_id, detached != 0)
        .as_ptr()
        .cast()
}

/// Run a registered thread on the calling OS thread. `ready` may be null;
/// otherwise the call parks until the parent sets it non-zero.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __santhread_thread_start(
    thread: *mut c_void,
    os_id: u64,
    ready: *const AtomicU32,
) -> *mut c_void {
    let Some(thread) = NonNull::new(thread.cast::<Thread>()) else {
        return ptr::null_mut();
    };
    // SAFETY: handle from __santhread_thread_create; `ready` null or live.
    unsafe { Thread::thread_start(thread, os_id, ready.as_ref()) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn __santhread_get_current_thread() -> *mut c_void {
    current_thread().map_or(ptr::null_mut(), |t| ptr::from_ref(t).cast_mut().cast())
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn __santhread_set_current_thread(thread: *mut c_void) {
    // SAFETY: the caller hands us a live thread handle or null.
    unsafe { set_current_thread(thread.cast()) };
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn __santhread_get_current_tid() -> u32 {
    current_tid_or_invalid()
}

/// Thread whose stack or fake stack contains `addr`, or null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __santhread_find_thread_by_stack_address(addr: *const c_void) -> *mut c_void {
    find_thread_by_stack_address(addr as usize).map_or(ptr::null_mut(), |t| t.as_ptr().cast())
}

/// The calling thread switches to `[bottom, bottom + size)`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __santhread_set_user_stack(bottom: *mut c_void, size: usize) {
    if let Some(thread) = current_thread() {
        thread.set_user_stack(bottom as usize, size);
    }
}

/// The calling thread returns to the stack it used before the last switch.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __santhread_restore_previous_user_stack() {
    if let Some(thread) = current_thread() {
        thread.restore_previous_user_stack();
    }
}
