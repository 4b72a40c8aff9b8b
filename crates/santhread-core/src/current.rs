//! Current-thread lookup and reverse lookup by address.

use core::cell::Cell;
use core::ffi::c_void;
use core::ptr::{self, NonNull};

use crate::context::{ThreadStatus, Tid};
use crate::platform;
use crate::registry::{RegistryLock, global_registry};
use crate::thread::Thread;
use crate::INVALID_TID;

thread_local! {
    static CURRENT_THREAD: Cell<*mut Thread> = const { Cell::new(ptr::null_mut()) };
}

#[inline]
pub(crate) fn current_thread_ptr() -> *mut Thread {
    CURRENT_THREAD
        .try_with(Cell::get)
        .unwrap_or(ptr::null_mut())
}

/// The calling thread's [`Thread`], if it has been registered.
#[inline]
#[must_use]
pub fn current_thread() -> Option<&'static Thread> {
    // SAFETY: the slot holds null or a live Thread; a Thread clears the slot
    // before it is unmapped.
    unsafe { current_thread_ptr().as_ref() }
}

/// Make `thread` (or nothing, with null) the calling thread's current one.
///
/// Also arms the TSD slot with the thread's context so the last-resort
/// teardown hook can find it.
///
/// # Safety
///
/// A non-null `thread` must stay live until the slot is cleared or
/// overwritten on this OS thread.
pub unsafe fn set_current_thread(thread: *mut Thread) {
    let _ = CURRENT_THREAD.try_with(|slot| slot.set(thread));
    // SAFETY: non-null per the contract means live.
    let ctx = unsafe { thread.as_ref() }
        .and_then(Thread::context)
        .map_or(ptr::null_mut(), |ctx| ctx as *const _ as *mut c_void);
    platform::set_tsd(ctx);
}

/// Tid of the calling thread, or [`INVALID_TID`].
#[inline]
#[must_use]
pub fn current_tid_or_invalid() -> Tid {
    current_thread().map_or(INVALID_TID, Thread::tid)
}

/// Find the running thread whose stack or fake stack contains `addr`.
///
/// The result is a snapshot: the thread may exit once the lock is released.
#[must_use]
pub fn find_thread_by_stack_address(addr: usize) -> Option<NonNull<Thread>> {
    find_thread_by_stack_address_in(&global_registry().lock(), addr)
}

/// [`find_thread_by_stack_address`] against an already-held registry lock.
#[must_use]
pub fn find_thread_by_stack_address_in(lock: &RegistryLock<'_>, addr: usize) -> Option<NonNull<Thread>> {
    lock.find(|ctx| {
        if ctx.status() != ThreadStatus::Running {
            return false;
        }
        // SAFETY: under the registry lock a bound back-reference is live.
        let Some(thread) = (unsafe { ctx.thread().as_ref() }) else {
            return false;
        };
        thread.addr_is_in_stack(addr) || thread.addr_is_in_fake_stack(addr)
    })
    .and_then(|ctx| NonNull::new(ctx.thread()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ThreadRegistry;

    #[test]
    fn unregistered_thread_has_invalid_tid() {
        std::thread::spawn(|| {
            assert!(current_thread().is_none());
            assert_eq!(current_tid_or_invalid(), INVALID_TID);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn set_and_clear_current() {
        let reg: &'static ThreadRegistry = Box::leak(Box::new(ThreadRegistry::new(8, 0)));
        let t = Thread::try_create_in(reg, None, ptr::null_mut(), INVALID_TID, 0, false).unwrap();
        let handle = t.as_ptr() as usize;
        std::thread::spawn(move || {
            let t = handle as *mut Thread;
            // SAFETY: live until destroyed below.
            unsafe { set_current_thread(t) };
            assert_eq!(current_tid_or_invalid(), 0);
            assert_eq!(current_thread_ptr(), t);
            // SAFETY: clearing, then destroying once.
            unsafe {
                set_current_thread(ptr::null_mut());
                assert!(current_thread().is_none());
                Thread::destroy(NonNull::new_unchecked(t));
            }
        })
        .join()
        .unwrap();
    }

    #[test]
    fn reverse_lookup_finds_running_thread_by_stack_address() {
        let reg: &'static ThreadRegistry = Box::leak(Box::new(ThreadRegistry::new(8, 0)));
        let t = Thread::try_create_in(reg, None, ptr::null_mut(), INVALID_TID, 0, false).unwrap();
        let handle = t.as_ptr() as usize;
        let probe = std::thread::spawn(move || {
            let t = handle as *mut Thread;
            // SAFETY: owned by this OS thread until destroyed below.
            let thread = unsafe { &*t };
            thread.init().unwrap();
            let local = 0u64;
            let addr = core::hint::black_box(&local) as *const u64 as usize;

            // Not running yet: invisible.
            let before = find_thread_by_stack_address_in(&reg.lock(), addr);
            reg.lock().start_thread(thread.tid(), platform::os_thread_id()).unwrap();
            let found = find_thread_by_stack_address_in(&reg.lock(), addr).map(|p| p.as_ptr() as usize);
            let miss = find_thread_by_stack_address_in(&reg.lock(), 0x10);
            // SAFETY: destroyed once.
            unsafe { Thread::destroy(NonNull::new_unchecked(t)) };
            (before.is_none(), found, miss.is_none())
        })
        .join()
        .unwrap();
        assert_eq!(probe, (true, Some(handle), true));
    }
}
