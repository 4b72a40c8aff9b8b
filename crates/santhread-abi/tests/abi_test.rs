//! Exercises the exported symbols the way instrumented code calls them.

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use santhread_abi::fake_stack_abi::*;
use santhread_abi::thread_abi::*;
use santhread_core::config::set_detect_stack_use_after_return;
use santhread_core::platform::os_thread_id;
use santhread_core::runtime::threads_initialized;
use santhread_core::{FakeStack, INVALID_TID};

// Tests flip the process-wide use-after-return switch.
static UAR_LOCK: Mutex<()> = Mutex::new(());

fn bootstrap() {
    // SAFETY: plain bootstrap call.
    unsafe { __santhread_init_threads() };
    while !threads_initialized() {
        std::thread::yield_now();
    }
}

#[derive(Default)]
struct Outcome {
    real: AtomicUsize,
    frame: AtomicUsize,
    frame_begin: AtomicUsize,
    frame_end: AtomicUsize,
    live_after_free: AtomicUsize,
    gc_flagged: AtomicUsize,
    found_self: AtomicUsize,
}

unsafe extern "C" fn exercise_fake_frames(arg: *mut c_void) -> *mut c_void {
    // SAFETY: the test passes a leaked Outcome.
    let out = unsafe { &*(arg as *const Outcome) };
    let marker = 0u64;
    let real = ptr::from_ref(&marker) as usize;
    out.real.store(real, Ordering::Relaxed);

    // SAFETY: ABI calls with compiler-shaped arguments.
    unsafe {
        let frame = __asan_stack_malloc_3(256, real);
        out.frame.store(frame, Ordering::Relaxed);
        let fs = __asan_get_current_fake_stack();
        let mut beg: *mut c_void = ptr::null_mut();
        let mut end: *mut c_void = ptr::null_mut();
        let hit = __asan_addr_is_in_fake_stack(fs, (frame + 100) as *mut c_void, &mut beg, &mut end);
        if hit as usize == frame {
            out.frame_begin.store(beg as usize, Ordering::Relaxed);
            out.frame_end.store(end as usize, Ordering::Relaxed);
        }
        __asan_stack_free_3(frame, 256);
        let fs_ref = &*(fs as *const FakeStack);
        out.live_after_free.store(usize::from(fs_ref.frame_is_live(frame)), Ordering::Relaxed);

        __asan_handle_no_return();
        out.gc_flagged.store(usize::from(fs_ref.needs_gc()), Ordering::Relaxed);

        let me = __santhread_get_current_thread();
        let found = __santhread_find_thread_by_stack_address(ptr::from_ref(&marker).cast());
        out.found_self.store(usize::from(!me.is_null() && me == found), Ordering::Relaxed);
    }
    ptr::null_mut()
}

#[test]
fn unregistered_thread_sees_invalid_tid_and_no_fake_stack() {
    let _guard = UAR_LOCK.lock();
    set_detect_stack_use_after_return(true);
    let (tid, fs) = std::thread::spawn(|| {
        // SAFETY: queries only.
        unsafe { (__santhread_get_current_tid(), __asan_get_current_fake_stack() as usize) }
    })
    .join()
    .unwrap();
    set_detect_stack_use_after_return(false);
    assert_eq!(tid, INVALID_TID);
    assert_eq!(fs, 0);
}

#[test]
fn disabled_malloc_returns_real_stack() {
    let _guard = UAR_LOCK.lock();
    bootstrap();
    set_detect_stack_use_after_return(false);
    let real = 0x7fff_0000_usize;
    // SAFETY: disabled path never touches memory.
    unsafe {
        assert_eq!(__asan_stack_malloc_0(16, real), real);
        assert_eq!(__asan_stack_malloc_10(40_000, real), real);
        assert!(__asan_get_current_fake_stack().is_null());
    }
}

#[test]
fn enabled_malloc_serves_frames_from_the_fake_stack() {
    let _guard = UAR_LOCK.lock();
    bootstrap();
    set_detect_stack_use_after_return(true);

    let out: &'static Outcome = Box::leak(Box::default());
    // SAFETY: the routine matches ThreadCallback and `out` is leaked.
    let handle = unsafe {
        __santhread_thread_create(
            Some(exercise_fake_frames),
            ptr::from_ref(out).cast_mut().cast(),
            __santhread_get_current_tid(),
            0,
            0,
        )
    } as usize;
    std::thread::spawn(move || {
        // SAFETY: fresh handle, started once, no readiness flag.
        unsafe { __santhread_thread_start(handle as *mut c_void, os_thread_id(), ptr::null()) };
    })
    .join()
    .unwrap();
    set_detect_stack_use_after_return(false);

    let frame = out.frame.load(Ordering::Relaxed);
    assert_ne!(frame, out.real.load(Ordering::Relaxed));
    assert_eq!(out.frame_begin.load(Ordering::Relaxed), frame);
    assert_eq!(out.frame_end.load(Ordering::Relaxed), frame + 512);
    assert_eq!(out.live_after_free.load(Ordering::Relaxed), 0);
    assert_eq!(out.gc_flagged.load(Ordering::Relaxed), 1);
    assert_eq!(out.found_self.load(Ordering::Relaxed), 1);
}

#[test]
fn user_stack_switch_is_a_no_op_without_a_registered_thread() {
    std::thread::spawn(|| {
        // SAFETY: no current thread, both calls return immediately.
        unsafe {
            __santhread_set_user_stack(0x1000 as *mut c_void, 0x1000);
            __santhread_restore_previous_user_stack();
            assert!(__santhread_get_current_thread().is_null());
        }
    })
    .join()
    .unwrap();
}

#[test]
fn user_stack_switch_rotates_current_thread() {
    let _guard = UAR_LOCK.lock();
    bootstrap();
    let result = std::thread::spawn(|| {
        // SAFETY: as in the other tests; the routine only touches stacks.
        unsafe {
            let handle = __santhread_thread_create(Some(switch_and_back), ptr::null_mut(), 0, 0, 1);
            __santhread_thread_start(handle, os_thread_id(), ptr::null()) as usize
        }
    })
    .join()
    .unwrap();
    assert_eq!(result, 1);
}

unsafe extern "C" fn switch_and_back(_arg: *mut c_void) -> *mut c_void {
    // SAFETY: registered by __santhread_thread_start.
    let thread = unsafe { &*(__santhread_get_current_thread() as *const santhread_core::Thread) };
    let original = thread.stacks().next_stack();
    // SAFETY: descriptor-only switch.
    unsafe { __santhread_set_user_stack(0x10_0000 as *mut c_void, 0x2000) };
    let switched = thread.stacks().next_stack() == santhread_core::StackDescriptor::new(0x10_0000, 0x2000)
        && thread.stacks().previous_stack() == original;
    // SAFETY: as above.
    unsafe { __santhread_restore_previous_user_stack() };
    let restored = thread.stacks().next_stack() == original;
    usize::from(switched && restored) as *mut c_void
}
