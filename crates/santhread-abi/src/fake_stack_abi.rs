//! Fake stack entry points called by instrumented code.

use std::ffi::c_void;
use std::ptr;

use santhread_core::fake_stack::get_fake_stack_fast;
use santhread_core::shadow::shadow;
use santhread_core::{FakeStack, current_thread};

stack_malloc_free!(0, __asan_stack_malloc_0, __asan_stack_free_0);
stack_malloc_free!(1, __asan_stack_malloc_1, __asan_stack_free_1);
stack_malloc_free!(2, __asan_stack_malloc_2, __asan_stack_free_2);
stack_malloc_free!(3, __asan_stack_malloc_3, __asan_stack_free_3);
stack_malloc_free!(4, __asan_stack_malloc_4, __asan_stack_free_4);
stack_malloc_free!(5, __asan_stack_malloc_5, __asan_stack_free_5);
stack_malloc_free!(6, __asan_stack_malloc_6, __asan_stack_free_6);
stack_malloc_free!(7, __asan_stack_malloc_7, __asan_stack_free_7);
stack_malloc_free!(8, __asan_stack_malloc_8, __asan_stack_free_8);
stack_malloc_free!(9, __asan_stack_malloc_9, __asan_stack_free_9);
stack_malloc_free!(10, __asan_stack_malloc_10, __asan_stack_free_10);

/// The calling thread's fake stack, or null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __asan_get_current_fake_stack() -> *mut c_void {
    get_fake_stack_fast().map_or(ptr::null_mut(), |fs| fs.as_ptr().cast())
}

/// If `addr` is inside a frame of `fake_stack`, return the frame start and
/// optionally store its bounds in `beg`/`end`. Null otherwise.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __asan_addr_is_in_fake_stack(
    fake_stack: *mut c_void,
    addr: *mut c_void,
    beg: *mut *mut c_void,
    end: *mut *mut c_void,
) -> *mut c_void {
    // SAFETY: a non-null handle came from __asan_get_current_fake_stack.
    let Some(fs) = (unsafe { fake_stack.cast::<FakeStack>().as_ref() }) else {
        return ptr::null_mut();
    };
    let Some((frame_beg, frame_end)) = fs.addr_is_in_fake_stack(addr as usize) else {
        return ptr::null_mut();
    };
    // SAFETY: out-pointers are optional and, when given, writable.
    unsafe {
        if !beg.is_null() {
            *beg = frame_beg as *mut c_void;
        }
        if !end.is_null() {
            *end = frame_end as *mut c_void;
        }
    }
    frame_beg as *mut c_void
}

/// Called before a no-return call (longjmp, throw, exit paths): frames
/// between here and the landing point will never run their epilogues.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __asan_handle_no_return() {
    let Some(thread) = current_thread() else {
        return;
    };
    let stack = thread.current_stack();
    if stack.size > 0 {
        shadow().unpoison(stack.bottom, stack.size);
    }
    if let Some(fs) = thread.existing_fake_stack() {
        // SAFETY: an installed fake stack stays mapped while its thread lives.
        unsafe { fs.as_ref() }.handle_no_return();
    }
}
