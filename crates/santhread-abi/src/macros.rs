//! Helper macros for ABI function generation.

/// Generate one `__asan_stack_malloc_N` / `__asan_stack_free_N` pair for
/// size class `N`.
///
/// Instrumented prologues call the malloc half with the frame size and the
/// address of the real frame; the result is either a fake frame or the real
/// frame unchanged. Epilogues call the free half only for fake frames.
macro_rules! stack_malloc_free {
    ($class:literal, $malloc:ident, $free:ident) => {
        #[doc = concat!("Fake frame of size class ", stringify!($class), ", or `real_stack`.")]
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $malloc(size: usize, real_stack: usize) -> usize {
            santhread_core::fake_stack::on_malloc($class, size, real_stack)
        }

        #[doc = concat!("Release a fake frame of size class ", stringify!($class), ".")]
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $free(ptr: usize, size: usize) {
            // SAFETY: compiled code only frees fake frames it got from the
            // matching malloc entry point.
            unsafe { santhread_core::fake_stack::on_free(ptr, $class, size) }
        }
    };
}

#[allow(unused_imports)]
pub(crate) use stack_malloc_free;
