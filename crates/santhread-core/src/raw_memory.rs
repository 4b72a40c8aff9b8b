//! Anonymous page mappings that bypass the general-purpose allocator.
//!
//! Everything the runtime needs before a thread is registered (the Thread
//! object, the context arena, fake stacks) comes from here, so creating it
//! never re-enters the tracked allocator.

use core::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::ThreadError;

const FALLBACK_PAGE_SIZE: usize = 4096;

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// System page size, queried once.
pub(crate) fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    // SAFETY: sysconf has no memory-safety preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let size = if raw > 0 {
        raw as usize
    } else {
        FALLBACK_PAGE_SIZE
    };
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

/// Round `size` up to a multiple of `align` (a power of two).
#[inline]
pub(crate) const fn round_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Map `size` bytes (rounded to pages) of zeroed read/write memory.
///
/// With `noreserve` the kernel commits pages lazily, for large sparse tables.
pub(crate) fn map_pages(
    size: usize,
    what: &'static str,
    noreserve: bool,
) -> Result<NonNull<u8>, ThreadError> {
    let len = round_up(size.max(1), page_size());
    let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    if noreserve {
        flags |= libc::MAP_NORESERVE;
    }
    // SAFETY: anonymous mapping with no fd and no address hint.
    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(ThreadError::MapFailed {
            what,
            size: len,
            errno: last_errno(),
        });
    }
    NonNull::new(base.cast()).ok_or(ThreadError::MapFailed {
        what,
        size: len,
        errno: 0,
    })
}

/// Release a mapping created by [`map_pages`].
///
/// # Safety
///
/// `base`/`size` must describe a mapping returned by [`map_pages`] (with the
/// same `size` argument), and nothing may touch it afterwards.
pub(crate) unsafe fn unmap_pages(base: NonNull<u8>, size: usize) {
    let len = round_up(size.max(1), page_size());
    // SAFETY: caller guarantees this is a live mapping of `len` bytes.
    unsafe {
        libc::munmap(base.as_ptr().cast(), len);
    }
}

/// Move `value` into its own page mapping.
pub(crate) fn map_object<T>(value: T, what: &'static str) -> Result<NonNull<T>, ThreadError> {
    debug_assert!(core::mem::align_of::<T>() <= page_size());
    let base = map_pages(core::mem::size_of::<T>(), what, false)?.cast::<T>();
    // SAFETY: fresh, page-aligned, writable mapping at least size_of::<T>() long.
    unsafe { base.as_ptr().write(value) };
    Ok(base)
}

/// Drop and unmap an object created by [`map_object`].
///
/// # Safety
///
/// `obj` must come from [`map_object`] and must not be used afterwards.
pub(crate) unsafe fn unmap_object<T>(obj: NonNull<T>) {
    // SAFETY: caller guarantees `obj` is a live, exclusively owned mapping.
    unsafe {
        ptr::drop_in_place(obj.as_ptr());
        unmap_pages(obj.cast(), core::mem::size_of::<T>());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
        assert_eq!(page_size(), page_size());
    }

    #[test]
    fn round_up_behaves() {
        assert_eq!(round_up(0, 4096), 0);
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
    }

    #[test]
    fn mapped_pages_are_zeroed_and_writable() {
        let base = map_pages(10_000, "test", false).unwrap();
        // SAFETY: the mapping is at least 10_000 bytes.
        unsafe {
            let bytes = core::slice::from_raw_parts_mut(base.as_ptr(), 10_000);
            assert!(bytes.iter().all(|&b| b == 0));
            bytes[9_999] = 7;
            assert_eq!(bytes[9_999], 7);
            unmap_pages(base, 10_000);
        }
    }

    #[test]
    fn object_round_trip() {
        let obj = map_object([3u64; 16], "test-object").unwrap();
        // SAFETY: fresh object, unmapped exactly once.
        unsafe {
            assert_eq!((*obj.as_ptr())[15], 3);
            unmap_object(obj);
        }
    }
}
