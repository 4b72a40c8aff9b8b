//! Use-after-return fake stack.
//!
//! Instrumented functions with addressable locals ask for a frame here
//! instead of using the real stack. When the function returns the frame is
//! released and poisoned, so a dangling pointer to one of its locals now
//! points at poisoned memory instead of a reused stack slot.
//!
//! ## Layout
//!
//! One anonymous mapping per thread:
//!
//! ```text
//! [ FakeStack header | flag bytes for every frame | class 0 | class 1 | ... | class 10 ]
//! ```
//!
//! Class `c` serves frames of `64 << c` bytes and owns `2^stack_size_log`
//! bytes, so it has `2^(stack_size_log - 6 - c)` frames. A frame's last word
//! holds the address of its flag byte, which is what lets
//! [`FakeStack::deallocate`] work without a handle to the owning stack.
//!
//! Creation is called from the lazy, signal-reentrant path and therefore
//! neither logs nor allocates; teardown may do both.

use core::cell::Cell;
use core::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};

use log::debug;

use crate::config::detect_stack_use_after_return;
use crate::context::Tid;
use crate::current::current_thread;
use crate::error::ThreadError;
use crate::metrics::{RuntimeMetrics, global_metrics};
use crate::raw_memory;
use crate::shadow::{PoisonKind, shadow};

/// Number of frame size classes.
pub const NUMBER_OF_SIZE_CLASSES: usize = 11;
/// Log2 of the smallest frame.
pub const MIN_STACK_FRAME_SIZE_LOG: u32 = 6;
/// Log2 of the largest frame.
pub const MAX_STACK_FRAME_SIZE_LOG: u32 = 16;

/// Word of the frame header that records the caller's real stack pointer.
/// Words 0..3 belong to instrumented code (magic, descriptor, pc).
const REAL_STACK_WORD: usize = 3;

const MAGIC: u64 = 0x5341_4e46_4b53_544b;
const WORD: usize = core::mem::size_of::<usize>();

/// Header of a fake stack mapping. Flags and frames follow it in memory.
#[repr(C)]
pub struct FakeStack {
    magic: AtomicU64,
    stack_size_log: u32,
    needs_gc: AtomicBool,
    mapped_size: usize,
    frames_offset: usize,
    hint_position: [AtomicUsize; NUMBER_OF_SIZE_CLASSES],
}

/// Frame size of `class` in bytes.
#[inline]
#[must_use]
pub const fn bytes_in_size_class(class: usize) -> usize {
    1 << (MIN_STACK_FRAME_SIZE_LOG as usize + class)
}

/// Frames in `class` for a stack of `2^stack_size_log` bytes per class.
#[inline]
#[must_use]
pub const fn number_of_frames(stack_size_log: u32, class: usize) -> usize {
    1 << (stack_size_log as usize - MIN_STACK_FRAME_SIZE_LOG as usize - class)
}

/// Offset of `class`'s first flag byte within the flag area.
const fn flags_offset(stack_size_log: u32, class: usize) -> usize {
    let mut off = 0;
    let mut c = 0;
    while c < class {
        off += number_of_frames(stack_size_log, c);
        c += 1;
    }
    off
}

const fn header_size() -> usize {
    raw_memory::round_up(core::mem::size_of::<FakeStack>(), 64)
}

/// Bytes of frame storage for a given size log.
#[must_use]
pub const fn frames_size(stack_size_log: u32) -> usize {
    NUMBER_OF_SIZE_CLASSES << stack_size_log
}

impl FakeStack {
    /// Map and initialise a fake stack.
    ///
    /// Allocation-free and log-free; safe to call from a signal handler.
    pub fn create(stack_size_log: u32) -> Result<NonNull<FakeStack>, ThreadError> {
        debug_assert!(stack_size_log >= MAX_STACK_FRAME_SIZE_LOG);
        let flags = flags_offset(stack_size_log, NUMBER_OF_SIZE_CLASSES);
        let frames_offset = raw_memory::round_up(header_size() + flags, raw_memory::page_size());
        let mapped_size = frames_offset + frames_size(stack_size_log);
        let base = raw_memory::map_pages(mapped_size, "fake stack", true)?.cast::<FakeStack>();
        // SAFETY: fresh, writable, page-aligned mapping larger than the header.
        unsafe {
            base.as_ptr().write(FakeStack {
                magic: AtomicU64::new(MAGIC),
                stack_size_log,
                needs_gc: AtomicBool::new(false),
                mapped_size,
                frames_offset,
                hint_position: [const { AtomicUsize::new(0) }; NUMBER_OF_SIZE_CLASSES],
            });
        }
        RuntimeMetrics::inc(&global_metrics().fake_stacks_created);
        Ok(base)
    }

    #[must_use]
    pub fn stack_size_log(&self) -> u32 {
        self.stack_size_log
    }

    #[inline]
    fn base(&self) -> usize {
        self as *const Self as usize
    }

    #[inline]
    fn frames_begin(&self) -> usize {
        self.base() + self.frames_offset
    }

    #[inline]
    fn frames_end(&self) -> usize {
        self.frames_begin() + frames_size(self.stack_size_log)
    }

    #[inline]
    fn flag(&self, class: usize, pos: usize) -> &AtomicU8 {
        let addr = self.base() + header_size() + flags_offset(self.stack_size_log, class) + pos;
        // SAFETY: `pos < number_of_frames(class)` at every call site, so the
        // byte lies inside the flag area of this mapping.
        unsafe { &*(addr as *const AtomicU8) }
    }

    #[inline]
    fn frame_addr(&self, class: usize, pos: usize) -> usize {
        self.frames_begin() + (class << self.stack_size_log) + pos * bytes_in_size_class(class)
    }

    /// Take a free frame of `class`, or `None` when the class is full.
    pub fn allocate(&self, class: usize, real_stack: usize) -> Option<usize> {
        if class >= NUMBER_OF_SIZE_CLASSES {
            return None;
        }
        if self.needs_gc.load(Ordering::Relaxed) {
            self.gc(real_stack);
        }
        let n = number_of_frames(self.stack_size_log, class);
        let hint = &self.hint_position[class];
        let start = hint.load(Ordering::Relaxed);
        for i in 0..n {
            let pos = (start + i) & (n - 1);
            if self.flag(class, pos).swap(1, Ordering::AcqRel) != 0 {
                continue;
            }
            hint.store(pos + 1, Ordering::Relaxed);
            let frame = self.frame_addr(class, pos);
            let last = frame + bytes_in_size_class(class) - WORD;
            let flag = self.flag(class, pos) as *const AtomicU8 as usize;
            // SAFETY: both words are inside this frame, which we now own.
            unsafe {
                ((frame + REAL_STACK_WORD * WORD) as *mut usize).write(real_stack);
                (last as *mut usize).write(flag);
            }
            return Some(frame);
        }
        None
    }

    /// Release a frame returned by [`Self::allocate`].
    ///
    /// # Safety
    ///
    /// `frame` must be a live frame of `class` from a fake stack that has
    /// not been destroyed, and its last word must be intact.
    pub unsafe fn deallocate(frame: usize, class: usize) {
        let last = frame + bytes_in_size_class(class) - WORD;
        // SAFETY: per the contract the last word holds our flag address.
        unsafe {
            let flag = *(last as *const usize) as *const AtomicU8;
            (*flag).store(0, Ordering::Release);
        }
    }

    /// The frame `[begin, end)` containing `addr`, if any.
    #[must_use]
    pub fn addr_is_in_fake_stack(&self, addr: usize) -> Option<(usize, usize)> {
        if addr < self.frames_begin() || addr >= self.frames_end() {
            return None;
        }
        let off = addr - self.frames_begin();
        let class = off >> self.stack_size_log;
        let size = bytes_in_size_class(class);
        let pos = (off & ((1 << self.stack_size_log) - 1)) / size;
        let begin = self.frame_addr(class, pos);
        Some((begin, begin + size))
    }

    /// Whether the frame containing `addr` is currently allocated.
    #[must_use]
    pub fn frame_is_live(&self, addr: usize) -> bool {
        let Some((begin, _)) = self.addr_is_in_fake_stack(addr) else {
            return false;
        };
        let off = begin - self.frames_begin();
        let class = off >> self.stack_size_log;
        let pos = (off & ((1 << self.stack_size_log) - 1)) / bytes_in_size_class(class);
        self.flag(class, pos).load(Ordering::Acquire) != 0
    }

    /// Release every frame whose recorded real stack is below `real_stack`,
    /// i.e. frames of functions the thread has already left. Returns how
    /// many were released.
    pub fn gc(&self, real_stack: usize) -> usize {
        self.needs_gc.store(false, Ordering::Relaxed);
        let mut collected = 0;
        for class in 0..NUMBER_OF_SIZE_CLASSES {
            for pos in 0..number_of_frames(self.stack_size_log, class) {
                let flag = self.flag(class, pos);
                if flag.load(Ordering::Acquire) == 0 {
                    continue;
                }
                let frame = self.frame_addr(class, pos);
                // SAFETY: allocated frames always carry the header word.
                let recorded = unsafe { *((frame + REAL_STACK_WORD * WORD) as *const usize) };
                if recorded < real_stack {
                    flag.store(0, Ordering::Release);
                    collected += 1;
                }
            }
        }
        collected
    }

    /// A longjmp-like exit skipped frames' epilogues; collect on next use.
    pub fn handle_no_return(&self) {
        self.needs_gc.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn needs_gc(&self) -> bool {
        self.needs_gc.load(Ordering::Relaxed)
    }

    /// Number of allocated frames across all classes.
    #[must_use]
    pub fn live_frames(&self) -> usize {
        (0..NUMBER_OF_SIZE_CLASSES)
            .flat_map(|class| {
                (0..number_of_frames(self.stack_size_log, class)).map(move |pos| (class, pos))
            })
            .filter(|&(class, pos)| self.flag(class, pos).load(Ordering::Relaxed) != 0)
            .count()
    }

    /// Tear down a fake stack owned by `tid`, returning how many frames were
    /// still live.
    ///
    /// # Safety
    ///
    /// `this` must come from [`FakeStack::create`] and must not be used
    /// after a successful return.
    pub unsafe fn destroy(this: NonNull<FakeStack>, tid: Tid) -> Result<usize, ThreadError> {
        // SAFETY: the caller guarantees `this` still points at our mapping.
        let fs = unsafe { this.as_ref() };
        if fs.magic.load(Ordering::Acquire) != MAGIC {
            return Err(ThreadError::DoubleFakeStackTeardown {
                tid,
                addr: this.as_ptr() as usize,
            });
        }
        let live = fs.live_frames();
        shadow().unpoison(fs.frames_begin(), frames_size(fs.stack_size_log));
        fs.magic.store(0, Ordering::Release);
        let mapped_size = fs.mapped_size;
        // SAFETY: exactly the mapping made by `create`; `fs` is not used below.
        unsafe { raw_memory::unmap_pages(this.cast(), mapped_size) };
        RuntimeMetrics::inc(&global_metrics().fake_stacks_destroyed);
        debug!(
            "T{tid}: destroyed fake stack at {:#x} ({live} live frames)",
            this.as_ptr() as usize
        );
        Ok(live)
    }
}

// ---------------------------------------------------------------------------
// Thread-local fast path
// ---------------------------------------------------------------------------

thread_local! {
    static TLS_FAKE_STACK: Cell<*mut FakeStack> = const { Cell::new(ptr::null_mut()) };
}

/// Publish `fs` (or clear with null) as the calling thread's fast-path stack.
#[inline]
pub fn set_tls_fake_stack(fs: *mut FakeStack) {
    let _ = TLS_FAKE_STACK.try_with(|slot| slot.set(fs));
}

#[inline]
#[must_use]
pub fn tls_fake_stack() -> *mut FakeStack {
    TLS_FAKE_STACK
        .try_with(Cell::get)
        .unwrap_or(ptr::null_mut())
}

/// The calling thread's fake stack, building it on first use.
///
/// With the feature disabled this is one relaxed load and returns `None`.
#[inline]
#[must_use]
pub fn get_fake_stack_fast() -> Option<NonNull<FakeStack>> {
    if !detect_stack_use_after_return() {
        return None;
    }
    if let Some(fs) = NonNull::new(tls_fake_stack()) {
        return Some(fs);
    }
    current_thread()?.fake_stack()
}

/// Serve an instrumented frame of `class` (at least `size` bytes), or fall
/// back to `real_stack`.
pub fn on_malloc(class: usize, size: usize, real_stack: usize) -> usize {
    let Some(fs) = get_fake_stack_fast() else {
        return real_stack;
    };
    // SAFETY: a published fake stack stays mapped while its thread lives.
    let Some(frame) = (unsafe { fs.as_ref() }).allocate(class, real_stack) else {
        return real_stack;
    };
    shadow().unpoison(frame, size.min(bytes_in_size_class(class)));
    if let Some(thread) = current_thread() {
        RuntimeMetrics::inc(&thread.stats().fake_frames_allocated);
    }
    frame
}

/// Release an instrumented frame and poison it.
///
/// # Safety
///
/// `frame` must have been returned by [`on_malloc`] for the same `class`
/// on this thread (not the `real_stack` fallback) and not freed since.
pub unsafe fn on_free(frame: usize, class: usize, size: usize) {
    // SAFETY: forwarded caller contract.
    unsafe { FakeStack::deallocate(frame, class) };
    shadow().poison(frame, size.min(bytes_in_size_class(class)), PoisonKind::StackAfterReturn);
    if let Some(thread) = current_thread() {
        RuntimeMetrics::inc(&thread.stats().fake_frames_freed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: u32 = 16;

    fn with_stack(f: impl FnOnce(&FakeStack)) {
        let fs = FakeStack::create(LOG).unwrap();
        // SAFETY: freshly created, destroyed exactly once below.
        unsafe {
            f(fs.as_ref());
            FakeStack::destroy(fs, 0).unwrap();
        }
    }

    #[test]
    fn class_geometry() {
        assert_eq!(bytes_in_size_class(0), 64);
        assert_eq!(bytes_in_size_class(10), 64 << 10);
        assert_eq!(number_of_frames(16, 0), 1024);
        assert_eq!(number_of_frames(16, 10), 1);
        assert_eq!(flags_offset(16, 1), 1024);
        assert_eq!(flags_offset(16, 2), 1024 + 512);
    }

    #[test]
    fn allocate_free_reuses_the_slot() {
        with_stack(|fs| {
            let a = fs.allocate(2, 0x7fff_0000).unwrap();
            let b = fs.allocate(2, 0x7fff_0000).unwrap();
            assert_ne!(a, b);
            assert_eq!(b - a, bytes_in_size_class(2));
            assert_eq!(fs.live_frames(), 2);
            // SAFETY: `a` is a live class-2 frame.
            unsafe { FakeStack::deallocate(a, 2) };
            assert_eq!(fs.live_frames(), 1);
            assert!(!fs.frame_is_live(a));
            assert!(fs.frame_is_live(b + 10));
        });
    }

    #[test]
    fn largest_class_fills_up() {
        with_stack(|fs| {
            assert!(fs.allocate(10, 0).is_some());
            assert!(fs.allocate(10, 0).is_none());
            assert!(fs.allocate(NUMBER_OF_SIZE_CLASSES, 0).is_none());
        });
    }

    #[test]
    fn address_lookup_finds_frame_bounds() {
        with_stack(|fs| {
            let frame = fs.allocate(3, 0).unwrap();
            let size = bytes_in_size_class(3);
            assert_eq!(fs.addr_is_in_fake_stack(frame + size - 1), Some((frame, frame + size)));
            assert_eq!(fs.addr_is_in_fake_stack(frame), Some((frame, frame + size)));
            assert_eq!(fs.addr_is_in_fake_stack(fs.base()), None);
            assert_eq!(fs.addr_is_in_fake_stack(fs.frames_end()), None);
        });
    }

    #[test]
    fn gc_releases_frames_of_returned_callers() {
        with_stack(|fs| {
            let deep = fs.allocate(0, 0x1000).unwrap();
            let shallow = fs.allocate(0, 0x9000).unwrap();
            fs.handle_no_return();
            assert!(fs.needs_gc());
            // Next allocation from a frame at 0x5000 collects `deep` first.
            let fresh = fs.allocate(1, 0x5000).unwrap();
            assert!(!fs.needs_gc());
            assert!(!fs.frame_is_live(deep));
            assert!(fs.frame_is_live(shallow));
            assert!(fs.frame_is_live(fresh));
        });
    }

    #[test]
    fn destroy_reports_live_frames_and_rejects_bad_magic() {
        let fs = FakeStack::create(LOG).unwrap();
        // SAFETY: single owner; the mapping stays valid until destroy.
        unsafe {
            fs.as_ref().allocate(0, 0).unwrap();
            fs.as_ref().allocate(5, 0).unwrap();
            assert_eq!(FakeStack::destroy(fs, 4), Ok(2));
        }

        let corrupt = FakeStack::create(LOG).unwrap();
        // SAFETY: still mapped; a failed destroy leaves it mapped.
        unsafe {
            corrupt.as_ref().magic.store(0, Ordering::Relaxed);
            assert_eq!(
                FakeStack::destroy(corrupt, 4),
                Err(ThreadError::DoubleFakeStackTeardown {
                    tid: 4,
                    addr: corrupt.as_ptr() as usize
                })
            );
            corrupt.as_ref().magic.store(MAGIC, Ordering::Relaxed);
            FakeStack::destroy(corrupt, 4).unwrap();
        }
    }

    #[test]
    fn tls_slot_round_trips() {
        assert!(tls_fake_stack().is_null());
        set_tls_fake_stack(0x1000 as *mut FakeStack);
        assert_eq!(tls_fake_stack() as usize, 0x1000);
        set_tls_fake_stack(ptr::null_mut());
        assert!(tls_fake_stack().is_null());
    }

    #[test]
    fn disabled_feature_falls_back_to_real_stack() {
        let _guard = crate::config::UAR_FLAG_TEST_LOCK.lock();
        crate::config::set_detect_stack_use_after_return(false);
        for _ in 0..100 {
            assert!(get_fake_stack_fast().is_none());
        }
        assert_eq!(on_malloc(0, 32, 0xdead_0000), 0xdead_0000);
    }
}
