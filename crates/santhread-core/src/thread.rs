//! Live per-OS-thread state.
//!
//! ## Lifecycle
//!
//! 1. [`Thread::create`] runs on the parent. It maps a placeholder `Thread`
//!    straight from the OS (never the tracked allocator), registers it and
//!    binds it to a [`ThreadContext`].
//! 2. [`Thread::thread_start`] runs on the new OS thread. It waits for the
//!    parent's readiness flag, becomes the current thread, runs
//!    [`Thread::init`] to learn its real stack and TLS, marks itself
//!    running, calls the user routine, then tears itself down.
//! 3. Teardown finishes the context (clearing its back-reference), destroys
//!    the fake stack and unmaps the `Thread`. The OS-level TSD destructor is
//!    a last-resort path to the same teardown for threads that exit without
//!    returning from their start routine.
//!
//! Only the owning thread writes these fields. Cross-thread readers go
//! through the registry lock and see a possibly-stale snapshot.

use core::ffi::c_void;
use core::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use log::{debug, trace};

use crate::config::{detect_stack_use_after_return, uar_stack_size_log_bounds};
use crate::context::{StackId, ThreadContext, Tid};
use crate::current::{current_thread_ptr, set_current_thread};
use crate::error::{ThreadError, fatal};
use crate::fake_stack::{self, FakeStack};
use crate::metrics::{RuntimeMetrics, ThreadStats, dead_thread_stats, global_metrics};
use crate::platform;
use crate::raw_memory;
use crate::registry::{ThreadRegistry, global_registry};
use crate::shadow::shadow;
use crate::stack::{StackDescriptor, StackDescriptorSet};
use crate::INVALID_TID;

/// C-ABI start routine.
pub type ThreadCallback = unsafe extern "C" fn(*mut c_void) -> *mut c_void;

/// Words of opaque per-thread storage reserved for the allocator.
pub const MALLOC_STORAGE_WORDS: usize = 16;

const FAKE_STACK_UNINIT: usize = 0;
/// Construction in progress, or permanently unavailable on this thread.
const FAKE_STACK_BUSY: usize = 1;

/// State of one live OS thread.
pub struct Thread {
    context: AtomicPtr<ThreadContext>,
    registry: &'static ThreadRegistry,
    start_routine: usize,
    arg: usize,
    stacks: StackDescriptorSet,
    tls_begin: AtomicUsize,
    tls_end: AtomicUsize,
    fake_stack: AtomicUsize,
    malloc_storage: [AtomicUsize; MALLOC_STORAGE_WORDS],
    stats: ThreadStats,
    unwinding: AtomicBool,
    in_deadly_signal: AtomicBool,
}

impl Thread {
    /// Valid "no stack, no fake stack" object, before registration.
    const fn placeholder(registry: &'static ThreadRegistry, start_routine: usize, arg: usize) -> Self {
        Self {
            context: AtomicPtr::new(ptr::null_mut()),
            registry,
            start_routine,
            arg,
            stacks: StackDescriptorSet::new(),
            tls_begin: AtomicUsize::new(0),
            tls_end: AtomicUsize::new(0),
            fake_stack: AtomicUsize::new(FAKE_STACK_UNINIT),
            malloc_storage: [const { AtomicUsize::new(0) }; MALLOC_STORAGE_WORDS],
            stats: ThreadStats::new(),
            unwinding: AtomicBool::new(false),
            in_deadly_signal: AtomicBool::new(false),
        }
    }

    /// Create and register a thread in the global registry.
    ///
    /// Aborts the process if the tid space is exhausted or memory cannot be
    /// mapped.
    #[must_use]
    pub fn create(
        start_routine: Option<ThreadCallback>,
        arg: *mut c_void,
        parent_tid: Tid,
        stack_id: StackId,
        detached: bool,
    ) -> NonNull<Thread> {
        Self::try_create_in(
            global_registry(),
            start_routine,
            arg,
            parent_tid,
            stack_id,
            detached,
        )
        .unwrap_or_else(|err| fatal(err))
    }

    /// Fallible [`Thread::create`] against an explicit registry.
    pub fn try_create_in(
        registry: &'static ThreadRegistry,
        start_routine: Option<ThreadCallback>,
        arg: *mut c_void,
        parent_tid: Tid,
        stack_id: StackId,
        detached: bool,
    ) -> Result<NonNull<Thread>, ThreadError> {
        let routine = start_routine.map_or(0, |f| f as usize);
        let thread = raw_memory::map_object(Self::placeholder(registry, routine, arg as usize), "thread")?;

        let mut lock = registry.lock();
        let registered = lock
            .create_thread(
                parent_tid,
                detached,
                thread.as_ptr() as usize,
                thread.as_ptr(),
                stack_id,
            )
            .and_then(|tid| lock.context(tid).ok_or(ThreadError::UnknownTid { tid }));
        match registered {
            Ok(ctx) => {
                // SAFETY: freshly mapped, not yet visible to any other thread
                // except through the context we just bound under the lock.
                unsafe { thread.as_ref() }.set_context(ctx);
                Ok(thread)
            }
            Err(err) => {
                drop(lock);
                // SAFETY: registration failed, so nothing references it.
                unsafe { raw_memory::unmap_object(thread) };
                Err(err)
            }
        }
    }

    pub(crate) fn set_context(&self, ctx: &ThreadContext) {
        self.context
            .store(ctx as *const ThreadContext as *mut ThreadContext, Ordering::Release);
    }

    /// The durable record of this thread.
    #[must_use]
    pub fn context(&self) -> Option<&ThreadContext> {
        let ctx = self.context.load(Ordering::Acquire);
        // SAFETY: contexts are never freed while their registry lives, and a
        // Thread never outlives its `'static` registry.
        unsafe { ctx.as_ref() }
    }

    #[must_use]
    pub fn tid(&self) -> Tid {
        self.context().map_or(INVALID_TID, ThreadContext::tid)
    }

    #[must_use]
    pub fn registry(&self) -> &'static ThreadRegistry {
        self.registry
    }

    #[must_use]
    pub fn start_routine(&self) -> Option<ThreadCallback> {
        if self.start_routine == 0 {
            return None;
        }
        // SAFETY: a non-zero value was stored from a `ThreadCallback`.
        Some(unsafe { core::mem::transmute::<usize, ThreadCallback>(self.start_routine) })
    }

    #[must_use]
    pub fn arg(&self) -> *mut c_void {
        self.arg as *mut c_void
    }

    /// Learn the real stack and TLS bounds. Must run on the thread itself.
    pub fn init(&self) -> Result<(), ThreadError> {
        let stack = platform::current_stack_bounds()?;
        self.stacks.set_user_stack(stack.bottom, stack.size())?;
        let tls = platform::current_static_tls_bounds();
        self.tls_begin.store(tls.bottom, Ordering::Relaxed);
        self.tls_end.store(tls.top, Ordering::Relaxed);

        let sh = shadow();
        sh.unpoison(stack.bottom, stack.size());
        if tls.size() > 0 {
            sh.unpoison(tls.bottom, tls.size());
        }
        debug!(
            "T{}: stack [{:#x},{:#x}) size {:#x}; tls [{:#x},{:#x})",
            self.tid(),
            stack.bottom,
            stack.top,
            stack.size(),
            tls.bottom,
            tls.top
        );
        Ok(())
    }

    /// Body of the new OS thread. Returns the start routine's result.
    ///
    /// # Safety
    ///
    /// `this` must come from [`Thread::create`], must not have started
    /// before, and is unmapped before this returns.
    pub unsafe fn thread_start(
        this: NonNull<Thread>,
        os_id: u64,
        ready: Option<&AtomicU32>,
    ) -> *mut c_void {
        if let Some(flag) = ready {
            wait_until_ready(flag);
        }
        // SAFETY: live until `destroy` below.
        let thread = unsafe { this.as_ref() };
        // SAFETY: stays valid until `destroy` clears it.
        unsafe { set_current_thread(this.as_ptr()) };
        if let Err(err) = thread.init() {
            fatal(err);
        }
        if let Err(err) = thread.registry.lock().start_thread(thread.tid(), os_id) {
            fatal(err);
        }
        let result = match thread.start_routine() {
            // SAFETY: the creator vouched for routine and argument.
            Some(routine) => unsafe { routine(thread.arg()) },
            None => ptr::null_mut(),
        };
        // SAFETY: the routine returned; nothing on this thread uses `this` now.
        unsafe { Self::destroy(this) };
        result
    }

    /// Tear the thread down and unmap it.
    ///
    /// # Safety
    ///
    /// `this` must be a live Thread from [`Thread::create`] and nothing may
    /// use it afterwards.
    pub unsafe fn destroy(this: NonNull<Thread>) {
        // SAFETY: live until the unmap at the end.
        let thread = unsafe { this.as_ref() };
        let tid = thread.tid();
        debug!("T{tid}: tearing down");

        if let Err(err) = thread.registry.lock().finish_thread(tid) {
            fatal(err);
        }
        if current_thread_ptr() == this.as_ptr() {
            // SAFETY: clearing is always valid.
            unsafe { set_current_thread(ptr::null_mut()) };
        }

        let stack = thread.current_stack();
        let sh = shadow();
        if stack.size > 0 {
            sh.unpoison(stack.bottom, stack.size);
        }
        let (tls_begin, tls_end) = (thread.tls_begin(), thread.tls_end());
        if tls_end > tls_begin {
            sh.unpoison(tls_begin, tls_end - tls_begin);
        }

        if let Err(err) = thread.delete_fake_stack(tid) {
            fatal(err);
        }
        thread.stats.flush_into(dead_thread_stats());
        // SAFETY: the context no longer references us and the caller
        // guarantees no other user.
        unsafe { raw_memory::unmap_object(this) };
    }

    // -----------------------------------------------------------------------
    // Stacks
    // -----------------------------------------------------------------------

    /// Switch to a caller-supplied stack. Aborts on corrupted rotation state.
    pub fn set_user_stack(&self, bottom: usize, size: usize) {
        if let Err(err) = self.stacks.set_user_stack(bottom, size) {
            fatal(err);
        }
        RuntimeMetrics::inc(&self.stats.stack_switches);
        RuntimeMetrics::inc(&global_metrics().stack_switches);
    }

    /// Return to the stack in use before the last [`Self::set_user_stack`].
    pub fn restore_previous_user_stack(&self) {
        if let Err(err) = self.stacks.restore_previous_user_stack() {
            fatal(err);
        }
        RuntimeMetrics::inc(&self.stats.stack_switches);
        RuntimeMetrics::inc(&global_metrics().stack_switches);
    }

    #[inline(always)]
    #[must_use]
    pub fn current_stack(&self) -> StackDescriptor {
        self.stacks.current_stack()
    }

    #[must_use]
    pub fn stacks(&self) -> &StackDescriptorSet {
        &self.stacks
    }

    #[inline(always)]
    #[must_use]
    pub fn stack_top(&self) -> usize {
        self.stacks.stack_top()
    }

    #[inline(always)]
    #[must_use]
    pub fn stack_bottom(&self) -> usize {
        self.stacks.stack_bottom()
    }

    #[inline(always)]
    #[must_use]
    pub fn stack_size(&self) -> usize {
        self.stacks.stack_size()
    }

    #[inline(always)]
    #[must_use]
    pub fn addr_is_in_stack(&self, addr: usize) -> bool {
        self.stacks.addr_is_in_stack(addr)
    }

    #[must_use]
    pub fn tls_begin(&self) -> usize {
        self.tls_begin.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn tls_end(&self) -> usize {
        self.tls_end.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Fake stack
    // -----------------------------------------------------------------------

    /// This thread's fake stack, built on first use.
    ///
    /// `None` whenever the feature is disabled, without allocating.
    #[inline]
    #[must_use]
    pub fn fake_stack(&self) -> Option<NonNull<FakeStack>> {
        if !detect_stack_use_after_return() {
            return None;
        }
        match self.fake_stack.load(Ordering::Acquire) {
            FAKE_STACK_UNINIT => self.lazy_init_fake_stack(),
            FAKE_STACK_BUSY => None,
            fs => NonNull::new(fs as *mut FakeStack),
        }
    }

    /// Build the fake stack. Safe to re-enter from a signal handler: the
    /// loser of the 0 → 1 race simply gets `None`.
    fn lazy_init_fake_stack(&self) -> Option<NonNull<FakeStack>> {
        let stack_size = self.stack_size();
        if stack_size == 0 {
            return None;
        }
        if self
            .fake_stack
            .compare_exchange(
                FAKE_STACK_UNINIT,
                FAKE_STACK_BUSY,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_err()
        {
            return None;
        }
        let log = fake_stack_size_log(stack_size, uar_stack_size_log_bounds());
        // On failure the slot stays BUSY: this thread runs without one.
        let fs = FakeStack::create(log).ok()?;
        self.fake_stack.store(fs.as_ptr() as usize, Ordering::Release);
        if current_thread_ptr() == self as *const Thread as *mut Thread {
            fake_stack::set_tls_fake_stack(fs.as_ptr());
        }
        Some(fs)
    }

    /// The fake stack if already built; never builds one.
    #[must_use]
    pub fn existing_fake_stack(&self) -> Option<NonNull<FakeStack>> {
        match self.fake_stack.load(Ordering::Acquire) {
            FAKE_STACK_UNINIT | FAKE_STACK_BUSY => None,
            fs => NonNull::new(fs as *mut FakeStack),
        }
    }

    /// Whether `addr` is inside a frame of this thread's fake stack.
    #[must_use]
    pub fn addr_is_in_fake_stack(&self, addr: usize) -> bool {
        self.existing_fake_stack().is_some_and(|fs| {
            // SAFETY: an installed fake stack stays mapped until teardown.
            unsafe { fs.as_ref() }.addr_is_in_fake_stack(addr).is_some()
        })
    }

    /// Destroy the fake stack, if any. A second call is a no-op.
    pub fn delete_fake_stack(&self, tid: Tid) -> Result<(), ThreadError> {
        let Some(fs) = self.existing_fake_stack() else {
            return Ok(());
        };
        self.fake_stack.store(FAKE_STACK_UNINIT, Ordering::Release);
        if fake_stack::tls_fake_stack() == fs.as_ptr() {
            fake_stack::set_tls_fake_stack(ptr::null_mut());
        }
        // SAFETY: detached from every reference above; destroyed once.
        unsafe { FakeStack::destroy(fs, tid) }.map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Flags and storage
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn is_unwinding(&self) -> bool {
        self.unwinding.load(Ordering::Relaxed)
    }

    pub(crate) fn set_unwinding(&self, value: bool) {
        self.unwinding.store(value, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_in_deadly_signal(&self) -> bool {
        self.in_deadly_signal.load(Ordering::Relaxed)
    }

    pub(crate) fn set_in_deadly_signal(&self, value: bool) {
        self.in_deadly_signal.store(value, Ordering::Relaxed);
    }

    #[must_use]
    pub fn stats(&self) -> &ThreadStats {
        &self.stats
    }

    /// Opaque words the allocator keeps per thread.
    #[must_use]
    pub fn malloc_storage(&self) -> &[AtomicUsize; MALLOC_STORAGE_WORDS] {
        &self.malloc_storage
    }
}

/// `log2(roundup_pow2(stack_size))` clamped into the option bounds.
///
/// Never panics: bounds arriving out of order are swapped, and sizes past
/// the largest power of two count as `usize::BITS`.
fn fake_stack_size_log(stack_size: usize, (min_log, max_log): (u32, u32)) -> u32 {
    let (lo, hi) = (min_log.min(max_log), min_log.max(max_log));
    stack_size
        .checked_next_power_of_two()
        .map_or(usize::BITS, usize::trailing_zeros)
        .clamp(lo, hi)
}

/// Block until the parent publishes a non-zero readiness flag.
///
/// Uses futex wait; never allocates.
fn wait_until_ready(flag: &AtomicU32) {
    while flag.load(Ordering::Acquire) == 0 {
        // SAFETY: `flag` is a valid, aligned u32 for the call's duration.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                flag.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                0u32,
                ptr::null::<libc::timespec>(),
            );
        }
    }
}

/// Parent side of the startup handshake: release a child parked in
/// [`Thread::thread_start`].
pub fn signal_ready(flag: &AtomicU32) {
    flag.store(1, Ordering::Release);
    // SAFETY: `flag` is a valid, aligned u32 for the call's duration.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            flag.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            1u32,
        );
    }
}

/// Last-resort teardown, registered as the TSD destructor.
///
/// The slot holds the thread's context. While the destructor budget lasts
/// the hook re-arms itself so other TSD destructors (which may still use
/// the runtime) run first; on the final pass it destroys a thread that is
/// still bound.
pub(crate) unsafe extern "C" fn tsd_destructor(arg: *mut c_void) {
    // SAFETY: the slot only ever holds a context pointer or null.
    let Some(ctx) = (unsafe { (arg as *const ThreadContext).as_ref() }) else {
        return;
    };
    let remaining = ctx.take_destructor_iteration();
    if remaining > 1 {
        trace!("T{}: deferring teardown ({} passes left)", ctx.tid(), remaining - 1);
        platform::set_tsd(arg);
        return;
    }
    if let Some(thread) = NonNull::new(ctx.thread()) {
        // SAFETY: still bound, so not yet destroyed; this thread is exiting.
        unsafe { Thread::destroy(thread) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ThreadStatus;
    use crate::current::current_thread;

    fn test_registry() -> &'static ThreadRegistry {
        Box::leak(Box::new(ThreadRegistry::new(64, 0)))
    }

    unsafe extern "C" fn add_one(arg: *mut c_void) -> *mut c_void {
        (arg as usize + 1) as *mut c_void
    }

    unsafe extern "C" fn record_current_tid(arg: *mut c_void) -> *mut c_void {
        // SAFETY: the test passes a pointer to a live AtomicU32.
        let slot = unsafe { &*(arg as *const AtomicU32) };
        slot.store(crate::current::current_tid_or_invalid(), Ordering::SeqCst);
        ptr::null_mut()
    }

    #[test]
    fn placeholder_has_no_stack_and_no_fake_stack() {
        let reg = test_registry();
        let t = Thread::placeholder(reg, 0, 0);
        assert_eq!(t.stack_size(), 0);
        assert_eq!(t.tid(), INVALID_TID);
        assert!(t.existing_fake_stack().is_none());
        assert!(t.start_routine().is_none());
        assert!(!t.is_unwinding() && !t.is_in_deadly_signal());
    }

    #[test]
    fn create_binds_context_both_ways() {
        let reg = test_registry();
        let t = Thread::try_create_in(reg, Some(add_one), 41 as *mut c_void, 7, 99, false).unwrap();
        // SAFETY: live until destroyed below.
        let thread = unsafe { t.as_ref() };
        let ctx = thread.context().unwrap();
        assert_eq!(ctx.thread(), t.as_ptr());
        assert_eq!(ctx.parent_tid(), 7);
        assert_eq!(ctx.stack_id(), 99);
        assert_eq!(ctx.status(), ThreadStatus::Created);
        // SAFETY: never started; destroyed exactly once.
        unsafe { Thread::destroy(t) };
        assert!(!ctx.has_live_thread());
    }

    #[test]
    fn thread_start_runs_routine_and_tears_down() {
        let reg = test_registry();
        let t = Thread::try_create_in(reg, Some(add_one), 41 as *mut c_void, 0, 0, false).unwrap();
        // SAFETY: live until the child tears it down.
        let tid = unsafe { t.as_ref() }.tid();
        let handle = t.as_ptr() as usize;
        let result = std::thread::spawn(move || {
            let t = NonNull::new(handle as *mut Thread).unwrap();
            // SAFETY: created above, started once.
            let r = unsafe { Thread::thread_start(t, platform::os_thread_id(), None) };
            (r as usize, current_thread().is_none())
        })
        .join()
        .unwrap();
        assert_eq!(result, (42, true));
        let lock = reg.lock();
        let ctx = lock.context(tid).unwrap();
        assert_eq!(ctx.status(), ThreadStatus::Finished);
        assert!(!ctx.has_live_thread());
        assert_ne!(ctx.os_id(), 0);
    }

    #[test]
    fn child_waits_for_readiness_flag() {
        let reg = test_registry();
        let seen: &'static AtomicU32 = Box::leak(Box::new(AtomicU32::new(INVALID_TID)));
        let ready: &'static AtomicU32 = Box::leak(Box::new(AtomicU32::new(0)));
        let t = Thread::try_create_in(
            reg,
            Some(record_current_tid),
            seen as *const AtomicU32 as *mut c_void,
            0,
            0,
            true,
        )
        .unwrap();
        // SAFETY: live until the child tears it down.
        let tid = unsafe { t.as_ref() }.tid();
        let handle = t.as_ptr() as usize;
        let child = std::thread::spawn(move || {
            let t = NonNull::new(handle as *mut Thread).unwrap();
            // SAFETY: created above, started once.
            unsafe { Thread::thread_start(t, platform::os_thread_id(), Some(ready)) };
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(seen.load(Ordering::SeqCst), INVALID_TID);
        signal_ready(ready);
        child.join().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), tid);
        // Detached: retired at finish.
        assert_eq!(reg.lock().context(tid).unwrap().status(), ThreadStatus::Dead);
    }

    #[test]
    fn user_stack_switch_and_restore_returns_to_os_stack() {
        let reg = test_registry();
        let t = Thread::try_create_in(reg, None, ptr::null_mut(), 0, 0, false).unwrap();
        let handle = t.as_ptr() as usize;
        std::thread::spawn(move || {
            let t = NonNull::new(handle as *mut Thread).unwrap();
            // SAFETY: owned by this OS thread until destroy.
            let thread = unsafe { t.as_ref() };
            thread.init().unwrap();
            let os = platform::current_stack_bounds().unwrap();
            assert_eq!(thread.stack_bottom(), os.bottom);

            thread.set_user_stack(0x1000, 0x1000);
            thread.restore_previous_user_stack();
            let now = thread.current_stack();
            assert_eq!(now, StackDescriptor::new(os.bottom, os.size()));
            assert!(!thread.addr_is_in_stack(0x1800));
            assert_eq!(thread.stats().snapshot().stack_switches, 2);
            // SAFETY: done with it.
            unsafe { Thread::destroy(t) };
        })
        .join()
        .unwrap();
    }

    #[test]
    fn fake_stack_lifecycle_on_owning_thread() {
        let _guard = crate::config::UAR_FLAG_TEST_LOCK.lock();
        let reg = test_registry();
        let t = Thread::try_create_in(reg, None, ptr::null_mut(), 0, 0, false).unwrap();
        let handle = t.as_ptr() as usize;
        crate::config::set_detect_stack_use_after_return(true);
        let outcome = std::thread::spawn(move || {
            let t = NonNull::new(handle as *mut Thread).unwrap();
            // SAFETY: owned by this OS thread until destroy.
            let thread = unsafe { t.as_ref() };
            // No stack known yet: nothing is built.
            let before_init = thread.fake_stack().is_none();
            thread.init().unwrap();
            // SAFETY: valid until destroy.
            unsafe { set_current_thread(t.as_ptr()) };
            let fs = thread.fake_stack().unwrap();
            let cached = thread.fake_stack() == Some(fs);
            let published = fake_stack::tls_fake_stack() == fs.as_ptr();
            let frame = fake_stack::on_malloc(1, 100, 0x10);
            let found = thread.addr_is_in_fake_stack(frame + 8);

            let tid = thread.tid();
            thread.delete_fake_stack(tid).unwrap();
            let cleared = fake_stack::tls_fake_stack().is_null() && thread.existing_fake_stack().is_none();
            thread.delete_fake_stack(tid).unwrap();
            // SAFETY: done with it.
            unsafe { Thread::destroy(t) };
            (before_init, cached, published, found, cleared)
        })
        .join()
        .unwrap();
        crate::config::set_detect_stack_use_after_return(false);
        assert_eq!(outcome, (true, true, true, true, true));
    }

    #[test]
    fn disabled_fake_stack_is_never_built() {
        let _guard = crate::config::UAR_FLAG_TEST_LOCK.lock();
        crate::config::set_detect_stack_use_after_return(false);
        let reg = test_registry();
        let t = Thread::try_create_in(reg, None, ptr::null_mut(), 0, 0, false).unwrap();
        // SAFETY: live until destroyed below.
        let thread = unsafe { t.as_ref() };
        thread.stacks().set_user_stack(0x10_0000, 0x10_0000).unwrap();
        for _ in 0..32 {
            assert!(thread.fake_stack().is_none());
        }
        assert!(thread.existing_fake_stack().is_none());
        // SAFETY: destroyed once.
        unsafe { Thread::destroy(t) };
    }

    #[test]
    fn size_log_tolerates_out_of_order_bounds() {
        let mib = 1 << 20;
        assert_eq!(fake_stack_size_log(mib, (16, 20)), 20);
        assert_eq!(fake_stack_size_log(mib, (22, 20)), 22);
        assert_eq!(fake_stack_size_log(0x3000, (18, 16)), 16);
        assert_eq!(fake_stack_size_log(usize::MAX - 0xff, (16, 28)), 28);
    }

    #[test]
    fn exhausted_registry_reports_instead_of_leaking() {
        let reg: &'static ThreadRegistry = Box::leak(Box::new(ThreadRegistry::new(1, 0)));
        let first = Thread::try_create_in(reg, None, ptr::null_mut(), 0, 0, false).unwrap();
        let second = Thread::try_create_in(reg, None, ptr::null_mut(), 0, 0, false);
        assert_eq!(second.err(), Some(ThreadError::TidSpaceExhausted { capacity: 1 }));
        // SAFETY: destroyed once.
        unsafe { Thread::destroy(first) };
    }
}
