//! OS primitives the thread runtime consumes.
//!
//! Thin, allocation-free wrappers over libc: stack and static-TLS bounds of
//! the calling thread, the kernel thread id, the process-wide TSD slot that
//! backs the last-resort teardown hook, and `pthread_atfork` registration.

use core::ffi::c_void;
use core::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::error::ThreadError;

/// Times the TSD destructor pass runs at thread exit (POSIX minimum).
pub const PTHREAD_DESTRUCTOR_ITERATIONS: u32 = 4;

/// Bounds of a contiguous address range, `[bottom, top)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bounds {
    pub bottom: usize,
    pub top: usize,
}

impl Bounds {
    #[must_use]
    pub const fn size(&self) -> usize {
        self.top - self.bottom
    }
}

// ---------------------------------------------------------------------------
// Stack and TLS bounds
// ---------------------------------------------------------------------------

/// OS-reported stack of the calling thread.
pub fn current_stack_bounds() -> Result<Bounds, ThreadError> {
    let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();
    // SAFETY: `attr` is written by pthread_getattr_np before any read and
    // destroyed on every path after a successful init.
    unsafe {
        let rc = libc::pthread_getattr_np(libc::pthread_self(), attr.as_mut_ptr());
        if rc != 0 {
            return Err(ThreadError::StackBoundsUnavailable { errno: rc });
        }
        let mut addr: *mut c_void = core::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(attr.as_ptr(), &mut addr, &mut size);
        libc::pthread_attr_destroy(attr.as_mut_ptr());
        if rc != 0 || size == 0 {
            return Err(ThreadError::StackBoundsUnavailable { errno: rc });
        }
        let bottom = addr as usize;
        Ok(Bounds {
            bottom,
            top: bottom + size,
        })
    }
}

type TlsStaticInfoFn = unsafe extern "C" fn(*mut libc::size_t, *mut libc::size_t);

const TLS_INFO_UNRESOLVED: usize = 0;
const TLS_INFO_MISSING: usize = 1;

static TLS_INFO_FN: AtomicUsize = AtomicUsize::new(TLS_INFO_UNRESOLVED);

fn static_tls_size() -> usize {
    let mut f = TLS_INFO_FN.load(Ordering::Acquire);
    if f == TLS_INFO_UNRESOLVED {
        // SAFETY: dlsym with a NUL-terminated name and the default handle.
        let sym = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c"_dl_get_tls_static_info".as_ptr()) };
        f = if sym.is_null() {
            TLS_INFO_MISSING
        } else {
            sym as usize
        };
        TLS_INFO_FN.store(f, Ordering::Release);
    }
    if f == TLS_INFO_MISSING {
        return 0;
    }
    // SAFETY: the symbol resolved above has this signature in glibc.
    let info: TlsStaticInfoFn = unsafe { core::mem::transmute::<usize, TlsStaticInfoFn>(f) };
    let mut size: libc::size_t = 0;
    let mut align: libc::size_t = 0;
    // SAFETY: both out-pointers are valid locals.
    unsafe { info(&mut size, &mut align) };
    size
}

/// Static TLS block of the calling thread, or empty if unknown.
///
/// On x86_64 glibc the block ends at the thread pointer, which is what
/// `pthread_self` returns.
#[must_use]
pub fn current_static_tls_bounds() -> Bounds {
    if !cfg!(all(target_os = "linux", target_arch = "x86_64", target_env = "gnu")) {
        return Bounds::default();
    }
    let size = static_tls_size();
    if size == 0 {
        return Bounds::default();
    }
    // SAFETY: pthread_self has no preconditions.
    let top = unsafe { libc::pthread_self() } as usize;
    Bounds {
        bottom: top.saturating_sub(size),
        top,
    }
}

/// Kernel id of the calling thread.
#[must_use]
pub fn os_thread_id() -> u64 {
    // SAFETY: gettid takes no arguments and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

/// An address inside the caller's current stack frame.
#[inline(always)]
#[must_use]
pub fn current_frame_address() -> usize {
    let marker = 0u8;
    core::hint::black_box(&marker) as *const u8 as usize
}

// ---------------------------------------------------------------------------
// Thread-specific data slot
// ---------------------------------------------------------------------------

const KEY_UNSET: u32 = u32::MAX;

static TSD_KEY: AtomicU32 = AtomicU32::new(KEY_UNSET);

/// Create the process-wide TSD key with `destructor`. Idempotent.
///
/// Returns the pthread error code on failure.
pub fn install_tsd_destructor(destructor: unsafe extern "C" fn(*mut c_void)) -> Result<(), i32> {
    if TSD_KEY.load(Ordering::Acquire) != KEY_UNSET {
        return Ok(());
    }
    let mut key: libc::pthread_key_t = 0;
    // SAFETY: `key` is a valid out-pointer; destructor has the C signature.
    let rc = unsafe { libc::pthread_key_create(&mut key, Some(destructor)) };
    if rc != 0 {
        return Err(rc);
    }
    if TSD_KEY
        .compare_exchange(KEY_UNSET, key as u32, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        // Lost a race with another installer; keep theirs.
        // SAFETY: `key` was created above and never published.
        unsafe { libc::pthread_key_delete(key) };
    }
    Ok(())
}

/// Whether the TSD key exists.
#[must_use]
pub fn tsd_installed() -> bool {
    TSD_KEY.load(Ordering::Acquire) != KEY_UNSET
}

/// Store `value` in the calling thread's TSD slot. No-op before install.
pub fn set_tsd(value: *mut c_void) {
    let key = TSD_KEY.load(Ordering::Acquire);
    if key == KEY_UNSET {
        return;
    }
    // SAFETY: `key` was created by install_tsd_destructor.
    unsafe { libc::pthread_setspecific(key as libc::pthread_key_t, value) };
}

/// The calling thread's TSD slot, null before install.
#[must_use]
pub fn get_tsd() -> *mut c_void {
    let key = TSD_KEY.load(Ordering::Acquire);
    if key == KEY_UNSET {
        return core::ptr::null_mut();
    }
    // SAFETY: `key` was created by install_tsd_destructor.
    unsafe { libc::pthread_getspecific(key as libc::pthread_key_t) }
}

/// Register fork handlers. Returns the pthread error code on failure.
pub fn register_atfork(
    prepare: unsafe extern "C" fn(),
    parent: unsafe extern "C" fn(),
    child: unsafe extern "C" fn(),
) -> Result<(), i32> {
    // SAFETY: the handlers have the required C signature and 'static lifetime.
    let rc = unsafe { libc::pthread_atfork(Some(prepare), Some(parent), Some(child)) };
    if rc == 0 { Ok(()) } else { Err(rc) }
}
