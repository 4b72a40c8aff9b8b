//! Seam to the shadow-memory collaborator.
//!
//! The byte-level poison bitmap lives outside this crate. The runtime only
//! tells it which ranges became valid (a thread's stack and TLS, a fresh
//! fake frame) or invalid (a released fake frame). A process installs its
//! implementation once; until then [`NullShadow`] drops every request.

use std::sync::OnceLock;

/// Why a range is being poisoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoisonKind {
    /// A fake frame whose function has returned.
    StackAfterReturn,
    /// Memory no longer belonging to any live object.
    Unaddressable,
}

/// Range validity marking.
pub trait ShadowMemory: Send + Sync {
    /// Mark `[addr, addr + size)` addressable.
    fn unpoison(&self, addr: usize, size: usize);
    /// Mark `[addr, addr + size)` invalid for `kind`.
    fn poison(&self, addr: usize, size: usize, kind: PoisonKind);
}

/// Shadow implementation that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullShadow;

impl ShadowMemory for NullShadow {
    fn unpoison(&self, _addr: usize, _size: usize) {}
    fn poison(&self, _addr: usize, _size: usize, _kind: PoisonKind) {}
}

static NULL_SHADOW: NullShadow = NullShadow;
static INSTALLED: OnceLock<&'static dyn ShadowMemory> = OnceLock::new();

/// Install the process-wide shadow. Returns `false` if one was already set.
pub fn install_shadow(shadow: &'static dyn ShadowMemory) -> bool {
    INSTALLED.set(shadow).is_ok()
}

/// The installed shadow, or [`NullShadow`].
#[inline]
#[must_use]
pub fn shadow() -> &'static dyn ShadowMemory {
    match INSTALLED.get() {
        Some(s) => *s,
        None => &NULL_SHADOW,
    }
}
