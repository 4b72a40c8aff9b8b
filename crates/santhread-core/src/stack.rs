//! Triple-buffered stack descriptors.
//!
//! A thread's "current stack" changes when it jumps to a caller-supplied
//! stack (a signal handler on an alternate stack, a coroutine switch). A
//! signal handler running on the same thread may read the descriptors at
//! any instruction, so an update must never be observable half-done.
//!
//! ## Design
//!
//! Three descriptor slots and three role indices: `previous`, `next` and
//! `temp`. [`StackDescriptorSet::set_user_stack`] fills the slot in the temp
//! role, then reassigns the roles with three single-word stores:
//!
//! ```text
//! previous := next
//! next     := temp
//! temp     := old previous
//! ```
//!
//! An interrupting reader sees either the old pair or the new pair of
//! committed slots, never a torn descriptor. The current stack is `previous`
//! if the caller's own frame lies inside it, otherwise `next`.
//!
//! This protects against same-thread asynchronous observation only. Two OS
//! threads mutating one set concurrently is a bug; the owning thread is the
//! single writer.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::error::ThreadError;
use crate::platform;

/// A stack range `[bottom, top)`. `size == top - bottom` while committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackDescriptor {
    pub top: usize,
    pub bottom: usize,
    pub size: usize,
}

impl StackDescriptor {
    /// `top` wraps for a range ending at the top of the address space.
    #[must_use]
    pub const fn new(bottom: usize, size: usize) -> Self {
        Self {
            top: bottom.wrapping_add(size),
            bottom,
            size,
        }
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        self.bottom <= addr && addr < self.top
    }
}

struct Slot {
    top: AtomicUsize,
    bottom: AtomicUsize,
    size: AtomicUsize,
}

impl Slot {
    const fn empty() -> Self {
        Self {
            top: AtomicUsize::new(0),
            bottom: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
        }
    }

    fn load(&self) -> StackDescriptor {
        StackDescriptor {
            top: self.top.load(Ordering::SeqCst),
            bottom: self.bottom.load(Ordering::SeqCst),
            size: self.size.load(Ordering::SeqCst),
        }
    }

    fn store(&self, desc: StackDescriptor) {
        self.bottom.store(desc.bottom, Ordering::SeqCst);
        self.size.store(desc.size, Ordering::SeqCst);
        self.top.store(desc.top, Ordering::SeqCst);
    }
}

/// Three stack slots and their rotating roles.
pub struct StackDescriptorSet {
    slots: [Slot; 3],
    previous: AtomicU8,
    next: AtomicU8,
    temp: AtomicU8,
}

impl StackDescriptorSet {
    /// An empty set: no stack, every lookup misses.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [Slot::empty(), Slot::empty(), Slot::empty()],
            previous: AtomicU8::new(0),
            next: AtomicU8::new(1),
            temp: AtomicU8::new(2),
        }
    }

    fn roles(&self) -> Result<(u8, u8, u8), ThreadError> {
        let previous = self.previous.load(Ordering::SeqCst);
        let next = self.next.load(Ordering::SeqCst);
        let temp = self.temp.load(Ordering::SeqCst);
        let valid = previous < 3
            && next < 3
            && temp < 3
            && previous != next
            && next != temp
            && previous != temp;
        if valid {
            Ok((previous, next, temp))
        } else {
            Err(ThreadError::InconsistentRotation {
                previous,
                next,
                temp,
            })
        }
    }

    #[inline]
    fn slot(&self, role: &AtomicU8) -> StackDescriptor {
        // Roles are only ever assigned values below 3.
        self.slots[usize::from(role.load(Ordering::SeqCst) % 3)].load()
    }

    /// Install `[bottom, bottom + size)` as the newest stack.
    pub fn set_user_stack(&self, bottom: usize, size: usize) -> Result<(), ThreadError> {
        let (previous, next, temp) = self.roles()?;
        self.slots[usize::from(temp)].store(StackDescriptor::new(bottom, size));
        self.previous.store(next, Ordering::SeqCst);
        self.next.store(temp, Ordering::SeqCst);
        self.temp.store(previous, Ordering::SeqCst);
        Ok(())
    }

    /// Re-install the stack that was `previous` before the last change.
    pub fn restore_previous_user_stack(&self) -> Result<(), ThreadError> {
        let prev = self.slot(&self.previous);
        self.set_user_stack(prev.bottom, prev.size)
    }

    /// Current stack as seen from a frame at `sp`.
    #[inline]
    #[must_use]
    pub fn current_stack_at(&self, sp: usize) -> StackDescriptor {
        let previous = self.slot(&self.previous);
        if previous.contains(sp) {
            previous
        } else {
            self.slot(&self.next)
        }
    }

    /// Current stack as seen from the caller's frame.
    #[inline(always)]
    #[must_use]
    pub fn current_stack(&self) -> StackDescriptor {
        self.current_stack_at(platform::current_frame_address())
    }

    /// The slot in the previous role.
    #[must_use]
    pub fn previous_stack(&self) -> StackDescriptor {
        self.slot(&self.previous)
    }

    /// The slot in the next role.
    #[must_use]
    pub fn next_stack(&self) -> StackDescriptor {
        self.slot(&self.next)
    }

    #[inline(always)]
    #[must_use]
    pub fn stack_top(&self) -> usize {
        self.current_stack().top
    }

    #[inline(always)]
    #[must_use]
    pub fn stack_bottom(&self) -> usize {
        self.current_stack().bottom
    }

    #[inline(always)]
    #[must_use]
    pub fn stack_size(&self) -> usize {
        self.current_stack().size
    }

    /// Whether `addr` lies in the current stack.
    #[inline(always)]
    #[must_use]
    pub fn addr_is_in_stack(&self, addr: usize) -> bool {
        self.current_stack().contains(addr)
    }
}

impl Default for StackDescriptorSet {
    fn default() -> Self {
        Self::new()
    }
}
