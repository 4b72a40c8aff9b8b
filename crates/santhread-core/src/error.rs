//! Error type and the fatal-report path.
//!
//! Nothing in this crate is recoverable-and-continuable: a tracking runtime
//! that silently drops threads makes every later report unreliable. Internals
//! return `Result<_, ThreadError>`; process-facing entry points hand the
//! error to [`fatal`], which reports without touching the heap and aborts.

use core::fmt::{self, Write};

use thiserror::Error;

use crate::context::{ThreadStatus, Tid};

/// Everything that can go wrong while tracking threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ThreadError {
    /// Every tid below the registry capacity is alive or quarantined.
    #[error("thread limit exceeded: all {capacity} tids are in use")]
    TidSpaceExhausted { capacity: u32 },

    /// A dead context was picked for reuse while a Thread still points at it.
    #[error("tid {tid} selected for reuse while a live thread still references it")]
    LiveBackReference { tid: Tid },

    /// A raw mapping (bypassing the general allocator) failed.
    #[error("failed to map {size} bytes for {what} (errno {errno})")]
    MapFailed {
        what: &'static str,
        size: usize,
        errno: i32,
    },

    /// The OS would not report the calling thread's stack.
    #[error("cannot read stack bounds of the current thread (errno {errno})")]
    StackBoundsUnavailable { errno: i32 },

    /// The three descriptor role indices no longer form a permutation.
    #[error("stack descriptor roles corrupted: previous={previous} next={next} temp={temp}")]
    InconsistentRotation { previous: u8, next: u8, temp: u8 },

    /// A fake stack was torn down twice, or the pointer is not a fake stack.
    #[error("fake stack at {addr:#x} torn down twice or corrupted (T{tid})")]
    DoubleFakeStackTeardown { tid: Tid, addr: usize },

    /// No context was ever created for this tid.
    #[error("unknown tid {tid}")]
    UnknownTid { tid: Tid },

    /// A lifecycle transition was requested from the wrong state.
    #[error("T{tid} is {actual:?}, expected {expected:?}")]
    InvalidTransition {
        tid: Tid,
        actual: ThreadStatus,
        expected: ThreadStatus,
    },
}

/// Capacity of the on-stack report buffer.
const REPORT_CAPACITY: usize = 512;

/// Fixed-size, truncating `fmt::Write` sink living on the stack.
pub(crate) struct ReportBuffer {
    bytes: [u8; REPORT_CAPACITY],
    len: usize,
}

impl ReportBuffer {
    pub(crate) const fn new() -> Self {
        Self {
            bytes: [0; REPORT_CAPACITY],
            len: 0,
        }
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl Write for ReportBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = REPORT_CAPACITY - self.len;
        let take = s.len().min(room);
        self.bytes[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        // Truncation is silent: a partial report beats none.
        Ok(())
    }
}

/// Report `err` on stderr and abort the process.
///
/// Formats into a stack buffer and uses `write(2)` directly, so this is safe
/// to call before the allocator is usable and from inside signal handlers.
#[cold]
pub fn fatal(err: ThreadError) -> ! {
    let mut report = ReportBuffer::new();
    let _ = writeln!(report, "==santhread== FATAL: {err}");
    let bytes = report.as_bytes();
    // SAFETY: `bytes` is a valid initialized slice for the duration of the call.
    unsafe {
        libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len());
        libc::abort()
    }
}
