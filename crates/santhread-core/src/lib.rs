//! # santhread-core
//!
//! Per-thread bookkeeping for a memory-safety instrumentation runtime.
//!
//! For every thread the runtime observes, this crate records which address
//! ranges are that thread's valid stack at any instant, and owns the
//! secondary "fake stack" allocator used to detect use of stack memory after
//! the owning function returned.
//!
//! # Architecture
//!
//! - **Registry** (`registry`, `context`): never-destroyed per-tid
//!   [`ThreadContext`] records in a fixed-capacity raw arena, guarded by one
//!   lock. Dead tids go through a FIFO quarantine before reuse.
//! - **Thread** (`thread`): live per-OS-thread state, placed in raw mapped
//!   memory so creating it never enters the tracked allocator.
//! - **Stack descriptors** (`stack`): triple-buffered rotation of stack
//!   ranges, safe against same-thread signal observation.
//! - **Fake stack** (`fake_stack`): lazily built, signal-reentrant-safe
//!   use-after-return allocator plus its thread-local fast path.
//! - **Guards** (`guards`): scoped unwinding / deadly-signal flags.
//! - **Runtime** (`runtime`, `current`): bootstrap, current-thread lookup,
//!   reverse lookup by address, fork recovery.
//! - **Ambient** (`config`, `error`, `metrics`, `shadow`, `platform`,
//!   `raw_memory`): options, fatal errors, counters, collaborator seams.
//!
//! Nothing in a [`Thread`] is safe to mutate from two OS threads at once.
//! The owning thread is the only writer; other threads read under the
//! registry lock and must treat what they see as a stale snapshot.

pub mod config;
pub mod context;
pub mod current;
pub mod error;
pub mod fake_stack;
pub mod guards;
pub mod metrics;
pub mod platform;
pub(crate) mod raw_memory;
pub mod registry;
pub mod runtime;
pub mod shadow;
pub mod stack;
pub mod thread;

pub use config::{RuntimeOptions, detect_stack_use_after_return, runtime_options};
pub use context::{StackId, ThreadContext, ThreadStatus, Tid};
pub use current::{
    current_thread, current_tid_or_invalid, find_thread_by_stack_address, set_current_thread,
};
pub use error::{ThreadError, fatal};
pub use fake_stack::FakeStack;
pub use guards::{ScopedDeadlySignal, ScopedUnwinding};
pub use metrics::{MetricsSnapshot, RuntimeMetrics, ThreadStats, global_metrics};
pub use registry::{RegistryLock, RegistryStats, ThreadRegistry, global_registry};
pub use shadow::{NullShadow, PoisonKind, ShadowMemory};
pub use stack::{StackDescriptor, StackDescriptorSet};
pub use thread::{Thread, ThreadCallback};

/// Sentinel tid meaning "no thread". Must fit into 24 bits.
pub const INVALID_TID: Tid = 0x00ff_ffff;

/// Size of the tid space (4M).
pub const MAX_THREADS: u32 = 1 << 22;

/// Tid of the main thread.
pub const MAIN_TID: Tid = 0;
