// Every export takes raw values from compiler-generated call sites whose
// contract is fixed outside this crate.
#![allow(clippy::missing_safety_doc)]
//! # santhread-abi
//!
//! `extern "C"` boundary of the santhread runtime.
//!
//! ```text
//! instrumented code / interceptors -> export (this crate) -> santhread-core
//! ```
//!
//! Two families of symbols:
//!
//! - `__santhread_*`: thread registration and lookup used by interceptors
//!   and the error reporter.
//! - `__asan_*`: the fake stack entry points compiled code calls on every
//!   instrumented function entry and exit. Their names and signatures are
//!   dictated by the compiler.
//!
//! The use-after-return switch `__asan_option_detect_stack_use_after_return`
//! itself is defined in `santhread-core`.

#[macro_use]
mod macros;

pub mod fake_stack_abi;
pub mod thread_abi;
