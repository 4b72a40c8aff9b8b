//! Runtime options.
//!
//! Options come from the `SANTHREAD_OPTIONS` environment variable as
//! `key=value` pairs separated by `:` or `,`:
//!
//! ```text
//! SANTHREAD_OPTIONS=detect_stack_use_after_return=1:max_uar_stack_size_log=18
//! ```
//!
//! ## Design
//!
//! Resolution reads the environment, which allocates. The runtime may be
//! re-entered from inside the allocator while that happens, so the cache is
//! a non-blocking atomic state machine rather than a `OnceLock`: a reentrant
//! caller that observes RESOLVING gets the defaults instead of deadlocking.
//!
//! The use-after-return switch is additionally exported as the C symbol
//! `__asan_option_detect_stack_use_after_return`, which compiled code reads
//! directly on every instrumented function entry.

use std::sync::atomic::{AtomicI32, AtomicU8, AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

/// Environment variable holding the option string.
pub const OPTIONS_ENV: &str = "SANTHREAD_OPTIONS";

/// Smallest allowed fake stack class-region log: one frame of the largest
/// size class (`64 << 10` bytes) must fit.
pub const MIN_UAR_STACK_SIZE_LOG: u32 = 16;
/// Largest allowed fake stack class-region log.
pub const MAX_UAR_STACK_SIZE_LOG: u32 = 28;

/// Tunables of the thread-tracking runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RuntimeOptions {
    /// Serve frame-local allocations from a per-thread fake stack.
    pub detect_stack_use_after_return: bool,
    /// Lower clamp for the fake stack size log.
    pub min_uar_stack_size_log: u32,
    /// Upper clamp for the fake stack size log.
    pub max_uar_stack_size_log: u32,
    /// Dead contexts held back before their tids may be reused.
    pub thread_quarantine_size: u32,
}

impl RuntimeOptions {
    /// Built-in defaults.
    pub const DEFAULT: Self = Self {
        detect_stack_use_after_return: false,
        min_uar_stack_size_log: 16,
        max_uar_stack_size_log: 20,
        thread_quarantine_size: 16,
    };

    /// Parse an option string on top of the defaults.
    ///
    /// Unknown keys and malformed values are ignored. The size logs are
    /// clamped into `[MIN_UAR_STACK_SIZE_LOG, MAX_UAR_STACK_SIZE_LOG]` and
    /// `max` is raised to `min` if given lower.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let mut opts = Self::DEFAULT;
        for pair in raw.split([':', ',']) {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "detect_stack_use_after_return" => {
                    if let Some(v) = parse_bool(value) {
                        opts.detect_stack_use_after_return = v;
                    }
                }
                "min_uar_stack_size_log" => {
                    if let Ok(v) = value.parse() {
                        opts.min_uar_stack_size_log = v;
                    }
                }
                "max_uar_stack_size_log" => {
                    if let Ok(v) = value.parse() {
                        opts.max_uar_stack_size_log = v;
                    }
                }
                "thread_quarantine_size" => {
                    if let Ok(v) = value.parse() {
                        opts.thread_quarantine_size = v;
                    }
                }
                _ => {}
            }
        }
        opts.normalized()
    }

    fn normalized(mut self) -> Self {
        self.min_uar_stack_size_log = self
            .min_uar_stack_size_log
            .clamp(MIN_UAR_STACK_SIZE_LOG, MAX_UAR_STACK_SIZE_LOG);
        self.max_uar_stack_size_log = self
            .max_uar_stack_size_log
            .clamp(self.min_uar_stack_size_log, MAX_UAR_STACK_SIZE_LOG);
        self
    }
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self::DEFAULT
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Cached resolution
// ---------------------------------------------------------------------------

const STATE_UNRESOLVED: u8 = 0;
const STATE_RESOLVING: u8 = 1;
const STATE_RESOLVED: u8 = 2;

static STATE: AtomicU8 = AtomicU8::new(STATE_UNRESOLVED);
/// `min << 32 | max`, so readers never see one bound without the other.
static UAR_LOGS: AtomicU64 = AtomicU64::new(pack_logs(
    RuntimeOptions::DEFAULT.min_uar_stack_size_log,
    RuntimeOptions::DEFAULT.max_uar_stack_size_log,
));
static QUARANTINE: AtomicU32 = AtomicU32::new(RuntimeOptions::DEFAULT.thread_quarantine_size);

/// Global use-after-return switch read by instrumented code.
///
/// `int` layout; non-zero means enabled.
#[unsafe(no_mangle)]
#[allow(non_upper_case_globals)]
pub static __asan_option_detect_stack_use_after_return: AtomicI32 = AtomicI32::new(0);

const fn pack_logs(min: u32, max: u32) -> u64 {
    ((min as u64) << 32) | max as u64
}

const fn unpack_logs(packed: u64) -> (u32, u32) {
    ((packed >> 32) as u32, packed as u32)
}

fn load_cached() -> RuntimeOptions {
    let (min, max) = uar_stack_size_log_bounds();
    RuntimeOptions {
        detect_stack_use_after_return: detect_stack_use_after_return(),
        min_uar_stack_size_log: min,
        max_uar_stack_size_log: max,
        thread_quarantine_size: QUARANTINE.load(Ordering::Relaxed),
    }
}

fn store(opts: RuntimeOptions) {
    UAR_LOGS.store(
        pack_logs(opts.min_uar_stack_size_log, opts.max_uar_stack_size_log),
        Ordering::Relaxed,
    );
    QUARANTINE.store(opts.thread_quarantine_size, Ordering::Relaxed);
    set_detect_stack_use_after_return(opts.detect_stack_use_after_return);
}

/// Current options, reading the environment on first call.
///
/// A reentrant call during resolution gets [`RuntimeOptions::DEFAULT`].
#[must_use]
pub fn runtime_options() -> RuntimeOptions {
    match STATE.load(Ordering::Acquire) {
        STATE_RESOLVED => return load_cached(),
        STATE_RESOLVING => return RuntimeOptions::DEFAULT,
        _ => {}
    }

    if STATE
        .compare_exchange(
            STATE_UNRESOLVED,
            STATE_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        return if STATE.load(Ordering::Acquire) == STATE_RESOLVED {
            load_cached()
        } else {
            RuntimeOptions::DEFAULT
        };
    }

    let opts = std::env::var(OPTIONS_ENV)
        .map(|raw| RuntimeOptions::parse(&raw))
        .unwrap_or_default();
    store(opts);
    STATE.store(STATE_RESOLVED, Ordering::Release);
    opts
}

/// Replace the options outright, skipping the environment.
pub fn set_runtime_options(opts: RuntimeOptions) {
    store(opts.normalized());
    STATE.store(STATE_RESOLVED, Ordering::Release);
}

/// `(min, max)` fake stack size logs as currently cached.
///
/// Never resolves, so it is usable from signal context; before resolution
/// it reports the defaults.
#[must_use]
pub fn uar_stack_size_log_bounds() -> (u32, u32) {
    unpack_logs(UAR_LOGS.load(Ordering::Relaxed))
}

/// Whether fake stacks are enabled. A single relaxed load, never resolves.
#[inline]
#[must_use]
pub fn detect_stack_use_after_return() -> bool {
    __asan_option_detect_stack_use_after_return.load(Ordering::Relaxed) != 0
}

/// Flip the global use-after-return switch.
pub fn set_detect_stack_use_after_return(enabled: bool) {
    __asan_option_detect_stack_use_after_return.store(i32::from(enabled), Ordering::Relaxed);
}

/// Serializes tests that flip the process-wide use-after-return switch.
#[cfg(test)]
pub(crate) static UAR_FLAG_TEST_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_yields_defaults() {
        assert_eq!(RuntimeOptions::parse(""), RuntimeOptions::DEFAULT);
    }

    #[test]
    fn parses_mixed_separators() {
        let opts = RuntimeOptions::parse(
            "detect_stack_use_after_return=1,max_uar_stack_size_log=18:thread_quarantine_size=3",
        );
        assert!(opts.detect_stack_use_after_return);
        assert_eq!(opts.max_uar_stack_size_log, 18);
        assert_eq!(opts.thread_quarantine_size, 3);
        assert_eq!(opts.min_uar_stack_size_log, 16);
    }

    #[test]
    fn unknown_keys_and_bad_values_are_ignored() {
        let opts = RuntimeOptions::parse("bogus=1:detect_stack_use_after_return=maybe:noequals");
        assert_eq!(opts, RuntimeOptions::DEFAULT);
    }

    #[test]
    fn logs_are_clamped_and_ordered() {
        let opts = RuntimeOptions::parse("min_uar_stack_size_log=2:max_uar_stack_size_log=99");
        assert_eq!(opts.min_uar_stack_size_log, MIN_UAR_STACK_SIZE_LOG);
        assert_eq!(opts.max_uar_stack_size_log, MAX_UAR_STACK_SIZE_LOG);

        let opts = RuntimeOptions::parse("min_uar_stack_size_log=22:max_uar_stack_size_log=17");
        assert_eq!(opts.min_uar_stack_size_log, 22);
        assert_eq!(opts.max_uar_stack_size_log, 22);
    }

    #[test]
    fn switch_round_trips_through_exported_symbol() {
        let _guard = UAR_FLAG_TEST_LOCK.lock();
        let before = detect_stack_use_after_return();
        set_detect_stack_use_after_return(true);
        assert_eq!(
            __asan_option_detect_stack_use_after_return.load(Ordering::Relaxed),
            1
        );
        set_detect_stack_use_after_return(false);
        assert!(!detect_stack_use_after_return());
        set_detect_stack_use_after_return(before);
    }

    #[test]
    fn size_log_bounds_are_ordered() {
        let (min, max) = uar_stack_size_log_bounds();
        assert!(min >= MIN_UAR_STACK_SIZE_LOG);
        assert!(min <= max && max <= MAX_UAR_STACK_SIZE_LOG);
    }

    #[test]
    fn size_log_bounds_change_together() {
        let _guard = UAR_FLAG_TEST_LOCK.lock();
        let before = runtime_options();
        let low = RuntimeOptions {
            min_uar_stack_size_log: 16,
            max_uar_stack_size_log: 18,
            ..before
        };
        let high = RuntimeOptions {
            min_uar_stack_size_log: 22,
            max_uar_stack_size_log: 24,
            ..before
        };
        set_runtime_options(low);

        let done = std::sync::atomic::AtomicBool::new(false);
        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..20_000 {
                    set_runtime_options(if i % 2 == 0 { high } else { low });
                }
                done.store(true, Ordering::Release);
            });
            while !done.load(Ordering::Acquire) {
                let bounds = uar_stack_size_log_bounds();
                assert!(bounds == (16, 18) || bounds == (22, 24), "torn bounds {bounds:?}");
            }
        });

        set_runtime_options(before);
        assert_eq!(runtime_options(), before.normalized());
    }

    #[test]
    fn options_serialize_as_flat_object() {
        let json = serde_json::to_value(RuntimeOptions::DEFAULT).unwrap();
        assert_eq!(json["max_uar_stack_size_log"], 20);
        assert_eq!(json["detect_stack_use_after_return"], false);
    }
}
