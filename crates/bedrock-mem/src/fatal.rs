//! Fail-fast termination for unrecoverable memory conditions.
//!
//! Exhausted arenas, oversized pool requests, out-of-bounds indices and
//! misused slot indices leave no sane state to continue from. [`fatal`]
//! logs the diagnostic, optionally prints a backtrace (feature
//! `fatal-backtrace`), and panics. The workspace profiles set
//! `panic = "abort"`, so outside of tests this ends the process.

use bedrock_log::error;

/// Reports `msg` and terminates.
#[cold]
#[track_caller]
pub fn fatal(msg: &str) -> ! {
    let location = std::panic::Location::caller();
    error!("{msg} ({location})");

    #[cfg(feature = "fatal-backtrace")]
    error!("backtrace:\n{:?}", backtrace::Backtrace::new());

    panic!("{msg}");
}

/// Checks `low <= index <= high`, dying with `msg` otherwise.
///
/// With the `bounds-check` feature a violation goes through [`fatal`];
/// without it, it is a plain panic with no logging or backtrace.
#[inline(always)]
#[track_caller]
pub(crate) fn bounds_check(low: isize, high: isize, index: isize, msg: &str) {
    if index < low || index > high {
        if cfg!(feature = "bounds-check") {
            fatal(msg);
        }
        panic!("{msg}: {index} outside {low}..={high}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "Could not allocate from arena.")]
    fn test_fatal_panics_with_message() {
        fatal("Could not allocate from arena.");
    }

    #[test]
    fn test_bounds_check_accepts_inclusive_range() {
        bounds_check(0, 3, 0, "low");
        bounds_check(0, 3, 3, "high");
    }

    #[test]
    #[should_panic(expected = "List indexing out of bounds")]
    fn test_bounds_check_rejects_outside() {
        bounds_check(0, 3, 4, "List indexing out of bounds");
    }
}
