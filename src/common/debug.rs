//! Process-wide debug switch for step-by-step progress output.
//!
//! Enabled by `--debug` or a non-empty `PATCHELF_DEBUG` environment
//! variable. All progress lines go to stderr so stdout stays reserved for
//! `--print-interpreter` / `--print-rpath` output.

use std::sync::atomic::{AtomicBool, Ordering};

static DEBUG_MODE: AtomicBool = AtomicBool::new(false);

pub fn set_enabled(enabled: bool) {
    DEBUG_MODE.store(enabled, Ordering::Relaxed);
}

pub fn enabled() -> bool {
    DEBUG_MODE.load(Ordering::Relaxed)
}

/// Print a progress line to stderr when debug mode is on.
#[macro_export]
macro_rules! debugln {
    ($($arg:tt)*) => {
        if $crate::common::debug::enabled() {
            eprintln!($($arg)*);
        }
    };
}
