//! Invariant checks and the fatal error path.

use std::backtrace::Backtrace;
use std::fmt;

/// Checks an engine invariant in builds with debug assertions.
///
/// A violated invariant means a scheduler-level bug; continuing would risk
/// silent corruption, so the check panics with a diagnostic instead.
macro_rules! uassert {
    ($cond:expr, $($arg:tt)+) => {
        if cfg!(debug_assertions) && !$cond {
            $crate::utils::invariant_failed(format_args!($($arg)+));
        }
    };
}

/// Reports a violated invariant and panics.
#[cold]
#[track_caller]
pub(crate) fn invariant_failed(message: fmt::Arguments<'_>) -> ! {
    tracing::error!(%message, "engine invariant violated");
    panic!("engine invariant violated: {message}");
}

/// Logs a diagnostic with a captured backtrace and aborts the process.
///
/// Used when the engine cannot proceed at all, e.g. when no execution
/// context can be created for a task that is due to run.
#[cold]
pub(crate) fn abort_with_stacktrace(message: &str) -> ! {
    let backtrace = Backtrace::force_capture();
    tracing::error!(%message, %backtrace, "fatal engine error, aborting");
    eprintln!("fatal engine error: {message}\n{backtrace}");
    std::process::abort();
}

/// Extracts a human readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked with a non-string payload".to_string()
    }
}
