//! Logging shim: a `Logger` trait behind a one-shot global, severity-leveled
//! macros, silent no-op before installation (a library has no business
//! panicking because its host forgot to wire a logger).

use core::fmt;
use spin::Once;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Err,
}

pub trait Logger: Sync {
    fn log(&self, severity: Severity, msg: &fmt::Arguments<'_>);
}

static LOGGER: Once<&'static dyn Logger> = Once::new();

/// Installs the host's logger. Idempotent: later calls are ignored (first
/// writer wins).
pub fn init(logger: &'static dyn Logger) {
    LOGGER.call_once(|| logger);
}

pub fn try_get_logger() -> Option<&'static dyn Logger> {
    LOGGER.get().copied()
}

#[doc(hidden)]
pub fn dispatch(severity: Severity, args: fmt::Arguments<'_>) {
    if let Some(logger) = try_get_logger() {
        logger.log(severity, &args);
    }
}

#[macro_export]
macro_rules! log_dbg {
    ($($arg:tt)*) => {
        $crate::log::dispatch($crate::log::Severity::Debug, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::log::dispatch($crate::log::Severity::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::log::dispatch($crate::log::Severity::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_err {
    ($($arg:tt)*) => {
        $crate::log::dispatch($crate::log::Severity::Err, format_args!($($arg)*))
    };
}
