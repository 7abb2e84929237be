//! Kernel-style leveled print macros for muxr.
//!
//! All runtime logging goes to stderr through these macros. Output is
//! line-atomic (locked stderr handle) and optionally flushed per line.
//!
//! # Environment variables
//!
//! - `MUXR_LOG_LEVEL=<level>` - off|error|warn|info|debug|trace (or 0..5)
//! - `MUXR_LOG_FLUSH=1` - flush stderr after each line (debugging crashes)
//!
//! # Usage
//!
//! ```ignore
//! minfo!("loop {} started", id);
//! merror!("epoll_ctl failed: errno {}", errno);
//! mfatal!("eventfd creation failed");   // logs, then panics
//! ```
//!
//! `mfatal!` implements the fatal tier of the error taxonomy: conditions
//! the runtime cannot continue from (poller/waker creation failure, a
//! second loop on one thread, ADD/MOD registration failure). It logs at
//! error level and panics with the same message.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log levels, ordered by verbosity.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "1" => Some(LogLevel::Error),
            "warn" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN ]",
            LogLevel::Info => "[INFO ]",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static FLUSH: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize from environment. Runs once; later calls are no-ops.
/// Called lazily on first log, or explicitly for deterministic startup.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    if let Ok(val) = std::env::var("MUXR_LOG_LEVEL") {
        if let Some(level) = LogLevel::parse(&val) {
            LOG_LEVEL.store(level as u8, Ordering::Relaxed);
        }
    }
    if let Ok(val) = std::env::var("MUXR_LOG_FLUSH") {
        let on = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        FLUSH.store(on, Ordering::Relaxed);
    }
}

#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= log_level() as u8
}

/// Internal: write one tagged line under the stderr lock.
#[doc(hidden)]
pub fn _mlog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = write!(handle, "{} ", level.tag());
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if FLUSH.load(Ordering::Relaxed) {
        let _ = handle.flush();
    }
}

/// Internal: log the message at error level, then panic with it.
#[doc(hidden)]
pub fn _mfatal_impl(args: std::fmt::Arguments<'_>) -> ! {
    let msg = std::fmt::format(args);
    _mlog_impl(LogLevel::Error, format_args!("FATAL: {}", msg));
    panic!("{}", msg);
}

/// Error level log.
#[macro_export]
macro_rules! merror {
    ($($arg:tt)*) => {{
        $crate::mlog::_mlog_impl($crate::mlog::LogLevel::Error, format_args!($($arg)*));
    }};
}

/// Warning level log.
#[macro_export]
macro_rules! mwarn {
    ($($arg:tt)*) => {{
        $crate::mlog::_mlog_impl($crate::mlog::LogLevel::Warn, format_args!($($arg)*));
    }};
}

/// Info level log.
#[macro_export]
macro_rules! minfo {
    ($($arg:tt)*) => {{
        $crate::mlog::_mlog_impl($crate::mlog::LogLevel::Info, format_args!($($arg)*));
    }};
}

/// Debug level log.
#[macro_export]
macro_rules! mdebug {
    ($($arg:tt)*) => {{
        $crate::mlog::_mlog_impl($crate::mlog::LogLevel::Debug, format_args!($($arg)*));
    }};
}

/// Trace level log (most verbose).
#[macro_export]
macro_rules! mtrace {
    ($($arg:tt)*) => {{
        $crate::mlog::_mlog_impl($crate::mlog::LogLevel::Trace, format_args!($($arg)*));
    }};
}

/// Unrecoverable condition: log at error level, then panic.
#[macro_export]
macro_rules! mfatal {
    ($($arg:tt)*) => {{
        $crate::mlog::_mfatal_impl(format_args!($($arg)*));
    }};
}
