//! Kernel-style print macros for the reactor
//!
//! Thread-safe, optionally-flushing diagnostic output in the spirit of printk.
//! Every shard thread tags its records with its shard id, so interleaved
//! output from several reactors stays readable.
//!
//! # Environment Variables
//!
//! - `RCT_FLUSH_EPRINT=1` - Flush stderr after each print (useful when chasing aborts)
//! - `RCT_LOG_LEVEL=<level>` - Set log level: 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//!
//! # Usage
//!
//! ```ignore
//! use reactor_core::{kdebug, kinfo, kwarn, kerror};
//!
//! kinfo!("shard {} started", id);
//! kdebug!("poller registered: {}", name);
//! kwarn!("Reactor stalled for {} ms", ms);
//! kerror!("task panicked: {}", msg);
//! ```
//!
//! Output looks like:
//!
//! ```text
//! [INFO]  [shard 3] smp queues ready
//! [WARN]  Reactor stalled for 2000 ms on shard 0, running group main
//! ```

use std::cell::Cell;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log levels (matches common conventions)
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

    /// Parse a level name or digit, as accepted by `RCT_LOG_LEVEL`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "1" => Some(LogLevel::Error),
            "warn" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

// Global configuration (initialized once)
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

thread_local! {
    static SHARD_TAG: Cell<Option<u32>> = const { Cell::new(None) };
}

/// Initialize logging from environment variables
///
/// Called automatically on first log, but can be called explicitly for
/// deterministic initialization.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    if let Ok(val) = std::env::var("RCT_FLUSH_EPRINT") {
        let flush = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        FLUSH_ENABLED.store(flush, Ordering::Relaxed);
    }

    if let Ok(val) = std::env::var("RCT_LOG_LEVEL") {
        let level = LogLevel::parse(&val).unwrap_or(LogLevel::Info);
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

/// Check if flush is enabled
#[inline]
pub fn flush_enabled() -> bool {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    FLUSH_ENABLED.load(Ordering::Relaxed)
}

/// Get current log level
#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set log level programmatically
pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Set flush mode programmatically
pub fn set_flush_enabled(enabled: bool) {
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

/// Check if a log level is enabled
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= log_level() as u8
}

/// Tag records printed from this thread with a shard id.
///
/// Shard threads call this once at startup; `None` removes the tag.
pub fn set_shard_tag(shard: Option<u32>) {
    SHARD_TAG.with(|t| t.set(shard));
}

/// Shard id this thread tags its records with, if any.
pub fn shard_tag() -> Option<u32> {
    SHARD_TAG.with(|t| t.get())
}

/// Write one record to stderr under its lock, so lines from different
/// shards never interleave.
fn emit(level: Option<LogLevel>, args: std::fmt::Arguments<'_>, newline: bool) {
    let mut out = std::io::stderr().lock();
    if let Some(level) = level {
        let _ = write!(out, "{} ", level.prefix());
        if let Some(shard) = shard_tag() {
            let _ = write!(out, "[shard {}] ", shard);
        }
    }
    let _ = out.write_fmt(args);
    if newline {
        let _ = out.write_all(b"\n");
    }
    if flush_enabled() {
        let _ = out.flush();
    }
}

#[doc(hidden)]
pub fn _kprint_impl(args: std::fmt::Arguments<'_>) {
    emit(None, args, false);
}

#[doc(hidden)]
pub fn _kprintln_impl(args: std::fmt::Arguments<'_>) {
    emit(None, args, true);
}

#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if level_enabled(level) {
        emit(Some(level), args, true);
    }
}

/// Print to stderr (no newline)
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::kprint::_kprint_impl(format_args!($($arg)*))
    };
}

/// Print to stderr with newline
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint::_kprintln_impl(format_args!(""))
    };
    ($($arg:tt)*) => {
        $crate::kprint::_kprintln_impl(format_args!($($arg)*))
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __klog {
    ($level:ident, $($arg:tt)*) => {
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::$level, format_args!($($arg)*))
    };
}

/// Error record; shown unless logging is off
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => { $crate::__klog!(Error, $($arg)*) };
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => { $crate::__klog!(Warn, $($arg)*) };
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { $crate::__klog!(Info, $($arg)*) };
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => { $crate::__klog!(Debug, $($arg)*) };
}

/// Most verbose; per-task and per-poll detail
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => { $crate::__klog!(Trace, $($arg)*) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_levels() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(LogLevel::parse("WARN"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("5"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::parse("loud"), None);
        assert_eq!(LogLevel::from_u8(99), LogLevel::Trace);
    }

    #[test]
    fn test_shard_tag_is_per_thread() {
        set_shard_tag(Some(7));
        assert_eq!(shard_tag(), Some(7));
        let other = std::thread::spawn(shard_tag).join().unwrap();
        assert_eq!(other, None);
        set_shard_tag(None);
    }

    #[test]
    fn test_macros_compile() {
        set_log_level(LogLevel::Off);

        kprint!("test");
        kprintln!("test {}", 42);
        kerror!("error {}", "msg");
        kwarn!("warn");
        kinfo!("info");
        kdebug!("debug");
        ktrace!("trace");
    }
}
