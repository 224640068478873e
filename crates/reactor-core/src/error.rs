//! Error types for the reactor
//!
//! Three kinds of failure exist:
//!
//! - transient OS conditions (EAGAIN and friends) never leave the poller
//!   that saw them, so they have no variant here;
//! - operation errors travel inside a [`Deferred`](crate::deferred::Deferred)
//!   to whoever consumes it;
//! - invariant violations are fatal and go through [`invariant_violation`].

use core::fmt;

/// Result type for reactor operations
pub type Result<T> = core::result::Result<T, ReactorError>;

/// Errors delivered through deferred results
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactorError {
    /// OS call failed with this errno
    Os(i32),

    /// DMA offset or length not a multiple of the device alignment
    Alignment {
        what: &'static str,
        value: u64,
        align: u64,
    },

    /// Producer dropped without resolving
    BrokenPromise,

    /// Process-wide priority class table is full
    TooManyPriorityClasses,

    /// Stream used after close, or its peer went away
    StreamClosed,

    /// Argument rejected before reaching the OS
    InvalidArgument(&'static str),

    /// Shard is shutting down
    Shutdown,

    /// A task or remote closure panicked; carries the panic message
    Panicked(String),

    /// Operation did not complete before its deadline
    Timeout,

    /// Stream or file ended before the requested amount was read
    UnexpectedEof { wanted: u64, got: u64 },
}

impl ReactorError {
    /// errno carried by an OS error, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            ReactorError::Os(e) => Some(*e),
            _ => None,
        }
    }

    /// Build an error from a panic payload caught by `catch_unwind`.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        ReactorError::Panicked(panic_message(payload))
    }
}

impl fmt::Display for ReactorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReactorError::Os(code) => {
                write!(f, "{}", std::io::Error::from_raw_os_error(*code))
            }
            ReactorError::Alignment { what, value, align } => {
                write!(f, "{} {} is not aligned to {}", what, value, align)
            }
            ReactorError::BrokenPromise => write!(f, "broken promise"),
            ReactorError::TooManyPriorityClasses => {
                write!(f, "No more room for new I/O priority classes")
            }
            ReactorError::StreamClosed => write!(f, "stream closed"),
            ReactorError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            ReactorError::Shutdown => write!(f, "reactor shutting down"),
            ReactorError::Panicked(msg) => write!(f, "panicked: {}", msg),
            ReactorError::Timeout => write!(f, "timed out"),
            ReactorError::UnexpectedEof { wanted, got } => {
                write!(f, "unexpected end of data: wanted {} bytes, got {}", wanted, got)
            }
        }
    }
}

impl std::error::Error for ReactorError {}

impl From<std::io::Error> for ReactorError {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(code) => ReactorError::Os(code),
            None => match e.kind() {
                std::io::ErrorKind::InvalidInput => {
                    ReactorError::InvalidArgument("invalid input")
                }
                std::io::ErrorKind::TimedOut => ReactorError::Timeout,
                _ => ReactorError::Os(libc_eio()),
            },
        }
    }
}

impl From<ReactorError> for std::io::Error {
    fn from(e: ReactorError) -> Self {
        match e {
            ReactorError::Os(code) => std::io::Error::from_raw_os_error(code),
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}

// EIO is 5 on every platform the runtime supports; core has no libc.
#[inline]
fn libc_eio() -> i32 {
    5
}

// ============================================================================
// Invariant violations
// ============================================================================

/// Panic payload marking an unrecoverable invariant violation.
///
/// The task runner catches ordinary panics and keeps going, but aborts the
/// process when it sees this payload.
#[derive(Debug, Clone)]
pub struct InvariantViolation(pub String);

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invariant violation: {}", self.0)
    }
}

/// Report a broken internal invariant and unwind with an
/// [`InvariantViolation`] payload.
#[cold]
#[track_caller]
pub fn invariant_violation(msg: impl Into<String>) -> ! {
    let msg = msg.into();
    crate::kerror!("invariant violation: {} at {}", msg, std::panic::Location::caller());
    cfg_if::cfg_if! {
        if #[cfg(feature = "debug-assertions")] {
            crate::kerror!("{}", std::backtrace::Backtrace::force_capture());
        }
    }
    std::panic::panic_any(InvariantViolation(msg))
}

/// True if a caught panic payload is an invariant violation.
pub fn is_invariant_violation(payload: &(dyn std::any::Any + Send)) -> bool {
    payload.is::<InvariantViolation>()
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(v) = payload.downcast_ref::<InvariantViolation>() {
        v.to_string()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = ReactorError::Alignment { what: "offset", value: 100, align: 512 };
        assert_eq!(e.to_string(), "offset 100 is not aligned to 512");
        assert_eq!(
            ReactorError::TooManyPriorityClasses.to_string(),
            "No more room for new I/O priority classes"
        );
    }

    #[test]
    fn test_os_display_names_errno_once() {
        let shown = ReactorError::Os(32).to_string();
        assert_eq!(shown.matches("(os error 32)").count(), 1, "{}", shown);
        assert_eq!(shown, std::io::Error::from_raw_os_error(32).to_string());
    }

    #[test]
    fn test_io_error_roundtrip_keeps_errno() {
        let io = std::io::Error::from_raw_os_error(2);
        let e: ReactorError = io.into();
        assert_eq!(e.errno(), Some(2));
        let back: std::io::Error = e.into();
        assert_eq!(back.raw_os_error(), Some(2));
    }

    #[test]
    fn test_invariant_payload_is_recognized() {
        let caught = std::panic::catch_unwind(|| {
            crate::kprint::set_log_level(crate::kprint::LogLevel::Off);
            invariant_violation("double close");
        });
        let payload = caught.unwrap_err();
        assert!(is_invariant_violation(payload.as_ref()));
        assert!(panic_message(payload.as_ref()).contains("double close"));
    }

    #[test]
    fn test_plain_panic_is_not_invariant() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert!(!is_invariant_violation(payload.as_ref()));
        assert_eq!(ReactorError::from_panic(payload.as_ref()), ReactorError::Panicked("boom".into()));
    }
}
