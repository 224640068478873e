//! Environment variable helpers
//!
//! Runtime overrides for the reactor configuration all come through here.
//!
//! ```ignore
//! use reactor_core::env::{env_get, env_get_bool, env_get_us};
//!
//! let shards: usize = env_get("RCT_SMP", 4);
//! let poll_mode = env_get_bool("RCT_POLL_MODE", false);
//! let quota = env_get_us("RCT_TASK_QUOTA_US", Duration::from_micros(2000));
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Get environment variable parsed as `T`, or return `default`.
///
/// Unparseable values fall back to the default rather than failing.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as boolean.
///
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true and
/// "0", "false", "no", "off" as false. Anything else keeps the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Get environment variable as optional value.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get environment variable as string, or return default.
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Get a duration expressed in microseconds.
#[inline]
pub fn env_get_us(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key)
        .map(Duration::from_micros)
        .unwrap_or(default)
}

/// Get a duration expressed in milliseconds.
#[inline]
pub fn env_get_ms(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Check if environment variable is set (regardless of value)
#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var(key).is_ok()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__RCT_TEST_UNSET_12345__", 42);
        assert_eq!(val, 42);
        let val: Option<usize> = env_get_opt("__RCT_TEST_UNSET_12345__");
        assert!(val.is_none());
        assert_eq!(env_get_str("__RCT_TEST_UNSET_12345__", "x"), "x");
        assert!(!env_is_set("__RCT_TEST_UNSET_12345__"));
    }

    #[test]
    fn test_env_get_parses_trimmed() {
        std::env::set_var("__RCT_TEST_NUM__", " 123 ");
        let val: usize = env_get("__RCT_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__RCT_TEST_NUM__");
    }

    #[test]
    fn test_env_get_bool_keeps_default_on_garbage() {
        std::env::set_var("__RCT_TEST_BOOL__", "on");
        assert!(env_get_bool("__RCT_TEST_BOOL__", false));
        std::env::set_var("__RCT_TEST_BOOL__", "off");
        assert!(!env_get_bool("__RCT_TEST_BOOL__", true));
        std::env::set_var("__RCT_TEST_BOOL__", "maybe");
        assert!(env_get_bool("__RCT_TEST_BOOL__", true));
        assert!(!env_get_bool("__RCT_TEST_BOOL__", false));
        std::env::remove_var("__RCT_TEST_BOOL__");
    }

    #[test]
    fn test_env_durations() {
        std::env::set_var("__RCT_TEST_US__", "750");
        assert_eq!(
            env_get_us("__RCT_TEST_US__", Duration::ZERO),
            Duration::from_micros(750)
        );
        std::env::set_var("__RCT_TEST_MS__", "bogus");
        assert_eq!(
            env_get_ms("__RCT_TEST_MS__", Duration::from_millis(9)),
            Duration::from_millis(9)
        );
        std::env::remove_var("__RCT_TEST_US__");
        std::env::remove_var("__RCT_TEST_MS__");
    }
}
