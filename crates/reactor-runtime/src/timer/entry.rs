//! Timer handle and type

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Unique handle of one arming of a timer.
///
/// Every arm gets a fresh handle, so heap entries left behind by a cancel
/// or a re-arm are recognized as stale when they surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub u64);

impl TimerHandle {
    #[inline]
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TimerHandle(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Handle of a timer that was never armed.
    pub const NONE: TimerHandle = TimerHandle(0);

    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for TimerHandle {
    fn default() -> Self {
        Self::NONE
    }
}

/// What happens after a timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerType {
    OneShot,
    /// Re-armed at `now + interval` before the callback runs
    Periodic { interval: Duration },
}

impl TimerType {
    #[inline]
    pub fn is_periodic(&self) -> bool {
        matches!(self, TimerType::Periodic { .. })
    }

    #[inline]
    pub fn periodic_interval(&self) -> Option<Duration> {
        match self {
            TimerType::Periodic { interval } => Some(*interval),
            TimerType::OneShot => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_uniqueness() {
        let handles: Vec<_> = (0..1000).map(|_| TimerHandle::new()).collect();
        let unique: std::collections::HashSet<_> = handles.iter().collect();
        assert_eq!(handles.len(), unique.len());
        assert!(!handles.contains(&TimerHandle::NONE));
    }

    #[test]
    fn test_timer_type() {
        assert!(!TimerType::OneShot.is_periodic());
        let p = TimerType::Periodic { interval: Duration::from_secs(1) };
        assert_eq!(p.periodic_interval(), Some(Duration::from_secs(1)));
    }
}
