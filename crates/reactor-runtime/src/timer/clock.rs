//! The three clock domains timers can be armed against
//!
//! All clocks report a `Duration` since their own epoch:
//!
//! - [`SteadyClock`]: monotonic, nanosecond resolution, backed by the
//!   shard's timerfd
//! - [`LowresClock`]: the steady clock sampled by the watchdog tick; cheap
//!   to read, coarse (about one task quota)
//! - [`ManualClock`]: process-wide logical time that only moves when a test
//!   calls [`ManualClock::advance`]

use reactor_core::Deferred;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Which timer set a clock's timers live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockKind {
    Steady,
    Lowres,
    Manual,
}

/// A clock domain.
pub trait Clock: 'static {
    const KIND: ClockKind;

    /// Time since this clock's epoch.
    fn now() -> Duration;
}

static START_INSTANT: OnceLock<Instant> = OnceLock::new();
static COARSE_TIME_NS: AtomicU64 = AtomicU64::new(0);
static MANUAL_TIME_NS: AtomicU64 = AtomicU64::new(0);

#[inline]
fn start() -> Instant {
    *START_INSTANT.get_or_init(Instant::now)
}

/// Monotonic high resolution clock.
#[derive(Debug, Clone, Copy)]
pub struct SteadyClock;

impl SteadyClock {
    /// Convert a point on this clock back to an `Instant`.
    pub fn to_instant(t: Duration) -> Instant {
        start() + t
    }
}

impl Clock for SteadyClock {
    const KIND: ClockKind = ClockKind::Steady;

    #[inline]
    fn now() -> Duration {
        start().elapsed()
    }
}

/// Coarse clock refreshed by every shard's watchdog tick.
#[derive(Debug, Clone, Copy)]
pub struct LowresClock;

impl LowresClock {
    /// Sample the steady clock. Never moves backwards.
    pub fn update() {
        let now = SteadyClock::now().as_nanos() as u64;
        COARSE_TIME_NS.fetch_max(now, Ordering::AcqRel);
    }
}

impl Clock for LowresClock {
    const KIND: ClockKind = ClockKind::Lowres;

    #[inline]
    fn now() -> Duration {
        Duration::from_nanos(COARSE_TIME_NS.load(Ordering::Acquire))
    }
}

/// Logical clock for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct ManualClock;

impl ManualClock {
    /// Move logical time forward and fire due manual timers on every shard.
    ///
    /// Must be called from a shard; resolves once all shards have run
    /// their expired timers.
    pub fn advance(d: Duration) -> Deferred<()> {
        MANUAL_TIME_NS.fetch_add(d.as_nanos() as u64, Ordering::AcqRel);
        crate::smp::invoke_on_all(|| {
            crate::shard::local().expire_manual_timers();
            Deferred::ready(())
        })
    }

    /// Move logical time without touching any shard.
    pub fn advance_silently(d: Duration) {
        MANUAL_TIME_NS.fetch_add(d.as_nanos() as u64, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    const KIND: ClockKind = ClockKind::Manual;

    #[inline]
    fn now() -> Duration {
        Duration::from_nanos(MANUAL_TIME_NS.load(Ordering::Acquire))
    }
}
