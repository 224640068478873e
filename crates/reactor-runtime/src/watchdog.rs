//! Per-shard watchdog thread
//!
//! Ticks once per task quota. Each tick:
//!
//! 1. raises the shard's preemption flag, so the running task queue yields
//!    at its next safe point;
//! 2. advances the low resolution clock;
//! 3. compares the shard's task and poll counters with the last tick. A
//!    shard that made no progress and is not asleep is stalled; stalls are
//!    reported at `blocked_reactor_notify` and then at every doubling.
//!
//! Reports are rate limited per minute; a summary line counts the ones
//! that were dropped.

use crate::config::ReactorConfig;
use crate::shard::ShardShared;
use crate::timer::LowresClock;
use reactor_core::{ReactorError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

const REPORT_WINDOW: Duration = Duration::from_secs(60);

/// Counts ticks without progress and says when to report.
#[derive(Debug)]
pub(crate) struct StallDetector {
    threshold: u64,
    next_report: u64,
    stalled: u64,
    last_tasks: u64,
    last_polls: u64,
}

impl StallDetector {
    /// `threshold` is the stall length, in ticks, of the first report.
    pub fn new(threshold: u64) -> Self {
        let threshold = threshold.max(1);
        Self { threshold, next_report: threshold, stalled: 0, last_tasks: 0, last_polls: 0 }
    }

    /// Feed one tick. Returns the stall length in ticks when it is time to
    /// report.
    pub fn tick(&mut self, tasks: u64, polls: u64, sleeping: bool) -> Option<u64> {
        let progressed = tasks != self.last_tasks || polls != self.last_polls;
        self.last_tasks = tasks;
        self.last_polls = polls;
        if progressed || sleeping {
            self.stalled = 0;
            self.next_report = self.threshold;
            return None;
        }
        self.stalled += 1;
        if self.stalled >= self.next_report {
            self.next_report = self.next_report.saturating_mul(2);
            Some(self.stalled)
        } else {
            None
        }
    }
}

/// Allows `per_minute` reports per rolling minute.
#[derive(Debug)]
pub(crate) struct ReportLimiter {
    per_minute: u32,
    window_start: Instant,
    used: u32,
    suppressed: u64,
}

impl ReportLimiter {
    pub fn new(per_minute: u32, now: Instant) -> Self {
        Self { per_minute: per_minute.max(1), window_start: now, used: 0, suppressed: 0 }
    }

    /// Returns `(allowed, suppressed_in_previous_window)`.
    pub fn check(&mut self, now: Instant) -> (bool, u64) {
        let mut dropped = 0;
        if now.duration_since(self.window_start) >= REPORT_WINDOW {
            dropped = std::mem::take(&mut self.suppressed);
            self.window_start = now;
            self.used = 0;
        }
        if self.used < self.per_minute {
            self.used += 1;
            (true, dropped)
        } else {
            self.suppressed += 1;
            (false, dropped)
        }
    }
}

/// Handle to a shard's watchdog thread; stops it on drop.
pub(crate) struct Watchdog {
    shutdown: Arc<AtomicBool>,
    thread: Thread,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn start(shard: Arc<ShardShared>, config: &ReactorConfig) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let quota = config.task_quota;
        let threshold = (config.blocked_reactor_notify.as_nanos() / quota.as_nanos().max(1)) as u64;
        let per_minute = config.blocked_reactor_reports_per_minute;
        let stop = shutdown.clone();
        let handle = thread::Builder::new()
            .name(format!("watchdog-{}", shard.id))
            .spawn(move || watchdog_loop(shard, quota, threshold, per_minute, stop))
            .map_err(ReactorError::from)?;
        Ok(Self { shutdown, thread: handle.thread().clone(), handle: Some(handle) })
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.thread.unpark();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watchdog_loop(
    shard: Arc<ShardShared>,
    quota: Duration,
    threshold: u64,
    per_minute: u32,
    shutdown: Arc<AtomicBool>,
) {
    let mut detector = StallDetector::new(threshold);
    let mut limiter = ReportLimiter::new(per_minute, Instant::now());
    LowresClock::update();

    while !shutdown.load(Ordering::Acquire) {
        thread::park_timeout(quota);
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        shard.preempt.request();
        LowresClock::update();

        let stall = detector.tick(
            shard.tasks_processed.load(Ordering::Relaxed),
            shard.polls.load(Ordering::Relaxed),
            shard.sleeping.load(Ordering::Relaxed),
        );
        let Some(ticks) = stall else {
            continue;
        };
        let (allowed, dropped) = limiter.check(Instant::now());
        if dropped > 0 {
            reactor_core::kwarn!("{} stall reports suppressed on shard {}", dropped, shard.id);
        }
        if allowed {
            let group = shard.group_name(shard.running_group.load(Ordering::Relaxed));
            reactor_core::kwarn!(
                "Reactor stalled for {} ms on shard {}, running group {}",
                (quota * ticks as u32).as_millis(),
                shard.id,
                group
            );
        }
    }
}
