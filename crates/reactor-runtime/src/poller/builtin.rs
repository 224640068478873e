//! Pollers every shard registers at startup
//!
//! Registration order matters only for sleep: a poller refusing
//! `try_enter_interrupt_mode` unwinds those before it.

use super::Poller;
use crate::io::IoBackend;
use crate::reactor::Reactor;
use crate::smp::SmpShard;
use crate::syscall::SyscallPool;
use crate::timer::{complete_timers, Clock, LowresClock, TimerSet};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

/// Reaps finished disk requests.
pub(crate) struct IoCompletionPoller {
    backend: Rc<dyn IoBackend>,
}

impl IoCompletionPoller {
    pub fn new(backend: Rc<dyn IoBackend>) -> Self {
        Self { backend }
    }
}

impl Poller for IoCompletionPoller {
    fn name(&self) -> &'static str {
        "io-completion"
    }

    fn poll(&mut self) -> bool {
        self.backend.reap()
    }

    fn try_enter_interrupt_mode(&mut self) -> bool {
        self.backend.can_sleep()
    }
}

/// Pushes batched disk submissions to the kernel.
pub(crate) struct AioSubmitPoller {
    backend: Rc<dyn IoBackend>,
}

impl AioSubmitPoller {
    pub fn new(backend: Rc<dyn IoBackend>) -> Self {
        Self { backend }
    }
}

impl Poller for AioSubmitPoller {
    fn name(&self) -> &'static str {
        "aio-submit"
    }

    fn poll(&mut self) -> bool {
        self.backend.flush()
    }

    fn pure_poll(&mut self) -> bool {
        self.backend.flush()
    }

    fn try_enter_interrupt_mode(&mut self) -> bool {
        self.backend.flush();
        true
    }
}

/// Moves cross-shard requests and results.
pub(crate) struct SmpPoller {
    smp: Rc<SmpShard>,
}

impl SmpPoller {
    pub fn new(smp: Rc<SmpShard>) -> Self {
        Self { smp }
    }
}

impl Poller for SmpPoller {
    fn name(&self) -> &'static str {
        "smp"
    }

    fn poll(&mut self) -> bool {
        self.smp.poll()
    }

    fn pure_poll(&mut self) -> bool {
        self.smp.has_work()
    }

    // Runs after `sleeping` is published, so a sender that missed the flag
    // left its items where this check sees them.
    fn try_enter_interrupt_mode(&mut self) -> bool {
        !self.smp.has_work()
    }
}

/// Non-blocking epoll pass for fd readiness and the internal descriptors.
pub(crate) struct EpollPoller {
    reactor: Weak<Reactor>,
}

impl EpollPoller {
    pub fn new(reactor: Weak<Reactor>) -> Self {
        Self { reactor }
    }
}

impl Poller for EpollPoller {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn poll(&mut self) -> bool {
        self.reactor.upgrade().map_or(false, |r| r.poll_epoll(0))
    }
}

/// Drains results of blocking calls.
pub(crate) struct SyscallPoller {
    pool: Rc<SyscallPool>,
}

impl SyscallPoller {
    pub fn new(pool: Rc<SyscallPool>) -> Self {
        Self { pool }
    }
}

impl Poller for SyscallPoller {
    fn name(&self) -> &'static str {
        "syscall"
    }

    fn poll(&mut self) -> bool {
        self.pool.complete()
    }

    fn pure_poll(&mut self) -> bool {
        self.pool.has_completions()
    }

    fn try_enter_interrupt_mode(&mut self) -> bool {
        !self.pool.has_completions()
    }
}

/// Fires lowres timers; before sleep it leaves the next lowres deadline
/// in `nap` so the reactor arms its timerfd no later than that.
pub(crate) struct LowresTimerPoller {
    timers: Rc<RefCell<TimerSet>>,
    nap: Rc<Cell<Option<Duration>>>,
}

impl LowresTimerPoller {
    pub fn new(timers: Rc<RefCell<TimerSet>>, nap: Rc<Cell<Option<Duration>>>) -> Self {
        Self { timers, nap }
    }
}

impl Poller for LowresTimerPoller {
    fn name(&self) -> &'static str {
        "lowres-timers"
    }

    fn poll(&mut self) -> bool {
        complete_timers(&self.timers, LowresClock::now()) > 0
    }

    fn pure_poll(&mut self) -> bool {
        let next = self.timers.borrow_mut().next_deadline();
        next.map_or(false, |d| d <= LowresClock::now())
    }

    fn try_enter_interrupt_mode(&mut self) -> bool {
        let next = self.timers.borrow_mut().next_deadline();
        if next.map_or(false, |d| d <= LowresClock::now()) {
            return false;
        }
        self.nap.set(next);
        true
    }

    fn exit_interrupt_mode(&mut self) {
        self.nap.set(None);
    }
}

/// Output streams in batch-flush mode waiting for their deferred flush.
#[derive(Default)]
pub(crate) struct FlushBatch {
    pending: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl FlushBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, flush: Box<dyn FnOnce()>) {
        self.pending.borrow_mut().push(flush);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Start every queued flush. Flushes queued meanwhile wait for the
    /// next round.
    pub fn run(&self) -> bool {
        let batch = std::mem::take(&mut *self.pending.borrow_mut());
        let any = !batch.is_empty();
        for flush in batch {
            flush();
        }
        any
    }
}

pub(crate) struct BatchFlushPoller {
    batch: Rc<FlushBatch>,
}

impl BatchFlushPoller {
    pub fn new(batch: Rc<FlushBatch>) -> Self {
        Self { batch }
    }
}

impl Poller for BatchFlushPoller {
    fn name(&self) -> &'static str {
        "batch-flush"
    }

    fn poll(&mut self) -> bool {
        self.batch.run()
    }

    fn pure_poll(&mut self) -> bool {
        !self.batch.is_empty()
    }

    fn try_enter_interrupt_mode(&mut self) -> bool {
        self.batch.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_batch_defers_late_additions() {
        let batch = Rc::new(FlushBatch::new());
        let hits = Rc::new(Cell::new(0));
        let (b, h) = (batch.clone(), hits.clone());
        batch.add(Box::new(move || {
            h.set(h.get() + 1);
            let h = h.clone();
            b.add(Box::new(move || h.set(h.get() + 10)));
        }));
        let mut poller = BatchFlushPoller::new(batch.clone());
        assert!(!poller.try_enter_interrupt_mode());
        assert!(poller.poll());
        assert_eq!(hits.get(), 1);
        assert_eq!(batch.len(), 1);
        assert!(poller.poll());
        assert_eq!(hits.get(), 11);
        assert!(!poller.poll());
        assert!(poller.try_enter_interrupt_mode());
    }

    #[test]
    fn test_lowres_poller_reports_nap() {
        let timers = Rc::new(RefCell::new(TimerSet::new()));
        let nap = Rc::new(Cell::new(None));
        let mut poller = LowresTimerPoller::new(timers, nap.clone());
        assert!(poller.try_enter_interrupt_mode());
        assert_eq!(nap.get(), None);
        poller.exit_interrupt_mode();
        assert!(!poller.poll());
    }
}
