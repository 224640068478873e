//! Timers for the three clock domains
//!
//! ```text
//!   Timer<SteadyClock> ─┐                     ┌─ timerfd (re-armed to the
//!   Timer<LowresClock> ─┼─▶ shard TimerSet ───┤   earliest steady deadline)
//!   Timer<ManualClock> ─┘   (one per clock)   ├─ lowres poller (every tick)
//!                                             └─ ManualClock::advance
//! ```
//!
//! A [`Timer`] owns its callback. Arming registers it with the current
//! shard's set for its clock; the reactor walks each set up to "now" and
//! calls [`complete_timers`], which re-arms periodic timers before their
//! callback runs.
//!
//! Timers are shard-local and must be armed and cancelled on the shard
//! that created them.

pub mod clock;
pub mod entry;
pub mod set;

pub use clock::{Clock, ClockKind, LowresClock, ManualClock, SteadyClock};
pub use entry::{TimerHandle, TimerType};
pub use set::{TimerSet, TimerSetStats};

use reactor_core::error::{invariant_violation, is_invariant_violation, panic_message};
use reactor_core::{promise, Deferred, ReactorError};
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;

type Callback = Box<dyn FnMut()>;

/// Shared state of one timer; the shard's set holds it while armed.
pub struct TimerState {
    pub(crate) kind: ClockKind,
    pub(crate) handle: Cell<TimerHandle>,
    pub(crate) deadline: Cell<Duration>,
    pub(crate) timer_type: Cell<TimerType>,
    pub(crate) armed: Cell<bool>,
    callback: RefCell<Option<Callback>>,
}

impl TimerState {
    pub(crate) fn new(kind: ClockKind, callback: Callback) -> Self {
        Self {
            kind,
            handle: Cell::new(TimerHandle::NONE),
            deadline: Cell::new(Duration::ZERO),
            timer_type: Cell::new(TimerType::OneShot),
            armed: Cell::new(false),
            callback: RefCell::new(Some(callback)),
        }
    }

    /// Run the callback with no borrow held, so it may re-arm, cancel or
    /// replace itself.
    fn fire(&self) {
        let Some(mut cb) = self.callback.borrow_mut().take() else {
            return;
        };
        if let Err(payload) = catch_unwind(AssertUnwindSafe(&mut cb)) {
            if is_invariant_violation(payload.as_ref()) {
                reactor_core::kerror!("aborting: {}", panic_message(payload.as_ref()));
                std::process::abort();
            }
            reactor_core::kerror!("timer callback panicked: {}", panic_message(payload.as_ref()));
        }
        let mut slot = self.callback.borrow_mut();
        if slot.is_none() {
            *slot = Some(cb);
        }
    }
}

/// Fire every timer in `set` due at `now`. Returns how many fired.
///
/// Periodic timers are re-added at `now + interval` before their callback
/// runs. A timer cancelled by an earlier callback in the same batch does
/// not fire.
pub fn complete_timers(set: &RefCell<TimerSet>, now: Duration) -> usize {
    let expired = set.borrow_mut().expire(now);
    let mut fired = 0;
    for (handle, timer) in expired {
        if !timer.armed.get() || timer.handle.get() != handle {
            continue;
        }
        match timer.timer_type.get() {
            TimerType::Periodic { interval } => {
                timer.deadline.set(now + interval);
                set.borrow_mut().insert(&timer);
            }
            TimerType::OneShot => timer.armed.set(false),
        }
        timer.fire();
        fired += 1;
    }
    fired
}

/// A cancellable callback bound to clock `C`.
///
/// Dropping an armed timer cancels it.
pub struct Timer<C: Clock = SteadyClock> {
    state: Rc<TimerState>,
    _clock: PhantomData<C>,
}

impl<C: Clock> Timer<C> {
    pub fn new(callback: impl FnMut() + 'static) -> Self {
        Self {
            state: Rc::new(TimerState::new(C::KIND, Box::new(callback))),
            _clock: PhantomData,
        }
    }

    /// Replace the callback. Takes effect on the next expiry.
    pub fn set_callback(&mut self, callback: impl FnMut() + 'static) {
        *self.state.callback.borrow_mut() = Some(Box::new(callback));
    }

    /// Arm for an absolute point on `C`. Arming an armed timer is a bug.
    pub fn arm_at(&mut self, deadline: Duration) {
        self.arm_state(deadline, TimerType::OneShot);
    }

    /// Arm to fire once after `delay`.
    pub fn arm(&mut self, delay: Duration) {
        self.arm_state(C::now() + delay, TimerType::OneShot);
    }

    /// Arm to fire every `period`, first after one period.
    pub fn arm_periodic(&mut self, period: Duration) {
        self.arm_state(C::now() + period, TimerType::Periodic { interval: period });
    }

    /// Cancel if armed, then arm for `deadline`.
    pub fn rearm(&mut self, deadline: Duration) {
        self.cancel();
        self.arm_at(deadline);
    }

    fn arm_state(&mut self, deadline: Duration, timer_type: TimerType) {
        if self.state.armed.get() {
            invariant_violation("timer armed twice");
        }
        self.state.deadline.set(deadline);
        self.state.timer_type.set(timer_type);
        self.state.armed.set(true);
        crate::shard::local().add_timer(&self.state);
    }

    /// Disarm. Returns false if the timer was not armed.
    pub fn cancel(&mut self) -> bool {
        if !self.state.armed.replace(false) {
            return false;
        }
        if let Some(reactor) = crate::shard::try_local() {
            reactor.del_timer(&self.state);
        }
        true
    }

    pub fn armed(&self) -> bool {
        self.state.armed.get()
    }

    /// Deadline of the current or last arming.
    pub fn deadline(&self) -> Duration {
        self.state.deadline.get()
    }
}

impl<C: Clock> Drop for Timer<C> {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl<C: Clock> std::fmt::Debug for Timer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("clock", &C::KIND)
            .field("armed", &self.armed())
            .field("deadline", &self.deadline())
            .finish()
    }
}

/// Resolve after `d` on clock `C`.
///
/// The shard's timer set keeps the timer alive until it fires.
pub fn sleep<C: Clock>(d: Duration) -> Deferred<()> {
    let (p, f) = promise();
    let mut p = Some(p);
    let state = Rc::new(TimerState::new(
        C::KIND,
        Box::new(move || {
            if let Some(p) = p.take() {
                p.set_value(());
            }
        }),
    ));
    state.deadline.set(C::now() + d);
    state.armed.set(true);
    crate::shard::local().add_timer(&state);
    f
}

/// Fail with [`ReactorError::Timeout`] unless `f` resolves within `d`.
///
/// The underlying operation is not cancelled; its late result is dropped.
pub fn with_timeout<T: 'static>(d: Duration, f: Deferred<T>) -> Deferred<T> {
    let (p, out) = promise();
    let slot = Rc::new(RefCell::new(Some(p)));
    let on_expire = slot.clone();
    let timer = Rc::new(RefCell::new(Timer::<SteadyClock>::new(move || {
        if let Some(p) = on_expire.borrow_mut().take() {
            p.set_error(ReactorError::Timeout);
        }
    })));
    timer.borrow_mut().arm(d);
    f.on_complete(move |r| {
        timer.borrow_mut().cancel();
        match slot.borrow_mut().take() {
            Some(p) => p.set_result(r),
            None => {
                if let Err(e) = r {
                    reactor_core::kdebug!("result arrived after timeout: {}", e);
                }
            }
        }
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn armed_state(set: &RefCell<TimerSet>, at_ms: u64, ty: TimerType, cb: Callback) -> Rc<TimerState> {
        let s = Rc::new(TimerState::new(ClockKind::Manual, cb));
        s.deadline.set(Duration::from_millis(at_ms));
        s.timer_type.set(ty);
        s.armed.set(true);
        set.borrow_mut().insert(&s);
        s
    }

    #[test]
    fn test_periodic_rearmed_before_callback() {
        let set = Rc::new(RefCell::new(TimerSet::new()));
        let seen = Rc::new(Cell::new(None));
        let (set2, seen2) = (set.clone(), seen.clone());
        let ty = TimerType::Periodic { interval: Duration::from_millis(10) };
        let _t = armed_state(
            &set,
            10,
            ty,
            Box::new(move || seen2.set(set2.borrow_mut().next_deadline())),
        );
        assert_eq!(complete_timers(&set, Duration::from_millis(12)), 1);
        assert_eq!(seen.get(), Some(Duration::from_millis(22)));
        assert_eq!(complete_timers(&set, Duration::from_millis(22)), 1);
        assert_eq!(set.borrow().len(), 1);
    }

    #[test]
    fn test_one_shot_disarms() {
        let set = RefCell::new(TimerSet::new());
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let t = armed_state(&set, 5, TimerType::OneShot, Box::new(move || h.set(h.get() + 1)));
        assert_eq!(complete_timers(&set, Duration::from_millis(4)), 0);
        assert_eq!(complete_timers(&set, Duration::from_millis(5)), 1);
        assert!(!t.armed.get());
        assert_eq!(complete_timers(&set, Duration::from_millis(50)), 0);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let set = RefCell::new(TimerSet::new());
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let t = armed_state(&set, 5, TimerType::OneShot, Box::new(move || h.set(h.get() + 1)));
        t.armed.set(false);
        set.borrow_mut().remove(&t);
        assert_eq!(complete_timers(&set, Duration::from_millis(10)), 0);
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn test_callback_cancels_later_timer_in_same_batch() {
        let set = RefCell::new(TimerSet::new());
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let second = armed_state(&set, 2, TimerType::OneShot, Box::new(move || h.set(h.get() + 1)));
        let victim = second.clone();
        let _first = armed_state(&set, 1, TimerType::OneShot, Box::new(move || victim.armed.set(false)));
        assert_eq!(complete_timers(&set, Duration::from_millis(3)), 1);
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        reactor_core::kprint::set_log_level(reactor_core::kprint::LogLevel::Off);
        let set = RefCell::new(TimerSet::new());
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let _a = armed_state(&set, 1, TimerType::OneShot, Box::new(|| panic!("boom")));
        let _b = armed_state(&set, 2, TimerType::OneShot, Box::new(move || h.set(h.get() + 1)));
        assert_eq!(complete_timers(&set, Duration::from_millis(3)), 2);
        assert_eq!(hits.get(), 1);
    }
}
