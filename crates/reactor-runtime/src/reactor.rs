//! The per-shard engine
//!
//! One [`Reactor`] per shard thread. Each loop iteration:
//!
//! ```text
//!   apply poller registrations
//!   fire due steady timers
//!   run task queues (fair scheduler, until preempted)
//!   poll every poller once
//!   nothing to do?
//!     ├─ poll_mode             ─▶ spin
//!     ├─ idle < idle_poll_time ─▶ pure_poll
//!     └─ otherwise             ─▶ try to sleep in epoll_wait
//! ```
//!
//! Sleep arms the timerfd for the earliest steady or lowres deadline and
//! blocks on the shard's epoll set, which also holds the wakeup eventfd and
//! the signalfd.

use crate::config::ReactorConfig;
use crate::epoll::{Epoll, Fired, Internal};
use crate::io::{self, coordinator_of, IoBackend, IoQueue, PriorityClassStats};
use crate::platform_linux::check;
use crate::poller::builtin::{
    AioSubmitPoller, BatchFlushPoller, EpollPoller, FlushBatch, IoCompletionPoller, LowresTimerPoller,
    SmpPoller, SyscallPoller,
};
use crate::poller::{Poller, PollerId, PollerRegistry};
use crate::sched::{run_some_tasks, run_task_guarded, GroupStats, Preempt, Scheduler};
use crate::shard::{self, ShardShared};
use crate::signal::Signals;
use crate::smp::{self, QueueStats, SmpShard, SmpShared};
use crate::syscall::SyscallPool;
use crate::timer::{
    complete_timers, Clock, ClockKind, LowresClock, ManualClock, SteadyClock, Timer, TimerSet, TimerSetStats,
    TimerState,
};
use crate::watchdog::Watchdog;
use reactor_core::error::panic_message;
use reactor_core::task::{SchedulingGroup, Task, TaskSink};
use reactor_core::{do_for_each, promise, Deferred, Result};
use std::cell::{Cell, RefCell};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Rounds of dropping leftover tasks at shutdown; each round may queue the
/// broken-promise continuations of the one before.
const MAX_TEARDOWN_ROUNDS: usize = 64;
const LOAD_SAMPLE_PERIOD: Duration = Duration::from_secs(1);

type ExitHook = Box<dyn FnOnce() -> Deferred<()>>;

/// Snapshot of one shard's counters.
#[derive(Debug, Clone)]
pub struct ReactorStats {
    pub shard: u32,
    pub tasks_processed: u64,
    pub polls: u64,
    pub tasks_queued: usize,
    pub steady_timers: TimerSetStats,
    pub lowres_timers: TimerSetStats,
    pub io_backend: &'static str,
    pub io_in_flight: usize,
    /// Per-class accounting; empty unless this shard is an io coordinator
    pub io_classes: Vec<PriorityClassStats>,
    pub smp_queues: Vec<(u32, QueueStats)>,
    pub smp_in_flight: usize,
    pub syscalls: u64,
    pub groups: Vec<GroupStats>,
    pub load: f64,
}

/// Busy fraction of the last sampling period.
#[derive(Default)]
struct LoadSampler {
    slept: Cell<Duration>,
    slept_at_sample: Cell<Duration>,
    sampled_at: Cell<Duration>,
    load: Cell<f64>,
}

impl LoadSampler {
    fn add_sleep(&self, d: Duration) {
        self.slept.set(self.slept.get() + d);
    }

    fn sample(&self, now: Duration) {
        let elapsed = now.saturating_sub(self.sampled_at.get());
        let slept = self.slept.get().saturating_sub(self.slept_at_sample.get());
        if !elapsed.is_zero() {
            let idle = slept.as_secs_f64() / elapsed.as_secs_f64();
            self.load.set((1.0 - idle).clamp(0.0, 1.0));
        }
        self.sampled_at.set(now);
        self.slept_at_sample.set(self.slept.get());
    }
}

/// CLOCK_MONOTONIC timerfd the shard sleeps against.
struct HighresTimer {
    fd: OwnedFd,
    armed: Cell<Option<Duration>>,
}

impl HighresTimer {
    fn new() -> Result<Self> {
        // SAFETY: returns a fresh descriptor or -1.
        let fd = check(unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        })?;
        // SAFETY: fd was just created.
        Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) }, armed: Cell::new(None) })
    }

    /// Fire at steady time `at`, or disarm with `None`.
    fn arm(&self, at: Option<Duration>) {
        if self.armed.get() == at {
            return;
        }
        let value = match at {
            Some(at) => {
                // A zero it_value disarms; anything due already fires in 1ns.
                let d = at.saturating_sub(SteadyClock::now()).max(Duration::from_nanos(1));
                libc::timespec { tv_sec: d.as_secs() as libc::time_t, tv_nsec: d.subsec_nanos() as libc::c_long }
            }
            None => libc::timespec { tv_sec: 0, tv_nsec: 0 },
        };
        let spec = libc::itimerspec { it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 }, it_value: value };
        // SAFETY: spec lives across the call.
        let r = unsafe { libc::timerfd_settime(self.fd.as_raw_fd(), 0, &spec, std::ptr::null_mut()) };
        if r < 0 {
            reactor_core::kerror!("timerfd_settime failed: {}", crate::platform_linux::last_os_error());
            self.armed.set(None);
            return;
        }
        self.armed.set(at);
    }

    fn drain(&self) {
        let mut expirations: u64 = 0;
        // SAFETY: reads 8 bytes into a local.
        unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut expirations as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
        self.armed.set(None);
    }
}

pub struct Reactor {
    id: u32,
    config: Arc<ReactorConfig>,
    shard: Arc<ShardShared>,
    sched: RefCell<Scheduler>,
    steady_timers: RefCell<TimerSet>,
    lowres_timers: Rc<RefCell<TimerSet>>,
    manual_timers: RefCell<TimerSet>,
    lowres_nap: Rc<Cell<Option<Duration>>>,
    highres: HighresTimer,
    epoll: Rc<Epoll>,
    signals: Signals,
    pollers: PollerRegistry,
    smp: Rc<SmpShard>,
    syscall: Rc<SyscallPool>,
    io_backend: Rc<dyn IoBackend>,
    io_coordinator: u32,
    io_queue: Option<Rc<IoQueue>>,
    flush_batch: Rc<FlushBatch>,
    at_exit: RefCell<Vec<ExitHook>>,
    stopping: Cell<bool>,
    stopped: Cell<bool>,
    watchdog: RefCell<Option<Watchdog>>,
    load: LoadSampler,
    load_timer: RefCell<Option<Timer<LowresClock>>>,
}

impl Reactor {
    /// Build shard `id`'s engine. Nothing runs until [`Reactor::run`].
    pub(crate) fn new(id: u32, config: Arc<ReactorConfig>, shared: Arc<SmpShared>) -> Result<Rc<Self>> {
        let shard = shared.shard(id as usize).clone();
        let epoll = Rc::new(Epoll::new()?);
        epoll.add_internal(shard.notifier.as_raw_fd(), Internal::Wakeup)?;
        let highres = HighresTimer::new()?;
        epoll.add_internal(highres.fd.as_raw_fd(), Internal::Timer)?;

        let syscall = SyscallPool::new(shard.clone(), config.syscall_queue_length)?;
        let io_backend = io::create_backend(&config, &syscall)?;
        let smp_count = shared.count() as u32;
        let queues = config.io_queue_count() as u32;
        let io_coordinator = coordinator_of(id, smp_count, queues);
        let io_queue = (io_coordinator == id).then(|| {
            let capacity = config.io_request_budget() / queues.max(1) as usize;
            Rc::new(IoQueue::new(id, capacity, io_backend.clone()))
        });
        reactor_core::kdebug!(
            "shard {}: io backend {}, coordinator {}",
            id,
            io_backend.name(),
            io_coordinator
        );

        Ok(Rc::new(Self {
            id,
            sched: RefCell::new(Scheduler::new(config.task_quota, config.max_task_backlog)),
            steady_timers: RefCell::new(TimerSet::new()),
            lowres_timers: Rc::new(RefCell::new(TimerSet::new())),
            manual_timers: RefCell::new(TimerSet::new()),
            lowres_nap: Rc::new(Cell::new(None)),
            highres,
            signals: Signals::new(epoll.clone()),
            epoll,
            pollers: PollerRegistry::new(),
            smp: Rc::new(SmpShard::new(id as usize, shared)),
            syscall,
            io_backend,
            io_coordinator,
            io_queue,
            flush_batch: Rc::new(FlushBatch::new()),
            at_exit: RefCell::new(Vec::new()),
            stopping: Cell::new(false),
            stopped: Cell::new(false),
            watchdog: RefCell::new(None),
            load: LoadSampler::default(),
            load_timer: RefCell::new(None),
            shard,
            config,
        }))
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn smp_count(&self) -> u32 {
        self.smp.count() as u32
    }

    pub fn config(&self) -> &ReactorConfig {
        &self.config
    }

    pub fn shard(&self) -> &Arc<ShardShared> {
        &self.shard
    }

    pub(crate) fn smp(&self) -> &Rc<SmpShard> {
        &self.smp
    }

    pub(crate) fn signals(&self) -> &Signals {
        &self.signals
    }

    pub fn syscall(&self) -> &Rc<SyscallPool> {
        &self.syscall
    }

    pub fn io_backend(&self) -> Rc<dyn IoBackend> {
        self.io_backend.clone()
    }

    /// Shard whose io queue serves this one.
    pub fn io_coordinator(&self) -> u32 {
        self.io_coordinator
    }

    /// This shard's io queue, if it is a coordinator.
    pub fn io_queue(&self) -> Option<Rc<IoQueue>> {
        self.io_queue.clone()
    }

    pub(crate) fn flush_batch(&self) -> &Rc<FlushBatch> {
        &self.flush_batch
    }

    /// Fraction of the last second spent outside epoll_wait.
    pub fn load(&self) -> f64 {
        self.load.load.get()
    }

    pub fn stopped(&self) -> bool {
        self.stopped.get()
    }

    // ------------------------------------------------------------------
    // Tasks and scheduling groups
    // ------------------------------------------------------------------

    pub fn create_scheduling_group(&self, name: &str, shares: f32) -> SchedulingGroup {
        let group = self.sched.borrow_mut().create_group(name, shares);
        self.shard.set_group_name(group.0, name);
        reactor_core::kdebug!("scheduling group {} ({}) with {} shares", group.0, name, shares);
        group
    }

    pub fn set_shares(&self, group: SchedulingGroup, shares: f32) {
        self.sched.borrow_mut().set_shares(group, shares);
    }

    pub fn group_stats(&self, group: SchedulingGroup) -> Option<GroupStats> {
        self.sched.borrow().stats(group)
    }

    /// Resolve on a later turn of the loop, after already queued tasks.
    pub fn later(&self) -> Deferred<()> {
        let (p, f) = promise();
        reactor_core::task::spawn(move || p.set_value(()));
        f
    }

    // ------------------------------------------------------------------
    // Pollers and fd readiness
    // ------------------------------------------------------------------

    /// Register a poller; it runs from the next iteration on.
    pub fn add_poller(&self, poller: Box<dyn Poller>) -> PollerId {
        reactor_core::kdebug!("adding poller {}", poller.name());
        self.pollers.add(poller)
    }

    pub fn remove_poller(&self, id: PollerId) {
        self.pollers.remove(id);
    }

    pub fn readable(&self, fd: RawFd) -> Deferred<()> {
        self.epoll.readable(fd)
    }

    pub fn writeable(&self, fd: RawFd) -> Deferred<()> {
        self.epoll.writeable(fd)
    }

    /// Stop watching `fd`; call before closing it.
    pub fn forget(&self, fd: RawFd) {
        self.epoll.forget(fd);
    }

    /// One epoll pass. Returns true if anything fired.
    pub(crate) fn poll_epoll(&self, timeout_ms: i32) -> bool {
        let fired = self.epoll.wait(timeout_ms);
        self.handle_internal(fired);
        fired.any()
    }

    fn handle_internal(&self, fired: Fired) {
        if fired.wakeup {
            self.shard.notifier.drain();
        }
        if fired.timer {
            self.highres.drain();
        }
        if fired.signal {
            self.signals.dispatch();
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn timer_set(&self, kind: ClockKind) -> &RefCell<TimerSet> {
        match kind {
            ClockKind::Steady => &self.steady_timers,
            ClockKind::Lowres => &*self.lowres_timers,
            ClockKind::Manual => &self.manual_timers,
        }
    }

    pub(crate) fn add_timer(&self, timer: &Rc<TimerState>) {
        self.timer_set(timer.kind).borrow_mut().insert(timer);
    }

    pub(crate) fn del_timer(&self, timer: &TimerState) {
        self.timer_set(timer.kind).borrow_mut().remove(timer);
    }

    pub(crate) fn expire_manual_timers(&self) -> usize {
        complete_timers(&self.manual_timers, ManualClock::now())
    }

    /// Resolve after `d` on the steady clock.
    pub fn sleep(&self, d: Duration) -> Deferred<()> {
        crate::timer::sleep::<SteadyClock>(d)
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Run `hook` when the system exits, before shards stop. Hooks run in
    /// reverse order of registration.
    pub fn at_exit(&self, hook: impl FnOnce() -> Deferred<()> + 'static) {
        self.at_exit.borrow_mut().push(Box::new(hook));
    }

    fn run_at_exit(&self) -> Deferred<()> {
        let mut hooks = std::mem::take(&mut *self.at_exit.borrow_mut());
        hooks.reverse();
        do_for_each(hooks, |hook| hook())
    }

    /// Stop every shard with `code` as the process exit code.
    ///
    /// Shard 0 coordinates: at-exit hooks of the other shards run first,
    /// then its own, then the others stop, then shard 0 stops.
    pub fn exit(&self, code: i32) {
        if self.id != 0 {
            smp::submit_to(0, move || {
                shard::local().exit(code);
                Deferred::ready(())
            })
            .discard();
            return;
        }
        if self.stopping.replace(true) {
            return;
        }
        reactor_core::kdebug!("exit({}) requested", code);
        self.smp.shared().set_exit_code(code);
        smp::invoke_on_others(|| shard::local().run_at_exit())
            .then_result(|r| {
                if let Err(e) = r {
                    reactor_core::kerror!("at-exit hook on another shard failed: {}", e);
                }
                shard::local().run_at_exit()
            })
            .then_result(|r| {
                if let Err(e) = r {
                    reactor_core::kerror!("at-exit hook failed: {}", e);
                }
                smp::invoke_on_others(|| {
                    shard::local().stop();
                    Deferred::ready(())
                })
            })
            .on_complete(|r| {
                if let Err(e) = r {
                    reactor_core::kerror!("stopping other shards failed: {}", e);
                }
                shard::local().stop();
            });
    }

    /// Leave the loop at the next iteration.
    pub(crate) fn stop(&self) {
        self.stopped.set(true);
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    pub fn stats(&self) -> ReactorStats {
        let sched = self.sched.borrow();
        let groups = (0..sched.group_count() as u32)
            .filter_map(|g| sched.stats(SchedulingGroup(g)))
            .collect();
        ReactorStats {
            shard: self.id,
            tasks_processed: self.shard.tasks_processed.load(Ordering::Relaxed),
            polls: self.shard.polls.load(Ordering::Relaxed),
            tasks_queued: sched.queued(),
            steady_timers: self.steady_timers.borrow().stats(),
            lowres_timers: self.lowres_timers.borrow().stats(),
            io_backend: self.io_backend.name(),
            io_in_flight: self.io_backend.in_flight(),
            io_classes: self.io_queue.as_ref().map(|q| q.stats()).unwrap_or_default(),
            smp_queues: self.smp.stats(),
            smp_in_flight: self.smp.in_flight(),
            syscalls: self.syscall.executed(),
            groups,
            load: self.load(),
        }
    }

    // ------------------------------------------------------------------
    // The loop
    // ------------------------------------------------------------------

    fn register_pollers(self: &Rc<Self>) {
        self.add_poller(Box::new(IoCompletionPoller::new(self.io_backend.clone())));
        self.add_poller(Box::new(AioSubmitPoller::new(self.io_backend.clone())));
        self.add_poller(Box::new(SmpPoller::new(self.smp.clone())));
        self.add_poller(Box::new(EpollPoller::new(Rc::downgrade(self))));
        self.add_poller(Box::new(SyscallPoller::new(self.syscall.clone())));
        self.add_poller(Box::new(LowresTimerPoller::new(
            self.lowres_timers.clone(),
            self.lowres_nap.clone(),
        )));
        self.add_poller(Box::new(BatchFlushPoller::new(self.flush_batch.clone())));
    }

    fn start_services(self: &Rc<Self>) {
        if self.id == 0 && self.config.handle_sigint {
            for sig in [nix::sys::signal::Signal::SIGINT, nix::sys::signal::Signal::SIGTERM] {
                let handled = self.signals.handle(
                    sig,
                    Box::new(move || {
                        reactor_core::kinfo!("received {}, exiting", sig);
                        shard::local().exit(0);
                    }),
                );
                if let Err(e) = handled {
                    reactor_core::kwarn!("cannot handle {}: {}", sig, e);
                }
            }
        }

        LowresClock::update();
        self.load.sample(SteadyClock::now());
        let me: Weak<Reactor> = Rc::downgrade(self);
        let mut timer = Timer::<LowresClock>::new(move || {
            if let Some(r) = me.upgrade() {
                r.load.sample(SteadyClock::now());
            }
        });
        timer.arm_periodic(LOAD_SAMPLE_PERIOD);
        *self.load_timer.borrow_mut() = Some(timer);

        match Watchdog::start(self.shard.clone(), &self.config) {
            Ok(w) => *self.watchdog.borrow_mut() = Some(w),
            Err(e) => reactor_core::kwarn!("shard {}: no stall watchdog: {}", self.id, e),
        }
    }

    /// Run until [`Reactor::exit`] stops this shard. Returns the exit code.
    pub fn run(self: &Rc<Self>) -> i32 {
        self.register_pollers();
        self.start_services();

        let mut idle_since: Option<Instant> = None;
        loop {
            self.pollers.apply();
            if self.stopped.get() {
                break;
            }

            // ── Step 1: timers and tasks ──
            complete_timers(&self.steady_timers, SteadyClock::now());
            let ran = run_some_tasks(&self.sched, &self.shard.preempt, |task| {
                self.shard.running_group.store(task.group().0, Ordering::Relaxed);
                run_task_guarded(task);
                self.shard.tasks_processed.fetch_add(1, Ordering::Relaxed);
            });

            // ── Step 2: event sources ──
            let polled = self.pollers.poll_all();
            self.shard.polls.fetch_add(1, Ordering::Relaxed);
            if ran > 0 || polled || self.sched.borrow().has_tasks() {
                idle_since = None;
                continue;
            }

            // ── Step 3: idle ──
            if self.config.poll_mode {
                continue;
            }
            let now = Instant::now();
            let since = *idle_since.get_or_insert(now);
            if now.duration_since(since) < self.config.idle_poll_time {
                if self.pollers.pure_poll_all() {
                    idle_since = None;
                }
                continue;
            }
            self.try_sleep();
            idle_since = None;
        }

        self.teardown();
        let code = self.smp.shared().exit_code();
        reactor_core::kdebug!("shard {} loop finished, exit code {}", self.id, code);
        code
    }

    fn try_sleep(&self) {
        self.shard.sleeping.store(true, Ordering::Relaxed);
        std::sync::atomic::fence(Ordering::SeqCst);
        if !self.pollers.try_enter_all() {
            self.shard.sleeping.store(false, Ordering::Relaxed);
            return;
        }
        if self.sched.borrow().has_tasks() || self.stopped.get() {
            self.pollers.exit_all();
            self.shard.sleeping.store(false, Ordering::Relaxed);
            return;
        }

        let steady = self.steady_timers.borrow_mut().next_deadline();
        let wake_at = match (steady, self.lowres_nap.get()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.highres.arm(wake_at);

        let started = Instant::now();
        let fired = self.epoll.wait(-1);
        self.load.add_sleep(started.elapsed());
        LowresClock::update();
        self.shard.sleeping.store(false, Ordering::Relaxed);
        self.handle_internal(fired);
        self.pollers.exit_all();
    }

    /// Release everything that could still resolve promises, while the
    /// shard's task sink is installed to take their continuations.
    fn teardown(&self) {
        // Results still travelling between shards.
        self.smp.poll();
        if let Some(mut w) = self.watchdog.borrow_mut().take() {
            w.stop();
        }
        self.load_timer.borrow_mut().take();
        self.pollers.clear();
        self.syscall.shutdown();
        self.syscall.complete();

        let abandoned = self.smp.abandon() + self.syscall.abandon();
        if abandoned > 0 {
            reactor_core::kdebug!("shard {}: {} requests abandoned at shutdown", self.id, abandoned);
        }
        for set in [&self.steady_timers, &*self.lowres_timers, &self.manual_timers] {
            let timers = std::mem::take(&mut *set.borrow_mut());
            drop(timers);
        }
        for _ in 0..MAX_TEARDOWN_ROUNDS {
            let tasks = self.sched.borrow_mut().drain_tasks();
            if tasks.is_empty() {
                break;
            }
            if let Err(payload) = catch_unwind(AssertUnwindSafe(move || drop(tasks))) {
                reactor_core::kerror!("dropping tasks at shutdown panicked: {}", panic_message(payload.as_ref()));
            }
        }
        self.shard.stopped.store(true, Ordering::Release);
    }
}

impl TaskSink for Reactor {
    fn schedule(&self, task: Task) {
        self.sched.borrow_mut().add_task(task);
    }

    fn current_group(&self) -> SchedulingGroup {
        self.sched.borrow().current_group()
    }

    fn need_preempt(&self) -> bool {
        self.shard.preempt.need_preempt()
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("id", &self.id)
            .field("pollers", &self.pollers.len())
            .field("io_coordinator", &self.io_coordinator)
            .field("stopped", &self.stopped.get())
            .finish()
    }
}
