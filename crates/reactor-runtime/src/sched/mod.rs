//! Weighted-fair task scheduler
//!
//! Every scheduling group owns a [`TaskQueue`] with a share weight. Queues
//! with work sit in an active list ordered by virtual runtime, where
//!
//! ```text
//!   vruntime += wall_time * 2^32 / shares >> 32
//! ```
//!
//! Each pass pops the queue with the lowest vruntime, runs its tasks until
//! preemption is requested (at least one task always runs), charges the
//! elapsed time and reinserts it. Over time every busy queue receives CPU in
//! proportion to its shares.
//!
//! A queue that was idle rejoins at no less than
//! `last_vruntime - to_vruntime(quota)`, so long idleness earns at most one
//! quota of catch-up.
//!
//! ```text
//!   activating ──insert_activating──▶ active (sorted by vruntime)
//!                                        │ pop front
//!                                        ▼
//!                                   run tasks ── account ──▶ reinsert / idle
//! ```

mod task_queue;

pub use task_queue::TaskQueue;

use reactor_core::error::{is_invariant_violation, panic_message};
use reactor_core::task::{SchedulingGroup, Task};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Time source used for accounting; tests substitute a manual one.
pub trait SchedClock {
    fn now(&self) -> Instant;
}

/// Monotonic wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl SchedClock for WallClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Source of preemption requests checked between tasks.
pub trait Preempt {
    fn need_preempt(&self) -> bool;
    fn reset(&self);
}

/// Preemption flag raised by the shard's watchdog thread every quota.
#[derive(Debug, Clone, Default)]
pub struct PreemptFlag(Arc<AtomicBool>);

impl PreemptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running task queue to yield at its next safe point.
    #[inline]
    pub fn request(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

impl Preempt for PreemptFlag {
    #[inline]
    fn need_preempt(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    #[inline]
    fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Snapshot of one group's accounting.
#[derive(Debug, Clone)]
pub struct GroupStats {
    pub id: SchedulingGroup,
    pub name: String,
    pub shares: f32,
    pub vruntime: u64,
    pub runtime: Duration,
    pub tasks_processed: u64,
    pub quota_violation_time: Duration,
    pub queued: usize,
}

/// Per-shard set of task queues plus the fairness bookkeeping.
pub struct Scheduler<C: SchedClock = WallClock> {
    queues: Vec<TaskQueue>,
    active: VecDeque<usize>,
    activating: Vec<usize>,
    last_vruntime: u64,
    quota: Duration,
    max_task_backlog: usize,
    current: Option<usize>,
    tasks_processed: u64,
    clock: C,
}

impl Scheduler<WallClock> {
    pub fn new(quota: Duration, max_task_backlog: usize) -> Self {
        Self::with_clock(quota, max_task_backlog, WallClock)
    }
}

impl<C: SchedClock> Scheduler<C> {
    /// Scheduler with the default group "main" (shares 1000) already created.
    pub fn with_clock(quota: Duration, max_task_backlog: usize, clock: C) -> Self {
        Self {
            queues: vec![TaskQueue::new(SchedulingGroup::DEFAULT, "main", 1000.0)],
            active: VecDeque::new(),
            activating: Vec::new(),
            last_vruntime: 0,
            quota,
            max_task_backlog,
            current: None,
            tasks_processed: 0,
            clock,
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn quota(&self) -> Duration {
        self.quota
    }

    pub fn max_task_backlog(&self) -> usize {
        self.max_task_backlog
    }

    pub fn create_group(&mut self, name: impl Into<String>, shares: f32) -> SchedulingGroup {
        let id = SchedulingGroup(self.queues.len() as u32);
        self.queues.push(TaskQueue::new(id, name, shares));
        id
    }

    pub fn set_shares(&mut self, group: SchedulingGroup, shares: f32) {
        if let Some(q) = self.queues.get_mut(group.index()) {
            q.set_shares(shares);
        }
    }

    pub fn group_name(&self, group: SchedulingGroup) -> &str {
        self.queues.get(group.index()).map(|q| q.name.as_str()).unwrap_or("?")
    }

    pub fn group_count(&self) -> usize {
        self.queues.len()
    }

    /// Group whose tasks are running, or the default group between passes.
    pub fn current_group(&self) -> SchedulingGroup {
        self.current
            .map(|i| self.queues[i].id)
            .unwrap_or(SchedulingGroup::DEFAULT)
    }

    pub fn tasks_processed(&self) -> u64 {
        self.tasks_processed
    }

    pub fn has_tasks(&self) -> bool {
        !self.active.is_empty() || !self.activating.is_empty()
    }

    /// Tasks queued across all groups.
    pub fn queued(&self) -> usize {
        self.queues.iter().map(TaskQueue::len).sum()
    }

    pub fn stats(&self, group: SchedulingGroup) -> Option<GroupStats> {
        self.queues.get(group.index()).map(|q| GroupStats {
            id: q.id,
            name: q.name.clone(),
            shares: q.shares(),
            vruntime: q.vruntime,
            runtime: q.runtime,
            tasks_processed: q.tasks_processed,
            quota_violation_time: q.quota_violation_time,
            queued: q.len(),
        })
    }

    /// Queue a task on its group; unknown groups fall back to the default.
    pub fn add_task(&mut self, task: Task) {
        let mut idx = task.group().index();
        if idx >= self.queues.len() {
            reactor_core::kwarn!("task for unknown scheduling group {}, using main", idx);
            idx = 0;
        }
        let q = &mut self.queues[idx];
        let was_empty = q.is_empty();
        q.tasks.push_back(task);
        if was_empty {
            self.activate(idx);
        }
    }

    /// Take every queued task out without running it.
    pub(crate) fn drain_tasks(&mut self) -> Vec<Task> {
        let mut out = Vec::new();
        for q in &mut self.queues {
            out.extend(q.tasks.drain(..));
            q.active = false;
        }
        self.active.clear();
        self.activating.clear();
        out
    }

    fn activate(&mut self, idx: usize) {
        let q = &mut self.queues[idx];
        if q.active {
            return;
        }
        // Cap idle credit at one quota behind the leader.
        let floor = self.last_vruntime.saturating_sub(q.to_vruntime(self.quota));
        q.vruntime = q.vruntime.max(floor);
        q.active = true;
        self.activating.push(idx);
    }

    fn insert_active(&mut self, idx: usize) {
        self.queues[idx].active = true;
        let v = self.queues[idx].vruntime;
        let behind_back = self
            .active
            .back()
            .map_or(true, |&b| self.queues[b].vruntime < v);
        if behind_back {
            self.active.push_back(idx);
            return;
        }
        // Newly runnable queue: start at the front and sink past everything
        // with a lower or equal vruntime.
        self.active.push_front(idx);
        let mut i = 0;
        while i + 1 != self.active.len()
            && self.queues[self.active[i]].vruntime >= self.queues[self.active[i + 1]].vruntime
        {
            self.active.swap(i, i + 1);
            i += 1;
        }
    }

    fn insert_activating(&mut self) {
        let activating = std::mem::take(&mut self.activating);
        for idx in activating {
            self.insert_active(idx);
        }
    }

    /// Start a pass: returns the queue with the lowest vruntime.
    pub(crate) fn begin_pass(&mut self) -> Option<usize> {
        self.insert_activating();
        let idx = self.active.pop_front()?;
        self.last_vruntime = self.last_vruntime.max(self.queues[idx].vruntime);
        self.current = Some(idx);
        Some(idx)
    }

    pub(crate) fn pop_task(&mut self, idx: usize) -> Option<Task> {
        self.queues[idx].tasks.pop_front()
    }

    pub(crate) fn task_done(&mut self, idx: usize) -> usize {
        self.queues[idx].tasks_processed += 1;
        self.tasks_processed += 1;
        self.queues[idx].len()
    }

    /// Charge `runtime` to the queue and put it back if it still has work.
    pub(crate) fn end_pass(&mut self, idx: usize, runtime: Duration) {
        let quota = self.quota;
        let q = &mut self.queues[idx];
        q.vruntime = q.vruntime.saturating_add(q.to_vruntime(runtime));
        q.runtime += runtime;
        if runtime > quota * 2 {
            q.quota_violation_time += runtime - quota;
        }
        if q.is_empty() {
            q.active = false;
        } else {
            self.insert_active(idx);
        }
    }

    pub(crate) fn end_run(&mut self) {
        self.current = None;
    }
}

/// Run task queues until preemption is requested or all are drained.
///
/// Borrows `sched` only between tasks, so a running task may schedule more
/// work on this shard. Returns the number of tasks run.
pub fn run_some_tasks<C: SchedClock>(
    sched: &RefCell<Scheduler<C>>,
    preempt: &dyn Preempt,
    mut run: impl FnMut(Task),
) -> u64 {
    if !sched.borrow().has_tasks() {
        return 0;
    }
    preempt.reset();
    let backlog = sched.borrow().max_task_backlog();
    let mut ran = 0;
    let mut t_completed = sched.borrow().clock().now();
    loop {
        let t_started = t_completed;
        let Some(idx) = sched.borrow_mut().begin_pass() else {
            break;
        };
        loop {
            let Some(task) = sched.borrow_mut().pop_task(idx) else {
                break;
            };
            run(task);
            ran += 1;
            let left = sched.borrow_mut().task_done(idx);
            // Checked after the task so every pass makes progress.
            if preempt.need_preempt() {
                if left <= backlog {
                    break;
                }
                // Deep backlog: preempt checks would only slow it down.
                preempt.reset();
            }
        }
        let mut s = sched.borrow_mut();
        t_completed = s.clock().now();
        s.end_pass(idx, t_completed.saturating_duration_since(t_started));
        if !s.has_tasks() || preempt.need_preempt() {
            break;
        }
    }
    sched.borrow_mut().end_run();
    ran
}

/// Run one task, containing any panic it raises.
///
/// Ordinary panics are logged and the task is dropped. An invariant
/// violation aborts the process.
pub fn run_task_guarded(task: Task) {
    let group = task.group();
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| task.run())) {
        if is_invariant_violation(payload.as_ref()) {
            reactor_core::kerror!("aborting: {}", panic_message(payload.as_ref()));
            std::process::abort();
        }
        reactor_core::kerror!(
            "task in group {} panicked: {}",
            group.0,
            panic_message(payload.as_ref())
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Clock advanced by hand; shared with the tasks that "burn" time.
    #[derive(Clone)]
    struct ManualClock {
        base: Instant,
        offset: Rc<Cell<Duration>>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self { base: Instant::now(), offset: Rc::new(Cell::new(Duration::ZERO)) }
        }
        fn advance(&self, d: Duration) {
            self.offset.set(self.offset.get() + d);
        }
    }

    impl SchedClock for ManualClock {
        fn now(&self) -> Instant {
            self.base + self.offset.get()
        }
    }

    /// Preempts once a quota of manual time has elapsed since the last reset.
    struct TickPreempt {
        clock: ManualClock,
        quota: Duration,
        since: Cell<Instant>,
    }

    impl Preempt for TickPreempt {
        fn need_preempt(&self) -> bool {
            self.clock.now() >= self.since.get() + self.quota
        }
        fn reset(&self) {
            self.since.set(self.clock.now());
        }
    }

    fn setup(quota: Duration) -> (RefCell<Scheduler<ManualClock>>, ManualClock, TickPreempt) {
        let clock = ManualClock::new();
        let sched = RefCell::new(Scheduler::with_clock(quota, 1000, clock.clone()));
        let preempt = TickPreempt { clock: clock.clone(), quota, since: Cell::new(clock.now()) };
        (sched, clock, preempt)
    }

    #[test]
    fn test_fairness_one_to_four() {
        let quota = Duration::from_micros(500);
        let cost = Duration::from_micros(100);
        let (sched, clock, preempt) = setup(quota);
        let g1 = sched.borrow_mut().create_group("q1", 1.0);
        let g2 = sched.borrow_mut().create_group("q2", 4.0);
        let done2 = Rc::new(Cell::new(0usize));

        for _ in 0..1000 {
            let c = clock.clone();
            sched.borrow_mut().add_task(Task::new(g1, move || c.advance(cost)));
            let c = clock.clone();
            let d = done2.clone();
            sched.borrow_mut().add_task(Task::new(g2, move || {
                c.advance(cost);
                d.set(d.get() + 1);
            }));
        }

        while done2.get() < 1000 {
            run_some_tasks(&sched, &preempt, |t| t.run());
        }

        let s = sched.borrow();
        let r1 = s.stats(g1).unwrap().runtime.as_secs_f64();
        let r2 = s.stats(g2).unwrap().runtime.as_secs_f64();
        let ratio = r2 / (4.0 * r1);
        assert!((0.95..=1.05).contains(&ratio), "q1 {:?} q2 {:?}", r1, r2);
    }

    #[test]
    fn test_at_least_one_task_per_pass() {
        let (sched, clock, preempt) = setup(Duration::from_micros(10));
        let g = sched.borrow_mut().create_group("slow", 1.0);
        for _ in 0..3 {
            let c = clock.clone();
            sched.borrow_mut().add_task(Task::new(g, move || c.advance(Duration::from_millis(1))));
        }
        assert_eq!(run_some_tasks(&sched, &preempt, |t| t.run()), 1);
        assert_eq!(run_some_tasks(&sched, &preempt, |t| t.run()), 1);
        assert_eq!(sched.borrow().stats(g).unwrap().tasks_processed, 2);
    }

    #[test]
    fn test_idle_queue_credit_is_capped() {
        let quota = Duration::from_micros(500);
        let (sched, clock, preempt) = setup(quota);
        let busy = sched.borrow_mut().create_group("busy", 1.0);
        let idle = sched.borrow_mut().create_group("idle", 1.0);
        for _ in 0..100 {
            let c = clock.clone();
            sched.borrow_mut().add_task(Task::new(busy, move || c.advance(Duration::from_micros(100))));
        }
        while sched.borrow().has_tasks() {
            run_some_tasks(&sched, &preempt, |t| t.run());
        }
        let busy_v = sched.borrow().stats(busy).unwrap().vruntime;

        sched.borrow_mut().add_task(Task::new(idle, || {}));
        sched.borrow_mut().insert_activating();
        let idle_v = sched.borrow().stats(idle).unwrap().vruntime;
        // One quota behind the last pass start, never the idle queue's zero.
        assert!(idle_v > 0);
        assert!(busy_v - idle_v <= 2 * 500_000);
    }

    #[test]
    fn test_tasks_scheduled_while_running() {
        let (sched, _clock, preempt) = setup(Duration::from_millis(100));
        let sched = Rc::new(sched);
        let hits = Rc::new(Cell::new(0));
        let (s2, h2) = (sched.clone(), hits.clone());
        sched.borrow_mut().add_task(Task::new(SchedulingGroup::DEFAULT, move || {
            let h3 = h2.clone();
            s2.borrow_mut().add_task(Task::new(SchedulingGroup::DEFAULT, move || h3.set(h3.get() + 1)));
            h2.set(h2.get() + 1);
        }));
        run_some_tasks(&sched, &preempt, |t| t.run());
        assert_eq!(hits.get(), 2);
        assert!(!sched.borrow().has_tasks());
    }

    #[test]
    fn test_active_order_ties_go_behind() {
        let (sched, _clock, _preempt) = setup(Duration::from_micros(500));
        let a = sched.borrow_mut().create_group("a", 1.0);
        let b = sched.borrow_mut().create_group("b", 1.0);
        sched.borrow_mut().add_task(Task::new(a, || {}));
        sched.borrow_mut().add_task(Task::new(b, || {}));
        let first = sched.borrow_mut().begin_pass().unwrap();
        assert_eq!(first, a.index());
    }

    #[test]
    fn test_panicking_task_is_contained() {
        reactor_core::kprint::set_log_level(reactor_core::kprint::LogLevel::Off);
        let (sched, _clock, preempt) = setup(Duration::from_millis(1));
        let after = Rc::new(Cell::new(false));
        let a = after.clone();
        sched.borrow_mut().add_task(Task::new(SchedulingGroup::DEFAULT, || panic!("boom")));
        sched.borrow_mut().add_task(Task::new(SchedulingGroup::DEFAULT, move || a.set(true)));
        run_some_tasks(&sched, &preempt, run_task_guarded);
        assert!(after.get());
    }
}
