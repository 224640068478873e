//! Task objects and the thread-local task sink
//!
//! A [`Task`] is a closure tagged with the scheduling group it runs in.
//! Code that needs to run something later (deferred continuations, pollers,
//! cross-shard completions) calls [`schedule`]; the shard installs itself as
//! the thread's [`TaskSink`] when it starts and removes itself on shutdown.
//!
//! Without an installed sink, tasks run inline. That keeps the primitives in
//! this crate usable from plain unit tests.

use std::cell::RefCell;
use std::rc::Rc;

/// Identifier of a scheduling group (task queue).
///
/// Group 0 is the default group every shard creates at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SchedulingGroup(pub u32);

impl SchedulingGroup {
    pub const DEFAULT: SchedulingGroup = SchedulingGroup(0);

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A schedulable closure plus the group it belongs to.
///
/// Consumed exactly once by [`Task::run`].
pub struct Task {
    group: SchedulingGroup,
    func: Box<dyn FnOnce()>,
}

impl Task {
    pub fn new(group: SchedulingGroup, func: impl FnOnce() + 'static) -> Self {
        Self { group, func: Box::new(func) }
    }

    /// Task in the caller's current scheduling group.
    pub fn current(func: impl FnOnce() + 'static) -> Self {
        Self::new(current_group(), func)
    }

    #[inline]
    pub fn group(&self) -> SchedulingGroup {
        self.group
    }

    #[inline]
    pub fn run(self) {
        (self.func)()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("group", &self.group).finish_non_exhaustive()
    }
}

/// Receiver for scheduled tasks; implemented by the shard's reactor.
pub trait TaskSink {
    /// Queue a task on its group's run queue.
    fn schedule(&self, task: Task);

    /// Group of the task currently executing on this thread.
    fn current_group(&self) -> SchedulingGroup;

    /// Whether the running task should yield at its next safe point.
    fn need_preempt(&self) -> bool {
        false
    }
}

thread_local! {
    static SINK: RefCell<Option<Rc<dyn TaskSink>>> = const { RefCell::new(None) };
}

/// Install the task sink for this thread, returning the previous one.
pub fn install_sink(sink: Rc<dyn TaskSink>) -> Option<Rc<dyn TaskSink>> {
    SINK.with(|s| s.borrow_mut().replace(sink))
}

/// Remove this thread's task sink.
pub fn uninstall_sink() -> Option<Rc<dyn TaskSink>> {
    SINK.with(|s| s.borrow_mut().take())
}

#[inline]
fn current_sink() -> Option<Rc<dyn TaskSink>> {
    SINK.with(|s| s.borrow().clone())
}

/// Hand a task to this thread's sink, or run it now if there is none.
pub fn schedule(task: Task) {
    match current_sink() {
        Some(sink) => sink.schedule(task),
        None => task.run(),
    }
}

/// Schedule a closure in the current scheduling group.
pub fn spawn(func: impl FnOnce() + 'static) {
    schedule(Task::current(func))
}

/// Scheduling group of the running task (default when no sink is installed).
pub fn current_group() -> SchedulingGroup {
    current_sink()
        .map(|s| s.current_group())
        .unwrap_or(SchedulingGroup::DEFAULT)
}

/// Whether the shard has asked the running task to yield.
pub fn need_preempt() -> bool {
    current_sink().map(|s| s.need_preempt()).unwrap_or(false)
}

/// Whether a sink is installed on this thread.
pub fn has_sink() -> bool {
    SINK.with(|s| s.borrow().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Collect {
        queued: RefCell<Vec<Task>>,
    }

    impl TaskSink for Collect {
        fn schedule(&self, task: Task) {
            self.queued.borrow_mut().push(task);
        }
        fn current_group(&self) -> SchedulingGroup {
            SchedulingGroup(3)
        }
    }

    #[test]
    fn test_inline_without_sink() {
        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();
        spawn(move || r.set(true));
        assert!(ran.get());
        assert_eq!(current_group(), SchedulingGroup::DEFAULT);
    }

    #[test]
    fn test_sink_receives_tasks() {
        let sink = Rc::new(Collect { queued: RefCell::new(Vec::new()) });
        install_sink(sink.clone());
        let ran = Rc::new(Cell::new(0));
        let r = ran.clone();
        spawn(move || r.set(r.get() + 1));
        assert_eq!(ran.get(), 0);
        let tasks: Vec<Task> = sink.queued.borrow_mut().drain(..).collect();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].group(), SchedulingGroup(3));
        uninstall_sink();
        for t in tasks {
            t.run();
        }
        assert_eq!(ran.get(), 1);
        assert!(!has_sink());
    }
}
