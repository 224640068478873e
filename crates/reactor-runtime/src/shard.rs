//! Thread-local shard context
//!
//! Every reactor thread installs its [`Reactor`] here. Code running on a
//! shard reaches the local engine through [`local()`] without threading a
//! handle through every call.

use crate::reactor::Reactor;
use crate::sched::PreemptFlag;
use crate::notifier::EventFdNotifier;
use reactor_core::error::invariant_violation;
use reactor_core::task::{self, TaskSink};
use reactor_core::Result;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;

thread_local! {
    /// Shard ID of this OS thread
    static SHARD_ID: Cell<u32> = const { Cell::new(u32::MAX) };

    /// Reactor running on this OS thread
    static REACTOR: RefCell<Option<Rc<Reactor>>> = const { RefCell::new(None) };
}

/// Install `reactor` as this thread's shard.
pub(crate) fn install(reactor: Rc<Reactor>) {
    let id = reactor.id();
    SHARD_ID.with(|c| c.set(id));
    reactor_core::kprint::set_shard_tag(Some(id));
    task::install_sink(reactor.clone() as Rc<dyn TaskSink>);
    REACTOR.with(|r| *r.borrow_mut() = Some(reactor));
}

/// Remove this thread's shard; breaks the thread-local reference.
pub(crate) fn clear() {
    task::uninstall_sink();
    REACTOR.with(|r| r.borrow_mut().take());
    SHARD_ID.with(|c| c.set(u32::MAX));
    reactor_core::kprint::set_shard_tag(None);
}

/// The reactor of the calling shard.
///
/// Calling this off a shard thread is a bug.
#[inline]
pub fn local() -> Rc<Reactor> {
    match try_local() {
        Some(r) => r,
        None => invariant_violation("no reactor on this thread"),
    }
}

#[inline]
pub fn try_local() -> Option<Rc<Reactor>> {
    REACTOR.with(|r| r.borrow().clone())
}

/// ID of the calling shard, or 0 off a shard.
#[inline]
pub fn shard_id() -> u32 {
    try_shard_id().unwrap_or(0)
}

#[inline]
pub fn try_shard_id() -> Option<u32> {
    let id = SHARD_ID.with(|c| c.get());
    if id == u32::MAX {
        None
    } else {
        Some(id)
    }
}

/// Number of shards in the running system, or 1 off a shard.
pub fn count() -> u32 {
    try_local().map(|r| r.smp_count()).unwrap_or(1)
}

/// Per-shard state shared with other threads.
///
/// Other shards, the syscall worker and the watchdog only ever touch a
/// shard through this.
pub struct ShardShared {
    pub id: u32,
    pub notifier: EventFdNotifier,
    /// Set while the shard is about to block or blocked in epoll
    pub sleeping: AtomicBool,
    /// Set once the shard's loop has exited
    pub stopped: AtomicBool,
    pub tasks_processed: AtomicU64,
    pub polls: AtomicU64,
    pub preempt: PreemptFlag,
    /// Scheduling group whose tasks are running
    pub running_group: AtomicU32,
    group_names: RwLock<Vec<String>>,
}

impl ShardShared {
    pub fn new(id: u32) -> Result<Self> {
        Ok(Self {
            id,
            notifier: EventFdNotifier::create()?,
            sleeping: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            tasks_processed: AtomicU64::new(0),
            polls: AtomicU64::new(0),
            preempt: PreemptFlag::new(),
            running_group: AtomicU32::new(0),
            group_names: RwLock::new(vec!["main".to_string()]),
        })
    }

    /// Wake the shard if it sleeps. Call after publishing work for it.
    ///
    /// The waker clears `sleeping`, so racing wakers cost at most one
    /// spurious eventfd write.
    pub fn maybe_wakeup(&self) {
        std::sync::atomic::fence(Ordering::SeqCst);
        if self.sleeping.load(Ordering::Relaxed) {
            self.sleeping.store(false, Ordering::Relaxed);
            if let Err(e) = self.notifier.notify() {
                reactor_core::kerror!("failed to wake shard {}: {}", self.id, e);
            }
        }
    }

    pub(crate) fn set_group_name(&self, group: u32, name: &str) {
        if let Ok(mut names) = self.group_names.write() {
            let idx = group as usize;
            if names.len() <= idx {
                names.resize(idx + 1, String::new());
            }
            names[idx] = name.to_string();
        }
    }

    pub fn group_name(&self, group: u32) -> String {
        self.group_names
            .read()
            .ok()
            .and_then(|n| n.get(group as usize).cloned())
            .unwrap_or_else(|| group.to_string())
    }
}
