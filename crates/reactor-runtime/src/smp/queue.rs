//! Message queue for one ordered pair of shards
//!
//! ```text
//!   shard A                                   shard B
//!   pending[B] ──batch──▶ requests ring ──▶ run work item
//!                                               │ result resolves
//!   resolve promise ◀── completions ring ◀──batch── completed[A]
//! ```
//!
//! Both rings are single-producer single-consumer; the fifos on either
//! side are shard-local and batch traffic into the rings.

use crate::completion::AnyResult;
use crossbeam_queue::ArrayQueue;
use reactor_core::Deferred;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) type RemoteFn = Box<dyn FnOnce() -> Deferred<Box<dyn Any + Send>> + Send>;

/// Closure sent to another shard, tagged with the origin's request id.
pub(crate) struct WorkItem {
    pub id: u64,
    pub func: RemoteFn,
}

/// Result travelling back to the origin.
pub(crate) struct Completion {
    pub id: u64,
    pub result: AnyResult,
}

/// Traffic counters of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub sent: u64,
    pub received: u64,
    pub completed: u64,
    pub last_batch: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    completed: AtomicU64,
    last_batch: AtomicU64,
}

pub(crate) struct MessageQueue {
    pub requests: ArrayQueue<WorkItem>,
    pub completions: ArrayQueue<Completion>,
    counters: Counters,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            requests: ArrayQueue::new(capacity.max(1)),
            completions: ArrayQueue::new(capacity.max(1)),
            counters: Counters::default(),
        }
    }

    pub fn record_sent(&self, batch: u64) {
        self.counters.sent.fetch_add(batch, Ordering::Relaxed);
        self.counters.last_batch.store(batch, Ordering::Relaxed);
    }

    pub fn record_received(&self, n: u64) {
        self.counters.received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_completed(&self, n: u64) {
        self.counters.completed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            last_batch: self.counters.last_batch.load(Ordering::Relaxed),
        }
    }
}
