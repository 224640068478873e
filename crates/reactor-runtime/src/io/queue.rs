//! Per-coordinator disk I/O queue
//!
//! Shards are split into contiguous groups, one io queue per group; the
//! first shard of a group is its coordinator. Requests from the other
//! shards of the group travel to the coordinator through smp and enter
//! the same fair queue, so the group shares one admission window.

use super::backend::{IoBackend, IoCompletion, IoRequest};
use super::fair_queue::FairQueue;
use super::priority::PriorityClass;
use crate::timer::{Clock, SteadyClock};
use reactor_core::Deferred;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

const WEIGHT_UNIT: usize = 16 * 1024;
const QUEUE_TIME_ALPHA: f64 = 0.1;

/// Accounting for one priority class on one io queue.
#[derive(Debug, Clone, Default)]
pub struct PriorityClassStats {
    pub name: &'static str,
    pub shares: u32,
    pub bytes: u64,
    pub ops: u64,
    /// Requests waiting for admission
    pub queued: u64,
    /// Decaying average of the time spent waiting for admission
    pub queue_time: Duration,
    samples: u64,
}

impl PriorityClassStats {
    fn record_queue_time(&mut self, t: Duration) {
        if self.samples == 0 {
            self.queue_time = t;
        } else {
            let prev = self.queue_time.as_secs_f64();
            let next = prev + QUEUE_TIME_ALPHA * (t.as_secs_f64() - prev);
            self.queue_time = Duration::from_secs_f64(next.max(0.0));
        }
        self.samples += 1;
    }
}

/// Admission weight of a request of `len` bytes.
#[inline]
pub fn request_weight(len: usize) -> u32 {
    (1 + len / WEIGHT_UNIT) as u32
}

/// Coordinator serving `shard` with `queues` io queues over `smp` shards.
pub fn coordinator_of(shard: u32, smp: u32, queues: u32) -> u32 {
    let queues = queues.clamp(1, smp.max(1));
    let group = smp.div_ceil(queues).max(1);
    shard / group * group
}

pub struct IoQueue {
    coordinator: u32,
    fq: Rc<FairQueue>,
    backend: Rc<dyn IoBackend>,
    stats: Rc<RefCell<BTreeMap<u32, PriorityClassStats>>>,
}

impl IoQueue {
    pub fn new(coordinator: u32, capacity: usize, backend: Rc<dyn IoBackend>) -> Self {
        Self {
            coordinator,
            fq: Rc::new(FairQueue::new(capacity)),
            backend,
            stats: Rc::new(RefCell::new(BTreeMap::new())),
        }
    }

    pub fn coordinator(&self) -> u32 {
        self.coordinator
    }

    pub fn capacity(&self) -> usize {
        self.fq.capacity()
    }

    /// Requests admitted and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.fq.requests_currently_executing()
    }

    pub fn queued(&self) -> usize {
        self.fq.waiters()
    }

    /// Queue `req` under `pc` and submit it once admitted.
    pub fn queue_request(&self, pc: PriorityClass, req: IoRequest) -> Deferred<IoCompletion> {
        let len = req.len();
        {
            let mut stats = self.stats.borrow_mut();
            let s = stats.entry(pc.id()).or_insert_with(|| PriorityClassStats {
                name: pc.name(),
                shares: pc.shares(),
                ..Default::default()
            });
            s.bytes += len as u64;
            s.ops += 1;
            s.queued += 1;
        }
        let queued_at = SteadyClock::now();
        let stats = self.stats.clone();
        let backend = self.backend.clone();
        self.fq.queue(pc.id(), pc.shares(), request_weight(len), move || {
            if let Some(s) = stats.borrow_mut().get_mut(&pc.id()) {
                s.queued -= 1;
                s.record_queue_time(SteadyClock::now().saturating_sub(queued_at));
            }
            backend.submit(req)
        })
    }

    pub fn stats(&self) -> Vec<PriorityClassStats> {
        self.stats.borrow().values().cloned().collect()
    }
}

impl std::fmt::Debug for IoQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoQueue")
            .field("coordinator", &self.coordinator)
            .field("backend", &self.backend.name())
            .field("fair_queue", &self.fq)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weights() {
        assert_eq!(request_weight(0), 1);
        assert_eq!(request_weight(4096), 1);
        assert_eq!(request_weight(16 * 1024), 2);
        assert_eq!(request_weight(128 * 1024), 9);
    }

    #[test]
    fn test_coordinator_groups() {
        let map: Vec<u32> = (0..8).map(|s| coordinator_of(s, 8, 3)).collect();
        assert_eq!(map, vec![0, 0, 0, 3, 3, 3, 6, 6]);
        assert_eq!((0..4).map(|s| coordinator_of(s, 4, 4)).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!((0..4).map(|s| coordinator_of(s, 4, 1)).collect::<Vec<_>>(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_queue_time_ewma() {
        let mut s = PriorityClassStats::default();
        s.record_queue_time(Duration::from_millis(10));
        assert_eq!(s.queue_time, Duration::from_millis(10));
        s.record_queue_time(Duration::from_millis(20));
        let ms = s.queue_time.as_secs_f64() * 1000.0;
        assert!((ms - 11.0).abs() < 1e-6);
    }
}
