//! BinaryHeap-based timer set
//!
//! One set per clock domain per shard. Single-threaded: only the owning
//! reactor touches it.
//!
//! # Complexity
//!
//! - Insert: O(log n)
//! - Cancel: O(1) (lazy)
//! - Expire: O(k log n) for k expired entries
//!
//! # Cancellation Strategy
//!
//! The heap only orders `(deadline, handle)` pairs; the live map owns the
//! timers. Cancelling removes the map entry and leaves the heap entry to be
//! skipped when it reaches the top.

use super::entry::TimerHandle;
use super::TimerState;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::rc::Rc;
use std::time::Duration;

/// Min-heap entry (earliest deadline first, ties by handle)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeapEntry {
    deadline: Duration,
    handle: TimerHandle,
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        match other.deadline.cmp(&self.deadline) {
            Ordering::Equal => other.handle.cmp(&self.handle),
            ord => ord,
        }
    }
}

/// Statistics snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct TimerSetStats {
    pub active: usize,
    pub stale_entries: usize,
    pub total_inserted: u64,
    pub total_fired: u64,
    pub total_cancelled: u64,
}

/// Ordered set of armed timers for one clock domain.
pub struct TimerSet {
    heap: BinaryHeap<HeapEntry>,
    live: HashMap<TimerHandle, Rc<TimerState>>,
    total_inserted: u64,
    total_fired: u64,
    total_cancelled: u64,
}

impl TimerSet {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::with_capacity(64),
            live: HashMap::with_capacity(64),
            total_inserted: 0,
            total_fired: 0,
            total_cancelled: 0,
        }
    }

    /// Add an armed timer under a fresh handle.
    ///
    /// Returns true if it became the earliest deadline.
    pub(crate) fn insert(&mut self, timer: &Rc<TimerState>) -> bool {
        let handle = TimerHandle::new();
        let deadline = timer.deadline.get();
        timer.handle.set(handle);
        self.heap.push(HeapEntry { deadline, handle });
        self.live.insert(handle, timer.clone());
        self.total_inserted += 1;
        self.heap.peek().map(|e| e.handle) == Some(handle)
    }

    /// Forget a timer. Returns false if it was not in the set.
    pub(crate) fn remove(&mut self, timer: &TimerState) -> bool {
        let removed = self.live.remove(&timer.handle.get()).is_some();
        if removed {
            self.total_cancelled += 1;
            if self.live.is_empty() {
                self.heap.clear();
            }
        }
        removed
    }

    /// Pop every timer due at or before `now`, in deadline order.
    pub(crate) fn expire(&mut self, now: Duration) -> Vec<(TimerHandle, Rc<TimerState>)> {
        let mut expired = Vec::new();
        while let Some(top) = self.heap.peek().copied() {
            if top.deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(timer) = self.live.remove(&top.handle) {
                self.total_fired += 1;
                expired.push((top.handle, timer));
            }
        }
        if self.live.is_empty() {
            self.heap.clear();
        }
        expired
    }

    /// Earliest live deadline; drops stale heads on the way.
    pub fn next_deadline(&mut self) -> Option<Duration> {
        while let Some(top) = self.heap.peek() {
            if self.live.contains_key(&top.handle) {
                return Some(top.deadline);
            }
            self.heap.pop();
        }
        None
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn stats(&self) -> TimerSetStats {
        TimerSetStats {
            active: self.live.len(),
            stale_entries: self.heap.len().saturating_sub(self.live.len()),
            total_inserted: self.total_inserted,
            total_fired: self.total_fired,
            total_cancelled: self.total_cancelled,
        }
    }
}

impl Default for TimerSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::clock::ClockKind;

    fn state_at(ms: u64) -> Rc<TimerState> {
        let s = Rc::new(TimerState::new(ClockKind::Manual, Box::new(|| {})));
        s.deadline.set(Duration::from_millis(ms));
        s.armed.set(true);
        s
    }

    #[test]
    fn test_expire_in_deadline_order() {
        let mut set = TimerSet::new();
        let (a, b, c) = (state_at(30), state_at(10), state_at(20));
        set.insert(&a);
        assert!(set.insert(&b));
        assert!(!set.insert(&c));
        let fired: Vec<_> = set
            .expire(Duration::from_millis(25))
            .into_iter()
            .map(|(_, t)| t.deadline.get().as_millis())
            .collect();
        assert_eq!(fired, vec![10, 20]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.next_deadline(), Some(Duration::from_millis(30)));
    }

    #[test]
    fn test_cancel_is_lazy() {
        let mut set = TimerSet::new();
        let (a, b) = (state_at(10), state_at(20));
        set.insert(&a);
        set.insert(&b);
        assert!(set.remove(&a));
        assert!(!set.remove(&a));
        assert_eq!(set.stats().stale_entries, 1);
        assert_eq!(set.next_deadline(), Some(Duration::from_millis(20)));
        assert_eq!(set.expire(Duration::from_millis(100)).len(), 1);
        assert!(set.is_empty());
        assert_eq!(set.stats().total_cancelled, 1);
    }

    #[test]
    fn test_reinsert_leaves_old_entry_stale() {
        let mut set = TimerSet::new();
        let a = state_at(10);
        set.insert(&a);
        set.remove(&a);
        a.deadline.set(Duration::from_millis(50));
        set.insert(&a);
        assert!(set.expire(Duration::from_millis(20)).is_empty());
        assert_eq!(set.expire(Duration::from_millis(50)).len(), 1);
    }
}
