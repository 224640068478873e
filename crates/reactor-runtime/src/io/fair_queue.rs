//! Weighted fair admission queue
//!
//! Requests are grouped by class. Each dispatch picks the class with the
//! lowest accumulated cost and charges it
//!
//! ```text
//!   cost = weight / shares * exp((now - base) / tau)
//! ```
//!
//! The exponential makes recent activity dominate, so a class that was
//! busy long ago is not punished now. When costs would overflow an f32,
//! `base` moves forward and every class's accumulator is scaled down by
//! the same factor, which keeps their order.
//!
//! At most `capacity` requests run at once.

use crate::timer::{Clock, SteadyClock};
use reactor_core::{promise, Deferred, Semaphore};
use std::cell::{Cell, RefCell};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

pub const DEFAULT_TAU: Duration = Duration::from_millis(100);

type Request = Box<dyn FnOnce()>;

struct ClassState {
    shares: u32,
    accumulated: f32,
    queue: VecDeque<(u32, Request)>,
    executing: usize,
}

#[derive(Clone, Copy)]
struct HeapEntry {
    accumulated: f32,
    class: u32,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Reversed: BinaryHeap pops the cheapest class first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .accumulated
            .total_cmp(&self.accumulated)
            .then_with(|| other.class.cmp(&self.class))
    }
}

struct State {
    classes: HashMap<u32, ClassState>,
    /// Classes with queued requests
    heap: BinaryHeap<HeapEntry>,
    base: Duration,
    queued: usize,
    executing: usize,
}

/// Fair queue over a fixed admission window.
pub struct FairQueue {
    sem: Semaphore,
    capacity: usize,
    tau: Duration,
    state: RefCell<State>,
    dispatching: Cell<bool>,
}

impl FairQueue {
    pub fn new(capacity: usize) -> Self {
        Self::with_tau(capacity, DEFAULT_TAU)
    }

    pub fn with_tau(capacity: usize, tau: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            sem: Semaphore::new(capacity),
            capacity,
            tau,
            state: RefCell::new(State {
                classes: HashMap::new(),
                heap: BinaryHeap::new(),
                base: SteadyClock::now(),
                queued: 0,
                executing: 0,
            }),
            dispatching: Cell::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Requests waiting for admission.
    pub fn waiters(&self) -> usize {
        self.state.borrow().queued
    }

    /// Requests admitted and not yet finished.
    pub fn requests_currently_executing(&self) -> usize {
        self.state.borrow().executing
    }

    /// Queue `func` under `class`; it runs once admitted and the slot is
    /// released when its result resolves.
    pub fn queue<T, F>(self: &Rc<Self>, class: u32, shares: u32, weight: u32, func: F) -> Deferred<T>
    where
        T: 'static,
        F: FnOnce() -> Deferred<T> + 'static,
    {
        let (p, out) = promise();
        let fq = self.clone();
        let request: Request = Box::new(move || {
            func().on_complete(move |r| {
                fq.notify_requests_finished(class, 1);
                p.set_result(r);
            });
        });
        {
            let mut st = self.state.borrow_mut();
            let cs = st.classes.entry(class).or_insert_with(|| ClassState {
                shares: shares.max(1),
                accumulated: 0.0,
                queue: VecDeque::new(),
                executing: 0,
            });
            cs.queue.push_back((weight.max(1), request));
            let first = cs.queue.len() == 1;
            let accumulated = cs.accumulated;
            if first {
                st.heap.push(HeapEntry { accumulated, class });
            }
            st.queued += 1;
        }
        self.dispatch_requests();
        out
    }

    fn notify_requests_finished(&self, class: u32, n: usize) {
        {
            let mut st = self.state.borrow_mut();
            st.executing -= n;
            if let Some(cs) = st.classes.get_mut(&class) {
                cs.executing -= n;
            }
        }
        self.sem.signal(n);
        self.dispatch_requests();
    }

    /// Admit requests while the window has room.
    fn dispatch_requests(&self) {
        if self.dispatching.replace(true) {
            return;
        }
        loop {
            if self.state.borrow().queued == 0 || !self.sem.try_wait(1) {
                break;
            }
            let Some(request) = self.pick_next() else {
                self.sem.signal(1);
                break;
            };
            request();
        }
        self.dispatching.set(false);
    }

    /// Pop the cheapest class and charge it for its head request.
    ///
    /// The heap holds one entry per class with queued requests; entries
    /// whose class has since drained are skipped.
    fn pick_next(&self) -> Option<Request> {
        let mut st = self.state.borrow_mut();
        let now = SteadyClock::now();
        let tau = self.tau.as_secs_f32().max(f32::MIN_POSITIVE);
        loop {
            let entry = st.heap.pop()?;
            let Some((weight, shares)) = st
                .classes
                .get(&entry.class)
                .and_then(|cs| cs.queue.front().map(|(w, _)| (*w, cs.shares)))
            else {
                continue;
            };
            let req_cost = weight as f32 / shares as f32;
            let charge = |st: &State| {
                let accumulated = st.classes.get(&entry.class).map_or(0.0, |c| c.accumulated);
                accumulated + (now.saturating_sub(st.base).as_secs_f32() / tau).exp() * req_cost
            };
            let mut next = charge(&*st);
            while next.is_infinite() {
                normalize(&mut *st, self.tau);
                next = charge(&*st);
            }
            let Some(cs) = st.classes.get_mut(&entry.class) else {
                continue;
            };
            let Some((_, request)) = cs.queue.pop_front() else {
                continue;
            };
            cs.accumulated = next;
            cs.executing += 1;
            let more = !cs.queue.is_empty();
            st.queued -= 1;
            st.executing += 1;
            if more {
                st.heap.push(HeapEntry { accumulated: next, class: entry.class });
            }
            return Some(request);
        }
    }
}

/// Move `base` forward and scale every accumulator by the same factor.
///
/// Heap entries are rekeyed in place, never added: the class being
/// dispatched is off the heap while this runs.
fn normalize(st: &mut State, tau: Duration) {
    let factor = f32::MIN_POSITIVE;
    let shift = tau.as_secs_f64() * -(factor as f64).ln();
    st.base += Duration::from_secs_f64(shift);
    for cs in st.classes.values_mut() {
        cs.accumulated *= factor;
    }
    let classes = &st.classes;
    let rekeyed: BinaryHeap<HeapEntry> = std::mem::take(&mut st.heap)
        .into_iter()
        .map(|e| HeapEntry { accumulated: classes.get(&e.class).map_or(0.0, |c| c.accumulated), class: e.class })
        .collect();
    st.heap = rekeyed;
}

impl std::fmt::Debug for FairQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FairQueue")
            .field("capacity", &self.capacity)
            .field("queued", &self.waiters())
            .field("executing", &self.requests_currently_executing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reactor_core::Promise;

    struct Harness {
        fq: Rc<FairQueue>,
        running: Rc<RefCell<VecDeque<Promise<()>>>>,
        order: Rc<RefCell<Vec<u32>>>,
        max_in_flight: Rc<Cell<usize>>,
    }

    impl Harness {
        fn new(fq: FairQueue) -> Self {
            Self {
                fq: Rc::new(fq),
                running: Rc::new(RefCell::new(VecDeque::new())),
                order: Rc::new(RefCell::new(Vec::new())),
                max_in_flight: Rc::new(Cell::new(0)),
            }
        }

        fn submit(&self, class: u32, shares: u32) -> Deferred<()> {
            let (running, order, max) = (self.running.clone(), self.order.clone(), self.max_in_flight.clone());
            self.fq.queue(class, shares, 1, move || {
                order.borrow_mut().push(class);
                let (p, d) = promise();
                running.borrow_mut().push_back(p);
                max.set(max.get().max(running.borrow().len()));
                d
            })
        }

        fn complete_one(&self) -> bool {
            let p = self.running.borrow_mut().pop_front();
            match p {
                Some(p) => {
                    p.set_value(());
                    true
                }
                None => false,
            }
        }
    }

    #[test]
    fn test_capacity_and_alternation() {
        let h = Harness::new(FairQueue::new(32));
        let mut results = Vec::new();
        for i in 0..1000u32 {
            results.push(h.submit(1 + i % 2, 1));
        }
        assert_eq!(h.fq.requests_currently_executing(), 32);
        assert_eq!(h.fq.waiters(), 968);
        while h.complete_one() {}
        assert_eq!(h.max_in_flight.get(), 32);
        let order = h.order.borrow();
        assert_eq!(order.len(), 1000);
        let mut diff: i64 = 0;
        for &c in order.iter() {
            diff += if c == 1 { 1 } else { -1 };
            assert!(diff.abs() <= 2, "classes drifted apart: {}", diff);
        }
        for mut r in results {
            assert_eq!(r.try_take(), Some(Ok(())));
        }
    }

    #[test]
    fn test_shares_bias_dispatch() {
        let h = Harness::new(FairQueue::new(1));
        let mut results = Vec::new();
        for _ in 0..300 {
            results.push(h.submit(1, 1));
            results.push(h.submit(2, 2));
        }
        // First request was admitted right away; measure the contended part.
        for _ in 0..300 {
            h.complete_one();
        }
        let order = h.order.borrow();
        let heavy = order[1..300].iter().filter(|&&c| c == 2).count();
        assert!((190..=210).contains(&heavy), "class with twice the shares got {}", heavy);
        drop(order);
        while h.complete_one() {}
        results.into_iter().for_each(|r| r.discard());
    }

    #[test]
    fn test_normalization_keeps_dispatching() {
        let h = Harness::new(FairQueue::with_tau(1, Duration::from_micros(1)));
        let a = h.submit(1, 1);
        std::thread::sleep(Duration::from_millis(2));
        let b = h.submit(1, 1);
        let c = h.submit(2, 1);
        while h.complete_one() {}
        assert_eq!(h.order.borrow().len(), 3);
        let st = h.fq.state.borrow();
        assert!(st.classes.values().all(|c| c.accumulated.is_finite()));
        drop(st);
        for r in [a, b, c] {
            r.discard();
        }
    }

    fn non_empty_classes(fq: &FairQueue) -> usize {
        fq.state.borrow().classes.values().filter(|c| !c.queue.is_empty()).count()
    }

    #[test]
    fn test_competing_classes_survive_normalization() {
        let h = Harness::new(FairQueue::with_tau(1, Duration::from_millis(1)));
        let mut results: Vec<_> = (0..50).map(|_| h.submit(2, 1)).collect();
        results.extend((0..3).map(|_| h.submit(1, 1)));
        std::thread::sleep(Duration::from_millis(100));
        // Charging the next request overflows and forces a rescale.
        h.complete_one();
        assert_eq!(h.fq.state.borrow().heap.len(), non_empty_classes(&h.fq));

        results.push(h.submit(1, 1));
        results.extend((0..5).map(|_| h.submit(2, 1)));
        assert_eq!(h.fq.state.borrow().heap.len(), non_empty_classes(&h.fq));
        while h.complete_one() {}

        assert_eq!(h.fq.waiters(), 0);
        assert_eq!(h.fq.requests_currently_executing(), 0);
        assert_eq!(h.order.borrow().len(), 59);
        for mut r in results {
            assert_eq!(r.try_take(), Some(Ok(())));
        }
    }

    #[test]
    fn test_stale_heap_entry_is_skipped() {
        let h = Harness::new(FairQueue::new(1));
        let a = h.submit(1, 1);
        let b = h.submit(2, 1);
        // An entry for a class with nothing queued must not stop dispatch.
        h.fq.state.borrow_mut().heap.push(HeapEntry { accumulated: -1.0, class: 1 });
        while h.complete_one() {}
        assert_eq!(h.fq.waiters(), 0);
        assert_eq!(*h.order.borrow(), vec![1, 2]);
        a.discard();
        b.discard();
    }
}
