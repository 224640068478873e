//! Shard-local counting semaphore
//!
//! Waiters are served strictly in FIFO order: a large request at the head
//! blocks smaller ones behind it, so nobody starves.

use crate::deferred::{promise, Deferred, Promise};
use crate::error::ReactorError;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

struct Waiter {
    units: usize,
    promise: Promise<()>,
}

/// Counting semaphore whose waits resolve as deferred results.
///
/// Not `Sync`; shared between users of one shard through `Rc`.
pub struct Semaphore {
    count: Cell<usize>,
    waiters: RefCell<VecDeque<Waiter>>,
    broken: RefCell<Option<ReactorError>>,
}

impl Semaphore {
    pub fn new(count: usize) -> Self {
        Self {
            count: Cell::new(count),
            waiters: RefCell::new(VecDeque::new()),
            broken: RefCell::new(None),
        }
    }

    /// Units currently available.
    #[inline]
    pub fn current(&self) -> usize {
        self.count.get()
    }

    /// Number of queued waiters.
    #[inline]
    pub fn waiters(&self) -> usize {
        self.waiters.borrow().len()
    }

    /// Take `units` now if possible without jumping the queue.
    pub fn try_wait(&self, units: usize) -> bool {
        if self.broken.borrow().is_none()
            && self.waiters.borrow().is_empty()
            && self.count.get() >= units
        {
            self.count.set(self.count.get() - units);
            true
        } else {
            false
        }
    }

    /// Acquire `units`, resolving once they are available.
    pub fn wait(&self, units: usize) -> Deferred<()> {
        if let Some(e) = self.broken.borrow().clone() {
            return Deferred::failed(e);
        }
        if self.try_wait(units) {
            return Deferred::ready(());
        }
        let (p, d) = promise();
        self.waiters.borrow_mut().push_back(Waiter { units, promise: p });
        d
    }

    /// Return `units` and wake as many head waiters as now fit.
    pub fn signal(&self, units: usize) {
        if self.broken.borrow().is_some() {
            return;
        }
        self.count.set(self.count.get() + units);
        loop {
            let next = {
                let mut waiters = self.waiters.borrow_mut();
                let units = waiters.front().map(|w| w.units);
                match units {
                    Some(units) if units <= self.count.get() => {
                        self.count.set(self.count.get() - units);
                        waiters.pop_front()
                    }
                    _ => None,
                }
            };
            match next {
                Some(w) => w.promise.set_value(()),
                None => break,
            }
        }
    }

    /// Fail every current and future waiter with `err`.
    pub fn broken(&self, err: ReactorError) {
        *self.broken.borrow_mut() = Some(err.clone());
        let waiters: Vec<Waiter> = self.waiters.borrow_mut().drain(..).collect();
        for w in waiters {
            w.promise.set_error(err.clone());
        }
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("count", &self.count.get())
            .field("waiters", &self.waiters())
            .finish()
    }
}
