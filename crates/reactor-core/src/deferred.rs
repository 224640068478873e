//! Deferred results and their continuations
//!
//! A [`Promise`] / [`Deferred`] pair is a single-assignment slot with one
//! producer and one consumer:
//!
//! ```text
//!   producer                       consumer
//!   Promise<T> ──set_value──▶ [ slot ] ◀──then/on_complete── Deferred<T>
//!                                 │
//!                 continuation attached first?
//!                   yes: resolution schedules it as a Task
//!                   no : value parks in the slot; attaching later runs
//!                        the continuation synchronously
//! ```
//!
//! Both halves are move-only and their consuming operations take `self`,
//! so a value cannot be resolved or consumed twice.
//!
//! A failed result must reach someone. Dropping one unconsumed is logged at
//! error level; use [`Deferred::discard`] to drop deliberately.

use crate::error::{invariant_violation, ReactorError, Result};
use crate::task::{self, Task};
use std::cell::RefCell;
use std::rc::Rc;

type Continuation<T> = Box<dyn FnOnce(Result<T>)>;

enum Slot<T> {
    /// Unresolved, nobody waiting yet
    Empty,
    /// Resolved, not yet consumed
    Ready(Result<T>),
    /// Unresolved, continuation attached
    Waiting(Continuation<T>),
    /// Value handed to its consumer
    Done,
}

struct Shared<T> {
    slot: Slot<T>,
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        if let Slot::Ready(Err(e)) = &self.slot {
            crate::kerror!("failed deferred result dropped unconsumed: {}", e);
        }
    }
}

type SharedRef<T> = Rc<RefCell<Shared<T>>>;

/// Create a connected producer/consumer pair.
pub fn promise<T: 'static>() -> (Promise<T>, Deferred<T>) {
    let shared = Rc::new(RefCell::new(Shared { slot: Slot::Empty }));
    (
        Promise { shared: Some(shared.clone()) },
        Deferred { state: State::Linked(shared) },
    )
}

// ============================================================================
// Promise
// ============================================================================

/// Producer half of a deferred result.
///
/// Dropping it unresolved fails the consumer with
/// [`ReactorError::BrokenPromise`].
pub struct Promise<T: 'static> {
    shared: Option<SharedRef<T>>,
}

impl<T: 'static> Promise<T> {
    /// Same as [`promise()`].
    pub fn new() -> (Promise<T>, Deferred<T>) {
        promise()
    }

    pub fn set_value(mut self, value: T) {
        self.complete(Ok(value));
    }

    pub fn set_error(mut self, err: ReactorError) {
        self.complete(Err(err));
    }

    pub fn set_result(mut self, r: Result<T>) {
        self.complete(r);
    }

    fn complete(&mut self, r: Result<T>) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        let cont = {
            let mut s = shared.borrow_mut();
            match std::mem::replace(&mut s.slot, Slot::Done) {
                Slot::Empty => {
                    // With the consumer gone a value is dropped; an error is
                    // kept so its drop gets logged.
                    if Rc::strong_count(&shared) > 1 || r.is_err() {
                        s.slot = Slot::Ready(r);
                    }
                    return;
                }
                Slot::Waiting(cont) => cont,
                Slot::Ready(_) | Slot::Done => invariant_violation("promise resolved twice"),
            }
        };
        task::schedule(Task::current(move || cont(r)));
    }
}

impl<T: 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        let Some(shared) = &self.shared else {
            return;
        };
        let orphaned = Rc::strong_count(shared) == 1
            && matches!(shared.try_borrow().map(|s| matches!(s.slot, Slot::Empty)), Ok(true));
        if orphaned {
            self.shared = None;
            return;
        }
        self.complete(Err(ReactorError::BrokenPromise));
    }
}

// ============================================================================
// Deferred
// ============================================================================

enum State<T> {
    Ready(Result<T>),
    Linked(SharedRef<T>),
    Taken,
}

/// Consumer half of a deferred result.
#[must_use = "a deferred result carries errors that must be consumed"]
pub struct Deferred<T: 'static> {
    state: State<T>,
}

/// Loop control for [`repeat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iteration {
    Continue,
    Stop,
}

impl<T: 'static> Deferred<T> {
    /// Already-resolved value; no allocation.
    pub fn ready(value: T) -> Self {
        Deferred { state: State::Ready(Ok(value)) }
    }

    pub fn failed(err: ReactorError) -> Self {
        Deferred { state: State::Ready(Err(err)) }
    }

    pub fn from_result(r: Result<T>) -> Self {
        Deferred { state: State::Ready(r) }
    }

    #[inline]
    fn take_state(&mut self) -> State<T> {
        std::mem::replace(&mut self.state, State::Taken)
    }

    /// Whether the value is available.
    pub fn is_ready(&self) -> bool {
        match &self.state {
            State::Ready(_) => true,
            State::Linked(shared) => matches!(shared.borrow().slot, Slot::Ready(_)),
            State::Taken => false,
        }
    }

    /// Whether the value is available and is an error.
    pub fn is_failed(&self) -> bool {
        match &self.state {
            State::Ready(r) => r.is_err(),
            State::Linked(shared) => matches!(shared.borrow().slot, Slot::Ready(Err(_))),
            State::Taken => false,
        }
    }

    /// Take the result if it is ready; leaves the deferred consumed.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match self.take_state() {
            State::Ready(r) => Some(r),
            State::Linked(shared) => {
                let taken = {
                    let mut s = shared.borrow_mut();
                    match std::mem::replace(&mut s.slot, Slot::Done) {
                        Slot::Ready(r) => Some(r),
                        other => {
                            s.slot = other;
                            None
                        }
                    }
                };
                if taken.is_none() {
                    self.state = State::Linked(shared);
                }
                taken
            }
            State::Taken => None,
        }
    }

    /// Run `f` with the result: now if ready, otherwise as a task once the
    /// producer resolves.
    pub fn on_complete(mut self, f: impl FnOnce(Result<T>) + 'static) {
        match self.take_state() {
            State::Ready(r) => f(r),
            State::Linked(shared) => {
                let ready = {
                    let mut s = shared.borrow_mut();
                    match std::mem::replace(&mut s.slot, Slot::Done) {
                        Slot::Empty => {
                            s.slot = Slot::Waiting(Box::new(f));
                            return;
                        }
                        Slot::Ready(r) => r,
                        Slot::Waiting(_) | Slot::Done => {
                            invariant_violation("deferred result consumed twice")
                        }
                    }
                };
                f(ready)
            }
            State::Taken => invariant_violation("deferred result consumed twice"),
        }
    }

    /// Chain an asynchronous step on success; errors skip `f`.
    pub fn then<U: 'static, F>(mut self, f: F) -> Deferred<U>
    where
        F: FnOnce(T) -> Deferred<U> + 'static,
    {
        if let Some(r) = self.try_take() {
            return match r {
                Ok(v) => f(v),
                Err(e) => Deferred::failed(e),
            };
        }
        let (p, d) = promise();
        self.on_complete(move |r| match r {
            Ok(v) => f(v).forward_to(p),
            Err(e) => p.set_error(e),
        });
        d
    }

    /// Chain a step that sees both success and failure.
    pub fn then_result<U: 'static, F>(mut self, f: F) -> Deferred<U>
    where
        F: FnOnce(Result<T>) -> Deferred<U> + 'static,
    {
        if let Some(r) = self.try_take() {
            return f(r);
        }
        let (p, d) = promise();
        self.on_complete(move |r| f(r).forward_to(p));
        d
    }

    /// Transform the value synchronously.
    pub fn map<U: 'static, F>(self, f: F) -> Deferred<U>
    where
        F: FnOnce(T) -> U + 'static,
    {
        self.then(move |v| Deferred::ready(f(v)))
    }

    pub fn map_err<F>(self, f: F) -> Deferred<T>
    where
        F: FnOnce(ReactorError) -> ReactorError + 'static,
    {
        self.then_result(move |r| Deferred::from_result(r.map_err(f)))
    }

    /// Run `f` after completion either way, passing the result through.
    pub fn finally<F>(self, f: F) -> Deferred<T>
    where
        F: FnOnce() + 'static,
    {
        self.then_result(move |r| {
            f();
            Deferred::from_result(r)
        })
    }

    /// Resolve `p` with this result when it arrives.
    pub fn forward_to(mut self, p: Promise<T>) {
        match self.try_take() {
            Some(r) => p.set_result(r),
            None => self.on_complete(move |r| p.set_result(r)),
        }
    }

    /// Drop the value; a failure is logged rather than lost silently.
    pub fn discard(self) {
        self.on_complete(|r| {
            if let Err(e) = r {
                crate::kwarn!("discarded failed deferred result: {}", e);
            }
        });
    }

    /// Replace the value with `()`.
    pub fn ignore_value(self) -> Deferred<()> {
        self.map(|_| ())
    }
}

impl<T: 'static> Drop for Deferred<T> {
    fn drop(&mut self) {
        if let State::Ready(Err(e)) = &self.state {
            crate::kerror!("failed deferred result dropped unconsumed: {}", e);
        }
    }
}

impl<T: 'static> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            State::Ready(Ok(_)) => "ready",
            State::Ready(Err(_)) => "failed",
            State::Linked(_) if self.is_ready() => "resolved",
            State::Linked(_) => "pending",
            State::Taken => "consumed",
        };
        f.debug_struct("Deferred").field("state", &state).finish()
    }
}

impl<T: 'static> From<Result<T>> for Deferred<T> {
    fn from(r: Result<T>) -> Self {
        Deferred::from_result(r)
    }
}

// ============================================================================
// Combinators
// ============================================================================

/// Wait for every deferred; values come back in input order.
///
/// All inputs are consumed even when one fails; the first error wins.
pub fn when_all<T: 'static>(items: Vec<Deferred<T>>) -> Deferred<Vec<T>> {
    struct Join<T: 'static> {
        values: Vec<Option<T>>,
        remaining: usize,
        error: Option<ReactorError>,
        done: Option<Promise<Vec<T>>>,
    }

    if items.is_empty() {
        return Deferred::ready(Vec::new());
    }
    let (p, d) = promise();
    let n = items.len();
    let join = Rc::new(RefCell::new(Join {
        values: (0..n).map(|_| None).collect(),
        remaining: n,
        error: None,
        done: Some(p),
    }));
    for (i, item) in items.into_iter().enumerate() {
        let join = join.clone();
        item.on_complete(move |r| {
            let finished = {
                let mut j = join.borrow_mut();
                match r {
                    Ok(v) => j.values[i] = Some(v),
                    Err(e) => {
                        if j.error.is_none() {
                            j.error = Some(e);
                        }
                    }
                }
                j.remaining -= 1;
                if j.remaining == 0 {
                    let p = j.done.take();
                    let outcome = match j.error.take() {
                        Some(e) => Err(e),
                        None => Ok(j.values.drain(..).flatten().collect()),
                    };
                    p.map(|p| (p, outcome))
                } else {
                    None
                }
            };
            if let Some((p, outcome)) = finished {
                p.set_result(outcome);
            }
        });
    }
    d
}

/// Wait for two deferreds of different types.
pub fn join<A: 'static, B: 'static>(a: Deferred<A>, b: Deferred<B>) -> Deferred<(A, B)> {
    a.then_result(move |ra| {
        b.then_result(move |rb| {
            Deferred::from_result(match (ra, rb) {
                (Ok(a), Ok(b)) => Ok((a, b)),
                (Err(e), _) | (_, Err(e)) => Err(e),
            })
        })
    })
}

/// Run `action` until it yields [`Iteration::Stop`] or fails.
///
/// Ready iterations loop in place; when the shard requests preemption the
/// loop resumes from a fresh task instead.
pub fn repeat<F>(mut action: F) -> Deferred<()>
where
    F: FnMut() -> Deferred<Iteration> + 'static,
{
    while !task::need_preempt() {
        let mut step = action();
        match step.try_take() {
            Some(Ok(Iteration::Continue)) => continue,
            Some(Ok(Iteration::Stop)) => return Deferred::ready(()),
            Some(Err(e)) => return Deferred::failed(e),
            None => {
                let (p, d) = promise();
                step.on_complete(move |r| match r {
                    Ok(Iteration::Continue) => repeat(action).forward_to(p),
                    Ok(Iteration::Stop) => p.set_value(()),
                    Err(e) => p.set_error(e),
                });
                return d;
            }
        }
    }
    let (p, d) = promise();
    task::spawn(move || repeat(action).forward_to(p));
    d
}

/// Run `action` until `stop` returns true (checked before each round).
pub fn do_until<C, F>(mut stop: C, mut action: F) -> Deferred<()>
where
    C: FnMut() -> bool + 'static,
    F: FnMut() -> Deferred<()> + 'static,
{
    repeat(move || {
        if stop() {
            return Deferred::ready(Iteration::Stop);
        }
        action().map(|_| Iteration::Continue)
    })
}

/// Run `f` on each item in sequence, waiting for each step.
pub fn do_for_each<I, F>(items: I, mut f: F) -> Deferred<()>
where
    I: IntoIterator,
    I::IntoIter: 'static,
    I::Item: 'static,
    F: FnMut(I::Item) -> Deferred<()> + 'static,
{
    let mut iter = items.into_iter();
    repeat(move || match iter.next() {
        Some(item) => f(item).map(|_| Iteration::Continue),
        None => Deferred::ready(Iteration::Stop),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_ready_then_runs_synchronously() {
        let seen = Rc::new(Cell::new(0));
        let s = seen.clone();
        Deferred::ready(20)
            .map(|v| v + 1)
            .map(move |v| s.set(v))
            .discard();
        assert_eq!(seen.get(), 21);
    }

    #[test]
    fn test_continuation_waits_for_resolution() {
        let (p, d) = promise::<u32>();
        let seen = Rc::new(Cell::new(0));
        let s = seen.clone();
        d.map(move |v| s.set(v)).discard();
        assert_eq!(seen.get(), 0);
        p.set_value(7);
        assert_eq!(seen.get(), 7);
    }

    #[test]
    fn test_value_parked_until_attached() {
        let (p, mut d) = promise::<&'static str>();
        assert!(!d.is_ready());
        p.set_value("hi");
        assert!(d.is_ready());
        assert_eq!(d.try_take(), Some(Ok("hi")));
        assert_eq!(d.try_take(), None);
    }

    #[test]
    fn test_broken_promise() {
        let (p, mut d) = promise::<u8>();
        drop(p);
        assert_eq!(d.try_take(), Some(Err(ReactorError::BrokenPromise)));
    }

    #[test]
    fn test_error_skips_then() {
        let called = Rc::new(Cell::new(false));
        let c = called.clone();
        let mut d = Deferred::<u8>::failed(ReactorError::Timeout).then(move |_| {
            c.set(true);
            Deferred::ready(1u8)
        });
        assert!(!called.get());
        assert_eq!(d.try_take(), Some(Err(ReactorError::Timeout)));
    }

    #[test]
    fn test_finally_runs_on_error() {
        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();
        let mut d = Deferred::<()>::failed(ReactorError::Shutdown).finally(move || r.set(true));
        assert!(ran.get());
        assert_eq!(d.try_take(), Some(Err(ReactorError::Shutdown)));
    }

    #[test]
    fn test_when_all_keeps_order() {
        let (p1, d1) = promise();
        let (p2, d2) = promise();
        let mut all = when_all(vec![d1, d2, Deferred::ready(3)]);
        assert!(!all.is_ready());
        p2.set_value(2);
        p1.set_value(1);
        assert_eq!(all.try_take(), Some(Ok(vec![1, 2, 3])));
    }

    #[test]
    fn test_when_all_first_error_wins() {
        let (p1, d1) = promise::<u8>();
        let mut all = when_all(vec![d1, Deferred::failed(ReactorError::Timeout)]);
        assert!(!all.is_ready());
        p1.set_error(ReactorError::Shutdown);
        assert_eq!(all.try_take(), Some(Err(ReactorError::Timeout)));
    }

    #[test]
    fn test_join_pairs() {
        let mut d = join(Deferred::ready(1u8), Deferred::ready("b"));
        assert_eq!(d.try_take(), Some(Ok((1, "b"))));
    }

    #[test]
    fn test_repeat_across_pending_steps() {
        let pending: Rc<RefCell<Vec<Promise<Iteration>>>> = Rc::new(RefCell::new(Vec::new()));
        let count = Rc::new(Cell::new(0));
        let (pq, c) = (pending.clone(), count.clone());
        let mut done = repeat(move || {
            c.set(c.get() + 1);
            let (p, d) = promise();
            pq.borrow_mut().push(p);
            d
        });
        for _ in 0..3 {
            let p = pending.borrow_mut().pop().unwrap();
            p.set_value(Iteration::Continue);
        }
        assert!(!done.is_ready());
        pending.borrow_mut().pop().unwrap().set_value(Iteration::Stop);
        assert_eq!(done.try_take(), Some(Ok(())));
        assert_eq!(count.get(), 4);
    }

    #[test]
    fn test_do_for_each_sums() {
        let sum = Rc::new(Cell::new(0));
        let s = sum.clone();
        let mut d = do_for_each(1..=10, move |i| {
            s.set(s.get() + i);
            Deferred::ready(())
        });
        assert_eq!(d.try_take(), Some(Ok(())));
        assert_eq!(sum.get(), 55);
    }

    #[test]
    fn test_do_until_stops() {
        let n = Rc::new(Cell::new(0));
        let (a, b) = (n.clone(), n.clone());
        let mut d = do_until(move || a.get() == 5, move || {
            b.set(b.get() + 1);
            Deferred::ready(())
        });
        assert_eq!(d.try_take(), Some(Ok(())));
        assert_eq!(n.get(), 5);
    }

    #[test]
    #[should_panic]
    fn test_double_consume_is_invariant_violation() {
        crate::kprint::set_log_level(crate::kprint::LogLevel::Off);
        let taken = Deferred { state: State::<u8>::Taken };
        taken.on_complete(|_| {});
    }
}
