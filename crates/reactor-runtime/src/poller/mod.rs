//! Pollers: one per event source
//!
//! The reactor calls every registered poller once per idle iteration. When
//! nothing reports work it tries to sleep:
//!
//! ```text
//!   try_enter_interrupt_mode() on each poller, in order
//!     all accept  ─▶ epoll_wait ─▶ exit_interrupt_mode() on all
//!     one refuses ─▶ exit_interrupt_mode() on those already entered,
//!                    keep polling
//! ```
//!
//! Registrations made while polling are applied at the next safe point,
//! so a poller may add or remove pollers from inside `poll()`.

pub mod builtin;

use std::cell::{Cell, RefCell};

/// One event source driven by the reactor loop.
pub trait Poller {
    fn name(&self) -> &'static str {
        "poller"
    }

    /// Process pending events. Returns true if any work was done.
    fn poll(&mut self) -> bool;

    /// Check for work without running user continuations where possible.
    /// Used while spinning before sleep.
    fn pure_poll(&mut self) -> bool {
        self.poll()
    }

    /// Prepare for the shard to block. Return false if blocking is unsafe
    /// right now; the reactor then keeps polling.
    fn try_enter_interrupt_mode(&mut self) -> bool {
        true
    }

    fn exit_interrupt_mode(&mut self) {}
}

/// Handle returned by [`PollerRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollerId(u64);

/// Ordered set of pollers with deferred registration.
pub struct PollerRegistry {
    active: RefCell<Vec<(PollerId, Box<dyn Poller>)>>,
    pending_add: RefCell<Vec<(PollerId, Box<dyn Poller>)>>,
    pending_remove: RefCell<Vec<PollerId>>,
    next_id: Cell<u64>,
}

impl PollerRegistry {
    pub fn new() -> Self {
        Self {
            active: RefCell::new(Vec::new()),
            pending_add: RefCell::new(Vec::new()),
            pending_remove: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
        }
    }

    /// Register a poller; it starts being polled at the next safe point.
    pub fn add(&self, poller: Box<dyn Poller>) -> PollerId {
        let id = PollerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.pending_add.borrow_mut().push((id, poller));
        id
    }

    pub fn remove(&self, id: PollerId) {
        self.pending_remove.borrow_mut().push(id);
    }

    /// Apply pending registrations. Must not be called while polling.
    pub fn apply(&self) {
        let added = std::mem::take(&mut *self.pending_add.borrow_mut());
        let removed = std::mem::take(&mut *self.pending_remove.borrow_mut());
        if added.is_empty() && removed.is_empty() {
            return;
        }
        let mut active = self.active.borrow_mut();
        active.extend(added);
        if !removed.is_empty() {
            active.retain(|(id, _)| !removed.contains(id));
        }
    }

    pub fn len(&self) -> usize {
        self.active.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Poll each poller once. Returns true if any did work.
    pub fn poll_all(&self) -> bool {
        let mut work = false;
        for (_, p) in self.active.borrow_mut().iter_mut() {
            work |= p.poll();
        }
        work
    }

    pub fn pure_poll_all(&self) -> bool {
        let mut work = false;
        for (_, p) in self.active.borrow_mut().iter_mut() {
            work |= p.pure_poll();
        }
        work
    }

    /// Enter interrupt mode on every poller, or on none.
    pub fn try_enter_all(&self) -> bool {
        let mut active = self.active.borrow_mut();
        for i in 0..active.len() {
            if !active[i].1.try_enter_interrupt_mode() {
                reactor_core::ktrace!("poller {} refused to sleep", active[i].1.name());
                for (_, p) in active[..i].iter_mut().rev() {
                    p.exit_interrupt_mode();
                }
                return false;
            }
        }
        true
    }

    pub fn exit_all(&self) {
        for (_, p) in self.active.borrow_mut().iter_mut() {
            p.exit_interrupt_mode();
        }
    }

    /// Drop every poller, pending or active.
    pub fn clear(&self) {
        self.pending_add.borrow_mut().clear();
        self.pending_remove.borrow_mut().clear();
        let pollers = std::mem::take(&mut *self.active.borrow_mut());
        drop(pollers);
    }
}

impl Default for PollerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    struct Probe {
        log: Rc<RefCell<Vec<String>>>,
        tag: &'static str,
        work: bool,
        accept: bool,
    }

    impl Poller for Probe {
        fn poll(&mut self) -> bool {
            self.log.borrow_mut().push(format!("poll {}", self.tag));
            self.work
        }
        fn try_enter_interrupt_mode(&mut self) -> bool {
            self.log.borrow_mut().push(format!("enter {}", self.tag));
            self.accept
        }
        fn exit_interrupt_mode(&mut self) {
            self.log.borrow_mut().push(format!("exit {}", self.tag));
        }
    }

    fn probe(log: &Rc<RefCell<Vec<String>>>, tag: &'static str, work: bool, accept: bool) -> Box<dyn Poller> {
        Box::new(Probe { log: log.clone(), tag, work, accept })
    }

    #[test]
    fn test_registration_applies_at_safe_point() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let reg = PollerRegistry::new();
        let a = reg.add(probe(&log, "a", false, true));
        assert!(!reg.poll_all());
        assert!(log.borrow().is_empty());
        reg.apply();
        reg.add(probe(&log, "b", true, true));
        assert!(!reg.poll_all());
        reg.apply();
        assert!(reg.poll_all());
        reg.remove(a);
        reg.apply();
        assert_eq!(reg.len(), 1);
        assert_eq!(*log.borrow(), vec!["poll a", "poll a", "poll b"]);
    }

    #[test]
    fn test_refusal_unwinds_in_reverse() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let reg = PollerRegistry::new();
        reg.add(probe(&log, "a", false, true));
        reg.add(probe(&log, "b", false, true));
        reg.add(probe(&log, "c", false, false));
        reg.add(probe(&log, "d", false, true));
        reg.apply();
        assert!(!reg.try_enter_all());
        assert_eq!(*log.borrow(), vec!["enter a", "enter b", "enter c", "exit b", "exit a"]);
    }

    #[test]
    fn test_all_accept() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let reg = PollerRegistry::new();
        reg.add(probe(&log, "a", false, true));
        reg.add(probe(&log, "b", false, true));
        reg.apply();
        assert!(reg.try_enter_all());
        reg.exit_all();
        assert_eq!(*log.borrow(), vec!["enter a", "enter b", "exit a", "exit b"]);
    }
}
