//! Typed results across threads
//!
//! Promises are shard-local, so a result computed on another thread comes
//! back type-erased under an id and is matched here to the promise that
//! waits for it.

use reactor_core::error::invariant_violation;
use reactor_core::{Promise, Result};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;

pub(crate) type AnyResult = Result<Box<dyn Any + Send>>;

type Resolver = Box<dyn FnOnce(AnyResult)>;

pub(crate) fn erase<T: Send + 'static>(r: Result<T>) -> AnyResult {
    r.map(|v| Box::new(v) as Box<dyn Any + Send>)
}

/// Promises waiting for a result from another thread, keyed by id.
#[derive(Default)]
pub(crate) struct Resolvers {
    next: Cell<u64>,
    waiting: RefCell<HashMap<u64, Resolver>>,
}

impl Resolvers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Send + 'static>(&self, p: Promise<T>) -> u64 {
        let id = self.next.get();
        self.next.set(id + 1);
        let resolve: Resolver = Box::new(move |r: AnyResult| match r {
            Ok(v) => match v.downcast::<T>() {
                Ok(v) => p.set_value(*v),
                Err(_) => invariant_violation("cross-thread result has the wrong type"),
            },
            Err(e) => p.set_error(e),
        });
        self.waiting.borrow_mut().insert(id, resolve);
        id
    }

    /// Hand `r` to the promise registered under `id`.
    pub fn resolve(&self, id: u64, r: AnyResult) {
        let resolver = self.waiting.borrow_mut().remove(&id);
        match resolver {
            Some(resolve) => resolve(r),
            None => reactor_core::kerror!("result for unknown request {}", id),
        }
    }

    pub fn len(&self) -> usize {
        self.waiting.borrow().len()
    }

    /// Drop every waiting promise; their consumers see `BrokenPromise`.
    pub fn abandon(&self) -> usize {
        let all = std::mem::take(&mut *self.waiting.borrow_mut());
        let n = all.len();
        drop(all);
        n
    }
}
