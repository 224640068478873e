//! Syscall thread: blocking OS calls off the reactor thread
//!
//! Each shard owns one worker thread (`syscall-N`) for calls that have no
//! non-blocking form: open, fsync, stat, rename and friends.
//!
//! ```text
//!   shard ──ArrayQueue<Job>──▶ syscall-N ──ArrayQueue<Done>──▶ shard
//!           (bounded by the        │           (drained by the
//!            has_room semaphore)   └─ maybe_wakeup  syscall poller)
//! ```
//!
//! The worker parks when idle and wakes the shard only if it sleeps.

use crate::completion::{erase, AnyResult, Resolvers};
use crate::shard::ShardShared;
use crossbeam_queue::ArrayQueue;
use reactor_core::error::invariant_violation;
use reactor_core::{promise, Deferred, ReactorError, Result, Semaphore};
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};

struct Job {
    id: u64,
    func: Box<dyn FnOnce() -> AnyResult + Send>,
}

struct Done {
    id: u64,
    result: AnyResult,
}

struct PoolInner {
    work: ArrayQueue<Job>,
    done: ArrayQueue<Done>,
    shutdown: AtomicBool,
    executed: AtomicU64,
    shard: Arc<ShardShared>,
}

/// Per-shard blocking-call worker.
pub struct SyscallPool {
    inner: Arc<PoolInner>,
    worker: Thread,
    handle: RefCell<Option<JoinHandle<()>>>,
    has_room: Semaphore,
    resolvers: Resolvers,
}

impl SyscallPool {
    pub fn new(shard: Arc<ShardShared>, queue_length: usize) -> Result<Rc<Self>> {
        let queue_length = queue_length.max(1);
        let inner = Arc::new(PoolInner {
            work: ArrayQueue::new(queue_length),
            done: ArrayQueue::new(queue_length),
            shutdown: AtomicBool::new(false),
            executed: AtomicU64::new(0),
            shard,
        });
        let worker_inner = inner.clone();
        let handle = thread::Builder::new()
            .name(format!("syscall-{}", inner.shard.id))
            .spawn(move || worker_loop(worker_inner))
            .map_err(ReactorError::from)?;
        Ok(Rc::new(Self {
            worker: handle.thread().clone(),
            handle: RefCell::new(Some(handle)),
            inner,
            has_room: Semaphore::new(queue_length),
            resolvers: Resolvers::new(),
        }))
    }

    /// Run `f` on the syscall thread.
    ///
    /// A panic inside `f` fails the result with `ReactorError::Panicked`.
    pub fn submit<T, F>(self: &Rc<Self>, f: F) -> Deferred<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (p, out) = promise();
        let id = self.resolvers.register(p);
        let job = Job { id, func: Box::new(move || erase(f())) };
        let pool = self.clone();
        self.has_room.wait(1).on_complete(move |r| match r {
            Ok(()) => pool.push(job),
            Err(e) => pool.resolvers.resolve(id, Err(e)),
        });
        out
    }

    fn push(&self, job: Job) {
        if self.inner.work.push(job).is_err() {
            invariant_violation("syscall queue overflow despite has_room");
        }
        self.worker.unpark();
    }

    /// Drain finished calls. Returns true if any completed.
    pub fn complete(&self) -> bool {
        let mut n = 0;
        while let Some(done) = self.inner.done.pop() {
            self.resolvers.resolve(done.id, done.result);
            n += 1;
        }
        if n > 0 {
            self.has_room.signal(n);
        }
        n > 0
    }

    /// Whether completions are waiting to be drained.
    pub fn has_completions(&self) -> bool {
        !self.inner.done.is_empty()
    }

    /// Calls submitted and not yet drained.
    pub fn in_flight(&self) -> usize {
        self.resolvers.len()
    }

    /// Drop promises of calls whose results were never drained.
    pub fn abandon(&self) -> usize {
        self.resolvers.abandon()
    }

    pub fn executed(&self) -> u64 {
        self.inner.executed.load(Ordering::Relaxed)
    }

    /// Stop and join the worker. Queued calls still run first.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.worker.unpark();
        if let Some(handle) = self.handle.borrow_mut().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SyscallPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        match inner.work.pop() {
            Some(job) => {
                let result = match catch_unwind(AssertUnwindSafe(job.func)) {
                    Ok(r) => r,
                    Err(payload) => Err(ReactorError::from_panic(payload.as_ref())),
                };
                inner.executed.fetch_add(1, Ordering::Relaxed);
                let mut done = Done { id: job.id, result };
                // Bounded by has_room, so a full queue only means the shard
                // has not drained yet.
                while let Err(back) = inner.done.push(done) {
                    done = back;
                    thread::yield_now();
                }
                inner.shard.maybe_wakeup();
            }
            None => {
                if inner.shutdown.load(Ordering::Acquire) {
                    break;
                }
                thread::park();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pool(len: usize) -> Rc<SyscallPool> {
        SyscallPool::new(Arc::new(ShardShared::new(0).unwrap()), len).unwrap()
    }

    fn wait_until_done<T: 'static>(pool: &SyscallPool, f: &mut Deferred<T>) -> Result<T> {
        for _ in 0..5000 {
            pool.complete();
            if let Some(r) = f.try_take() {
                return r;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("syscall did not complete");
    }

    #[test]
    fn test_submit_runs_on_worker_thread() {
        let pool = pool(4);
        let mut f = pool.submit(|| Ok(thread::current().name().map(str::to_string)));
        let name = wait_until_done(&pool, &mut f).unwrap();
        assert_eq!(name.as_deref(), Some("syscall-0"));
        assert_eq!(pool.executed(), 1);
    }

    #[test]
    fn test_panic_becomes_error() {
        reactor_core::kprint::set_log_level(reactor_core::kprint::LogLevel::Off);
        let pool = pool(4);
        let mut f = pool.submit::<u32, _>(|| panic!("disk on fire"));
        match wait_until_done(&pool, &mut f) {
            Err(ReactorError::Panicked(msg)) => assert!(msg.contains("disk on fire")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_queue_is_bounded() {
        let pool = pool(2);
        let mut fs: Vec<_> = (0..5u32)
            .map(|i| {
                pool.submit(move || {
                    thread::sleep(Duration::from_millis(5));
                    Ok(i)
                })
            })
            .collect();
        assert_eq!(pool.has_room.waiters(), 3);
        let got: Vec<u32> = fs.iter_mut().map(|f| wait_until_done(&pool, f).unwrap()).collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
        assert_eq!(pool.in_flight(), 0);
    }
}
