//! Cross-shard messaging and multi-shard startup
//!
//! Every ordered pair of shards owns one [`MessageQueue`]. A shard batches
//! outgoing work per destination and pushes a batch once it reaches
//! `smp_batch_size`; the smp poller pushes whatever is left each
//! iteration. The destination runs each item, queues the result, and ships
//! results back in the same batched way.
//!
//! ```text
//!   submit_to(B, f)
//!     │  pending[B] ──(batch)──▶ queue(A,B).requests
//!     │                                  │ poller on B
//!     │                                  ▼
//!     │                          f() ─▶ completed[A]
//!     │                                  │ (batch)
//!     ▼                                  ▼
//!   Deferred<T> ◀── resolvers ◀── queue(A,B).completions
//! ```
//!
//! Results are type-erased on the way back and matched to their promise
//! by request id.

mod queue;

pub use queue::QueueStats;

use crate::completion::Resolvers;
use crate::config::ReactorConfig;
use crate::reactor::Reactor;
use crate::shard::{self, ShardShared};
use queue::{Completion, MessageQueue, RemoteFn, WorkItem};
use reactor_core::error::{is_invariant_violation, panic_message};
use reactor_core::{promise, when_all, Deferred, ReactorError, Result};
use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

// ============================================================================
// Shared state
// ============================================================================

/// State every shard of one running system can see.
pub(crate) struct SmpShared {
    count: usize,
    queues: Vec<MessageQueue>,
    shards: Vec<Arc<ShardShared>>,
    batch_size: usize,
    exit_code: AtomicI32,
}

impl SmpShared {
    fn new(shards: Vec<Arc<ShardShared>>, queue_length: usize, batch_size: usize) -> Self {
        let count = shards.len();
        Self {
            count,
            queues: (0..count * count).map(|_| MessageQueue::new(queue_length)).collect(),
            shards,
            batch_size: batch_size.max(1),
            exit_code: AtomicI32::new(0),
        }
    }

    #[inline]
    fn queue(&self, from: usize, to: usize) -> &MessageQueue {
        &self.queues[from * self.count + to]
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn shard(&self, id: usize) -> &Arc<ShardShared> {
        &self.shards[id]
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire)
    }

    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::Release);
    }

    pub fn queue_stats(&self, from: usize, to: usize) -> QueueStats {
        self.queue(from, to).stats()
    }
}

// ============================================================================
// Shard side
// ============================================================================

/// One shard's endpoint of the message queues.
pub(crate) struct SmpShard {
    id: usize,
    shared: Arc<SmpShared>,
    /// Outgoing work, by destination
    pending: RefCell<Vec<VecDeque<WorkItem>>>,
    /// Finished incoming work, by origin
    completed: RefCell<Vec<VecDeque<Completion>>>,
    resolvers: Resolvers,
}

impl SmpShard {
    pub fn new(id: usize, shared: Arc<SmpShared>) -> Self {
        let n = shared.count;
        Self {
            id,
            pending: RefCell::new((0..n).map(|_| VecDeque::new()).collect()),
            completed: RefCell::new((0..n).map(|_| VecDeque::new()).collect()),
            shared,
            resolvers: Resolvers::new(),
        }
    }

    pub fn shared(&self) -> &Arc<SmpShared> {
        &self.shared
    }

    pub fn count(&self) -> usize {
        self.shared.count
    }

    /// Run `f` on shard `to` and deliver its result here.
    pub fn submit<T, F>(self: &Rc<Self>, to: usize, f: F) -> Deferred<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Deferred<T> + Send + 'static,
    {
        if to >= self.shared.count {
            return Deferred::failed(ReactorError::InvalidArgument("no such shard"));
        }
        if to == self.id {
            return match catch_unwind(AssertUnwindSafe(f)) {
                Ok(d) => d,
                Err(payload) => Deferred::failed(contain_panic(payload)),
            };
        }
        let (p, out) = promise();
        let id = self.resolvers.register(p);
        let func: RemoteFn =
            Box::new(move || f().map(|v| Box::new(v) as Box<dyn Any + Send>));
        let full = {
            let mut pending = self.pending.borrow_mut();
            pending[to].push_back(WorkItem { id, func });
            pending[to].len() >= self.shared.batch_size
        };
        if full {
            self.flush_pending_to(to);
        }
        out
    }

    fn flush_pending_to(&self, to: usize) -> bool {
        let q = self.shared.queue(self.id, to);
        let mut pushed = 0;
        {
            let mut pending = self.pending.borrow_mut();
            let fifo = &mut pending[to];
            while let Some(item) = fifo.pop_front() {
                if let Err(item) = q.requests.push(item) {
                    fifo.push_front(item);
                    break;
                }
                pushed += 1;
            }
        }
        if pushed > 0 {
            q.record_sent(pushed);
            self.shared.shards[to].maybe_wakeup();
        }
        pushed > 0
    }

    fn flush_pending(&self) -> bool {
        let mut work = false;
        for to in 0..self.shared.count {
            if to != self.id && !self.pending.borrow()[to].is_empty() {
                work |= self.flush_pending_to(to);
            }
        }
        work
    }

    /// Run work other shards sent here.
    fn process_incoming(self: &Rc<Self>) -> bool {
        let mut work = false;
        for from in 0..self.shared.count {
            if from == self.id {
                continue;
            }
            let q = self.shared.queue(from, self.id);
            let mut n = 0;
            while let Some(item) = q.requests.pop() {
                n += 1;
                let WorkItem { id, func } = item;
                let result = match catch_unwind(AssertUnwindSafe(func)) {
                    Ok(d) => d,
                    Err(payload) => Deferred::failed(contain_panic(payload)),
                };
                let me = self.clone();
                result.on_complete(move |r| {
                    me.completed.borrow_mut()[from].push_back(Completion { id, result: r });
                });
            }
            if n > 0 {
                q.record_received(n);
                work = true;
            }
        }
        work
    }

    fn flush_completions(&self) -> bool {
        let mut work = false;
        for origin in 0..self.shared.count {
            if origin == self.id {
                continue;
            }
            let q = self.shared.queue(origin, self.id);
            let mut pushed = 0;
            {
                let mut completed = self.completed.borrow_mut();
                let fifo = &mut completed[origin];
                while let Some(c) = fifo.pop_front() {
                    if let Err(c) = q.completions.push(c) {
                        fifo.push_front(c);
                        break;
                    }
                    pushed += 1;
                }
            }
            if pushed > 0 {
                self.shared.shards[origin].maybe_wakeup();
                work = true;
            }
        }
        work
    }

    /// Resolve promises for work this shard sent out.
    fn process_completions(&self) -> bool {
        let mut work = false;
        for to in 0..self.shared.count {
            if to == self.id {
                continue;
            }
            let q = self.shared.queue(self.id, to);
            let mut n = 0;
            while let Some(c) = q.completions.pop() {
                self.resolvers.resolve(c.id, c.result);
                n += 1;
            }
            if n > 0 {
                q.record_completed(n);
                work = true;
            }
        }
        work
    }

    /// One round of cross-shard traffic. Returns true if anything moved.
    pub fn poll(self: &Rc<Self>) -> bool {
        let mut work = self.process_completions();
        work |= self.process_incoming();
        work |= self.flush_completions();
        work |= self.flush_pending();
        work
    }

    /// Whether a poll would find something to do.
    pub fn has_work(&self) -> bool {
        if self.pending.borrow().iter().any(|f| !f.is_empty())
            || self.completed.borrow().iter().any(|f| !f.is_empty())
        {
            return true;
        }
        (0..self.shared.count).filter(|&o| o != self.id).any(|o| {
            !self.shared.queue(o, self.id).requests.is_empty()
                || !self.shared.queue(self.id, o).completions.is_empty()
        })
    }

    /// Requests sent from here still waiting for a result.
    pub fn in_flight(&self) -> usize {
        self.resolvers.len()
    }

    /// Give up on results that will never arrive because the system stopped.
    pub fn abandon(&self) -> usize {
        self.pending.borrow_mut().iter_mut().for_each(VecDeque::clear);
        self.resolvers.abandon()
    }

    /// Stats of the queues this shard sends on.
    pub fn stats(&self) -> Vec<(u32, QueueStats)> {
        (0..self.shared.count)
            .filter(|&to| to != self.id)
            .map(|to| (to as u32, self.shared.queue_stats(self.id, to)))
            .collect()
    }
}

fn contain_panic(payload: Box<dyn Any + Send>) -> ReactorError {
    if is_invariant_violation(payload.as_ref()) {
        reactor_core::kerror!("aborting: {}", panic_message(payload.as_ref()));
        std::process::abort();
    }
    reactor_core::kerror!("remote closure panicked: {}", panic_message(payload.as_ref()));
    ReactorError::from_panic(payload.as_ref())
}

// ============================================================================
// Public API
// ============================================================================

/// Run `f` on `shard` and resolve with its result on the calling shard.
///
/// Calls to one destination are delivered and answered in submission
/// order. Submitting to the calling shard runs `f` right away.
pub fn submit_to<T, F>(shard: u32, f: F) -> Deferred<T>
where
    T: Send + 'static,
    F: FnOnce() -> Deferred<T> + Send + 'static,
{
    shard::local().smp().submit(shard as usize, f)
}

/// Run `f` on every shard, this one included.
pub fn invoke_on_all<F>(f: F) -> Deferred<()>
where
    F: FnOnce() -> Deferred<()> + Send + Clone + 'static,
{
    let smp = shard::local().smp().clone();
    let calls = (0..smp.count()).map(|s| smp.submit(s, f.clone())).collect();
    when_all(calls).ignore_value()
}

/// Run `f` on every shard except this one.
pub fn invoke_on_others<F>(f: F) -> Deferred<()>
where
    F: FnOnce() -> Deferred<()> + Send + Clone + 'static,
{
    let smp = shard::local().smp().clone();
    let me = smp.id;
    let calls = (0..smp.count()).filter(|&s| s != me).map(|s| smp.submit(s, f.clone())).collect();
    when_all(calls).ignore_value()
}

/// Number of shards in the running system.
pub fn count() -> u32 {
    shard::count()
}

// ============================================================================
// Startup
// ============================================================================

type MainFn = Box<dyn FnOnce() -> Deferred<i32>>;

/// A validated multi-shard setup, ready to run.
pub struct Smp {
    config: Arc<ReactorConfig>,
}

impl Smp {
    pub fn configure(config: ReactorConfig) -> Result<Self> {
        config.validate().map_err(|e| {
            reactor_core::kerror!("{}", e);
            match e {
                crate::config::ConfigError::InvalidValue(msg) => ReactorError::InvalidArgument(msg),
            }
        })?;
        Ok(Self { config: Arc::new(config) })
    }

    pub fn config(&self) -> &ReactorConfig {
        &self.config
    }

    /// Start every shard and run `main` on shard 0.
    ///
    /// Shards `1..n` get their own threads named `reactor-N`; shard 0 runs
    /// on the caller's thread. `main`'s value becomes the exit code; an
    /// error exits with 1. Returns once every shard has stopped.
    pub fn run<F>(self, main: F) -> Result<i32>
    where
        F: FnOnce() -> Deferred<i32> + 'static,
    {
        #[cfg(feature = "debug-logging")]
        if std::env::var_os("RCT_LOG_LEVEL").is_none() {
            reactor_core::kprint::set_log_level(reactor_core::kprint::LogLevel::Debug);
        }
        let n = self.config.shard_count();
        let cpus = self.config.allowed_cpus();
        let shards = (0..n)
            .map(|i| ShardShared::new(i as u32).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let shared = Arc::new(SmpShared::new(
            shards,
            self.config.smp_queue_length,
            self.config.smp_batch_size,
        ));

        let saved_mask = if self.config.handle_sigint {
            Some(crate::signal::block_exit_signals()?)
        } else {
            None
        };

        let barrier = Arc::new(Barrier::new(n));
        let failed = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(n.saturating_sub(1));
        for id in 1..n {
            let ctx = StartContext {
                id,
                cpu: pick_cpu(&cpus, id),
                config: self.config.clone(),
                shared: shared.clone(),
                barrier: barrier.clone(),
                failed: failed.clone(),
            };
            let spawned = thread::Builder::new()
                .name(format!("reactor-{}", id))
                .spawn(move || run_shard(ctx, None));
            match spawned {
                Ok(h) => handles.push(h),
                Err(e) => {
                    // Shards already started would wait on the barrier forever.
                    reactor_core::kerror!("failed to spawn shard {}: {}", id, e);
                    std::process::abort();
                }
            }
        }

        let ctx = StartContext {
            id: 0,
            cpu: pick_cpu(&cpus, 0),
            config: self.config.clone(),
            shared: shared.clone(),
            barrier,
            failed,
        };
        let result = run_shard(ctx, Some(Box::new(main)));

        for h in handles {
            match h.join() {
                Ok(Err(e)) => reactor_core::kerror!("shard failed: {}", e),
                Ok(Ok(_)) => {}
                Err(payload) => {
                    reactor_core::kerror!("shard thread panicked: {}", panic_message(payload.as_ref()))
                }
            }
        }
        if let Some(mask) = saved_mask {
            crate::signal::restore_mask(&mask);
        }
        result
    }
}

fn pick_cpu(cpus: &[usize], id: usize) -> Option<usize> {
    if cpus.is_empty() {
        None
    } else {
        Some(cpus[id % cpus.len()])
    }
}

struct StartContext {
    id: usize,
    cpu: Option<usize>,
    config: Arc<ReactorConfig>,
    shared: Arc<SmpShared>,
    barrier: Arc<Barrier>,
    failed: Arc<AtomicBool>,
}

fn run_shard(ctx: StartContext, main: Option<MainFn>) -> Result<i32> {
    if ctx.config.thread_affinity {
        if let Some(cpu) = ctx.cpu {
            if let Err(e) = crate::platform_linux::pin_current_thread(cpu) {
                reactor_core::kwarn!("shard {}: cannot pin to cpu {}: {}", ctx.id, cpu, e);
            }
        }
    }
    let reactor = match Reactor::new(ctx.id as u32, ctx.config.clone(), ctx.shared.clone()) {
        Ok(r) => r,
        Err(e) => {
            reactor_core::kerror!("shard {}: startup failed: {}", ctx.id, e);
            ctx.failed.store(true, Ordering::SeqCst);
            ctx.barrier.wait();
            return Err(e);
        }
    };
    ctx.barrier.wait();
    if ctx.failed.load(Ordering::SeqCst) {
        return Err(ReactorError::Shutdown);
    }
    shard::install(reactor.clone());
    reactor_core::kdebug!("shard {} started", ctx.id);
    if let Some(main) = main {
        reactor_core::task::spawn(move || {
            main().on_complete(|r| {
                let code = match r {
                    Ok(code) => code,
                    Err(e) => {
                        reactor_core::kerror!("application failed: {}", e);
                        1
                    }
                };
                shard::local().exit(code);
            });
        });
    }
    let code = reactor.run();
    shard::clear();
    reactor_core::kdebug!("shard {} stopped", ctx.id);
    Ok(code)
}

/// Boot `n` shards with test settings and run `main` on shard 0.
#[cfg(test)]
pub(crate) fn run_test<F>(n: usize, main: F) -> i32
where
    F: FnOnce() -> Deferred<i32> + 'static,
{
    match Smp::configure(ReactorConfig::for_tests(n)).and_then(|smp| smp.run(main)) {
        Ok(code) => code,
        Err(e) => panic!("runtime failed: {}", e),
    }
}
