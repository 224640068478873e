//! Channels: output streams other threads can write to
//!
//! A [`Channel`] is a `Send + Sync` handle to an output stream that lives
//! on one shard. Any thread may `put` packets; they land in the shard's
//! [`PacketQueue`], and the shard's packet-queue poller writes them out.
//!
//! ```text
//!   any thread ──put──▶ PacketQueue (SegQueue) ──maybe_wakeup──▶ shard
//!                                                 │
//!                       PacketQueuePoller ◀───────┘
//!                         drain ─▶ write_chain ─▶ flush ─▶ done(result)
//! ```
//!
//! The poller does not start a new drain while the previous flush is in
//! flight, so packets of one channel reach the stream in queue order.

use crate::poller::Poller;
use crate::shard::{self, ShardShared};
use crate::stream::{OutputStream, Packet};
use bytes::Bytes;
use crossbeam_queue::SegQueue;
use reactor_core::{Deferred, ReactorError, Result};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Packets taken per drain.
const DRAIN_BATCH: usize = 128;

static NEXT_CHANNEL: AtomicU64 = AtomicU64::new(1);

pub type PacketDone = Box<dyn FnOnce(Result<()>) + Send>;
pub type ReconnectHook = Box<dyn Fn(ReconnectDone) + Send + Sync>;

/// Fragments queued for a channel, plus a callback run once they have been
/// flushed (or have failed).
pub struct UserPacket {
    pub fragments: Vec<Bytes>,
    done: Option<PacketDone>,
    channel: u64,
}

impl UserPacket {
    pub fn new(fragments: Vec<Bytes>) -> Self {
        Self { fragments, done: None, channel: 0 }
    }

    pub fn on_done(mut self, done: impl FnOnce(Result<()>) + Send + 'static) -> Self {
        self.done = Some(Box::new(done));
        self
    }

    pub fn len(&self) -> usize {
        self.fragments.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn complete(&mut self, r: Result<()>) {
        if let Some(done) = self.done.take() {
            done(r);
        }
    }
}

impl From<Bytes> for UserPacket {
    fn from(b: Bytes) -> Self {
        Self::new(vec![b])
    }
}

/// Multi-producer queue of packets for one shard.
pub struct PacketQueue {
    queue: SegQueue<UserPacket>,
    shard: Arc<ShardShared>,
}

impl PacketQueue {
    pub fn new(shard: Arc<ShardShared>) -> Arc<Self> {
        Arc::new(Self { queue: SegQueue::new(), shard })
    }

    pub fn shard_id(&self) -> u32 {
        self.shard.id
    }

    /// Queue `p` and wake the owning shard if it sleeps.
    pub fn enqueue(&self, p: UserPacket) {
        self.queue.push(p);
        self.shard.maybe_wakeup();
    }

    pub fn try_dequeue(&self) -> Option<UserPacket> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Thread-safe handle to an output stream owned by one shard.
pub struct Channel {
    id: u64,
    addr: String,
    queue: OnceLock<Arc<PacketQueue>>,
    broken: AtomicBool,
    reconnecting: AtomicBool,
    reconnect_hook: Mutex<Option<ReconnectHook>>,
}

impl Channel {
    pub fn new(addr: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CHANNEL.fetch_add(1, Ordering::Relaxed),
            addr: addr.into(),
            queue: OnceLock::new(),
            broken: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            reconnect_hook: Mutex::new(None),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// True once the channel is bound to a shard's stream.
    pub fn is_init(&self) -> bool {
        self.queue.get().is_some()
    }

    pub fn put(&self, mut p: UserPacket) -> Result<()> {
        let Some(queue) = self.queue.get() else {
            return Err(ReactorError::InvalidArgument("channel is not bound to a stream"));
        };
        p.channel = self.id;
        queue.enqueue(p);
        Ok(())
    }

    pub fn put_many(&self, packets: impl IntoIterator<Item = UserPacket>) -> Result<()> {
        for p in packets {
            self.put(p)?;
        }
        Ok(())
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    pub fn set_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }

    pub fn set_reconnect_hook(&self, hook: impl Fn(ReconnectDone) + Send + Sync + 'static) {
        if let Ok(mut h) = self.reconnect_hook.lock() {
            *h = Some(Box::new(hook));
        }
    }

    /// Ask the hook to re-establish a broken channel. At most one attempt
    /// runs at a time; the hook signals completion through the token.
    pub fn reconnect(self: &Arc<Self>) {
        let Ok(hook) = self.reconnect_hook.lock() else {
            return;
        };
        let Some(hook) = hook.as_ref() else {
            return;
        };
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let token = ReconnectDone(self.clone());
        if self.is_broken() {
            hook(token);
        } else {
            token.done();
        }
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::Acquire)
    }

    fn bind(&self, queue: &Arc<PacketQueue>) {
        if self.queue.set(queue.clone()).is_err() {
            let bound = self.queue.get().map(|q| q.shard_id());
            if bound != Some(queue.shard_id()) {
                reactor_core::error::invariant_violation("channel rebound to another shard");
            }
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("addr", &self.addr)
            .field("broken", &self.is_broken())
            .field("reconnecting", &self.is_reconnecting())
            .finish()
    }
}

/// Completion token handed to a reconnect hook.
pub struct ReconnectDone(Arc<Channel>);

impl ReconnectDone {
    pub fn channel(&self) -> &Arc<Channel> {
        &self.0
    }

    /// The channel works again.
    pub fn done(self) {
        self.0.broken.store(false, Ordering::Release);
        self.0.reconnecting.store(false, Ordering::Release);
    }

    /// The attempt failed; the channel stays broken and may be retried.
    pub fn failed(self) {
        self.0.reconnecting.store(false, Ordering::Release);
    }
}

type Streams = Rc<RefCell<HashMap<u64, (Arc<Channel>, Rc<OutputStream>)>>>;

/// The shard-local side of a [`PacketQueue`]: the streams its channels
/// write to.
pub struct LocalPacketQueue {
    queue: Arc<PacketQueue>,
    streams: Streams,
}

impl LocalPacketQueue {
    /// Create this shard's packet queue and register its poller.
    pub fn start() -> Rc<Self> {
        let r = shard::local();
        let queue = PacketQueue::new(r.shard().clone());
        let streams: Streams = Rc::default();
        r.add_poller(Box::new(PacketQueuePoller::new(queue.clone(), streams.clone())));
        Rc::new(Self { queue, streams })
    }

    pub fn queue(&self) -> &Arc<PacketQueue> {
        &self.queue
    }

    /// Route `channel` to `out`. A stream bound earlier (before a
    /// reconnect, say) is closed in the background.
    pub fn bind(&self, channel: &Arc<Channel>, out: OutputStream) {
        channel.bind(&self.queue);
        let old = self.streams.borrow_mut().insert(channel.id, (channel.clone(), Rc::new(out)));
        if let Some((_, old)) = old {
            old.close().discard();
        }
    }

    /// Detach `channel` and close its stream.
    pub fn unbind(&self, channel: &Channel) -> Deferred<()> {
        match self.streams.borrow_mut().remove(&channel.id) {
            Some((_, out)) => out.close(),
            None => Deferred::ready(()),
        }
    }
}

/// Drains the packet queue into channel streams.
pub(crate) struct PacketQueuePoller {
    queue: Arc<PacketQueue>,
    streams: Streams,
    busy: Rc<Cell<bool>>,
}

impl PacketQueuePoller {
    fn new(queue: Arc<PacketQueue>, streams: Streams) -> Self {
        Self { queue, streams, busy: Rc::new(Cell::new(false)) }
    }

    fn drain(&self) -> bool {
        let mut batch = Vec::new();
        while batch.len() < DRAIN_BATCH {
            match self.queue.try_dequeue() {
                Some(p) => batch.push(p),
                None => break,
            }
        }
        if batch.is_empty() {
            return false;
        }
        let mut writes = Vec::new();
        let mut touched: Vec<u64> = Vec::new();
        for mut p in batch {
            let target = self.streams.borrow().get(&p.channel).cloned();
            let Some((channel, out)) = target else {
                p.complete(Err(ReactorError::StreamClosed));
                continue;
            };
            if channel.is_broken() {
                p.complete(Err(ReactorError::StreamClosed));
                channel.reconnect();
                continue;
            }
            if !touched.contains(&p.channel) {
                touched.push(p.channel);
            }
            let packet: Packet = std::mem::take(&mut p.fragments).into_iter().collect();
            writes.push((channel, out.write_chain(packet), p));
        }
        if writes.is_empty() {
            return true;
        }
        self.busy.set(true);
        let busy = self.busy.clone();
        let streams = self.streams.clone();
        write_in_order(writes)
            .then(move |pending| flush_touched(streams, touched).map(move |()| pending))
            .on_complete(move |r| {
                busy.set(false);
                let Ok(pending) = r else {
                    return;
                };
                for (channel, result, mut p) in pending {
                    if result.is_err() {
                        channel.set_broken();
                        channel.reconnect();
                    }
                    p.complete(result);
                }
            });
        true
    }
}

type Pending = Vec<(Arc<Channel>, Result<()>, UserPacket)>;

/// Await each write in queue order, keeping per-packet results.
fn write_in_order(writes: Vec<(Arc<Channel>, Deferred<()>, UserPacket)>) -> Deferred<Pending> {
    let mut writes = writes.into_iter();
    let results: Rc<RefCell<Pending>> = Rc::default();
    let out = results.clone();
    reactor_core::repeat(move || {
        let Some((channel, write, p)) = writes.next() else {
            return Deferred::ready(reactor_core::Iteration::Stop);
        };
        let results = results.clone();
        write.then_result(move |r| {
            results.borrow_mut().push((channel, r, p));
            Deferred::ready(reactor_core::Iteration::Continue)
        })
    })
    .map(move |()| std::mem::take(&mut *out.borrow_mut()))
}

/// Flush every stream written in this drain. A failed flush marks the
/// packets of that channel failed through their write results, so flush
/// errors are folded into the channel's broken state here.
fn flush_touched(streams: Streams, touched: Vec<u64>) -> Deferred<()> {
    let targets: Vec<_> = touched.iter().filter_map(|id| streams.borrow().get(id).cloned()).collect();
    let flushes = targets
        .into_iter()
        .map(|(channel, out)| {
            out.flush().then_result(move |r| {
                if let Err(e) = r {
                    reactor_core::kwarn!("channel {} flush failed: {}", channel.addr(), e);
                    channel.set_broken();
                    channel.reconnect();
                }
                Deferred::ready(())
            })
        })
        .collect();
    reactor_core::when_all(flushes).ignore_value()
}

impl Poller for PacketQueuePoller {
    fn name(&self) -> &'static str {
        "packet-queue"
    }

    fn poll(&mut self) -> bool {
        if self.busy.get() {
            return false;
        }
        self.drain()
    }

    fn pure_poll(&mut self) -> bool {
        !self.busy.get() && !self.queue.is_empty()
    }

    fn try_enter_interrupt_mode(&mut self) -> bool {
        self.busy.get() || self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smp::run_test;
    use crate::stream::MemorySink;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_put_before_bind_fails() {
        let ch = Channel::new("peer:1");
        assert!(!ch.is_init());
        assert!(ch.put(UserPacket::from(Bytes::from_static(b"x"))).is_err());
    }

    #[test]
    fn test_reconnect_runs_hook_once_while_broken() {
        let ch = Channel::new("peer:2");
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let parked: Arc<Mutex<Option<ReconnectDone>>> = Arc::default();
        let park = parked.clone();
        ch.set_reconnect_hook(move |done| {
            seen.fetch_add(1, Ordering::SeqCst);
            *park.lock().unwrap() = Some(done);
        });
        ch.set_broken();
        ch.reconnect();
        ch.reconnect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(ch.is_reconnecting());
        parked.lock().unwrap().take().unwrap().done();
        assert!(!ch.is_broken());
        assert!(!ch.is_reconnecting());
    }

    #[test]
    fn test_reconnect_on_healthy_channel_skips_hook() {
        let ch = Channel::new("peer:3");
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        ch.set_reconnect_hook(move |done| {
            seen.fetch_add(1, Ordering::SeqCst);
            done.done();
        });
        ch.reconnect();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!ch.is_reconnecting());
    }

    #[test]
    fn test_packets_from_other_thread_are_written_and_flushed() {
        let code = run_test(1, || {
            let local = LocalPacketQueue::start();
            let sink = MemorySink::new(1 << 16);
            let log = sink.log();
            let ch = Channel::new("mem");
            local.bind(&ch, OutputStream::new(sink));

            let (tx, rx) = std::sync::mpsc::channel::<Result<()>>();
            let remote = ch.clone();
            let producer = std::thread::spawn(move || {
                for i in 0..4u8 {
                    let tx = tx.clone();
                    let p = UserPacket::new(vec![Bytes::from(vec![b'a' + i; 2]), Bytes::from_static(b"|")])
                        .on_done(move |r| {
                            let _ = tx.send(r);
                        });
                    if remote.put(p).is_err() {
                        return;
                    }
                }
            });
            let _ = producer.join();

            let rx = Rc::new(rx);
            let done = Rc::new(Cell::new(0));
            let counted = done.clone();
            reactor_core::do_until(
                move || counted.get() == 4,
                move || {
                    while let Ok(r) = rx.try_recv() {
                        if r.is_ok() {
                            done.set(done.get() + 1);
                        }
                    }
                    shard::local().later()
                },
            )
            .then(move |()| local.unbind(&ch).map(move |()| local))
            .map(move |_local| {
                let log = log.borrow();
                if log.contents() == b"aa|bb|cc|dd|".to_vec() && log.flushes >= 1 && log.closed {
                    0
                } else {
                    1
                }
            })
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_flush_failure_breaks_channel() {
        let code = run_test(1, || {
            let local = LocalPacketQueue::start();
            let sink = MemorySink::new(1 << 16).fail_flush(ReactorError::Os(libc::EPIPE));
            let ch = Channel::new("mem-bad");
            local.bind(&ch, OutputStream::new(sink));
            if ch.put(UserPacket::from(Bytes::from_static(b"lost"))).is_err() {
                return Deferred::ready(10);
            }
            let probe = ch.clone();
            reactor_core::do_until(move || probe.is_broken(), || shard::local().later())
                .then(move |()| local.unbind(&ch).then_result(|_| Deferred::ready(0)))
        });
        assert_eq!(code, 0);
    }
}
