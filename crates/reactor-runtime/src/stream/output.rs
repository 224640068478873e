//! Coalescing output stream
//!
//! Small writes fill a buffer of the sink's preferred size; a write that
//! would overflow it twice over goes straight to the sink after the
//! partial buffer. Zero-copy chains accumulate separately and may not be
//! mixed with buffered writes.
//!
//! In batch-flush mode `flush` only marks the stream; the shard's
//! batch-flush poller starts the real flush once per loop iteration.
//! Writes arriving while that flush runs wait for it, and an error it
//! hits is handed to the next `flush` or `close`.

use super::{DataSink, Packet};
use crate::poller::builtin::FlushBatch;
use crate::shard;
use bytes::{Bytes, BytesMut};
use reactor_core::error::invariant_violation;
use reactor_core::{promise, repeat, Deferred, Iteration, Promise, ReactorError};
use std::cell::RefCell;
use std::rc::Rc;

pub struct OutputStream {
    out: Rc<Out>,
}

struct Out {
    sink: RefCell<Box<dyn DataSink>>,
    st: RefCell<OutState>,
}

struct OutState {
    size: usize,
    buf: BytesMut,
    zc: Packet,
    trim_to_size: bool,
    batch: Option<Rc<FlushBatch>>,
    /// A batched flush is requested and not yet started
    flush: bool,
    /// The batch poller is pushing data to the sink
    flushing: bool,
    in_batch: bool,
    batch_waiters: Vec<Promise<()>>,
    error: Option<ReactorError>,
    closed: bool,
}

enum Pending {
    Buf(Bytes),
    Chain(Packet),
}

impl OutputStream {
    /// Stream with the sink's preferred buffer size.
    pub fn new(sink: impl DataSink + 'static) -> Self {
        let size = sink.buffer_size();
        Self::with_buffer_size(sink, size)
    }

    pub fn with_buffer_size(sink: impl DataSink + 'static, size: usize) -> Self {
        let st = OutState {
            size: size.max(1),
            buf: BytesMut::new(),
            zc: Packet::new(),
            trim_to_size: false,
            batch: None,
            flush: false,
            flushing: false,
            in_batch: false,
            batch_waiters: Vec::new(),
            error: None,
            closed: false,
        };
        Self { out: Rc::new(Out { sink: RefCell::new(Box::new(sink)), st: RefCell::new(st) }) }
    }

    /// Never hand the sink more than one buffer's worth per put.
    pub fn trim_to_size(self, enable: bool) -> Self {
        self.out.st.borrow_mut().trim_to_size = enable;
        self
    }

    /// Defer flushes to the shard's batch-flush poller. Must be called on
    /// a shard.
    pub fn batch_flushes(self, enable: bool) -> Self {
        self.out.st.borrow_mut().batch = enable.then(|| shard::local().flush_batch().clone());
        self
    }

    pub fn buffer_size(&self) -> usize {
        self.out.st.borrow().size
    }

    /// Bytes accepted but not yet handed to the sink.
    pub fn buffered(&self) -> usize {
        let st = self.out.st.borrow();
        st.buf.len() + st.zc.len()
    }

    /// Buffered write of a copy of `data`.
    pub fn write(&self, data: &[u8]) -> Deferred<()> {
        let out = &self.out;
        let mut st = out.st.borrow_mut();
        if st.closed {
            return Deferred::failed(ReactorError::StreamClosed);
        }
        if !st.zc.is_empty() {
            drop(st);
            invariant_violation("buffered write on an output stream holding zero-copy data");
        }
        let n = data.len();
        let size = st.size;
        let end = st.buf.len();
        let bulk_threshold = if end > 0 { 2 * size - end } else { size };

        if n >= bulk_threshold {
            let trim = st.trim_to_size;
            let (first, rest) = if end > 0 {
                let now = size - end;
                st.buf.extend_from_slice(&data[..now]);
                (Some(take_buf(&mut st.buf)), Bytes::copy_from_slice(&data[now..]))
            } else {
                (None, Bytes::copy_from_slice(data))
            };
            drop(st);
            let me = out.clone();
            let send_rest = move || if trim { me.split_and_put(rest) } else { me.put(rest) };
            return match first {
                Some(b) => out.put(b).then(move |()| send_rest()),
                None => send_rest(),
            };
        }

        let now = n.min(size - end);
        if st.buf.capacity() == 0 {
            st.buf.reserve(size);
        }
        st.buf.extend_from_slice(&data[..now]);
        if now == n {
            return Deferred::ready(());
        }
        let mut next = BytesMut::with_capacity(size);
        next.extend_from_slice(&data[now..]);
        let full = std::mem::replace(&mut st.buf, next).freeze();
        drop(st);
        out.put(full)
    }

    /// Zero-copy write of one buffer.
    pub fn write_bytes(&self, buf: Bytes) -> Deferred<()> {
        self.write_chain(Packet::from(buf))
    }

    /// Zero-copy write of a fragment chain. Chains are held until they
    /// reach the buffer size or the stream is flushed.
    pub fn write_chain(&self, packet: Packet) -> Deferred<()> {
        if packet.is_empty() {
            return Deferred::ready(());
        }
        let mut st = self.out.st.borrow_mut();
        if st.closed {
            return Deferred::failed(ReactorError::StreamClosed);
        }
        if !st.buf.is_empty() {
            drop(st);
            invariant_violation("zero-copy write on an output stream holding buffered data");
        }
        st.zc.append(packet);
        if st.zc.len() >= st.size {
            let chain = std::mem::take(&mut st.zc);
            drop(st);
            return self.out.zero_copy_put(chain);
        }
        Deferred::ready(())
    }

    /// Hand buffered data to the sink and flush it. With nothing buffered
    /// this completes at once.
    pub fn flush(&self) -> Deferred<()> {
        if self.out.st.borrow().closed {
            return Deferred::failed(ReactorError::StreamClosed);
        }
        self.out.flush()
    }

    /// Final flush, wait for any batched flush, then close the sink. The
    /// first error seen wins; the sink is closed regardless.
    pub fn close(&self) -> Deferred<()> {
        {
            let mut st = self.out.st.borrow_mut();
            if st.closed {
                drop(st);
                invariant_violation("output stream closed twice");
            }
            st.closed = true;
        }
        let (waiter, reporter, closer) = (self.out.clone(), self.out.clone(), self.out.clone());
        self.out
            .flush()
            .then_result(move |r| waiter.batch_done().then_result(move |_| Deferred::from_result(r)))
            .then(move |()| match reporter.st.borrow_mut().error.take() {
                Some(e) => Deferred::failed(e),
                None => Deferred::ready(()),
            })
            .then_result(move |r| {
                let closing = closer.sink.borrow_mut().close();
                closing.then_result(move |c| Deferred::from_result(r.and(c)))
            })
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        let Ok(st) = self.out.st.try_borrow() else {
            return;
        };
        let unflushed = !st.buf.is_empty() || !st.zc.is_empty();
        if unflushed && !st.closed && !std::thread::panicking() {
            drop(st);
            invariant_violation("output stream dropped with unflushed data");
        }
    }
}

impl std::fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.out.st.borrow();
        f.debug_struct("OutputStream")
            .field("size", &st.size)
            .field("buffered", &st.buf.len())
            .field("zero_copy", &st.zc.len())
            .field("closed", &st.closed)
            .finish()
    }
}

fn take_buf(buf: &mut BytesMut) -> Bytes {
    std::mem::take(buf).freeze()
}

impl Out {
    fn flush(self: &Rc<Self>) -> Deferred<()> {
        let mut st = self.st.borrow_mut();
        let Some(batch) = st.batch.clone() else {
            let pending = if !st.buf.is_empty() {
                Pending::Buf(take_buf(&mut st.buf))
            } else if !st.zc.is_empty() {
                Pending::Chain(std::mem::take(&mut st.zc))
            } else {
                return Deferred::ready(());
            };
            drop(st);
            let me = self.clone();
            let sent = match pending {
                Pending::Buf(b) => self.put(b),
                Pending::Chain(p) => self.zero_copy_put(p),
            };
            return sent.then(move |()| me.sink.borrow_mut().flush());
        };

        if let Some(e) = st.error.take() {
            return Deferred::failed(e);
        }
        st.flush = true;
        if !st.in_batch {
            st.in_batch = true;
            drop(st);
            let me = self.clone();
            batch.add(Box::new(move || me.poll_flush()));
        }
        Deferred::ready(())
    }

    /// Runs from the batch-flush poller.
    fn poll_flush(self: &Rc<Self>) {
        let pending = {
            let mut st = self.st.borrow_mut();
            if !st.flush {
                // Cancelled by a write, or nothing more was asked for.
                st.flushing = false;
                st.in_batch = false;
                let waiters = std::mem::take(&mut st.batch_waiters);
                drop(st);
                for p in waiters {
                    p.set_value(());
                }
                return;
            }
            st.flush = false;
            if !st.buf.is_empty() {
                st.flushing = true;
                Some(Pending::Buf(take_buf(&mut st.buf)))
            } else if !st.zc.is_empty() {
                st.flushing = true;
                Some(Pending::Chain(std::mem::take(&mut st.zc)))
            } else {
                None
            }
        };

        let sent = match pending {
            Some(Pending::Buf(b)) => self.sink.borrow_mut().put(b),
            Some(Pending::Chain(p)) => self.sink.borrow_mut().put_many(p),
            None => Deferred::ready(()),
        };
        let (flusher, me) = (self.clone(), self.clone());
        sent.then(move |()| flusher.sink.borrow_mut().flush()).on_complete(move |r| {
            if let Err(e) = r {
                let mut st = me.st.borrow_mut();
                if st.error.is_none() {
                    st.error = Some(e);
                }
            }
            // flush() may have been called again meanwhile
            me.poll_flush();
        });
    }

    /// Resolves when no batched flush is pending or running.
    fn batch_done(&self) -> Deferred<()> {
        let mut st = self.st.borrow_mut();
        if !st.in_batch {
            return Deferred::ready(());
        }
        let (p, d) = promise();
        st.batch_waiters.push(p);
        d
    }

    fn put(self: &Rc<Self>, buf: Bytes) -> Deferred<()> {
        if self.cancel_batched_flush() {
            let me = self.clone();
            return self.batch_done().then(move |()| me.sink.borrow_mut().put(buf));
        }
        self.sink.borrow_mut().put(buf)
    }

    fn zero_copy_put(self: &Rc<Self>, packet: Packet) -> Deferred<()> {
        if self.cancel_batched_flush() {
            let me = self.clone();
            return self.batch_done().then(move |()| me.sink.borrow_mut().put_many(packet));
        }
        self.sink.borrow_mut().put_many(packet)
    }

    /// A direct put supersedes a batched flush that has not started.
    /// Returns whether one is running, in which case the put must wait.
    fn cancel_batched_flush(&self) -> bool {
        let mut st = self.st.borrow_mut();
        st.flush = false;
        st.flushing
    }

    /// Send `buf` in buffer-sized pieces and keep the tail buffered.
    fn split_and_put(self: &Rc<Self>, buf: Bytes) -> Deferred<()> {
        let me = self.clone();
        let mut rest = buf;
        repeat(move || {
            let size = me.st.borrow().size;
            if rest.len() < size {
                let mut st = me.st.borrow_mut();
                st.buf.reserve(size);
                st.buf.extend_from_slice(&rest);
                rest.clear();
                return Deferred::ready(Iteration::Stop);
            }
            let chunk = rest.split_to(size);
            me.put(chunk).map(|()| Iteration::Continue)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smp::run_test;
    use crate::stream::MemorySink;

    fn resolved(mut d: Deferred<()>) {
        assert!(matches!(d.try_take(), Some(Ok(()))));
    }

    #[test]
    fn test_small_writes_coalesce_into_one_flush() {
        let sink = MemorySink::new(512);
        let log = sink.log();
        let out = OutputStream::new(sink);
        resolved(out.write(&[1u8; 100]));
        resolved(out.write(&[2u8; 100]));
        resolved(out.write(&[3u8; 1]));
        assert!(log.borrow().puts.is_empty());
        resolved(out.flush());
        {
            let log = log.borrow();
            assert_eq!(log.puts.len(), 1);
            assert_eq!(log.puts[0].len(), 201);
            assert_eq!(log.flushes, 1);
        }
        resolved(out.close());
        assert!(log.borrow().closed);
    }

    #[test]
    fn test_empty_flush_is_a_noop() {
        let sink = MemorySink::new(512);
        let log = sink.log();
        let out = OutputStream::new(sink);
        resolved(out.flush());
        assert_eq!(log.borrow().flushes, 0);
        assert!(log.borrow().puts.is_empty());
        resolved(out.close());
    }

    #[test]
    fn test_large_write_bypasses_buffer() {
        let sink = MemorySink::new(64);
        let log = sink.log();
        let out = OutputStream::new(sink);
        resolved(out.write(&[9u8; 10]));
        // 10 buffered + 200 written: top up to 64, then the rest goes direct.
        resolved(out.write(&[8u8; 200]));
        {
            let log = log.borrow();
            assert_eq!(log.puts.iter().map(|b| b.len()).collect::<Vec<_>>(), vec![64, 146]);
        }
        assert_eq!(out.buffered(), 0);
        resolved(out.close());
        assert_eq!(log.borrow().contents().len(), 210);
    }

    #[test]
    fn test_overflowing_write_swaps_buffers() {
        let sink = MemorySink::new(64);
        let log = sink.log();
        let out = OutputStream::new(sink);
        resolved(out.write(&[1u8; 50]));
        resolved(out.write(&[2u8; 30]));
        assert_eq!(log.borrow().puts.len(), 1);
        assert_eq!(log.borrow().puts[0].len(), 64);
        assert_eq!(out.buffered(), 16);
        resolved(out.close());
        assert_eq!(log.borrow().contents().len(), 80);
    }

    #[test]
    fn test_trim_to_size_splits_bulk_writes() {
        let sink = MemorySink::new(64);
        let log = sink.log();
        let out = OutputStream::new(sink).trim_to_size(true);
        resolved(out.write(&[5u8; 200]));
        assert_eq!(log.borrow().puts.iter().map(|b| b.len()).collect::<Vec<_>>(), vec![64, 64, 64]);
        assert_eq!(out.buffered(), 8);
        resolved(out.close());
        assert_eq!(log.borrow().puts.last().map(|b| b.len()), Some(8));
    }

    #[test]
    fn test_zero_copy_chain_held_until_full() {
        let sink = MemorySink::new(16);
        let log = sink.log();
        let out = OutputStream::new(sink);
        resolved(out.write_bytes(Bytes::from_static(b"hello ")));
        assert_eq!(log.borrow().chains, 0);
        resolved(out.write_chain(Packet::from("world, again")));
        assert_eq!(log.borrow().chains, 1);
        assert_eq!(log.borrow().contents(), b"hello world, again".to_vec());
        resolved(out.close());
    }

    #[test]
    fn test_close_reports_flush_error_and_closes() {
        let sink = MemorySink::new(64).fail_flush(ReactorError::Os(libc::EIO));
        let log = sink.log();
        let out = OutputStream::new(sink);
        resolved(out.write(b"data"));
        let mut closing = out.close();
        assert_eq!(closing.try_take(), Some(Err(ReactorError::Os(libc::EIO))));
        assert!(log.borrow().closed);
    }

    #[test]
    fn test_write_after_close_fails() {
        let out = OutputStream::new(MemorySink::new(64));
        resolved(out.close());
        let mut d = out.write(b"late");
        assert_eq!(d.try_take(), Some(Err(ReactorError::StreamClosed)));
    }

    #[test]
    #[should_panic]
    fn test_double_close_panics() {
        let out = OutputStream::new(MemorySink::new(64));
        resolved(out.close());
        let _ = out.close();
    }

    #[test]
    #[should_panic]
    fn test_mixing_write_kinds_panics() {
        let out = OutputStream::new(MemorySink::new(64));
        resolved(out.write(b"buffered"));
        let _ = out.write_bytes(Bytes::from_static(b"direct"));
    }

    #[test]
    #[should_panic]
    fn test_drop_with_unflushed_data_panics() {
        let out = OutputStream::new(MemorySink::new(64));
        resolved(out.write(b"lost"));
        drop(out);
    }

    #[test]
    fn test_batched_flushes_coalesce() {
        let code = run_test(1, || {
            let sink = MemorySink::new(512);
            let log = sink.log();
            let out = Rc::new(OutputStream::new(sink).batch_flushes(true));
            let mut steps = Vec::new();
            for i in 0..3u8 {
                steps.push(out.write(&[i; 10]));
                steps.push(out.flush());
            }
            // Nothing reaches the sink until the poller runs.
            let deferred = log.borrow().puts.is_empty() && out.buffered() == 30;
            reactor_core::when_all(steps).then(move |_| out.close()).map(move |()| {
                let l = log.borrow();
                let coalesced = l.puts.len() == 1 && l.puts[0].len() == 30 && l.flushes == 1 && l.closed;
                if deferred && coalesced {
                    0
                } else {
                    1
                }
            })
        });
        assert_eq!(code, 0);
    }
}
