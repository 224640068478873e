//! In-memory sink and source, for tests and for feeding parsers from
//! buffers already in hand.

use super::{DataSink, DataSource, Packet, DEFAULT_BUFFER_SIZE};
use bytes::{Buf, Bytes, BytesMut};
use reactor_core::{Deferred, ReactorError};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// What a [`MemorySink`] was asked to do.
#[derive(Debug, Default, Clone)]
pub struct SinkLog {
    /// Every put, chains linearized
    pub puts: Vec<Bytes>,
    /// How many of `puts` came in as chains
    pub chains: usize,
    pub flushes: usize,
    pub closed: bool,
}

impl SinkLog {
    pub fn contents(&self) -> Vec<u8> {
        self.puts.iter().flat_map(|b| b.iter().copied()).collect()
    }
}

pub struct MemorySink {
    log: Rc<RefCell<SinkLog>>,
    buffer_size: usize,
    fail_flush: Option<ReactorError>,
}

impl MemorySink {
    pub fn new(buffer_size: usize) -> Self {
        Self { log: Rc::default(), buffer_size, fail_flush: None }
    }

    /// Shared view of the sink's history; stays valid after the sink is
    /// gone.
    pub fn log(&self) -> Rc<RefCell<SinkLog>> {
        self.log.clone()
    }

    /// Make every flush fail with `err`.
    pub fn fail_flush(mut self, err: ReactorError) -> Self {
        self.fail_flush = Some(err);
        self
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl DataSink for MemorySink {
    fn put(&mut self, buf: Bytes) -> Deferred<()> {
        self.log.borrow_mut().puts.push(buf);
        Deferred::ready(())
    }

    fn put_many(&mut self, packet: Packet) -> Deferred<()> {
        let mut log = self.log.borrow_mut();
        log.puts.push(packet.linearize());
        log.chains += 1;
        Deferred::ready(())
    }

    fn flush(&mut self) -> Deferred<()> {
        self.log.borrow_mut().flushes += 1;
        match &self.fail_flush {
            Some(e) => Deferred::failed(e.clone()),
            None => Deferred::ready(()),
        }
    }

    fn close(&mut self) -> Deferred<()> {
        self.log.borrow_mut().closed = true;
        Deferred::ready(())
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

/// Hands out preset chunks, then end of stream.
#[derive(Debug, Default)]
pub struct MemorySource {
    chunks: VecDeque<Bytes>,
}

impl MemorySource {
    pub fn new(chunks: impl IntoIterator<Item = Bytes>) -> Self {
        Self { chunks: chunks.into_iter().filter(|c| !c.is_empty()).collect() }
    }

    /// `data` split into chunks of at most `chunk` bytes.
    pub fn chunked(data: &[u8], chunk: usize) -> Self {
        let chunk = chunk.max(1);
        Self::new(data.chunks(chunk).map(Bytes::copy_from_slice))
    }

    pub fn remaining(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }
}

impl From<&'static str> for MemorySource {
    fn from(s: &'static str) -> Self {
        Self::new([Bytes::from_static(s.as_bytes())])
    }
}

impl From<BytesMut> for MemorySource {
    fn from(b: BytesMut) -> Self {
        Self::new([b.freeze()])
    }
}

impl DataSource for MemorySource {
    fn get(&mut self) -> Deferred<Bytes> {
        Deferred::ready(self.chunks.pop_front().unwrap_or_default())
    }

    fn skip(&mut self, mut n: u64) -> Deferred<Bytes> {
        while let Some(mut front) = self.chunks.pop_front() {
            if (front.len() as u64) > n {
                front.advance(n as usize);
                return Deferred::ready(front);
            }
            n -= front.len() as u64;
        }
        Deferred::ready(Bytes::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn take<T>(mut d: Deferred<T>) -> T {
        match d.try_take() {
            Some(Ok(v)) => v,
            other => panic!("not ready: {:?}", other.map(|r| r.err())),
        }
    }

    #[test]
    fn test_source_chunks_then_eof() {
        let mut src = MemorySource::chunked(b"abcdefg", 3);
        assert_eq!(src.remaining(), 7);
        assert_eq!(&take(src.get())[..], b"abc");
        assert_eq!(&take(src.get())[..], b"def");
        assert_eq!(&take(src.get())[..], b"g");
        assert!(take(src.get()).is_empty());
    }

    #[test]
    fn test_source_skip_returns_tail() {
        let mut src = MemorySource::chunked(b"abcdefg", 3);
        assert_eq!(&take(src.skip(4))[..], b"ef");
        assert_eq!(&take(src.get())[..], b"g");
        assert!(take(src.skip(10)).is_empty());
    }

    #[test]
    fn test_sink_log_survives_sink() {
        let mut sink = MemorySink::new(16);
        let log = sink.log();
        take(sink.put(Bytes::from_static(b"ab")));
        take(sink.put_many(Packet::from("cd")));
        take(sink.close());
        drop(sink);
        let log = log.borrow();
        assert_eq!(log.contents(), b"abcd".to_vec());
        assert_eq!(log.chains, 1);
        assert!(log.closed);
    }
}
