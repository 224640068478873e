//! Buffered input stream
//!
//! Holds at most one chunk from the source. Reads are served from it by
//! handing out the whole chunk or a zero-copy slice of its head; only
//! `read_exactly` across a chunk boundary copies. End of stream is sticky.

use super::DataSource;
use bytes::{Buf, Bytes, BytesMut};
use reactor_core::{repeat, Deferred, Iteration, ReactorError};
use std::cell::RefCell;
use std::rc::Rc;

/// Verdict of a [`consume`](InputStream::consume) visitor on one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Consumption {
    /// Took the whole chunk; send more.
    Continue,
    /// Finished. The bytes it did not take go back to the stream.
    Stop(Bytes),
}

/// One step of an incremental parser fed from a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStep {
    /// Everything given was taken; the message is not complete yet.
    NeedMore,
    /// A message ended after this many bytes of the last input.
    Done(usize),
    Error,
}

/// Incremental parser boundary. `eof` is set once the stream has no more
/// input beyond `data`.
pub trait StreamParser {
    fn feed(&mut self, data: &[u8], eof: bool) -> ParseStep;
}

pub struct InputStream {
    inp: Rc<In>,
}

struct In {
    source: RefCell<Box<dyn DataSource>>,
    st: RefCell<InState>,
}

#[derive(Default)]
struct InState {
    buf: Bytes,
    eof: bool,
}

impl InputStream {
    pub fn new(source: impl DataSource + 'static) -> Self {
        Self {
            inp: Rc::new(In { source: RefCell::new(Box::new(source)), st: RefCell::new(InState::default()) }),
        }
    }

    /// End of stream has been seen.
    pub fn eof(&self) -> bool {
        self.inp.st.borrow().eof
    }

    /// Bytes buffered and not yet handed out.
    pub fn available(&self) -> usize {
        self.inp.st.borrow().buf.len()
    }

    /// Next chunk of whatever size; empty at end of stream.
    pub fn read(&self) -> Deferred<Bytes> {
        let mut st = self.inp.st.borrow_mut();
        if !st.buf.is_empty() {
            return Deferred::ready(std::mem::take(&mut st.buf));
        }
        if st.eof {
            return Deferred::ready(Bytes::new());
        }
        drop(st);
        let me = self.inp.clone();
        self.inp.get().map(move |b| {
            if b.is_empty() {
                me.st.borrow_mut().eof = true;
            }
            b
        })
    }

    /// At most `n` bytes; empty only at end of stream.
    pub fn read_up_to(&self, n: usize) -> Deferred<Bytes> {
        self.inp.read_up_to(n)
    }

    /// Exactly `n` bytes. Ending cleanly before the first byte yields an
    /// empty buffer; ending part way fails with `UnexpectedEof`.
    pub fn read_exactly(&self, n: usize) -> Deferred<Bytes> {
        self.inp.read_exactly(n)
    }

    pub fn skip(&self, n: u64) -> Deferred<()> {
        let mut st = self.inp.st.borrow_mut();
        let now = (st.buf.len() as u64).min(n);
        st.buf.advance(now as usize);
        let left = n - now;
        if left == 0 {
            return Deferred::ready(());
        }
        drop(st);
        let me = self.inp.clone();
        let skipping = self.inp.source.borrow_mut().skip(left);
        skipping.map(move |rest| me.st.borrow_mut().buf = rest)
    }

    /// Hand chunks to `visitor` until it stops or the stream ends. At end
    /// of stream it gets one empty chunk.
    pub fn consume<V>(&self, visitor: V) -> Deferred<()>
    where
        V: FnMut(Bytes) -> Deferred<Consumption> + 'static,
    {
        self.inp.consume(visitor)
    }

    /// Drive `parser` until it completes a message; bytes past the message
    /// stay in the stream. Resolves with the parser so the caller can take
    /// the result out of it.
    pub fn consume_parser<P>(&self, parser: P) -> Deferred<P>
    where
        P: StreamParser + 'static,
    {
        let slot = Rc::new(RefCell::new(Some(parser)));
        let (feeding, result) = (slot.clone(), slot);
        let me = self.inp.clone();
        self.inp
            .consume(move |chunk| {
                let eof = me.st.borrow().eof;
                let mut p = feeding.borrow_mut();
                let Some(parser) = p.as_mut() else {
                    return Deferred::failed(ReactorError::InvalidArgument("parser already taken"));
                };
                match parser.feed(&chunk, eof) {
                    ParseStep::NeedMore => Deferred::ready(Consumption::Continue),
                    ParseStep::Done(used) => Deferred::ready(Consumption::Stop(chunk.slice(used.min(chunk.len())..))),
                    ParseStep::Error => Deferred::failed(ReactorError::InvalidArgument("malformed stream input")),
                }
            })
            .then(move |()| match result.borrow_mut().take() {
                Some(p) => Deferred::ready(p),
                None => Deferred::failed(ReactorError::InvalidArgument("parser already taken")),
            })
    }

    pub fn close(&self) -> Deferred<()> {
        self.inp.source.borrow_mut().close()
    }
}

impl std::fmt::Debug for InputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inp.st.borrow();
        f.debug_struct("InputStream").field("available", &st.buf.len()).field("eof", &st.eof).finish()
    }
}

impl In {
    fn get(&self) -> Deferred<Bytes> {
        self.source.borrow_mut().get()
    }

    fn read_up_to(self: &Rc<Self>, n: usize) -> Deferred<Bytes> {
        let mut st = self.st.borrow_mut();
        if st.buf.is_empty() {
            if st.eof {
                return Deferred::ready(Bytes::new());
            }
            drop(st);
            let me = self.clone();
            return self.get().then(move |b| {
                {
                    let mut st = me.st.borrow_mut();
                    st.eof = b.is_empty();
                    st.buf = b;
                }
                me.read_up_to(n)
            });
        }
        if st.buf.len() <= n {
            Deferred::ready(std::mem::take(&mut st.buf))
        } else {
            Deferred::ready(st.buf.split_to(n))
        }
    }

    fn read_exactly(self: &Rc<Self>, n: usize) -> Deferred<Bytes> {
        let mut st = self.st.borrow_mut();
        if st.buf.len() == n {
            return Deferred::ready(std::mem::take(&mut st.buf));
        }
        if st.buf.len() > n {
            return Deferred::ready(st.buf.split_to(n));
        }
        if st.buf.is_empty() {
            if st.eof {
                return Deferred::ready(Bytes::new());
            }
            drop(st);
            let me = self.clone();
            return self.get().then(move |b| {
                if b.is_empty() {
                    me.st.borrow_mut().eof = true;
                    return Deferred::ready(b);
                }
                me.st.borrow_mut().buf = b;
                me.read_exactly(n)
            });
        }

        // Straddles chunks: copy into one buffer.
        let mut acc = BytesMut::with_capacity(n);
        acc.extend_from_slice(&std::mem::take(&mut st.buf));
        drop(st);
        let acc = Rc::new(RefCell::new(acc));
        let (filling, done) = (acc.clone(), acc);
        let me = self.clone();
        repeat(move || {
            if filling.borrow().len() >= n {
                return Deferred::ready(Iteration::Stop);
            }
            let (m, acc) = (me.clone(), filling.clone());
            me.get().then(move |b| {
                let mut acc = acc.borrow_mut();
                if b.is_empty() {
                    m.st.borrow_mut().eof = true;
                    return Deferred::failed(ReactorError::UnexpectedEof { wanted: n as u64, got: acc.len() as u64 });
                }
                let need = n - acc.len();
                if b.len() > need {
                    acc.extend_from_slice(&b[..need]);
                    m.st.borrow_mut().buf = b.slice(need..);
                } else {
                    acc.extend_from_slice(&b);
                }
                Deferred::ready(Iteration::Continue)
            })
        })
        .map(move |()| std::mem::take(&mut *done.borrow_mut()).freeze())
    }

    fn consume<V>(self: &Rc<Self>, mut visitor: V) -> Deferred<()>
    where
        V: FnMut(Bytes) -> Deferred<Consumption> + 'static,
    {
        let me = self.clone();
        repeat(move || {
            let chunk = {
                let mut st = me.st.borrow_mut();
                if st.buf.is_empty() && !st.eof {
                    drop(st);
                    let m = me.clone();
                    return me.get().map(move |b| {
                        let mut st = m.st.borrow_mut();
                        st.eof = b.is_empty();
                        st.buf = b;
                        Iteration::Continue
                    });
                }
                std::mem::take(&mut st.buf)
            };
            let m = me.clone();
            visitor(chunk).map(move |c| match c {
                Consumption::Stop(rest) => {
                    m.st.borrow_mut().buf = rest;
                    Iteration::Stop
                }
                Consumption::Continue if m.st.borrow().eof => Iteration::Stop,
                Consumption::Continue => Iteration::Continue,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemorySource;

    fn take<T>(mut d: Deferred<T>) -> reactor_core::Result<T> {
        d.try_take().expect("deferred not ready")
    }

    fn stream(data: &[u8], chunk: usize) -> InputStream {
        InputStream::new(MemorySource::chunked(data, chunk))
    }

    #[test]
    fn test_read_hands_out_chunks_then_sticky_eof() {
        let input = stream(b"hello world", 5);
        assert_eq!(&take(input.read()).unwrap()[..], b"hello");
        assert_eq!(&take(input.read()).unwrap()[..], b" worl");
        assert_eq!(&take(input.read()).unwrap()[..], b"d");
        assert!(!input.eof());
        assert!(take(input.read()).unwrap().is_empty());
        assert!(input.eof());
        assert!(take(input.read()).unwrap().is_empty());
    }

    #[test]
    fn test_read_exactly_shares_and_copies() {
        let input = stream(b"abcdefghij", 4);
        // Within one chunk: a slice of it.
        assert_eq!(&take(input.read_exactly(2)).unwrap()[..], b"ab");
        // Across three chunks.
        assert_eq!(&take(input.read_exactly(7)).unwrap()[..], b"cdefghi");
        assert_eq!(input.available(), 1);
        assert_eq!(&take(input.read_exactly(1)).unwrap()[..], b"j");
        // Clean end of stream.
        assert!(take(input.read_exactly(4)).unwrap().is_empty());
        assert!(input.eof());
    }

    #[test]
    fn test_read_exactly_short_stream_fails() {
        let input = stream(b"abcdef", 4);
        assert_eq!(&take(input.read_exactly(2)).unwrap()[..], b"ab");
        assert_eq!(take(input.read_exactly(10)), Err(ReactorError::UnexpectedEof { wanted: 10, got: 4 }));
    }

    #[test]
    fn test_read_up_to_splits_chunk() {
        let input = stream(b"abcdefgh", 8);
        assert_eq!(&take(input.read_up_to(3)).unwrap()[..], b"abc");
        assert_eq!(&take(input.read_up_to(100)).unwrap()[..], b"defgh");
        assert!(take(input.read_up_to(3)).unwrap().is_empty());
        assert!(input.eof());
    }

    #[test]
    fn test_skip_spans_buffer_and_source() {
        let input = stream(b"0123456789", 3);
        assert_eq!(&take(input.read_up_to(1)).unwrap()[..], b"0");
        take(input.skip(5)).unwrap();
        assert_eq!(&take(input.read()).unwrap()[..], b"678");
        assert_eq!(&take(input.read()).unwrap()[..], b"9");
    }

    #[test]
    fn test_consume_returns_remainder() {
        let input = stream(b"key=value;rest", 4);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        take(input.consume(move |chunk| {
            let mut s = s.borrow_mut();
            match chunk.iter().position(|&b| b == b';') {
                Some(i) => {
                    s.extend_from_slice(&chunk[..i]);
                    Deferred::ready(Consumption::Stop(chunk.slice(i + 1..)))
                }
                None => {
                    s.extend_from_slice(&chunk);
                    Deferred::ready(Consumption::Continue)
                }
            }
        }))
        .unwrap();
        assert_eq!(&seen.borrow()[..], b"key=value");
        assert_eq!(&take(input.read_exactly(4)).unwrap()[..], b"rest");
    }

    /// Counts lines; done at the first blank line.
    #[derive(Default)]
    struct HeaderParser {
        lines: usize,
        at_line_start: bool,
        saw_eof: bool,
    }

    impl StreamParser for HeaderParser {
        fn feed(&mut self, data: &[u8], eof: bool) -> ParseStep {
            for (i, &b) in data.iter().enumerate() {
                if b == b'\n' {
                    if self.at_line_start {
                        return ParseStep::Done(i + 1);
                    }
                    self.lines += 1;
                    self.at_line_start = true;
                } else if b == 0 {
                    return ParseStep::Error;
                } else {
                    self.at_line_start = false;
                }
            }
            self.saw_eof = eof;
            ParseStep::NeedMore
        }
    }

    #[test]
    fn test_consume_parser_stops_at_message_end() {
        let input = stream(b"a: 1\nb: 2\n\nbody", 3);
        let p = take(input.consume_parser(HeaderParser { at_line_start: true, ..Default::default() })).unwrap();
        assert_eq!(p.lines, 2);
        assert_eq!(&take(input.read_exactly(4)).unwrap()[..], b"body");
    }

    #[test]
    fn test_consume_parser_sees_eof_and_errors() {
        let input = stream(b"partial", 4);
        let p = take(input.consume_parser(HeaderParser::default())).unwrap();
        assert!(p.saw_eof);
        assert!(input.eof());

        let bad = stream(b"x\0y", 8);
        assert!(matches!(take(bad.consume_parser(HeaderParser::default())), Err(ReactorError::InvalidArgument(_))));
    }
}
