//! Reads at arbitrary offsets and lengths
//!
//! The range is widened to the read alignment and read in one request.
//! A short read is topped up with further reads into fresh buffers until
//! the range is covered or the file ends; the result is then trimmed back
//! to what the caller asked for.

use super::File;
use crate::io::{align_up, DmaBuffer, PriorityClass};
use reactor_core::{do_until, Deferred, ReactorError};
use std::cell::RefCell;
use std::rc::Rc;

struct BulkRead {
    buf: DmaBuffer,
    /// Aligned start of the range
    offset: u64,
    /// Bytes before the caller's offset
    front: usize,
    /// Bytes wanted, counted from `offset`
    size: usize,
    filled: usize,
    eof: bool,
    align: u64,
}

impl BulkRead {
    fn done(&self) -> bool {
        self.eof || self.filled >= self.size
    }

    fn cur_offset(&self) -> u64 {
        self.offset + self.filled as u64
    }

    fn left_to_read(&self) -> usize {
        align_up((self.size - self.filled) as u64, self.align) as usize
    }

    fn append(&mut self, data: &[u8]) {
        let space = self.buf.len() - self.filled;
        let n = data.len().min(space);
        self.buf.as_mut_slice()[self.filled..self.filled + n].copy_from_slice(&data[..n]);
        self.filled += n;
    }

    fn finish(&mut self) -> DmaBuffer {
        let mut buf = std::mem::replace(&mut self.buf, DmaBuffer::new(0, 1));
        if self.filled > self.front {
            buf.trim_to(self.filled.min(self.size));
            buf.trim_front(self.front);
        } else {
            buf.trim_to(0);
        }
        buf
    }
}

impl File {
    /// Read `len` bytes at `pos`, neither needing alignment. The result is
    /// shorter only at end of file.
    pub fn dma_read_bulk(&self, pos: u64, len: usize, pc: PriorityClass) -> Deferred<DmaBuffer> {
        let align = self.disk_read_dma_alignment().max(1);
        let front = (pos % align) as usize;
        let offset = pos - front as u64;
        let size = len + front;
        let buf = DmaBuffer::new(align_up(size as u64, align) as usize, self.memory_dma_alignment() as usize);
        let file = self.dup();
        self.inner.read_dma(offset, buf, pc).then(move |(n, buf)| {
            let state = Rc::new(RefCell::new(BulkRead {
                buf,
                offset,
                front,
                size,
                filled: n,
                eof: false,
                align,
            }));
            let (check, step, result) = (state.clone(), state.clone(), state);
            do_until(
                move || check.borrow().done(),
                move || {
                    let (at, want) = {
                        let s = step.borrow();
                        (s.cur_offset(), s.left_to_read())
                    };
                    let st = step.clone();
                    file.read_maybe_eof(at, want, pc).map(move |more| {
                        let mut s = st.borrow_mut();
                        if more.is_empty() {
                            s.eof = true;
                        } else {
                            s.append(more.as_slice());
                        }
                    })
                },
            )
            .map(move |()| result.borrow_mut().finish())
        })
    }

    /// Like [`dma_read_bulk`](Self::dma_read_bulk), but ending early is an
    /// error.
    pub fn dma_read_exactly(&self, pos: u64, len: usize, pc: PriorityClass) -> Deferred<DmaBuffer> {
        self.dma_read_bulk(pos, len, pc).then(move |buf| {
            if buf.len() < len {
                return Deferred::failed(ReactorError::UnexpectedEof { wanted: len as u64, got: buf.len() as u64 });
            }
            Deferred::ready(buf)
        })
    }

    /// One read into a fresh buffer. Reading at an unaligned offset past
    /// end of file fails with EINVAL under O_DIRECT; that counts as EOF.
    fn read_maybe_eof(&self, pos: u64, len: usize, pc: PriorityClass) -> Deferred<DmaBuffer> {
        let align = self.disk_read_dma_alignment().max(1);
        let buf = DmaBuffer::new(align_up(len as u64, align) as usize, self.memory_dma_alignment() as usize);
        self.inner.read_dma(pos, buf, pc).then_result(|r| match r {
            Ok((n, mut buf)) => {
                buf.trim_to(n);
                Deferred::ready(buf)
            }
            Err(ReactorError::Os(libc::EINVAL)) => Deferred::ready(DmaBuffer::new(0, 1)),
            Err(e) => Deferred::failed(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(data_len: usize, front: usize, size: usize) -> BulkRead {
        let mut buf = DmaBuffer::new(align_up(size as u64, 512) as usize, 512);
        for (i, b) in buf.as_mut_slice().iter_mut().enumerate().take(data_len) {
            *b = (i % 251) as u8;
        }
        BulkRead { buf, offset: 0, front, size, filled: data_len, eof: false, align: 512 }
    }

    #[test]
    fn test_finish_trims_both_ends() {
        let mut s = state(1024, 10, 700);
        assert!(s.done());
        let out = s.finish();
        assert_eq!(out.len(), 690);
        assert_eq!(out.as_slice()[0], 10);
    }

    #[test]
    fn test_short_read_continues_aligned() {
        let mut s = state(512, 0, 1500);
        assert!(!s.done());
        assert_eq!(s.cur_offset(), 512);
        assert_eq!(s.left_to_read(), 1024);
        s.append(&[7u8; 300]);
        assert_eq!(s.filled, 812);
        s.eof = true;
        assert!(s.done());
        assert_eq!(s.finish().len(), 812);
    }

    #[test]
    fn test_nothing_past_front_is_empty() {
        let mut s = state(5, 10, 600);
        s.eof = true;
        assert!(s.finish().is_empty());
    }
}
