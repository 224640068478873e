//! Disk I/O submission backends
//!
//! A backend turns an [`IoRequest`] into a deferred [`IoCompletion`]. The
//! shard drives it from two pollers: one calls [`IoBackend::reap`] for
//! finished requests, the other [`IoBackend::flush`] for batched
//! submissions.

use super::dma::DmaBuffer;
use crate::syscall::SyscallPool;
use crate::platform_linux::{check, check_size};
use reactor_core::{Deferred, Result};
use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

/// What a request does.
#[derive(Debug)]
pub enum IoOp {
    /// Fill `buf` from the file
    Read { buf: DmaBuffer },
    /// Write all of `buf`
    Write { buf: DmaBuffer },
    Fdatasync,
}

/// One positional disk request.
#[derive(Debug)]
pub struct IoRequest {
    pub fd: RawFd,
    pub pos: u64,
    pub op: IoOp,
}

impl IoRequest {
    pub fn read(fd: RawFd, pos: u64, buf: DmaBuffer) -> Self {
        Self { fd, pos, op: IoOp::Read { buf } }
    }

    pub fn write(fd: RawFd, pos: u64, buf: DmaBuffer) -> Self {
        Self { fd, pos, op: IoOp::Write { buf } }
    }

    pub fn fdatasync(fd: RawFd) -> Self {
        Self { fd, pos: 0, op: IoOp::Fdatasync }
    }

    /// Bytes moved by the request.
    pub fn len(&self) -> usize {
        match &self.op {
            IoOp::Read { buf } | IoOp::Write { buf } => buf.len(),
            IoOp::Fdatasync => 0,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self.op, IoOp::Write { .. })
    }

    fn into_buf(self) -> Option<DmaBuffer> {
        match self.op {
            IoOp::Read { buf } | IoOp::Write { buf } => Some(buf),
            IoOp::Fdatasync => None,
        }
    }
}

/// Result of a finished request; the buffer comes back to the caller.
#[derive(Debug)]
pub struct IoCompletion {
    pub res: usize,
    pub buf: Option<DmaBuffer>,
}

pub trait IoBackend {
    fn name(&self) -> &'static str;

    /// Start `req`. The buffer stays owned by the backend until completion.
    fn submit(self: Rc<Self>, req: IoRequest) -> Deferred<IoCompletion>;

    /// Push batched submissions to the kernel. Returns true if any went out.
    fn flush(&self) -> bool {
        false
    }

    /// Resolve finished requests. Returns true if any completed.
    fn reap(&self) -> bool {
        false
    }

    fn in_flight(&self) -> usize;

    /// Whether completions wake a sleeping shard on their own.
    fn can_sleep(&self) -> bool {
        true
    }
}

/// Run one request with plain blocking calls.
pub(crate) fn execute_blocking(mut req: IoRequest) -> Result<IoCompletion> {
    let (fd, pos) = (req.fd, req.pos);
    let res = match &mut req.op {
        // SAFETY: the buffer is owned by `req` for the duration of the call.
        IoOp::Read { buf } => check_size(unsafe {
            libc::pread(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), pos as libc::off_t)
        })?,
        // SAFETY: as above.
        IoOp::Write { buf } => check_size(unsafe {
            libc::pwrite(fd, buf.as_ptr() as *const libc::c_void, buf.len(), pos as libc::off_t)
        })?,
        // SAFETY: plain syscall on a caller-owned fd.
        IoOp::Fdatasync => check(unsafe { libc::fdatasync(fd) })? as usize,
    };
    Ok(IoCompletion { res, buf: req.into_buf() })
}

/// Fallback backend: pread/pwrite on the shard's syscall thread.
pub struct ThreadedBackend {
    pool: Rc<SyscallPool>,
    in_flight: Rc<Cell<usize>>,
}

impl ThreadedBackend {
    pub fn new(pool: Rc<SyscallPool>) -> Self {
        Self { pool, in_flight: Rc::new(Cell::new(0)) }
    }
}

impl IoBackend for ThreadedBackend {
    fn name(&self) -> &'static str {
        "threaded"
    }

    fn submit(self: Rc<Self>, req: IoRequest) -> Deferred<IoCompletion> {
        self.in_flight.set(self.in_flight.get() + 1);
        let counter = self.in_flight.clone();
        self.pool
            .submit(move || execute_blocking(req))
            .finally(move || counter.set(counter.get() - 1))
    }

    fn in_flight(&self) -> usize {
        self.in_flight.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_execute_blocking_roundtrip() {
        let path = std::env::temp_dir().join(format!("rct-backend-{}", std::process::id()));
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        f.write_all(b"0123456789").unwrap();
        let fd = f.as_raw_fd();
        let done = execute_blocking(IoRequest::read(fd, 4, DmaBuffer::new(4, 512))).unwrap();
        assert_eq!(done.res, 4);
        assert_eq!(done.buf.unwrap().as_slice(), b"4567");
        let short = execute_blocking(IoRequest::read(fd, 8, DmaBuffer::new(4, 512))).unwrap();
        assert_eq!(short.res, 2);
        let wrote = execute_blocking(IoRequest::write(fd, 10, DmaBuffer::copy_from(b"ab", 1))).unwrap();
        assert_eq!(wrote.res, 2);
        assert_eq!(execute_blocking(IoRequest::fdatasync(fd)).unwrap().res, 0);
        drop(f);
        assert_eq!(std::fs::read(&path).unwrap(), b"0123456789ab");
        std::fs::remove_file(&path).unwrap();
    }
}
