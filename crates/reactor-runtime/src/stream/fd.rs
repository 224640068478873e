//! Streams over non-blocking descriptors (sockets, pipes)
//!
//! Every call is tried at once; on EAGAIN the shard's epoll set is asked
//! to wake the caller when the descriptor turns ready and the call is
//! retried.

use super::{DataSink, DataSource, Packet, DEFAULT_BUFFER_SIZE};
use crate::platform_linux::{check, check_size, set_nonblocking};
use crate::shard;
use bytes::{Buf, Bytes, BytesMut};
use reactor_core::{Deferred, ReactorError, Result};
use std::cell::Cell;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;

/// Upper bound on iovecs per writev call.
const MAX_IOV: usize = 1024;

/// A non-blocking descriptor driven by the shard's epoll set.
#[derive(Debug)]
pub struct PollableFd {
    fd: OwnedFd,
    socket: bool,
    read_shut: Cell<bool>,
}

impl PollableFd {
    /// Take over `fd` and make it non-blocking.
    pub fn new(fd: OwnedFd) -> Result<Rc<Self>> {
        Self::with_kind(fd, false)
    }

    /// Like [`new`](Self::new) for a socket; writes use `MSG_NOSIGNAL` so a
    /// reset peer shows up as EPIPE rather than SIGPIPE.
    pub fn socket(fd: OwnedFd) -> Result<Rc<Self>> {
        Self::with_kind(fd, true)
    }

    fn with_kind(fd: OwnedFd, socket: bool) -> Result<Rc<Self>> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Rc::new(Self { fd, socket, read_shut: Cell::new(false) }))
    }

    pub fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn is_socket(&self) -> bool {
        self.socket
    }

    /// Read whatever is available, up to `max` bytes. Empty means end of
    /// stream.
    pub fn read_some(self: &Rc<Self>, max: usize) -> Deferred<Bytes> {
        if self.read_shut.get() {
            return Deferred::ready(Bytes::new());
        }
        let mut buf = BytesMut::zeroed(max);
        loop {
            // SAFETY: buf is valid for max bytes.
            let r = check_size(unsafe { libc::read(self.raw(), buf.as_mut_ptr().cast(), max) });
            match r {
                Ok(n) => {
                    buf.truncate(n);
                    return Deferred::ready(buf.freeze());
                }
                Err(ReactorError::Os(libc::EINTR)) => continue,
                Err(ReactorError::Os(libc::EAGAIN)) => {
                    let me = self.clone();
                    return shard::local().readable(self.raw()).then(move |()| me.read_some(max));
                }
                Err(e) => return Deferred::failed(e),
            }
        }
    }

    /// Write all of `packet`, waiting for room as needed.
    pub fn write_all(self: &Rc<Self>, mut packet: Packet) -> Deferred<()> {
        loop {
            if packet.is_empty() {
                return Deferred::ready(());
            }
            let iov: Vec<libc::iovec> = packet
                .fragments()
                .take(MAX_IOV)
                .map(|f| libc::iovec { iov_base: f.as_ptr() as *mut libc::c_void, iov_len: f.len() })
                .collect();
            match self.writev(&iov) {
                Ok(n) => packet.trim_front(n),
                Err(ReactorError::Os(libc::EINTR)) => continue,
                Err(ReactorError::Os(libc::EAGAIN)) => {
                    let me = self.clone();
                    return shard::local().writeable(self.raw()).then(move |()| me.write_all(packet));
                }
                Err(e) => return Deferred::failed(e),
            }
        }
    }

    fn writev(&self, iov: &[libc::iovec]) -> Result<usize> {
        if self.socket {
            // SAFETY: zeroed msghdr is a valid empty message.
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_iov = iov.as_ptr() as *mut libc::iovec;
            msg.msg_iovlen = iov.len() as _;
            // SAFETY: msg points at iovecs that outlive the call.
            check_size(unsafe { libc::sendmsg(self.raw(), &msg, libc::MSG_NOSIGNAL) })
        } else {
            // SAFETY: iovecs point into live buffers.
            check_size(unsafe { libc::writev(self.raw(), iov.as_ptr(), iov.len() as libc::c_int) })
        }
    }

    /// Shut down one or both directions of a socket.
    pub fn shutdown(&self, how: libc::c_int) -> Result<()> {
        if how == libc::SHUT_RD || how == libc::SHUT_RDWR {
            self.read_shut.set(true);
        }
        // SAFETY: plain syscall on our descriptor.
        check(unsafe { libc::shutdown(self.raw(), how) })?;
        Ok(())
    }
}

impl Drop for PollableFd {
    fn drop(&mut self) {
        // Waiters fail with StreamClosed before the descriptor number can
        // be reused.
        if let Some(r) = shard::try_local() {
            r.forget(self.raw());
        }
    }
}

/// Sink writing to a [`PollableFd`].
pub struct FdSink {
    fd: Rc<PollableFd>,
    buffer_size: usize,
}

impl FdSink {
    pub fn new(fd: Rc<PollableFd>) -> Self {
        Self { fd, buffer_size: DEFAULT_BUFFER_SIZE }
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }
}

impl DataSink for FdSink {
    fn put(&mut self, buf: Bytes) -> Deferred<()> {
        self.fd.write_all(Packet::from(buf))
    }

    fn put_many(&mut self, packet: Packet) -> Deferred<()> {
        self.fd.write_all(packet)
    }

    fn close(&mut self) -> Deferred<()> {
        if self.fd.is_socket() {
            let _ = self.fd.shutdown(libc::SHUT_WR);
        }
        Deferred::ready(())
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

/// Source reading from a [`PollableFd`].
pub struct FdSource {
    fd: Rc<PollableFd>,
    read_size: usize,
}

impl FdSource {
    pub fn new(fd: Rc<PollableFd>) -> Self {
        Self { fd, read_size: DEFAULT_BUFFER_SIZE }
    }

    pub fn read_size(mut self, size: usize) -> Self {
        self.read_size = size.max(1);
        self
    }
}

impl DataSource for FdSource {
    fn get(&mut self) -> Deferred<Bytes> {
        self.fd.read_some(self.read_size)
    }

    fn skip(&mut self, n: u64) -> Deferred<Bytes> {
        let fd = self.fd.clone();
        let size = self.read_size;
        skip_reads(fd, size, n)
    }
}

fn skip_reads(fd: Rc<PollableFd>, size: usize, n: u64) -> Deferred<Bytes> {
    let again = fd.clone();
    fd.read_some(size).then(move |mut b| {
        if b.is_empty() || b.len() as u64 > n {
            b.advance((n as usize).min(b.len()));
            return Deferred::ready(b);
        }
        if b.len() as u64 == n {
            return Deferred::ready(Bytes::new());
        }
        skip_reads(again, size, n - b.len() as u64)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smp::run_test;
    use crate::stream::{InputStream, OutputStream};
    use std::os::unix::io::FromRawFd;

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        // SAFETY: fds has room for two descriptors.
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) }, 0);
        // SAFETY: both descriptors were just created and are owned here.
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn test_pipe_round_trip_through_streams() {
        let code = run_test(1, || {
            let (r, w) = pipe();
            let (r, w) = match (PollableFd::new(r), PollableFd::new(w)) {
                (Ok(r), Ok(w)) => (r, w),
                _ => return Deferred::ready(10),
            };
            let input = Rc::new(InputStream::new(FdSource::new(r).read_size(7)));
            let out = OutputStream::new(FdSink::new(w).with_buffer_size(16));
            // The reader waits on readiness before anything is written.
            let reading = input.read_exactly(40);
            let payload: Vec<u8> = (0..40u8).collect();
            let expect = payload.clone();
            let writing = out.write(&payload).then(move |()| out.flush().then(move |()| out.close()));
            reactor_core::join(reading, writing).map(move |(got, ())| if got[..] == expect[..] { 0 } else { 1 })
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_closed_writer_reads_eof() {
        let code = run_test(1, || {
            let (r, w) = pipe();
            let Ok(r) = PollableFd::new(r) else {
                return Deferred::ready(10);
            };
            let input = Rc::new(InputStream::new(FdSource::new(r)));
            let first = input.clone();
            shard::local()
                .later()
                .map(move |()| drop(w))
                .then(move |()| first.read())
                .map(move |b| if b.is_empty() && input.eof() { 0 } else { 1 })
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_skip_reads_past_source() {
        let code = run_test(1, || {
            let (r, w) = pipe();
            let Ok(r) = PollableFd::new(r) else {
                return Deferred::ready(10);
            };
            // SAFETY: writing a small buffer to a fresh pipe never blocks.
            unsafe { libc::write(w.as_raw_fd(), b"0123456789".as_ptr().cast(), 10) };
            drop(w);
            let input = Rc::new(InputStream::new(FdSource::new(r).read_size(3)));
            let rest = input.clone();
            input.skip(4).then(move |()| rest.read_up_to(100)).map(|b| if &b[..] == b"45" { 0 } else { 1 })
        });
        assert_eq!(code, 0);
    }
}
