//! Plain file: DMA reads and writes through the io queue, everything else
//! on the syscall thread

use super::{dir, DmaAlignment, EntryConsumer, FileImpl, FileStat};
use crate::io::{submit_io, DmaBuffer, IoCompletion, IoRequest, PriorityClass};
use crate::platform_linux::check;
use crate::shard;
use crate::syscall::SyscallPool;
use reactor_core::{Deferred, ReactorError, Result};
use std::cell::{Cell, RefCell};
use std::os::unix::io::{IntoRawFd, OwnedFd, RawFd};
use std::rc::Rc;

pub struct PosixFile {
    fd: RefCell<Option<OwnedFd>>,
    raw: RawFd,
    align: DmaAlignment,
    pool: Rc<SyscallPool>,
    bypass_fsync: bool,
    fsyncs: Cell<u64>,
}

impl PosixFile {
    /// Wrap an open descriptor. Must be called on a shard.
    pub fn new(fd: OwnedFd, align: DmaAlignment) -> Self {
        use std::os::unix::io::AsRawFd;
        let reactor = shard::local();
        Self {
            raw: fd.as_raw_fd(),
            fd: RefCell::new(Some(fd)),
            align,
            pool: reactor.syscall().clone(),
            bypass_fsync: reactor.config().bypass_fsync,
            fsyncs: Cell::new(0),
        }
    }

    /// fdatasync calls issued, bypassed ones included.
    pub fn fsyncs(&self) -> u64 {
        self.fsyncs.get()
    }

    pub fn is_closed(&self) -> bool {
        self.fd.borrow().is_none()
    }

    pub(crate) fn pool(&self) -> &Rc<SyscallPool> {
        &self.pool
    }

    fn blocking<T, F>(&self, f: F) -> Deferred<T>
    where
        T: Send + 'static,
        F: FnOnce(RawFd) -> Result<T> + Send + 'static,
    {
        if self.is_closed() {
            return Deferred::failed(ReactorError::Os(libc::EBADF));
        }
        let fd = self.raw;
        self.pool.submit(move || f(fd))
    }
}

fn read_result(c: IoCompletion) -> Result<(usize, DmaBuffer)> {
    match c.buf {
        Some(buf) => Ok((c.res, buf)),
        None => Err(ReactorError::InvalidArgument("read completed without its buffer")),
    }
}

impl FileImpl for PosixFile {
    fn fd(&self) -> RawFd {
        self.raw
    }

    fn alignment(&self) -> DmaAlignment {
        self.align
    }

    fn read_dma(&self, pos: u64, buf: DmaBuffer, pc: PriorityClass) -> Deferred<(usize, DmaBuffer)> {
        submit_io(pc, IoRequest::read(self.raw, pos, buf)).then(|c| Deferred::from_result(read_result(c)))
    }

    fn write_dma(&self, pos: u64, buf: DmaBuffer, pc: PriorityClass) -> Deferred<usize> {
        submit_io(pc, IoRequest::write(self.raw, pos, buf)).map(|c| c.res)
    }

    fn flush(&self) -> Deferred<()> {
        self.fsyncs.set(self.fsyncs.get() + 1);
        if self.bypass_fsync {
            return Deferred::ready(());
        }
        // SAFETY: plain syscall on a descriptor this file owns.
        self.blocking(|fd| check(unsafe { libc::fdatasync(fd) }).map(drop))
    }

    fn stat(&self) -> Deferred<FileStat> {
        self.blocking(|fd| {
            // SAFETY: stat is plain data filled by the kernel.
            let mut st: libc::stat = unsafe { std::mem::zeroed() };
            check(unsafe { libc::fstat(fd, &mut st) })?;
            Ok(FileStat::from_raw(&st))
        })
    }

    fn truncate(&self, len: u64) -> Deferred<()> {
        // SAFETY: plain syscall on a descriptor this file owns.
        self.blocking(move |fd| check(unsafe { libc::ftruncate(fd, len as libc::off_t) }).map(drop))
    }

    fn discard(&self, pos: u64, len: u64) -> Deferred<()> {
        self.blocking(move |fd| {
            let mode = libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE;
            // SAFETY: plain syscall on a descriptor this file owns.
            check(unsafe { libc::fallocate(fd, mode, pos as libc::off_t, len as libc::off_t) }).map(drop)
        })
    }

    fn allocate(&self, pos: u64, len: u64) -> Deferred<()> {
        self.blocking(move |fd| {
            let mode = libc::FALLOC_FL_ZERO_RANGE | libc::FALLOC_FL_KEEP_SIZE;
            // SAFETY: plain syscall on a descriptor this file owns.
            match check(unsafe { libc::fallocate(fd, mode, pos as libc::off_t, len as libc::off_t) }) {
                Ok(_) => Ok(()),
                // Allocation is only a hint.
                Err(ReactorError::Os(libc::EOPNOTSUPP)) => Ok(()),
                Err(e) => Err(e),
            }
        })
    }

    fn size(&self) -> Deferred<u64> {
        self.blocking(|fd| {
            // SAFETY: plain syscall on a descriptor this file owns.
            let end = unsafe { libc::lseek(fd, 0, libc::SEEK_END) };
            if end < 0 {
                return Err(crate::platform_linux::last_os_error());
            }
            Ok(end as u64)
        })
    }

    fn close(&self) -> Deferred<()> {
        let Some(fd) = self.fd.borrow_mut().take() else {
            return Deferred::failed(ReactorError::Os(libc::EBADF));
        };
        self.pool.submit(move || close_fd(fd))
    }

    fn list_directory(&self, next: EntryConsumer) -> Deferred<()> {
        if self.is_closed() {
            return Deferred::failed(ReactorError::Os(libc::EBADF));
        }
        dir::list(&self.pool, self.raw, next)
    }
}

fn close_fd(fd: OwnedFd) -> Result<()> {
    let raw = fd.into_raw_fd();
    // SAFETY: we own `raw` and close it exactly once.
    check(unsafe { libc::close(raw) }).map(drop)
}

impl Drop for PosixFile {
    fn drop(&mut self) {
        let Some(fd) = self.fd.get_mut().take() else {
            return;
        };
        match shard::try_local() {
            Some(r) if !r.stopped() => {
                self.pool.submit(move || close_fd(fd)).discard();
            }
            _ => drop(fd),
        }
    }
}

impl std::fmt::Debug for PosixFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PosixFile")
            .field("fd", &self.raw)
            .field("align", &self.align)
            .field("closed", &self.is_closed())
            .finish()
    }
}
