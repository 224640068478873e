//! io_uring backend
//!
//! No SQPOLL, no registered files or buffers: each request becomes one
//! SQE tagged with a request id. SQEs are batched and pushed to the kernel
//! once enough accumulate or when the aio-submit poller runs; CQEs are
//! drained by the io completion poller.

use super::backend::{IoBackend, IoCompletion, IoOp, IoRequest};
use super::dma::DmaBuffer;
use io_uring::{opcode, squeue, types, IoUring};
use reactor_core::{promise, Deferred, Promise, ReactorError, Result, Semaphore};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

struct InFlight {
    promise: Promise<IoCompletion>,
    /// Kept alive until the kernel is done with it
    buf: Option<DmaBuffer>,
}

pub struct UringBackend {
    ring: RefCell<IoUring>,
    /// Bounds requests inside the kernel to `max_aio`
    slots: Semaphore,
    ops: RefCell<HashMap<u64, InFlight>>,
    next_id: Cell<u64>,
    pending_submit: Cell<usize>,
    flush_threshold: usize,
}

impl UringBackend {
    pub fn new(max_aio: usize) -> Result<Self> {
        let max_aio = max_aio.max(1);
        let entries = (max_aio as u32).next_power_of_two();
        let ring = IoUring::new(entries).map_err(ReactorError::from)?;
        let sq = ring.params().sq_entries() as usize;
        Ok(Self {
            ring: RefCell::new(ring),
            slots: Semaphore::new(max_aio),
            ops: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
            pending_submit: Cell::new(0),
            flush_threshold: (max_aio / 4).min(sq / 2).max(1),
        })
    }

    fn push(&self, mut req: IoRequest, promise: Promise<IoCompletion>) {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let fd = types::Fd(req.fd);
        let sqe: squeue::Entry = match &mut req.op {
            IoOp::Read { buf } => {
                opcode::Read::new(fd, buf.as_mut_ptr(), buf.len() as u32).offset(req.pos).build()
            }
            IoOp::Write { buf } => {
                opcode::Write::new(fd, buf.as_ptr(), buf.len() as u32).offset(req.pos).build()
            }
            IoOp::Fdatasync => opcode::Fsync::new(fd).flags(types::FsyncFlags::DATASYNC).build(),
        };
        let sqe = sqe.user_data(id);
        let buf = match req.op {
            IoOp::Read { buf } | IoOp::Write { buf } => Some(buf),
            IoOp::Fdatasync => None,
        };
        self.ops.borrow_mut().insert(id, InFlight { promise, buf });

        let mut pushed = self.try_push(&sqe);
        if !pushed {
            self.flush();
            pushed = self.try_push(&sqe);
        }
        if !pushed {
            // The slots semaphore keeps us under the SQ size; a full queue
            // after a flush means the kernel refused the batch.
            let failed = self.ops.borrow_mut().remove(&id);
            self.slots.signal(1);
            if let Some(op) = failed {
                op.promise.set_error(ReactorError::Os(libc::EBUSY));
            }
            return;
        }
        self.pending_submit.set(self.pending_submit.get() + 1);
        if self.pending_submit.get() >= self.flush_threshold {
            self.flush();
        }
    }

    fn try_push(&self, sqe: &squeue::Entry) -> bool {
        let mut ring = self.ring.borrow_mut();
        // SAFETY: the buffer the SQE points into is owned by `ops` until the
        // matching CQE is reaped.
        let pushed = unsafe { ring.submission().push(sqe).is_ok() };
        pushed
    }
}

impl IoBackend for UringBackend {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn submit(self: Rc<Self>, req: IoRequest) -> Deferred<IoCompletion> {
        let (p, out) = promise();
        let me = self.clone();
        self.slots.wait(1).on_complete(move |r| match r {
            Ok(()) => me.push(req, p),
            Err(e) => p.set_error(e),
        });
        out
    }

    fn flush(&self) -> bool {
        if self.pending_submit.get() == 0 {
            return false;
        }
        match self.ring.borrow().submit() {
            Ok(_) => {
                self.pending_submit.set(0);
                true
            }
            Err(e) if matches!(e.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EBUSY)) => false,
            Err(e) => {
                reactor_core::kerror!("io_uring submit failed: {}", e);
                false
            }
        }
    }

    fn reap(&self) -> bool {
        let done: Vec<(u64, i32)> = {
            let mut ring = self.ring.borrow_mut();
            ring.completion().map(|cqe| (cqe.user_data(), cqe.result())).collect()
        };
        if done.is_empty() {
            return false;
        }
        for (id, res) in done {
            let op = self.ops.borrow_mut().remove(&id);
            self.slots.signal(1);
            let Some(op) = op else {
                reactor_core::kerror!("completion for unknown io request {}", id);
                continue;
            };
            if res < 0 {
                op.promise.set_error(ReactorError::Os(-res));
            } else {
                op.promise.set_value(IoCompletion { res: res as usize, buf: op.buf });
            }
        }
        true
    }

    fn in_flight(&self) -> usize {
        self.ops.borrow().len()
    }

    /// Completions do not reach epoll, so the shard keeps polling while
    /// requests are in the kernel.
    fn can_sleep(&self) -> bool {
        self.ops.borrow().is_empty()
    }
}

impl Drop for UringBackend {
    fn drop(&mut self) {
        // Buffers must outlive the kernel's use of them.
        let n = self.ops.borrow().len();
        if n > 0 {
            let ring = self.ring.borrow();
            if let Err(e) = ring.submit_and_wait(n) {
                reactor_core::kerror!("io_uring drain on shutdown failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_read_through_ring() {
        let backend = match UringBackend::new(8) {
            Ok(b) => Rc::new(b),
            // io_uring may be disabled in the sandbox running the tests.
            Err(_) => return,
        };
        let path = std::env::temp_dir().join(format!("rct-uring-{}", std::process::id()));
        std::fs::write(&path, b"hello uring").unwrap();
        let f = std::fs::File::open(&path).unwrap();
        let mut d = backend.clone().submit(IoRequest::read(f.as_raw_fd(), 6, DmaBuffer::new(5, 512)));
        assert!(backend.flush() || backend.in_flight() == 1);
        let mut spins = 0;
        while !d.is_ready() && spins < 1_000_000 {
            backend.reap();
            spins += 1;
        }
        let done = d.try_take().unwrap().unwrap();
        assert_eq!(done.res, 5);
        assert_eq!(done.buf.unwrap().as_slice(), b"uring");
        assert_eq!(backend.in_flight(), 0);
        std::fs::remove_file(&path).unwrap();
    }
}
