//! Files on filesystems that cannot extend a file concurrently
//!
//! Operations queue in arrival order and dispatch under one rule:
//!
//! ```text
//!   size-changing (extending write, truncate, sloppy flush)  runs alone
//!   anything else                                           runs with its kind
//! ```
//!
//! Two sizes are tracked. `logical` is what callers see; `committed` is
//! the on-disk size, which may run ahead of it. When nothing is running
//! and enough appending writes wait, one `ftruncate` grows the file past
//! all of them so they stop being size-changing and go out together.
//! Close waits for the queue to drain and truncates back to `logical`.

use super::posix::PosixFile;
use super::{DmaAlignment, EntryConsumer, FileImpl, FileOpenOptions, FileStat};
use crate::io::{align_up, DmaBuffer, PriorityClass};
use crate::platform_linux::check;
use crate::shard;
use reactor_core::{promise, Deferred, Promise, ReactorError};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Read,
    Write,
    Flush,
    Truncate,
}

struct Op {
    kind: OpKind,
    pos: u64,
    len: u64,
    run: Box<dyn FnOnce() -> Deferred<()>>,
}

/// Counters of one append-challenged file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendStats {
    pub logical_size: u64,
    pub committed_size: u64,
    pub queued: usize,
    pub running_size_changing: usize,
    pub running_other: usize,
    /// Speculative truncates issued ahead of appending writes
    pub truncates_ahead: u64,
}

struct State {
    queue: VecDeque<Op>,
    logical: u64,
    committed: u64,
    running_size_changing: usize,
    running_other: usize,
    /// Appending writes tolerated in the queue before truncating ahead
    max_size_changing_ops: usize,
    sloppy: bool,
    growth_factor: u64,
    write_align: u64,
    closing: bool,
    drained: Option<Promise<()>>,
    truncates_ahead: u64,
}

impl State {
    fn must_run_alone(&self, kind: OpKind) -> bool {
        kind == OpKind::Truncate || (kind == OpKind::Flush && self.sloppy)
    }

    fn size_changing(&self, kind: OpKind, pos: u64, len: u64) -> bool {
        (kind == OpKind::Write && pos + len > self.committed) || self.must_run_alone(kind)
    }

    fn may_dispatch(&self, kind: OpKind, pos: u64, len: u64) -> bool {
        if self.size_changing(kind, pos, len) {
            self.running_size_changing == 0 && self.running_other == 0
        } else {
            self.running_size_changing == 0
        }
    }

    fn idle(&self) -> bool {
        self.running_size_changing == 0 && self.running_other == 0
    }

    /// On-disk size to truncate to before dispatching, if growing ahead
    /// pays off now.
    fn truncate_ahead(&self) -> Option<u64> {
        if !self.idle() {
            return None;
        }
        let mut speculative = self.committed;
        let mut appending = 0;
        for op in &self.queue {
            if self.must_run_alone(op.kind) {
                break;
            }
            if op.kind == OpKind::Write && op.pos + op.len > self.committed {
                speculative = speculative.max(op.pos + op.len);
                appending += 1;
            }
        }
        if appending > self.max_size_changing_ops || (appending > 0 && self.sloppy) {
            let grown = self.committed.saturating_mul(self.growth_factor);
            if self.sloppy && speculative < grown {
                speculative = align_up(grown, self.write_align);
            }
            return Some(speculative);
        }
        None
    }

    fn commit_size(&mut self, size: u64) {
        self.committed = self.committed.max(size);
        self.logical = self.logical.max(size);
    }

    fn may_quit(&self) -> bool {
        self.closing && self.queue.is_empty() && self.idle()
    }
}

struct Inner {
    posix: PosixFile,
    state: RefCell<State>,
}

impl Inner {
    fn enqueue(self: &Rc<Self>, op: Op) {
        self.state.borrow_mut().queue.push_back(op);
        self.process_queue();
    }

    fn optimize_queue(&self) {
        let Some(size) = self.state.borrow().truncate_ahead() else {
            return;
        };
        // Nothing else is running, so the truncate may block the shard
        // briefly; going through the syscall thread is far slower here.
        // SAFETY: plain syscall on a descriptor this file owns.
        let r = check(unsafe { libc::ftruncate(self.posix.fd(), size as libc::off_t) });
        match r {
            Ok(_) => {
                let mut s = self.state.borrow_mut();
                s.committed = size;
                s.truncates_ahead += 1;
            }
            // The next appending write runs alone instead.
            Err(e) => reactor_core::kdebug!("truncate ahead to {} failed: {}", size, e),
        }
    }

    fn process_queue(self: &Rc<Self>) {
        self.optimize_queue();
        loop {
            let next = {
                let mut s = self.state.borrow_mut();
                match s.queue.front() {
                    Some(op) if s.may_dispatch(op.kind, op.pos, op.len) => s.queue.pop_front(),
                    _ => None,
                }
            };
            let Some(op) = next else {
                break;
            };
            self.dispatch(op);
        }
        let drained = {
            let mut s = self.state.borrow_mut();
            if s.may_quit() {
                s.closing = false;
                s.drained.take()
            } else {
                None
            }
        };
        if let Some(p) = drained {
            p.set_value(());
        }
    }

    fn dispatch(self: &Rc<Self>, op: Op) {
        let size_changing = {
            let mut s = self.state.borrow_mut();
            let changing = s.size_changing(op.kind, op.pos, op.len);
            if changing {
                s.running_size_changing += 1;
            } else {
                s.running_other += 1;
            }
            changing
        };
        let me = self.clone();
        (op.run)().on_complete(move |_| {
            {
                let mut s = me.state.borrow_mut();
                if size_changing {
                    s.running_size_changing -= 1;
                } else {
                    s.running_other -= 1;
                }
            }
            me.process_queue();
        });
    }
}

/// See the module documentation.
pub struct AppendChallengedFile {
    inner: Rc<Inner>,
}

impl AppendChallengedFile {
    /// `size` is the file's current size and `committed` its on-disk size
    /// after any sloppy size hint was applied.
    pub fn new(
        posix: PosixFile,
        size: u64,
        committed: u64,
        max_size_changing_ops: usize,
        options: &FileOpenOptions,
        growth_factor: u64,
    ) -> Self {
        let write_align = posix.alignment().disk_write;
        Self {
            inner: Rc::new(Inner {
                posix,
                state: RefCell::new(State {
                    queue: VecDeque::new(),
                    logical: size,
                    committed: committed.max(size),
                    running_size_changing: 0,
                    running_other: 0,
                    max_size_changing_ops,
                    sloppy: options.sloppy_size,
                    growth_factor: growth_factor.max(1),
                    write_align,
                    closing: false,
                    drained: None,
                    truncates_ahead: 0,
                }),
            }),
        }
    }

    pub fn stats(&self) -> AppendStats {
        let s = self.inner.state.borrow();
        AppendStats {
            logical_size: s.logical,
            committed_size: s.committed,
            queued: s.queue.len(),
            running_size_changing: s.running_size_changing,
            running_other: s.running_other,
            truncates_ahead: s.truncates_ahead,
        }
    }

    fn logical(&self) -> u64 {
        self.inner.state.borrow().logical
    }
}

impl FileImpl for AppendChallengedFile {
    fn fd(&self) -> RawFd {
        self.inner.posix.fd()
    }

    fn alignment(&self) -> DmaAlignment {
        self.inner.posix.alignment()
    }

    fn read_dma(&self, pos: u64, mut buf: DmaBuffer, pc: PriorityClass) -> Deferred<(usize, DmaBuffer)> {
        let logical = self.logical();
        if pos >= logical {
            // Through the loop, so read-until-EOF callers do not recurse.
            return shard::local().later().map(move |()| (0, buf));
        }
        let end = (pos + buf.len() as u64).min(align_up(logical, self.alignment().disk_read));
        buf.trim_to((end - pos) as usize);
        let len = buf.len() as u64;
        let (p, d) = promise();
        let me = self.inner.clone();
        self.inner.enqueue(Op {
            kind: OpKind::Read,
            pos,
            len,
            run: Box::new(move || {
                me.posix.read_dma(pos, buf, pc).then_result(move |r| {
                    p.set_result(r);
                    Deferred::ready(())
                })
            }),
        });
        d
    }

    fn write_dma(&self, pos: u64, buf: DmaBuffer, pc: PriorityClass) -> Deferred<usize> {
        let len = buf.len() as u64;
        let (p, d) = promise();
        let me = self.inner.clone();
        self.inner.enqueue(Op {
            kind: OpKind::Write,
            pos,
            len,
            run: Box::new(move || {
                let state = me.clone();
                me.posix.write_dma(pos, buf, pc).then_result(move |r| {
                    if let Ok(n) = &r {
                        state.state.borrow_mut().commit_size(pos + *n as u64);
                    }
                    p.set_result(r);
                    Deferred::ready(())
                })
            }),
        });
        d
    }

    fn flush(&self) -> Deferred<()> {
        let (sloppy, logical, committed) = {
            let s = self.inner.state.borrow();
            (s.sloppy, s.logical, s.committed)
        };
        if !sloppy || logical == committed {
            return self.inner.posix.flush();
        }
        let (p, d) = promise();
        let me = self.inner.clone();
        self.inner.enqueue(Op {
            kind: OpKind::Flush,
            pos: 0,
            len: 0,
            run: Box::new(move || {
                let (logical, committed) = {
                    let s = me.state.borrow();
                    (s.logical, s.committed)
                };
                if logical != committed {
                    // Running alone; truncating on the shard is safe.
                    // SAFETY: plain syscall on a descriptor this file owns.
                    if let Err(e) = check(unsafe { libc::ftruncate(me.posix.fd(), logical as libc::off_t) }) {
                        p.set_error(e);
                        return Deferred::ready(());
                    }
                    me.state.borrow_mut().committed = logical;
                }
                me.posix.flush().then_result(move |r| {
                    p.set_result(r);
                    Deferred::ready(())
                })
            }),
        });
        d
    }

    fn stat(&self) -> Deferred<FileStat> {
        let me = self.inner.clone();
        self.inner.posix.stat().map(move |mut st| {
            st.size = me.state.borrow().logical;
            st
        })
    }

    fn truncate(&self, len: u64) -> Deferred<()> {
        let (p, d) = promise();
        let me = self.inner.clone();
        self.inner.enqueue(Op {
            kind: OpKind::Truncate,
            pos: len,
            len: 0,
            run: Box::new(move || {
                let state = me.clone();
                me.posix.truncate(len).then_result(move |r| {
                    if r.is_ok() {
                        let mut s = state.state.borrow_mut();
                        s.committed = len;
                        s.logical = len;
                    }
                    p.set_result(r);
                    Deferred::ready(())
                })
            }),
        });
        d
    }

    fn discard(&self, pos: u64, len: u64) -> Deferred<()> {
        self.inner.posix.discard(pos, len)
    }

    fn allocate(&self, pos: u64, len: u64) -> Deferred<()> {
        self.inner.posix.allocate(pos, len)
    }

    fn size(&self) -> Deferred<u64> {
        Deferred::ready(self.logical())
    }

    fn close(&self) -> Deferred<()> {
        let (p, drained) = promise();
        {
            let mut s = self.inner.state.borrow_mut();
            if s.closing || self.inner.posix.is_closed() {
                return Deferred::failed(ReactorError::Os(libc::EBADF));
            }
            s.closing = true;
            s.drained = Some(p);
        }
        self.inner.process_queue();
        let me = self.inner.clone();
        drained.then(move |()| {
            let (logical, committed) = {
                let s = me.state.borrow();
                (s.logical, s.committed)
            };
            let fixup = if logical != committed {
                let state = me.clone();
                me.posix.truncate(logical).map(move |()| state.state.borrow_mut().committed = logical)
            } else {
                Deferred::ready(())
            };
            fixup.then_result(move |r| {
                me.posix.close().then_result(move |closed| Deferred::from_result(r.and(closed)))
            })
        })
    }

    fn list_directory(&self, next: EntryConsumer) -> Deferred<()> {
        self.inner.posix.list_directory(next)
    }
}

impl std::fmt::Debug for AppendChallengedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendChallengedFile")
            .field("fd", &self.fd())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(committed: u64, max_ops: usize, sloppy: bool) -> State {
        State {
            queue: VecDeque::new(),
            logical: committed,
            committed,
            running_size_changing: 0,
            running_other: 0,
            max_size_changing_ops: max_ops,
            sloppy,
            growth_factor: 2,
            write_align: 4096,
            closing: false,
            drained: None,
            truncates_ahead: 0,
        }
    }

    fn op(kind: OpKind, pos: u64, len: u64) -> Op {
        Op { kind, pos, len, run: Box::new(|| Deferred::ready(())) }
    }

    #[test]
    fn test_size_changing_classification() {
        let mut s = state(8192, 0, false);
        assert!(!s.size_changing(OpKind::Write, 4096, 4096));
        assert!(s.size_changing(OpKind::Write, 8192, 4096));
        assert!(s.size_changing(OpKind::Truncate, 0, 0));
        assert!(!s.size_changing(OpKind::Flush, 0, 0));
        s.sloppy = true;
        assert!(s.size_changing(OpKind::Flush, 0, 0));
        assert!(!s.size_changing(OpKind::Read, 1 << 20, 4096));
    }

    #[test]
    fn test_size_changing_ops_run_alone() {
        let mut s = state(8192, 0, false);
        s.running_other = 1;
        assert!(s.may_dispatch(OpKind::Read, 0, 4096));
        assert!(!s.may_dispatch(OpKind::Write, 8192, 4096));
        assert!(!s.may_dispatch(OpKind::Truncate, 0, 0));
        s.running_other = 0;
        s.running_size_changing = 1;
        assert!(!s.may_dispatch(OpKind::Read, 0, 4096));
        assert!(!s.may_dispatch(OpKind::Write, 0, 4096));
        s.running_size_changing = 0;
        assert!(s.may_dispatch(OpKind::Truncate, 0, 0));
    }

    #[test]
    fn test_truncate_ahead_covers_appends() {
        let mut s = state(4096, 1, false);
        s.queue.push_back(op(OpKind::Write, 4096, 4096));
        assert_eq!(s.truncate_ahead(), None);
        s.queue.push_back(op(OpKind::Write, 8192, 4096));
        assert_eq!(s.truncate_ahead(), Some(12288));
        s.running_other = 1;
        assert_eq!(s.truncate_ahead(), None);
    }

    #[test]
    fn test_truncate_ahead_stops_at_truncate() {
        let mut s = state(4096, 0, false);
        s.queue.push_back(op(OpKind::Truncate, 0, 0));
        s.queue.push_back(op(OpKind::Write, 4096, 4096));
        assert_eq!(s.truncate_ahead(), None);
    }

    #[test]
    fn test_sloppy_growth() {
        let mut s = state(1 << 20, 4, true);
        s.queue.push_back(op(OpKind::Write, 1 << 20, 4096));
        assert_eq!(s.truncate_ahead(), Some(2 << 20));
        s.growth_factor = 3;
        assert_eq!(s.truncate_ahead(), Some(3 << 20));
    }

    #[test]
    fn test_commit_size_only_grows() {
        let mut s = state(4096, 0, false);
        s.commit_size(2048);
        assert_eq!((s.logical, s.committed), (4096, 4096));
        s.commit_size(12288);
        assert_eq!((s.logical, s.committed), (12288, 12288));
    }
}
