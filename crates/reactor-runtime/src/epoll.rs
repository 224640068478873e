//! epoll readiness backend
//!
//! One epoll instance per shard. User descriptors are registered on demand
//! when someone waits for them; the reactor's own wakeup eventfd, timerfd
//! and signalfd sit in the same set under reserved tokens, so a single
//! `epoll_wait` is the shard's only blocking point.

use crate::platform_linux::{check, errno};
use reactor_core::{promise, Deferred, Promise, ReactorError, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

const MAX_EVENTS: usize = 128;

/// Reserved tokens for the reactor's internal descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Internal {
    Wakeup = u64::MAX - 1,
    Timer = u64::MAX - 2,
    Signal = u64::MAX - 3,
}

/// Internal sources that fired during one wait.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fired {
    pub user: usize,
    pub wakeup: bool,
    pub timer: bool,
    pub signal: bool,
}

impl Fired {
    pub fn any(&self) -> bool {
        self.user > 0 || self.wakeup || self.timer || self.signal
    }
}

#[derive(Default)]
struct FdState {
    registered: bool,
    events: u32,
    readable: Vec<Promise<()>>,
    writeable: Vec<Promise<()>>,
}

pub struct Epoll {
    fd: OwnedFd,
    fds: RefCell<HashMap<RawFd, FdState>>,
}

impl Epoll {
    pub fn new() -> Result<Self> {
        // SAFETY: epoll_create1 returns a fresh descriptor or -1.
        let fd = check(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Self {
            // SAFETY: fd was just created.
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            fds: RefCell::new(HashMap::new()),
        })
    }

    /// Add one of the reactor's own descriptors, level-triggered for input.
    pub fn add_internal(&self, fd: RawFd, token: Internal) -> Result<()> {
        let mut ev = libc::epoll_event { events: libc::EPOLLIN as u32, u64: token as u64 };
        // SAFETY: ev lives across the call.
        check(unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut ev) })?;
        Ok(())
    }

    /// Resolve once `fd` is readable.
    pub fn readable(&self, fd: RawFd) -> Deferred<()> {
        self.wait_for(fd, libc::EPOLLIN as u32 | libc::EPOLLRDHUP as u32)
    }

    /// Resolve once `fd` is writeable.
    pub fn writeable(&self, fd: RawFd) -> Deferred<()> {
        self.wait_for(fd, libc::EPOLLOUT as u32)
    }

    fn wait_for(&self, fd: RawFd, event: u32) -> Deferred<()> {
        let (p, f) = promise();
        let mut fds = self.fds.borrow_mut();
        let st = fds.entry(fd).or_default();
        if event & libc::EPOLLOUT as u32 != 0 {
            st.writeable.push(p);
        } else {
            st.readable.push(p);
        }
        let wanted = st.events | event;
        if wanted != st.events || !st.registered {
            let op = if st.registered { libc::EPOLL_CTL_MOD } else { libc::EPOLL_CTL_ADD };
            let mut ev = libc::epoll_event { events: wanted, u64: fd as u64 };
            // SAFETY: ev lives across the call.
            let r = unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut ev) };
            if r < 0 {
                let err = ReactorError::Os(errno());
                let failed: Vec<_> = st.readable.drain(..).chain(st.writeable.drain(..)).collect();
                drop(fds);
                for p in failed {
                    p.set_error(err.clone());
                }
                return f;
            }
            st.registered = true;
            st.events = wanted;
        }
        f
    }

    /// Drop `fd` from the set; pending waiters fail with `StreamClosed`.
    /// Call before closing the descriptor.
    pub fn forget(&self, fd: RawFd) {
        let Some(st) = self.fds.borrow_mut().remove(&fd) else {
            return;
        };
        if st.registered {
            // SAFETY: removal needs no event struct on modern kernels.
            unsafe {
                libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
        }
        for p in st.readable.into_iter().chain(st.writeable) {
            p.set_error(ReactorError::StreamClosed);
        }
    }

    /// Number of user descriptors with waiters.
    pub fn waiting(&self) -> usize {
        self.fds
            .borrow()
            .values()
            .filter(|s| !s.readable.is_empty() || !s.writeable.is_empty())
            .count()
    }

    /// Wait up to `timeout_ms` (-1 blocks, 0 polls) and dispatch readiness.
    pub fn wait(&self, timeout_ms: i32) -> Fired {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        // SAFETY: the kernel writes at most MAX_EVENTS entries.
        let n = unsafe {
            libc::epoll_wait(self.fd.as_raw_fd(), events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
        };
        let mut fired = Fired::default();
        if n < 0 {
            let e = errno();
            if e != libc::EINTR {
                reactor_core::kerror!("epoll_wait failed: {}", ReactorError::Os(e));
            }
            return fired;
        }
        for ev in &events[..n as usize] {
            let (token, flags) = (ev.u64, ev.events);
            match token {
                t if t == Internal::Wakeup as u64 => fired.wakeup = true,
                t if t == Internal::Timer as u64 => fired.timer = true,
                t if t == Internal::Signal as u64 => fired.signal = true,
                fd => {
                    self.complete(fd as RawFd, flags);
                    fired.user += 1;
                }
            }
        }
        fired
    }

    fn complete(&self, fd: RawFd, flags: u32) {
        let err = flags & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
        let (readers, writers) = {
            let mut fds = self.fds.borrow_mut();
            let Some(st) = fds.get_mut(&fd) else {
                return;
            };
            let in_mask = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
            let readers = if flags & in_mask != 0 || err {
                std::mem::take(&mut st.readable)
            } else {
                Vec::new()
            };
            let writers = if flags & libc::EPOLLOUT as u32 != 0 || err {
                std::mem::take(&mut st.writeable)
            } else {
                Vec::new()
            };
            // Stop reporting what nobody waits for; level-triggered otherwise spins.
            let mut still = 0;
            if !st.readable.is_empty() {
                still |= in_mask;
            }
            if !st.writeable.is_empty() {
                still |= libc::EPOLLOUT as u32;
            }
            if still != st.events {
                let mut ev = libc::epoll_event { events: still, u64: fd as u64 };
                // SAFETY: ev lives across the call.
                unsafe {
                    libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, &mut ev);
                }
                st.events = still;
            }
            (readers, writers)
        };
        // Errors surface from the following read or write, not from here.
        for p in readers.into_iter().chain(writers) {
            p.set_value(());
        }
    }
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        // SAFETY: pipe2 fills both slots.
        check(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) }).unwrap();
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn test_readable_fires_once_data_arrives() {
        let ep = Epoll::new().unwrap();
        let (r, w) = pipe();
        let hit = Rc::new(Cell::new(false));
        let h = hit.clone();
        ep.readable(r.as_raw_fd()).on_complete(move |res| {
            res.unwrap();
            h.set(true);
        });
        assert_eq!(ep.wait(0).user, 0);
        assert!(!hit.get());
        unsafe { libc::write(w.as_raw_fd(), b"x".as_ptr() as *const _, 1) };
        assert_eq!(ep.wait(100).user, 1);
        assert!(hit.get());
        assert_eq!(ep.waiting(), 0);
        // Interest was dropped: no spin on the unread byte.
        assert_eq!(ep.wait(0).user, 0);
    }

    #[test]
    fn test_forget_fails_waiters() {
        let ep = Epoll::new().unwrap();
        let (r, _w) = pipe();
        let got = Rc::new(RefCell::new(None));
        let g = got.clone();
        ep.readable(r.as_raw_fd()).on_complete(move |res| *g.borrow_mut() = Some(res));
        ep.forget(r.as_raw_fd());
        assert_eq!(*got.borrow(), Some(Err(ReactorError::StreamClosed)));
    }

    #[test]
    fn test_internal_token() {
        let ep = Epoll::new().unwrap();
        let n = crate::notifier::EventFdNotifier::create().unwrap();
        ep.add_internal(n.as_raw_fd(), Internal::Wakeup).unwrap();
        n.notify().unwrap();
        let fired = ep.wait(100);
        assert!(fired.wakeup);
        assert!(!fired.timer);
    }
}
