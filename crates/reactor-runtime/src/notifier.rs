//! `EventFdNotifier`: cross-thread wakeup for a sleeping shard.
//!
//! Writes to an eventfd that sits in the shard's epoll set. Several
//! `notify()` calls before the shard reads the fd coalesce into a single
//! wakeup (eventfd counter semantics).

use crate::platform_linux::{check, errno};
use reactor_core::{ReactorError, Result};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

pub struct EventFdNotifier {
    fd: OwnedFd,
}

impl EventFdNotifier {
    /// Create a non-blocking eventfd.
    pub fn create() -> Result<Self> {
        // SAFETY: eventfd returns a fresh descriptor or -1.
        let fd = check(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
        // SAFETY: fd was just created and is owned by nobody else.
        Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    /// Wake the shard. Safe to call from any thread.
    pub fn notify(&self) -> Result<()> {
        let val: u64 = 1;
        // SAFETY: writes 8 bytes from a local into our eventfd.
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let e = errno();
            // Counter saturated: a wakeup is already pending.
            if e == libc::EAGAIN {
                return Ok(());
            }
            return Err(ReactorError::Os(e));
        }
        Ok(())
    }

    /// Reset the counter. Returns the number of coalesced notifications.
    pub fn drain(&self) -> u64 {
        let mut val: u64 = 0;
        // SAFETY: reads 8 bytes into a local.
        let ret = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            0
        } else {
            val
        }
    }
}

impl AsRawFd for EventFdNotifier {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl std::fmt::Debug for EventFdNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFdNotifier").field("fd", &self.fd.as_raw_fd()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifications_coalesce() {
        let n = EventFdNotifier::create().unwrap();
        assert_eq!(n.drain(), 0);
        n.notify().unwrap();
        n.notify().unwrap();
        n.notify().unwrap();
        assert_eq!(n.drain(), 3);
        assert_eq!(n.drain(), 0);
    }

    #[test]
    fn test_notify_from_other_thread() {
        let n = std::sync::Arc::new(EventFdNotifier::create().unwrap());
        let n2 = n.clone();
        std::thread::spawn(move || n2.notify().unwrap()).join().unwrap();
        assert_eq!(n.drain(), 1);
    }
}
