//! Signal delivery through signalfd
//!
//! Handled signals are blocked on the shard thread and read from a
//! signalfd that sits in the reactor's epoll set, so handlers run as
//! ordinary reactor code rather than in signal context.
//!
//! `Smp::run` blocks SIGINT and SIGTERM before spawning any thread; every
//! thread inherits the mask and the signals stay pending until a shard's
//! signalfd picks them up.

use crate::epoll::{Epoll, Internal};
use crate::platform_linux::nix_error;
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use reactor_core::error::panic_message;
use reactor_core::Result;
use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::AsRawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

type Handler = Box<dyn FnMut()>;

/// Per-shard signal handlers.
pub(crate) struct Signals {
    epoll: Rc<Epoll>,
    mask: RefCell<SigSet>,
    fd: RefCell<Option<SignalFd>>,
    handlers: RefCell<HashMap<i32, Handler>>,
}

impl Signals {
    pub fn new(epoll: Rc<Epoll>) -> Self {
        Self {
            epoll,
            mask: RefCell::new(SigSet::empty()),
            fd: RefCell::new(None),
            handlers: RefCell::new(HashMap::new()),
        }
    }

    /// Route `signal` to `handler`, replacing any previous handler.
    pub fn handle(&self, signal: Signal, handler: Handler) -> Result<()> {
        let mut one = SigSet::empty();
        one.add(signal);
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&one), None).map_err(nix_error)?;
        self.mask.borrow_mut().add(signal);
        let mask = *self.mask.borrow();
        {
            let mut fd = self.fd.borrow_mut();
            match fd.as_mut() {
                Some(sfd) => sfd.set_mask(&mask).map_err(nix_error)?,
                None => {
                    let sfd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
                        .map_err(nix_error)?;
                    self.epoll.add_internal(sfd.as_raw_fd(), Internal::Signal)?;
                    *fd = Some(sfd);
                }
            }
        }
        self.handlers.borrow_mut().insert(signal as i32, handler);
        reactor_core::kdebug!("handling {}", signal);
        Ok(())
    }

    /// Read every pending signal and run its handler.
    pub fn dispatch(&self) -> usize {
        let mut n = 0;
        loop {
            let info = match self.fd.borrow_mut().as_mut().map(|fd| fd.read_signal()) {
                Some(Ok(Some(info))) => info,
                Some(Err(e)) => {
                    reactor_core::kerror!("signalfd read failed: {}", e);
                    break;
                }
                _ => break,
            };
            let signo = info.ssi_signo as i32;
            let handler = self.handlers.borrow_mut().remove(&signo);
            let Some(mut handler) = handler else {
                continue;
            };
            if let Err(payload) = catch_unwind(AssertUnwindSafe(&mut handler)) {
                reactor_core::kerror!("signal handler panicked: {}", panic_message(payload.as_ref()));
            }
            self.handlers.borrow_mut().entry(signo).or_insert(handler);
            n += 1;
        }
        n
    }
}

/// Run `handler` on this shard whenever `signal` arrives.
pub fn handle_signal(signal: Signal, handler: impl FnMut() + 'static) -> Result<()> {
    crate::shard::local().signals().handle(signal, Box::new(handler))
}

/// Block SIGINT and SIGTERM on the calling thread; returns the old mask.
pub(crate) fn block_exit_signals() -> Result<SigSet> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    let mut old = SigSet::empty();
    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), Some(&mut old)).map_err(nix_error)?;
    Ok(old)
}

pub(crate) fn restore_mask(mask: &SigSet) {
    if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(mask), None) {
        reactor_core::kwarn!("cannot restore signal mask: {}", e);
    }
}
