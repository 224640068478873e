//! Disk I/O: priority classes, fair admission and submission backends
//!
//! ```text
//!   File::read_dma ─▶ submit_io(pc, req)
//!                        │ coordinator is another shard? ─▶ submit_to
//!                        ▼
//!                     IoQueue ─▶ FairQueue (capacity = budget / queues)
//!                        │ admitted
//!                        ▼
//!                     IoBackend (io_uring | syscall thread)
//! ```

pub mod backend;
pub mod dma;
pub mod fair_queue;
pub mod priority;
pub mod queue;
pub mod uring;

pub use backend::{IoBackend, IoCompletion, IoOp, IoRequest, ThreadedBackend};
pub use dma::{align_down, align_up, DmaBuffer};
pub use fair_queue::FairQueue;
pub use priority::{default_priority_class, register_priority_class, PriorityClass};
pub use queue::{coordinator_of, IoQueue, PriorityClassStats};
pub use uring::UringBackend;

use crate::config::{IoBackendKind, ReactorConfig};
use crate::syscall::SyscallPool;
use reactor_core::error::invariant_violation;
use reactor_core::{Deferred, Result};
use std::rc::Rc;

/// Build the shard's backend. `auto` falls back to the syscall thread when
/// io_uring cannot be set up.
pub(crate) fn create_backend(config: &ReactorConfig, pool: &Rc<SyscallPool>) -> Result<Rc<dyn IoBackend>> {
    match config.io_backend {
        IoBackendKind::Threaded => Ok(Rc::new(ThreadedBackend::new(pool.clone()))),
        IoBackendKind::Uring => Ok(Rc::new(UringBackend::new(config.max_aio)?)),
        IoBackendKind::Auto => match UringBackend::new(config.max_aio) {
            Ok(b) => Ok(Rc::new(b)),
            Err(e) => {
                reactor_core::kinfo!("io_uring unavailable ({}), using syscall thread for disk I/O", e);
                Ok(Rc::new(ThreadedBackend::new(pool.clone())))
            }
        },
    }
}

/// Send `req` through the calling shard's io queue.
pub fn submit_io(pc: PriorityClass, req: IoRequest) -> Deferred<IoCompletion> {
    let reactor = crate::shard::local();
    let coordinator = reactor.io_coordinator();
    if coordinator == reactor.id() {
        return local_queue().queue_request(pc, req);
    }
    crate::smp::submit_to(coordinator, move || local_queue().queue_request(pc, req))
}

fn local_queue() -> Rc<IoQueue> {
    match crate::shard::local().io_queue() {
        Some(q) => q,
        None => invariant_violation("io request reached a shard that is not a coordinator"),
    }
}
