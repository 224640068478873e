//! # reactor - sharded thread-per-core runtime
//!
//! One event loop per CPU, no shared mutable state between them, and
//! explicit message passing where shards must cooperate.
//!
//! ## Features
//!
//! - **Deferred results**: single-assignment values with continuations, no
//!   executor-level wakers
//! - **Fair scheduling**: task queues share each shard's CPU in proportion
//!   to their shares
//! - **Disk I/O**: O_DIRECT files behind a fair IO queue, io_uring or a
//!   thread-backed fallback
//! - **Cross-shard calls**: `submit_to` over lock-free request/response
//!   rings with batched flushes
//! - **Streams and sockets**: buffered input/output streams over files,
//!   pipes and TCP
//!
//! ## Quick Start
//!
//! ```ignore
//! use reactor::prelude::*;
//!
//! fn main() {
//!     let code = reactor::run(ReactorConfig::from_env(), || {
//!         submit_to(1, || Deferred::ready(shard_id()))
//!             .map(|id| {
//!                 kinfo!("hello from shard {}", id);
//!                 0
//!             })
//!     });
//!     std::process::exit(code.unwrap_or(1));
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │       Deferred chains, submit_to(), streams, sockets        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Shard 0  │◀────▶│  Shard 1  │◀────▶│  Shard N  │
//!    │  reactor  │ smp  │  reactor  │ smp  │  reactor  │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │ pollers: io, smp, epoll, syscall, timers, flush
//!          ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │        epoll + eventfd    │    io_uring / IO threads    │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use reactor_core::{
    do_for_each, do_until, join, promise, repeat, when_all, ConfigError, Deferred, Iteration, Promise,
    ReactorError, Result, SchedulingGroup, Semaphore,
};
pub use reactor_core::task::{self, spawn};

// Re-export kprint macros for logging
pub use reactor_core::{kdebug, kerror, kinfo, kprint, kprintln, ktrace, kwarn};
pub use reactor_core::kprint::{init as init_logging, set_flush_enabled, set_log_level, LogLevel};

// Re-export env utilities
pub use reactor_core::env::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

// Re-export runtime modules and types
pub use reactor_runtime::{channel, config, file, io, net, poller, sched, shard, signal, smp, stream, timer};
pub use reactor_runtime::{
    handle_signal, invoke_on_all, invoke_on_others, open_file_dma, register_priority_class, submit_to,
    with_timeout, Channel, ConnectedSocket, DmaBuffer, File, FileOpenOptions, InputStream, IoBackendKind,
    ListenOptions, LocalPacketQueue, NetworkStack, OpenFlags, OutputStream, Packet, Poller, PosixStack,
    PriorityClass, Reactor, ReactorConfig, ReactorStats, ServerSocket, Smp, Timer, UserPacket,
};
pub use reactor_runtime::shard::{local, shard_id};
pub use bytes::{Bytes, BytesMut};

/// Boot every shard described by `config`, run `main` on shard 0 and
/// block until the runtime exits.
///
/// `main`'s value is the exit code; if it fails the code is 1.
pub fn run<F>(config: ReactorConfig, main: F) -> Result<i32>
where
    F: FnOnce() -> Deferred<i32> + 'static,
{
    Smp::configure(config)?.run(main)
}

/// The number of shards the running application was started with.
#[inline]
pub fn shard_count() -> u32 {
    reactor_runtime::smp::count()
}

/// Resolve after `d` on the steady clock.
pub fn sleep(d: std::time::Duration) -> Deferred<()> {
    reactor_runtime::sleep::<reactor_runtime::SteadyClock>(d)
}

/// Stop every shard; `run` returns `code`.
pub fn exit(code: i32) {
    local().exit(code)
}

pub mod prelude {
    //! The items most programs need: `use reactor::prelude::*;`
    pub use crate::{
        do_for_each, do_until, exit, join, promise, repeat, shard_count, shard_id, sleep, spawn, submit_to,
        when_all, Deferred, InputStream, Iteration, Promise, NetworkStack, OutputStream, ReactorConfig, ReactorError,
        Result, Semaphore,
    };
    pub use crate::{kdebug, kerror, kinfo, kwarn};
}
