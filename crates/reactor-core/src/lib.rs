//! # reactor-core
//!
//! Platform-agnostic building blocks of the sharded reactor:
//!
//! - [`deferred`]: single-assignment results with continuations
//! - [`task`]: task objects and the per-thread sink a shard installs
//! - [`semaphore`]: shard-local counting semaphore with deferred waits
//! - [`error`]: the error taxonomy shared by every crate
//! - [`kprint`] / [`env`]: logging macros and environment helpers
//!
//! Nothing here touches the OS; the Linux runtime lives in
//! `reactor-runtime`.

pub mod deferred;
pub mod env;
pub mod error;
pub mod kprint;
pub mod semaphore;
pub mod task;

pub use deferred::{do_for_each, do_until, join, promise, repeat, when_all, Deferred, Iteration, Promise};
pub use error::{ConfigError, ReactorError, Result};
pub use semaphore::Semaphore;
pub use task::{SchedulingGroup, Task, TaskSink};
