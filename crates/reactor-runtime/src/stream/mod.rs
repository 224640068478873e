//! Buffered byte streams
//!
//! ```text
//!   OutputStream ── coalesces writes ──▶ DataSink   (fd, file, memory)
//!   InputStream  ◀── buffers chunks ──── DataSource (fd, file, memory)
//! ```
//!
//! Sinks and sources are the thin per-transport layer. They return
//! deferred results that never borrow the sink itself, so the stream can
//! chain on them after releasing its own state.

mod fd;
mod file;
mod input;
mod memory;
mod output;
mod packet;

pub use fd::{FdSink, FdSource, PollableFd};
pub use file::{input_from_file, output_to_file, FileSink, FileSource, FileStreamOptions};
pub use input::{Consumption, InputStream, ParseStep, StreamParser};
pub use memory::{MemorySink, MemorySource, SinkLog};
pub use output::OutputStream;
pub use packet::Packet;

use bytes::Bytes;
use reactor_core::Deferred;

/// Buffer size used when a sink has no preference.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Where an [`OutputStream`] sends its data.
pub trait DataSink {
    /// Send one buffer.
    fn put(&mut self, buf: Bytes) -> Deferred<()>;

    /// Send a fragment chain without copying it together first.
    fn put_many(&mut self, packet: Packet) -> Deferred<()>;

    /// Push sent data further down (fsync, socket cork release).
    fn flush(&mut self) -> Deferred<()> {
        Deferred::ready(())
    }

    /// Release the underlying resource. Called exactly once.
    fn close(&mut self) -> Deferred<()>;

    /// Preferred size for the stream's coalescing buffer.
    fn buffer_size(&self) -> usize {
        DEFAULT_BUFFER_SIZE
    }
}

/// Where an [`InputStream`] gets its data. An empty buffer means end of
/// stream.
pub trait DataSource {
    fn get(&mut self) -> Deferred<Bytes>;

    /// Drop the next `n` bytes. Resolves with whatever was read past them.
    fn skip(&mut self, n: u64) -> Deferred<Bytes>;

    fn close(&mut self) -> Deferred<()> {
        Deferred::ready(())
    }
}
