//! # reactor-runtime
//!
//! Linux runtime for the sharded reactor.
//!
//! This crate provides:
//! - Shard startup, pinning and cross-shard messaging ([`smp`])
//! - The per-shard event loop and its pollers ([`reactor`], [`poller`])
//! - Fair-share task scheduling across scheduling groups ([`sched`])
//! - Timers on steady, low-resolution and manual clocks ([`timer`])
//! - The fair IO queue and DMA files ([`io`], [`file`])
//! - Buffered streams, sockets and cross-thread channels ([`stream`], [`net`], [`channel`])
//! - A per-shard syscall thread, signals and a stall watchdog

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod completion;
        mod epoll;
        mod notifier;
        mod platform_linux;
        mod watchdog;

        pub mod channel;
        pub mod config;
        pub mod file;
        pub mod io;
        pub mod net;
        pub mod poller;
        pub mod reactor;
        pub mod sched;
        pub mod shard;
        pub mod signal;
        pub mod smp;
        pub mod stream;
        pub mod syscall;
        pub mod timer;

        // Re-exports
        pub use channel::{Channel, LocalPacketQueue, PacketQueue, UserPacket};
        pub use config::{IoBackendKind, ReactorConfig};
        pub use file::{open_file_dma, File, FileOpenOptions, OpenFlags};
        pub use io::{register_priority_class, DmaBuffer, PriorityClass};
        pub use net::{ConnectedSocket, ListenOptions, NetworkStack, PosixStack, ServerSocket};
        pub use poller::{Poller, PollerId};
        pub use reactor::{Reactor, ReactorStats};
        pub use signal::handle_signal;
        pub use smp::{invoke_on_all, invoke_on_others, submit_to, Smp};
        pub use stream::{InputStream, OutputStream, Packet};
        pub use timer::{sleep, with_timeout, LowresClock, ManualClock, SteadyClock, Timer};
    } else {
        compile_error!("reactor-runtime supports Linux only");
    }
}
