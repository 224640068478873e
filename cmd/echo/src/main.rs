//! Sharded TCP echo server
//!
//! Every shard listens on the same port (SO_REUSEPORT) and echoes what
//! each connection sends until the peer closes its side. Stop with Ctrl-C.
//!
//! Usage:
//!     cargo build --release -p reactor-echo
//!     ./target/release/echo [port]
//!
//! Test with:
//!     echo "hello" | nc -q1 localhost 9999
//!     for i in $(seq 1 100); do echo "ping $i" | nc -q1 localhost 9999 & done

use reactor::prelude::*;
use reactor::{invoke_on_others, ConnectedSocket, ListenOptions, PosixStack};
use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::Rc;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9999);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let config = ReactorConfig::from_env().handle_sigint(true);
    eprintln!("echo: starting {} shard(s) on {}", config.shard_count(), addr);

    let code = reactor::run(config, move || {
        invoke_on_others(move || {
            match serve(addr) {
                Ok(accepting) => accepting.discard(),
                Err(e) => kerror!("shard {} cannot listen on {}: {}", shard_id(), addr, e),
            }
            Deferred::ready(())
        })
        .then(move |()| match serve(addr) {
            // Shard 0's accept loop only ends on error; Ctrl-C exits with 0.
            Ok(accepting) => accepting.map(|()| 0),
            Err(e) => Deferred::failed(e),
        })
    });

    match code {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("echo: runtime failed: {}", e);
            std::process::exit(1);
        }
    }
}

/// Listen on this shard and accept forever.
fn serve(addr: SocketAddr) -> Result<Deferred<()>> {
    let opts = ListenOptions::new().reuse_port(true).backlog(4096);
    let server = Rc::new(PosixStack::new().listen(addr, opts)?);
    let served = Rc::new(Cell::new(0u64));
    kinfo!("shard {} listening on {}", shard_id(), server.local_addr()?);
    Ok(repeat(move || {
        let served = served.clone();
        server.accept().map(move |(conn, peer)| {
            served.set(served.get() + 1);
            kdebug!("shard {} connection #{} from {}", shard_id(), served.get(), peer);
            echo(conn, peer).discard();
            Iteration::Continue
        })
    }))
}

/// Echo one connection until EOF, then close the write side.
fn echo(conn: ConnectedSocket, peer: SocketAddr) -> Deferred<()> {
    let input = Rc::new(conn.input());
    let out = Rc::new(conn.output());
    let (reader, writer) = (input.clone(), out.clone());
    repeat(move || {
        let writer = writer.clone();
        reader.read().then(move |buf| {
            if buf.is_empty() {
                return Deferred::ready(Iteration::Stop);
            }
            let flushing = writer.clone();
            writer
                .write(&buf)
                .then(move |()| flushing.flush())
                .map(|()| Iteration::Continue)
        })
    })
    .then_result(move |r| {
        if let Err(e) = &r {
            kdebug!("connection from {} failed: {}", peer, e);
        }
        out.close().then_result(move |_| {
            drop(input);
            drop(conn);
            Deferred::ready(())
        })
    })
}
