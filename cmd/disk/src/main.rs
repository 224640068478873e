//! Disk I/O demo
//!
//! Two priority classes (shares 100 and 400) write blocks to one O_DIRECT
//! file concurrently; the IO queue admits them in proportion to their
//! shares. The file is then read back through an input stream and checked.
//!
//! Usage:
//!     cargo run --release -p reactor-disk [path] [blocks-per-class]
//!
//! Set `RCT_RELAXED_DMA=1` on filesystems without O_DIRECT support.

use reactor::file::{file_size, remove_file};
use reactor::prelude::*;
use reactor::stream::{input_from_file, FileStreamOptions};
use reactor::{local, open_file_dma, register_priority_class, DmaBuffer, File, FileOpenOptions, OpenFlags, PriorityClass};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;

const BLOCK: usize = 4096;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let path = args
        .get(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join(format!("reactor-disk-{}.dat", std::process::id())));
    let blocks: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(2048);

    println!("=== Disk: {} x {}B blocks per class into {} ===\n", blocks, BLOCK, path.display());

    let config = ReactorConfig::from_env().smp(1);
    let code = reactor::run(config, move || {
        let classes = match (register_priority_class("background", 100), register_priority_class("foreground", 400)) {
            (Ok(bg), Ok(fg)) => [bg, fg],
            (Err(e), _) | (_, Err(e)) => {
                kerror!("cannot register priority classes: {}", e);
                return Deferred::ready(1);
            }
        };
        let flags = OpenFlags::RW | OpenFlags::CREATE | OpenFlags::TRUNCATE;
        let check_path = path.clone();
        let cleanup = path.clone();
        open_file_dma(&path, flags, FileOpenOptions::new())
            .then(move |f| write_interleaved(f, classes, blocks))
            .then(move |()| verify(check_path, blocks))
            .then_result(move |r| {
                remove_file(cleanup).then_result(move |_| {
                    Deferred::ready(match r {
                        Ok(()) => 0,
                        Err(e) => {
                            kerror!("disk demo failed: {}", e);
                            1
                        }
                    })
                })
            })
    });

    match code {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("runtime failed: {}", e);
            std::process::exit(1);
        }
    }
}

/// Block `i` of class `c` lands at offset `(2 * i + c) * BLOCK`, filled
/// with its class tag.
fn write_interleaved(file: File, classes: [PriorityClass; 2], blocks: u64) -> Deferred<()> {
    let file = Rc::new(file);
    let started = Instant::now();
    let finished: Rc<[std::cell::Cell<Option<std::time::Duration>>; 2]> = Rc::default();
    let writes = (0..blocks)
        .flat_map(|i| (0..2u64).map(move |c| (i, c)))
        .map(|(i, c)| {
            let pc = classes[c as usize];
            let buf = DmaBuffer::copy_from(&[b'0' + c as u8; BLOCK], BLOCK);
            let finished = finished.clone();
            file.write_dma((2 * i + c) * BLOCK as u64, buf, pc).map(move |n| {
                if i + 1 == blocks {
                    finished[c as usize].set(Some(started.elapsed()));
                }
                n
            })
        })
        .collect();
    let closing = file.clone();
    when_all(writes)
        .then(move |written| {
            let total: usize = written.iter().sum();
            println!("Wrote {} bytes in {:?}", total, started.elapsed());
            for (c, pc) in classes.iter().enumerate() {
                let done = finished[c].get().unwrap_or_default();
                println!("  {:<11} ({:>3} shares) last write done after {:?}", pc.name(), pc.shares(), done);
            }
            for s in local().stats().io_classes {
                println!("  {:<11} ops={} bytes={} avg queue time={:?}", s.name, s.ops, s.bytes, s.queue_time);
            }
            closing.flush()
        })
        .then(move |()| match Rc::try_unwrap(file) {
            Ok(f) => f.close(),
            Err(_) => Deferred::ready(()),
        })
}

fn verify(path: PathBuf, blocks: u64) -> Deferred<()> {
    let expected = 2 * blocks * BLOCK as u64;
    let reopen = path.clone();
    file_size(path)
        .then(move |size| {
            if size != expected {
                return Deferred::failed(ReactorError::InvalidArgument("file size does not match what was written"));
            }
            open_file_dma(&reopen, OpenFlags::RO, FileOpenOptions::new())
        })
        .then(move |f| {
            let input = Rc::new(input_from_file(f, 0, FileStreamOptions::new().buffer_size(64 * 1024)));
            let reader = input.clone();
            let started = Instant::now();
            let block = Rc::new(std::cell::Cell::new(0u64));
            repeat(move || {
                let block = block.clone();
                reader.read_exactly(BLOCK).then(move |b| {
                    if b.is_empty() {
                        return Deferred::ready(Iteration::Stop);
                    }
                    let tag = b'0' + (block.get() % 2) as u8;
                    block.set(block.get() + 1);
                    if b.iter().any(|&x| x != tag) {
                        return Deferred::failed(ReactorError::InvalidArgument("block content mismatch"));
                    }
                    Deferred::ready(Iteration::Continue)
                })
            })
            .then(move |()| {
                println!("Read back and verified {} bytes in {:?}", expected, started.elapsed());
                input.close()
            })
        })
}
