//! Basic reactor example
//!
//! Boots the shards, calls into each of them, sleeps on a timer and
//! bounds concurrency with a semaphore.
//!
//! # Environment Variables
//!
//! - `RCT_SMP=4` - Number of shards (default: one per CPU)
//! - `RCT_FLUSH_EPRINT=1` - Flush log output immediately
//! - `RCT_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)

use reactor::prelude::*;
use reactor::{invoke_on_all, local};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// RCT_LOG_LEVEL=debug RCT_SMP=4 cargo run -p reactor-basic
fn main() {
    println!("=== Reactor Basic Example ===\n");

    let config = ReactorConfig::from_env();
    config.print();

    let code = reactor::run(config, || {
        let started = Instant::now();
        greet_every_shard()
            .then(sum_on_shards)
            .then(|total| {
                println!("Sum of squares computed across shards: {}", total);
                bounded_sleepers()
            })
            .map(move |()| {
                println!("\nAll steps done in {:?}", started.elapsed());
                0
            })
    });

    match code {
        Ok(code) => {
            println!("\n=== Example Complete (exit {}) ===", code);
            std::process::exit(code);
        }
        Err(e) => {
            eprintln!("runtime failed: {}", e);
            std::process::exit(1);
        }
    }
}

/// Every shard logs its id once.
fn greet_every_shard() -> Deferred<()> {
    let seen = Arc::new(AtomicUsize::new(0));
    let counted = seen.clone();
    invoke_on_all(move || {
        counted.fetch_add(1, Ordering::SeqCst);
        kinfo!("hello from shard {} of {}", shard_id(), shard_count());
        Deferred::ready(())
    })
    .map(move |()| println!("{} shard(s) answered", seen.load(Ordering::SeqCst)))
}

/// Square 1..=100 round-robin over the shards and add the results here.
fn sum_on_shards(_: ()) -> Deferred<u64> {
    let n = shard_count();
    let calls = (1..=100u64)
        .map(|i| submit_to((i % n as u64) as u32, move || Deferred::ready(i * i)))
        .collect();
    when_all(calls).map(|squares| squares.into_iter().sum())
}

/// Ten sleepers, at most three asleep at once.
fn bounded_sleepers() -> Deferred<()> {
    let sem = Rc::new(Semaphore::new(3));
    let peak = Rc::new(std::cell::Cell::new(0usize));
    let sleepers = (0..10u64)
        .map(|i| {
            let sem = sem.clone();
            let peak = peak.clone();
            sem.wait(1).then(move |()| {
                let asleep = 3 - sem.current();
                peak.set(peak.get().max(asleep));
                kdebug!("sleeper {} going down ({} asleep)", i, asleep);
                sleep(Duration::from_millis(10 + i)).finally(move || sem.signal(1))
            })
        })
        .collect();
    when_all(sleepers).map(move |_| {
        println!("Ten sleepers finished; at most {} slept at once", peak.get());
        let stats = local().stats();
        println!("Shard 0 ran {} tasks so far", stats.tasks_processed);
    })
}
