//! Scheduling-group fairness demo
//!
//! Runs CPU-bound loops in several scheduling groups on shard 0 and prints
//! how the shard's time was split. With shares 100/200/400 the expected
//! split is roughly 1:2:4.
//!
//! Usage:
//!     cargo run --release -p reactor-fairness [seconds] [shares,shares,...]

use reactor::prelude::*;
use reactor::task::{schedule, Task};
use reactor::{local, SchedulingGroup};
use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// CPU burned per task.
const SLICE: Duration = Duration::from_micros(50);

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let seconds: u64 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(3);
    let shares: Vec<f32> = args
        .get(2)
        .map(|s| s.split(',').filter_map(|v| v.trim().parse().ok()).collect())
        .unwrap_or_else(|| vec![100.0, 200.0, 400.0]);
    if shares.is_empty() || shares.iter().any(|&s| s < 1.0) {
        eprintln!("fairness: shares must be a comma-separated list of numbers >= 1");
        std::process::exit(2);
    }

    println!("=== Fairness: {} group(s) for {}s ===\n", shares.len(), seconds);

    let config = ReactorConfig::from_env().smp(1);
    let run = Duration::from_secs(seconds);
    let code = reactor::run(config, move || {
        let r = local();
        let groups: Vec<SchedulingGroup> = shares
            .iter()
            .enumerate()
            .map(|(i, &s)| r.create_scheduling_group(&format!("spin-{}", i), s))
            .collect();
        let deadline = Instant::now() + run;
        let loops = groups.iter().map(|&g| spin(g, deadline)).collect();
        when_all(loops).map(move |counts| {
            report(&groups, &shares, &counts);
            0
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

/// Keep `group` busy until `deadline`; resolves to the number of slices run.
fn spin(group: SchedulingGroup, deadline: Instant) -> Deferred<u64> {
    let (p, d) = promise();
    let count = Rc::new(Cell::new(0u64));
    step(group, deadline, count, p);
    d
}

fn step(group: SchedulingGroup, deadline: Instant, count: Rc<Cell<u64>>, p: Promise<u64>) {
    schedule(Task::new(group, move || {
        let start = Instant::now();
        if start >= deadline {
            p.set_value(count.get());
            return;
        }
        while start.elapsed() < SLICE {
            std::hint::spin_loop();
        }
        count.set(count.get() + 1);
        step(group, deadline, count, p);
    }));
}

fn report(groups: &[SchedulingGroup], shares: &[f32], counts: &[u64]) {
    let r = local();
    let total_shares: f32 = shares.iter().sum();
    let total_slices: u64 = counts.iter().sum::<u64>().max(1);
    println!("{:<10} {:>8} {:>10} {:>10} {:>12}", "group", "shares", "expected", "observed", "runtime");
    println!("{}", "─".repeat(54));
    for (i, &g) in groups.iter().enumerate() {
        let runtime = r.group_stats(g).map(|s| s.runtime).unwrap_or_default();
        println!(
            "{:<10} {:>8.0} {:>9.1}% {:>9.1}% {:>12?}",
            format!("spin-{}", i),
            shares[i],
            100.0 * shares[i] / total_shares,
            100.0 * counts[i] as f64 / total_slices as f64,
            runtime,
        );
    }
}
