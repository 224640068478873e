use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use reactor_core::task::Task;
use reactor_core::Deferred;
use reactor_runtime::io::FairQueue;
use reactor_runtime::sched::{run_some_tasks, PreemptFlag, Scheduler};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

fn run_groups(c: &mut Criterion) {
    let mut group = c.benchmark_group("run_some_tasks");
    for groups in [1usize, 4, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(groups), &groups, |b, &groups| {
            let sched = RefCell::new(Scheduler::new(Duration::from_micros(500), 1000));
            let ids: Vec<_> = (0..groups)
                .map(|i| sched.borrow_mut().create_group(format!("g{}", i), 100.0 * (i + 1) as f32))
                .collect();
            let preempt = PreemptFlag::new();
            let counter = Rc::new(Cell::new(0u64));
            b.iter(|| {
                for i in 0..1024 {
                    let c = counter.clone();
                    let g = ids[i % ids.len()];
                    sched.borrow_mut().add_task(Task::new(g, move || c.set(c.get() + 1)));
                }
                let mut ran = 0;
                while ran < 1024 {
                    ran += run_some_tasks(&sched, &preempt, Task::run);
                }
                black_box(ran)
            });
        });
    }
    group.finish();
}

fn fair_queue_dispatch(c: &mut Criterion) {
    c.bench_function("fair_queue_2_classes_1024_requests", |b| {
        let fq = Rc::new(FairQueue::new(4));
        b.iter(|| {
            let mut all = Vec::with_capacity(1024);
            for i in 0..1024u32 {
                let class = i % 2;
                all.push(fq.queue(class, 100 + 900 * class, 1, move || Deferred::ready(i)));
            }
            for mut d in all {
                black_box(d.try_take());
            }
        })
    });
}

criterion_group!(benches, run_groups, fair_queue_dispatch);
criterion_main!(benches);
