//! Event dispatch benchmarks.
//!
//! Measures the per-event cost of snapshotting the cause, journaling the
//! event and running listeners inside their own frames.
//!
//! Run with: `cargo bench --bench dispatch_benchmarks`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use causeway_journal::prelude::*;
use causeway_stack::prelude::*;

const BLOCK: ContextKey<u32> = ContextKey::new("block");

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn dispatcher_with_listeners(count: usize) -> EventDispatcher {
    let mut dispatcher = EventDispatcher::new();
    for i in 0..count {
        dispatcher.subscribe("block_break", format!("listener_{i}"), |causes, _, _, _| {
            causes.add_context(&BLOCK, 1)?;
            Ok(())
        });
    }
    dispatcher
}

// ---------------------------------------------------------------------------
// Benchmark 1: post with no listeners (snapshot + journal only)
// ---------------------------------------------------------------------------

fn bench_post_no_listeners(c: &mut Criterion) {
    let mut causes = CauseStackManager::new();
    causes.push_cause(CauseEntry::new("player")).unwrap();
    let mut dispatcher = EventDispatcher::new();

    c.bench_function("post_no_listeners", |b| {
        b.iter(|| {
            black_box(dispatcher.post(&mut causes, Event::named("block_break")).unwrap());
            dispatcher.journal_mut().clear();
        });
    });
}

// ---------------------------------------------------------------------------
// Benchmark 2: post scaling with listener count
// ---------------------------------------------------------------------------

fn bench_post_listener_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("post_listener_scaling");

    for count in [1usize, 8, 64] {
        let mut causes = CauseStackManager::new();
        causes.push_cause(CauseEntry::new("player")).unwrap();
        let mut dispatcher = dispatcher_with_listeners(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &_count| {
            b.iter(|| {
                black_box(dispatcher.post(&mut causes, Event::named("block_break")).unwrap());
                dispatcher.journal_mut().clear();
            });
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark 3: re-entrant chain
// ---------------------------------------------------------------------------

fn bench_reentrant_chain(c: &mut Criterion) {
    let mut causes = CauseStackManager::new();
    let mut dispatcher = EventDispatcher::new();
    for (from, to) in [("a", "b"), ("b", "c"), ("c", "d")] {
        dispatcher.subscribe(from, format!("{from}_to_{to}"), move |causes, dispatcher, _, _| {
            dispatcher.post(causes, Event::named(to))?;
            Ok(())
        });
    }

    c.bench_function("reentrant_chain_depth_4", |b| {
        b.iter(|| {
            black_box(dispatcher.post(&mut causes, Event::named("a")).unwrap());
            dispatcher.journal_mut().clear();
        });
    });
}

// ---------------------------------------------------------------------------
// Criterion groups and main
// ---------------------------------------------------------------------------

criterion_group!(
    benches,
    bench_post_no_listeners,
    bench_post_listener_scaling,
    bench_reentrant_chain,
);
criterion_main!(benches);
