//! Criterion benchmarks for change propagation.
//!
//! Three shapes:
//!
//! - **Chain**: one signal feeding a line of computeds
//! - **Fan-out**: one signal feeding many independent effects
//! - **Batch**: many writes coalesced into one flush
//!
//! Run with: `cargo bench -p shelf-reactive`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use shelf_reactive::{Computed, Effect, Runtime, Signal};

const SIZES: &[usize] = &[10, 100, 1000];

fn chain(rt: &Runtime, len: usize) -> (Signal<u64>, Computed<u64>) {
    let source = rt.signal(0u64);
    let mut last = {
        let source = source.clone();
        rt.computed(move || source.get() + 1)
    };
    last.get();
    for _ in 1..len {
        let prev = last.clone();
        last = rt.computed(move || prev.get() + 1);
        // Resolve link by link; a cold pull nests one evaluation per link
        // and would pass `max_tracking_depth`.
        last.get();
    }
    (source, last)
}

fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("propagation/chain");
    for &len in SIZES {
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, &len| {
            let rt = Runtime::new();
            let (source, tail) = chain(&rt, len);
            let mut value = 0u64;
            b.iter(|| {
                value += 1;
                source.set(value);
                rt.flush().unwrap();
                black_box(tail.get());
            });
        });
    }
    group.finish();
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("propagation/fan_out");
    for &width in SIZES {
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, &width| {
            let rt = Runtime::new();
            let source = rt.signal(0u64);
            let _effects: Vec<Effect> = (0..width)
                .map(|_| {
                    let source = source.clone();
                    rt.effect(move || {
                        black_box(source.get());
                    })
                })
                .collect();
            let mut value = 0u64;
            b.iter(|| {
                value += 1;
                source.set(value);
                rt.flush().unwrap();
            });
        });
    }
    group.finish();
}

fn bench_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("propagation/batch");
    for &writes in SIZES {
        group.bench_with_input(BenchmarkId::from_parameter(writes), &writes, |b, &writes| {
            let rt = Runtime::new();
            let signals: Vec<Signal<u64>> = (0..writes).map(|_| rt.signal(0)).collect();
            let _sum = {
                let signals = signals.clone();
                rt.effect(move || {
                    black_box(signals.iter().map(Signal::get).sum::<u64>());
                })
            };
            let mut value = 0u64;
            b.iter(|| {
                value += 1;
                rt.batch(|| {
                    for signal in &signals {
                        signal.set(value);
                    }
                });
                rt.flush().unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_chain, bench_fan_out, bench_batch);
criterion_main!(benches);
