//! Throughput benchmarks for the chunked bag.
//!
//! Run with: cargo bench

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};

use tether_bag::{ChunkedBag, default_capacity};

const COUNT: usize = 100_000;
const CAP: usize = default_capacity::<u64>();

// ============================================================================
// Emplace
// ============================================================================

fn bench_emplace(c: &mut Criterion) {
    let mut group = c.benchmark_group("emplace");
    group.throughput(Throughput::Elements(COUNT as u64));

    group.bench_function("fresh", |b| {
        b.iter(|| {
            let bag: ChunkedBag<u64, CAP> = ChunkedBag::new();
            for i in 0..COUNT as u64 {
                black_box(bag.emplace(i));
            }
            bag
        });
    });

    group.bench_function("with_cursor", |b| {
        b.iter(|| {
            let bag: ChunkedBag<u64, CAP> = ChunkedBag::new();
            let mut cursors = Vec::with_capacity(COUNT);
            for i in 0..COUNT as u64 {
                cursors.push(bag.emplace(i).into_tracked());
            }
            (bag, cursors)
        });
    });

    group.finish();
}

// ============================================================================
// Iterate
// ============================================================================

fn bench_iterate(c: &mut Criterion) {
    let mut group = c.benchmark_group("iterate");
    group.throughput(Throughput::Elements(COUNT as u64));

    let bag: ChunkedBag<u64, CAP> = ChunkedBag::new();
    for i in 0..COUNT as u64 {
        bag.emplace(i);
    }

    group.bench_function("exclusive", |b| {
        b.iter(|| {
            let mut sum = 0u64;
            bag.iterate(|entry| sum = sum.wrapping_add(*entry.get()));
            black_box(sum)
        });
    });

    group.bench_function("shared", |b| {
        b.iter(|| {
            let mut sum = 0u64;
            bag.iterate_shared(|entry| sum = sum.wrapping_add(*entry.get()));
            black_box(sum)
        });
    });

    group.bench_function("mutate", |b| {
        b.iter(|| {
            bag.iterate(|entry| *entry.get_mut() += 1);
        });
    });

    group.finish();
}

// ============================================================================
// Churn (erase + re-emplace through the free list)
// ============================================================================

fn bench_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("churn");
    group.throughput(Throughput::Elements(COUNT as u64));

    group.bench_function("erase_half_refill", |b| {
        let bag: ChunkedBag<u64, CAP> = ChunkedBag::new();
        for i in 0..COUNT as u64 {
            bag.emplace(i);
        }

        b.iter(|| {
            bag.iterate(|entry| {
                if *entry.get() % 2 == 0 {
                    bag.erase(&entry);
                }
            });
            for i in 0..COUNT as u64 / 2 {
                bag.emplace(i * 2);
            }
        });
    });

    group.finish();
}

// ============================================================================
// Cursor dereference
// ============================================================================

fn bench_cursor(c: &mut Criterion) {
    let mut group = c.benchmark_group("cursor");

    let bag: ChunkedBag<u64, CAP> = ChunkedBag::new();
    for i in 0..1000u64 {
        bag.emplace(i);
    }
    let cursor = bag.emplace(7).into_tracked();

    group.bench_function("lock", |b| {
        b.iter(|| {
            let access = cursor.lock().unwrap();
            black_box(*access.get())
        });
    });

    group.bench_function("lock_shared", |b| {
        b.iter(|| {
            let access = cursor.lock_shared().unwrap();
            black_box(*access)
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_emplace,
    bench_iterate,
    bench_churn,
    bench_cursor
);
criterion_main!(benches);
