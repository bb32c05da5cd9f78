//! Conflict resolution benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dsrepl_bench::{generate_updates, random_value, shuffled};
use dsrepl_core::{AttrHistoricalMultiple, Csn, EntryStore};

/// Benchmark applying updates in CSN order against a random order.
fn bench_entry_store_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("entry_store_apply");
    let ordered = generate_updates(5_000, 4, 32);
    let random = shuffled(ordered.clone());

    group.throughput(Throughput::Elements(ordered.len() as u64));
    for (name, updates) in [("in_order", &ordered), ("shuffled", &random)] {
        group.bench_function(name, |b| {
            b.iter(|| {
                let store = EntryStore::new();
                for update in updates {
                    store.apply(&update.entry_dn, &update.operation, update.csn);
                }
                black_box(store.len());
            });
        });
    }

    group.finish();
}

/// Benchmark adding values to a multi-valued attribute history.
fn bench_attribute_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("attribute_add");

    for values in [10usize, 100, 1000].iter() {
        let candidates: Vec<String> = (0..*values).map(|_| random_value(16)).collect();
        group.throughput(Throughput::Elements(*values as u64));
        group.bench_with_input(BenchmarkId::from_parameter(values), values, |b, _| {
            b.iter(|| {
                let mut history = AttrHistoricalMultiple::new();
                for (i, value) in candidates.iter().enumerate() {
                    history.add(value.as_str(), Csn::new(i as u64 + 1, 0, 1));
                }
                black_box(history.values());
            });
        });
    }

    group.finish();
}

/// Benchmark a replace racing against an older delete of every value.
fn bench_replace_conflict(c: &mut Criterion) {
    c.bench_function("replace_after_delete", |b| {
        let values: Vec<String> = (0..50).map(|_| random_value(16)).collect();
        b.iter(|| {
            let mut history = AttrHistoricalMultiple::new();
            for (i, value) in values.iter().enumerate() {
                history.add(value.as_str(), Csn::new(i as u64 + 1, 0, 1));
            }
            history.replace([values[0].as_str()], Csn::new(1_000, 0, 2));
            history.delete(Csn::new(999, 0, 3));
            black_box(history.values());
        });
    });
}

criterion_group!(
    benches,
    bench_entry_store_apply,
    bench_attribute_add,
    bench_replace_conflict
);
criterion_main!(benches);
