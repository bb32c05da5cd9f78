//! Changelog benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dsrepl_bench::generate_updates;
use dsrepl_core::{ChangelogDb, Csn, LogConfig, ServerState, SyncPolicy};
use std::sync::Arc;
use tempfile::TempDir;

fn open(dir: &TempDir) -> Arc<ChangelogDb> {
    let config = LogConfig::default().with_sync_policy(SyncPolicy::Manual);
    Arc::new(ChangelogDb::open(dir.path(), config).unwrap())
}

/// Benchmark appending records of various sizes.
fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("changelog_append");
    group.sample_size(50);

    for size in [32, 256, 2048].iter() {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let dir = TempDir::new().unwrap();
            let db = open(&dir);
            let template = generate_updates(1, 1, size).remove(0);
            let mut time = 1_000u64;

            b.iter(|| {
                let mut record = template.clone();
                record.csn = Csn::new(time, 0, 1);
                time += 1;
                black_box(db.append(black_box(&record)).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark reading the whole changelog through a cursor.
fn bench_cursor_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("changelog_scan");
    group.sample_size(20);

    for replicas in [1u16, 4, 16].iter() {
        let count = 10_000;
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        for record in generate_updates(count, *replicas, 64) {
            db.append(&record).unwrap();
        }

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("replicas", replicas), replicas, |b, _| {
            b.iter(|| {
                let mut cursor = db.cursor(&ServerState::new());
                let mut seen = 0usize;
                while let Some(record) = cursor.next().unwrap() {
                    black_box(record);
                    seen += 1;
                }
                assert_eq!(seen, count);
            });
        });
    }

    group.finish();
}

/// Benchmark point lookups by CSN.
fn bench_find(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let updates = generate_updates(10_000, 4, 64);
    for record in &updates {
        db.append(record).unwrap();
    }
    let targets: Vec<Csn> = updates.iter().step_by(97).map(|r| r.csn).collect();

    c.bench_function("changelog_find", |b| {
        let mut i = 0;
        b.iter(|| {
            let csn = targets[i % targets.len()];
            i += 1;
            black_box(db.find(black_box(csn)).unwrap());
        });
    });
}

criterion_group!(benches, bench_append, bench_cursor_scan, bench_find);
criterion_main!(benches);
