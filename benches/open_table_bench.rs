use criterion::{black_box, criterion_group, criterion_main, Criterion};

use compressfs_core::background::BackgroundQueue;
use compressfs_core::config::Config;
use compressfs_core::open_table::OpenTable;

/// Open/close-turnover churn through the open table: `open` on a spread of
/// paths followed by a `purge` pass, repeated. This is the hot path a live
/// mount drives on every `release()` call.
fn bench_open_purge_churn(c: &mut Criterion) {
    let config = Config::default();
    let queue = BackgroundQueue::new();
    let root = tempfile::tempdir().unwrap();

    c.bench_function("open_table_open_purge_1000_paths", |b| {
        b.iter(|| {
            let table = OpenTable::new();
            for i in 0..1000 {
                let path = format!("file-{}", i % 64);
                let record = table.open(black_box(&path), false);
                black_box(&record);
            }
            table.purge(root.path(), &config, &queue, true);
        });
    });
}

/// Repeated `open` of the same path, the case where the table should find
/// the existing record rather than allocate a new one.
fn bench_open_same_path(c: &mut Criterion) {
    let table = OpenTable::new();

    c.bench_function("open_table_reopen_same_path", |b| {
        b.iter(|| {
            let record = table.open(black_box("hot-file"), false);
            black_box(record);
        });
    });
}

criterion_group!(benches, bench_open_purge_churn, bench_open_same_path);
criterion_main!(benches);
