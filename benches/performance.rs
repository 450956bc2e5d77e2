//! Performance benchmarks for the record store.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use datadb::constants::SUBTITLE_COLLECTION;
use datadb::{EngineConfig, KeyRange, LocalEngine, RecordStore};
use serde_json::json;
use tempfile::TempDir;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
}

fn subtitle(i: u64) -> serde_json::Value {
    json!({
        "type": "local",
        "src": format!("/movies/{}.srt", i),
        "format": "srt",
        "language": if i % 2 == 0 { "en" } else { "zh" },
        "lastOpened": i,
    })
}

/// Benchmark single-record adds, in memory and with the write-ahead log
fn bench_add(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("add");

    group.bench_function("in_memory", |b| {
        let store = RecordStore::data_db(LocalEngine::in_memory()).unwrap();
        let mut i = 0;
        b.iter(|| {
            i += 1;
            rt.block_on(store.add(SUBTITLE_COLLECTION, &subtitle(i)))
                .unwrap()
        });
    });

    group.bench_function("persistent", |b| {
        let dir = TempDir::new().unwrap();
        let engine = LocalEngine::new(EngineConfig {
            path: Some(dir.path().to_path_buf()),
            ..Default::default()
        });
        let store = RecordStore::data_db(engine).unwrap();
        let mut i = 0;
        b.iter(|| {
            i += 1;
            rt.block_on(store.add(SUBTITLE_COLLECTION, &subtitle(i)))
                .unwrap()
        });
    });

    group.finish();
}

/// Benchmark reads against collections of varying size
fn bench_reads(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("reads");

    for size in [100u64, 1_000, 10_000] {
        let store = RecordStore::data_db(LocalEngine::in_memory()).unwrap();
        for i in 0..size {
            rt.block_on(store.add(SUBTITLE_COLLECTION, &subtitle(i)))
                .unwrap();
        }

        group.bench_with_input(BenchmarkId::new("get", size), &size, |b, &size| {
            b.iter(|| {
                rt.block_on(store.get(SUBTITLE_COLLECTION, black_box(size as i64 / 2)))
                    .unwrap()
            });
        });

        group.bench_with_input(BenchmarkId::new("get_by_index", size), &size, |b, _| {
            b.iter(|| {
                rt.block_on(store.get_by_index(SUBTITLE_COLLECTION, "language", black_box("zh")))
                    .unwrap()
            });
        });

        let range = KeyRange::bound(1, 50, false, false).unwrap();
        group.bench_with_input(BenchmarkId::new("get_all_range", size), &size, |b, _| {
            b.iter(|| {
                rt.block_on(store.get_all(SUBTITLE_COLLECTION, Some(&range)))
                    .unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_add, bench_reads);
criterion_main!(benches);
