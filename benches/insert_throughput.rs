use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use marten::{Db, DbConfig};

const PAGE_SIZE: usize = 4096;
const VALUE_SIZE: usize = 100;
const SEED: u64 = 42;

/// Database sizes to test (number of pre-existing entries)
const DB_SIZES: &[usize] = &[0, 1_000, 10_000];

fn bench_data_dir() -> PathBuf {
    PathBuf::from("target/bench-data-insert")
}

fn cleanup() {
    let _ = fs::remove_dir_all(bench_data_dir());
}

fn db_path(name: &str) -> PathBuf {
    bench_data_dir().join(name)
}

fn generate_value(size: usize) -> Vec<u8> {
    vec![b'x'; size]
}

fn create_db(name: &str) -> Db {
    let path = db_path(name);
    let _ = fs::remove_file(&path);
    Db::open(DbConfig::new(path).page_size(PAGE_SIZE)).expect("Failed to create database")
}

fn sequential_key(i: usize) -> Vec<u8> {
    format!("key_{i:010}").into_bytes()
}

fn random_key(rng: &mut StdRng) -> Vec<u8> {
    let val = rng.next_u64();
    format!("key_{val:016x}").into_bytes()
}

fn pre_populate(db: &Db, count: usize) {
    let tree = db.index("bench").expect("Failed to open index");
    let value = generate_value(VALUE_SIZE);
    for i in 0..count {
        tree.put(&sequential_key(i), &value).expect("Failed to insert");
    }
}

fn insert_throughput(c: &mut Criterion) {
    cleanup();
    let mut group = c.benchmark_group("insert_throughput");
    group.measurement_time(Duration::from_secs(10));

    for &size in DB_SIZES {
        let db = create_db(&format!("seq-{size}.mtdb"));
        pre_populate(&db, size);
        let tree = db.index("bench").unwrap();
        let value = generate_value(VALUE_SIZE);
        let mut next = size;

        group.bench_with_input(BenchmarkId::new("sequential", size), &size, |b, _| {
            b.iter(|| {
                let key = sequential_key(next);
                next += 1;
                tree.put(black_box(&key), black_box(&value)).unwrap();
            })
        });

        let db = create_db(&format!("rand-{size}.mtdb"));
        pre_populate(&db, size);
        let tree = db.index("bench").unwrap();
        let mut rng = StdRng::seed_from_u64(SEED);

        group.bench_with_input(BenchmarkId::new("random", size), &size, |b, _| {
            b.iter(|| {
                let key = random_key(&mut rng);
                tree.put(black_box(&key), black_box(&value)).unwrap();
            })
        });
    }

    group.finish();
    cleanup();
}

criterion_group!(benches, insert_throughput);
criterion_main!(benches);
