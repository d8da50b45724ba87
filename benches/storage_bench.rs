//! Benchmarks for tierkv storage operations

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use tierkv::{Config, Store};

fn bench_config() -> Config {
    Config::builder()
        .dram_bits(6)
        .pmem_bits(7)
        .fanout_bits(2)
        .subdivision_bits(1)
        .log_num_bits(1)
        .chunk_size(64 * 1024)
        .build()
}

fn storage_benchmarks(c: &mut Criterion) {
    // Bounded keyspaces keep the working set inside the preallocated levels
    // no matter how many iterations criterion decides to run.
    c.bench_function("insert_sequential", |b| {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_with_config(dir.path(), bench_config(), true).unwrap();
        let mut key = 0u64;
        b.iter(|| {
            store.insert(key % 10_000, key + 1);
            key += 1;
        });
    });

    c.bench_function("lookup_hit", |b| {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_with_config(dir.path(), bench_config(), true).unwrap();
        for i in 0..10_000u64 {
            store.insert(i, i * 2);
        }
        let mut key = 0u64;
        b.iter(|| {
            let v = store.lookup(key % 10_000);
            key = key.wrapping_add(0x9E37_79B9_7F4A_7C15);
            v
        });
    });

    c.bench_function("lookup_miss", |b| {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_with_config(dir.path(), bench_config(), true).unwrap();
        for i in 0..10_000u64 {
            store.insert(i, i);
        }
        b.iter(|| store.lookup(1 << 40));
    });

    c.bench_function("mixed_90_10", |b| {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_with_config(dir.path(), bench_config(), true).unwrap();
        for i in 0..10_000u64 {
            store.insert(i, i);
        }
        let mut op = 0u64;
        b.iter(|| {
            op = op.wrapping_add(0x9E37_79B9_7F4A_7C15);
            if op % 10 == 0 {
                store.insert(op % 10_000, op);
                None
            } else {
                store.lookup(op % 10_000)
            }
        });
    });

    c.bench_function("checkpoint_10k", |b| {
        b.iter_batched(
            || {
                let dir = tempfile::tempdir().unwrap();
                let store = Store::open_with_config(dir.path(), bench_config(), true).unwrap();
                for i in 0..10_000u64 {
                    store.insert(i, i);
                }
                (dir, store)
            },
            |(_dir, store)| store.checkpoint(4),
            BatchSize::PerIteration,
        );
    });
}

criterion_group!(benches, storage_benchmarks);
criterion_main!(benches);
