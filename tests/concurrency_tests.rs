//! Concurrent writer/reader tests over shared store handles.

use std::sync::atomic::{AtomicBool, Ordering};

use tierkv::{Config, Store, VarStore};

fn small_config() -> Config {
    Config::builder()
        .dram_bits(4)
        .pmem_bits(5)
        .fanout_bits(2)
        .subdivision_bits(1)
        .log_num_bits(1)
        .chunk_size(16 * 1024)
        .payload_chunk_size(16 * 4096)
        .filter_recovery_threads(2)
        .build()
}

#[test]
fn concurrent_writers_on_disjoint_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_with_config(dir.path(), small_config(), true).unwrap();

    const WRITERS: u64 = 4;
    const PER_WRITER: u64 = 3_000;

    crossbeam::thread::scope(|scope| {
        for w in 0..WRITERS {
            let store = &store;
            scope.spawn(move |_| {
                let base = w * 100_000;
                for i in 0..PER_WRITER {
                    store.insert(base + i, base + i + 1);
                }
            });
        }
    })
    .unwrap();

    for w in 0..WRITERS {
        let base = w * 100_000;
        for i in 0..PER_WRITER {
            assert_eq!(store.lookup(base + i), Some(base + i + 1), "writer {w} key {i}");
        }
    }
    assert_eq!(store.count(), WRITERS * PER_WRITER);
}

#[test]
fn readers_race_writers_without_torn_values() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_with_config(dir.path(), small_config(), true).unwrap();

    const KEYS: u64 = 512;
    for k in 0..KEYS {
        store.insert(k, k << 32 | k);
    }

    let stop = AtomicBool::new(false);
    crossbeam::thread::scope(|scope| {
        let store = &store;
        let stop = &stop;

        // Writers keep rewriting with self-checking values.
        for w in 0..2u64 {
            scope.spawn(move |_| {
                let mut round = 1u64;
                while !stop.load(Ordering::Relaxed) {
                    for k in (w..KEYS).step_by(2) {
                        store.insert(k, (k + round) << 32 | (k + round));
                    }
                    round += 1;
                }
            });
        }

        // Readers only ever observe a value some writer produced whole.
        for _ in 0..2 {
            scope.spawn(move |_| {
                for _ in 0..20_000 {
                    let k = fastrand_key();
                    if let Some(v) = store.lookup(k % KEYS) {
                        assert_eq!(v >> 32, v & 0xFFFF_FFFF, "torn value for key {}", k % KEYS);
                    }
                }
            });
        }

        std::thread::sleep(std::time::Duration::from_millis(200));
        stop.store(true, Ordering::Relaxed);
    })
    .unwrap();
}

fn fastrand_key() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().subsec_nanos() as u64;
    nanos.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

#[test]
fn concurrent_var_writers() {
    let dir = tempfile::tempdir().unwrap();
    let store = VarStore::open_with_config(dir.path(), small_config(), true).unwrap();

    crossbeam::thread::scope(|scope| {
        for w in 0..4u32 {
            let store = &store;
            scope.spawn(move |_| {
                for i in 0..1_000u32 {
                    let key = format!("w{w}/k{i}");
                    let value = format!("w{w}/v{i}");
                    store.insert(key.as_bytes(), value.as_bytes());
                }
            });
        }
    })
    .unwrap();

    for w in 0..4u32 {
        for i in 0..1_000u32 {
            let key = format!("w{w}/k{i}");
            let value = format!("w{w}/v{i}");
            assert_eq!(
                store.lookup(key.as_bytes()),
                Some(value.into_bytes()),
                "key {key}"
            );
        }
    }
}

#[test]
fn parallel_checkpoint_is_complete() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_with_config(dir.path(), small_config(), true).unwrap();

    for i in 0..6_000u64 {
        store.insert(i, i ^ 0xABCD);
    }
    store.checkpoint(8);
    for i in 0..6_000u64 {
        assert_eq!(store.lookup(i), Some(i ^ 0xABCD), "key {i}");
    }
}
