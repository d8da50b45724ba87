//! End-to-end tests against small store geometries.

use tierkv::{Config, Partition, Store, TierError, VarStore};

/// A geometry small enough that migrations and log rotations happen within a
/// few thousand inserts.
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

fn range_config() -> Config {
    Config::builder()
        .dram_bits(4)
        .pmem_bits(5)
        .fanout_bits(2)
        .subdivision_bits(1)
        .log_num_bits(1)
        .chunk_size(16 * 1024)
        .partition(Partition::Range)
        .range(0, 1 << 16)
        .filter_recovery_threads(2)
        .build()
}

#[test]
fn round_trip_through_all_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_with_config(dir.path(), small_config(), true).unwrap();

    // Enough to overflow DRAM entries and push older keys down the levels.
    for i in 0..20_000u64 {
        store.insert(i, i * 3 + 1);
    }
    for i in 0..20_000u64 {
        assert_eq!(store.lookup(i), Some(i * 3 + 1), "key {i}");
    }
    assert_eq!(store.lookup(20_001), None);
}

#[test]
fn updates_shadow_older_versions() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_with_config(dir.path(), small_config(), true).unwrap();

    store.insert(42, 99);
    store.insert(42, 100);
    store.insert(42, 99);
    assert_eq!(store.lookup(42), Some(99));

    // Still the newest version after both land on different tiers.
    store.checkpoint(1);
    store.insert(42, 7);
    assert_eq!(store.lookup(42), Some(7));
}

#[test]
fn removed_keys_stay_gone() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_with_config(dir.path(), small_config(), true).unwrap();

    for i in 0..1000u64 {
        store.insert(i, i);
    }
    for i in (0..1000u64).step_by(2) {
        store.remove(i);
    }
    for i in 0..1000u64 {
        if i % 2 == 0 {
            assert_eq!(store.lookup(i), None, "key {i}");
        } else {
            assert_eq!(store.lookup(i), Some(i), "key {i}");
        }
    }

    // A tombstone shadows the migrated version too.
    store.checkpoint(1);
    assert_eq!(store.lookup(0), None);
    store.insert(0, 5);
    assert_eq!(store.lookup(0), Some(5));
}

#[test]
fn unlogged_inserts_are_readable() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_with_config(dir.path(), small_config(), true).unwrap();

    for i in 0..500u64 {
        store.insert_with(i, i + 1, false, false);
    }
    for i in 0..500u64 {
        assert_eq!(store.lookup(i), Some(i + 1));
    }
}

#[test]
fn count_tracks_distinct_single_inserts() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_with_config(dir.path(), small_config(), true).unwrap();

    for i in 0..5_000u64 {
        store.insert(i, i);
    }
    assert_eq!(store.count(), 5_000);
}

#[test]
fn checkpoint_drains_dram() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_with_config(dir.path(), small_config(), true).unwrap();

    for i in 0..3_000u64 {
        store.insert(i, i + 9);
    }
    store.checkpoint(4);
    for i in 0..3_000u64 {
        assert_eq!(store.lookup(i), Some(i + 9), "key {i}");
    }
}

#[test]
fn open_without_reset_requires_an_existing_store() {
    let dir = tempfile::tempdir().unwrap();
    match Store::open_with_config(dir.path(), small_config(), false) {
        Err(TierError::StoreMissing(_)) => {}
        other => panic!("expected StoreMissing, got {other:?}"),
    }
}

// =============================================================================
// Range scans
// =============================================================================

#[test]
fn scan_returns_ordered_live_pairs() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_with_config(dir.path(), range_config(), true).unwrap();

    // Sparse keys so the scan crosses entry boundaries.
    for k in (0..30_000u64).step_by(3) {
        store.insert(k, k);
    }

    let results = store.scan(1_000, 50).unwrap();
    assert_eq!(results.len(), 50);
    let expected: Vec<u64> = (0..50).map(|i| 1_002 + 3 * i).collect();
    for (got, want) in results.iter().zip(expected) {
        assert_eq!(got.0, want);
        assert_eq!(got.1, want);
    }
}

#[test]
fn scan_starts_at_the_lower_bound_inclusive() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_with_config(dir.path(), range_config(), true).unwrap();

    for k in 0..2_000u64 {
        store.insert(k, k);
    }
    let results = store.scan(500, 5).unwrap();
    let keys: Vec<u64> = results.iter().map(|&(k, _)| k).collect();
    assert_eq!(keys, vec![500, 501, 502, 503, 504]);
}

#[test]
fn scan_spans_dram_and_migrated_levels() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_with_config(dir.path(), range_config(), true).unwrap();

    for k in 0..10_000u64 {
        store.insert(k, k + 1);
    }
    // Everything below is now in PMEM, fresh writes stay in DRAM.
    store.checkpoint(2);
    for k in 10_000..10_100u64 {
        store.insert(k, k + 1);
    }

    let results = store.scan(9_990, 20).unwrap();
    let keys: Vec<u64> = results.iter().map(|&(k, _)| k).collect();
    let expected: Vec<u64> = (9_990..10_010).collect();
    assert_eq!(keys, expected);
    assert!(results.iter().all(|&(k, v)| v == k + 1));
}

#[test]
fn scan_skips_tombstones() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_with_config(dir.path(), range_config(), true).unwrap();

    for k in 100..200u64 {
        store.insert(k, k);
    }
    store.remove(150);
    store.remove(151);

    let results = store.scan(148, 6).unwrap();
    let keys: Vec<u64> = results.iter().map(|&(k, _)| k).collect();
    assert_eq!(keys, vec![148, 149, 152, 153]);
}

#[test]
fn scan_past_the_data_returns_what_is_left() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_with_config(dir.path(), range_config(), true).unwrap();

    for k in 0..100u64 {
        store.insert(k, k);
    }
    let results = store.scan(95, 50).unwrap();
    assert_eq!(results.len(), 5);
    assert_eq!(store.scan(40_000, 10).unwrap(), vec![]);
}

// =============================================================================
// Variable-length keys
// =============================================================================

#[test]
fn var_keys_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = VarStore::open_with_config(dir.path(), small_config(), true).unwrap();

    for i in 0..4_000u32 {
        let key = format!("user:{i:08}");
        let value = format!("profile-{}", i * 7);
        store.insert(key.as_bytes(), value.as_bytes());
    }
    for i in 0..4_000u32 {
        let key = format!("user:{i:08}");
        let value = format!("profile-{}", i * 7);
        assert_eq!(store.lookup(key.as_bytes()).as_deref(), Some(value.as_bytes()));
    }
    assert_eq!(store.lookup(b"user:missing"), None);
}

#[test]
fn var_key_updates_and_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let store = VarStore::open_with_config(dir.path(), small_config(), true).unwrap();

    store.insert(b"alpha", b"one");
    store.insert(b"alpha", b"two");
    assert_eq!(store.lookup(b"alpha").as_deref(), Some(b"two".as_slice()));

    store.remove(b"alpha");
    assert_eq!(store.lookup(b"alpha"), None);

    store.insert(b"alpha", b"three");
    assert_eq!(store.lookup(b"alpha").as_deref(), Some(b"three".as_slice()));
}

#[test]
fn var_key_update_churn_reclaims_payload_space() {
    let dir = tempfile::tempdir().unwrap();
    let store = VarStore::open_with_config(dir.path(), small_config(), true).unwrap();

    // Four versions per key with values big enough to cycle every payload
    // chunk, forcing rotation and at least one compaction per log.
    let filler = [0x5Au8; 200];
    for round in 0..4u32 {
        for i in 0..2_000u32 {
            let key = format!("churn:{i:06}");
            let mut value = filler.to_vec();
            value[..4].copy_from_slice(&round.to_le_bytes());
            store.insert(key.as_bytes(), &value);
        }
    }
    for i in 0..2_000u32 {
        let key = format!("churn:{i:06}");
        let got = store.lookup(key.as_bytes()).unwrap();
        assert_eq!(&got[..4], &3u32.to_le_bytes(), "key {i}");
        assert_eq!(got.len(), filler.len());
    }
}

#[test]
fn var_values_of_mixed_sizes_survive_migration() {
    let dir = tempfile::tempdir().unwrap();
    let store = VarStore::open_with_config(dir.path(), small_config(), true).unwrap();

    let big = vec![0xA5u8; 3_000];
    for i in 0..500u32 {
        let key = format!("blob/{i}");
        if i % 10 == 0 {
            store.insert(key.as_bytes(), &big);
        } else {
            store.insert(key.as_bytes(), &i.to_le_bytes());
        }
    }
    store.checkpoint(2);
    for i in 0..500u32 {
        let key = format!("blob/{i}");
        let got = store.lookup(key.as_bytes()).unwrap();
        if i % 10 == 0 {
            assert_eq!(got, big);
        } else {
            assert_eq!(got, i.to_le_bytes());
        }
    }
}
