//! Property and invariant tests for the store's numbered invariants.
//! Invariants that need wall-clock timing or multi-store coordination
//! (4, 9, 10, 11, 12) are plain `#[test]`s; the rest are `quickcheck`
//! properties over arbitrary keys/values/tags.

use std::collections::BTreeSet;
use std::time::Duration;

use corestore::config::{ReplicationConfig, ReplicationMode, StoreConfig};
use corestore::error::StoreError;
use corestore::query::Operator;
use corestore::store::Store;
use quickcheck_macros::quickcheck;

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter("corestore=debug").try_init();
    });
}

fn store_in(tmp: &tempfile::TempDir, db: &str) -> std::sync::Arc<Store> {
    init_tracing();
    let config = StoreConfig::builder()
        .data_folder_path(tmp.path())
        .db(db)
        .namespace("default")
        .build();
    Store::open(config).unwrap()
}

fn sanitize_key(raw: String) -> String {
    let trimmed: String = raw.chars().filter(|c| !c.is_control()).take(200).collect();
    if trimmed.is_empty() { "k".to_string() } else { trimmed }
}

/// Invariant 1: `set(k,v); get(k) == v`.
#[quickcheck]
fn invariant_set_then_get_round_trips(key: String, value: Vec<u8>) -> bool {
    let key = sanitize_key(key);
    let tmp = tempfile::tempdir().unwrap();
    let store = store_in(&tmp, "inv1");
    store.set(&key, &value, Vec::<String>::new()).unwrap();
    store.get(&key).unwrap() == value
}

/// Invariant 2: the second `set` wins.
#[quickcheck]
fn invariant_second_set_wins(key: String, v1: Vec<u8>, v2: Vec<u8>) -> bool {
    let key = sanitize_key(key);
    let tmp = tempfile::tempdir().unwrap();
    let store = store_in(&tmp, "inv2");
    store.set(&key, &v1, Vec::<String>::new()).unwrap();
    store.set(&key, &v2, Vec::<String>::new()).unwrap();
    store.get(&key).unwrap() == v2
}

/// Invariant 3: delete leaves NotFound behind.
#[quickcheck]
fn invariant_delete_then_get_is_not_found(key: String, value: Vec<u8>) -> bool {
    let key = sanitize_key(key);
    let tmp = tempfile::tempdir().unwrap();
    let store = store_in(&tmp, "inv3");
    store.set(&key, &value, Vec::<String>::new()).unwrap();
    store.delete(&key).unwrap();
    matches!(store.get(&key), Err(StoreError::NotFound))
}

/// Invariant 5: a tag superset query excludes a key that lacks the
/// extra tag.
#[quickcheck]
fn invariant_query_by_tags_respects_tag_set(key: String, extra_absent_tag: String) -> bool {
    let key = sanitize_key(key);
    let extra = sanitize_key(extra_absent_tag);
    if extra == "present" {
        return true;
    }
    let tmp = tempfile::tempdir().unwrap();
    let store = store_in(&tmp, "inv5");
    store.set(&key, b"v", ["present"]).unwrap();

    let subset = store.query_by_tags(&["present".to_string()]).unwrap();
    let superset = store.query_by_tags(&["present".to_string(), extra]).unwrap();
    subset.contains_key(&key) && !superset.contains_key(&key)
}

/// Invariant 6: AND/OR are commutative, NOT is universe-minus-union.
#[test]
fn invariant_query_operators_commute_and_not_is_complement() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_in(&tmp, "inv6");
    store.set("p1", b"1", ["red", "big"]).unwrap();
    store.set("p2", b"2", ["red"]).unwrap();
    store.set("p3", b"3", ["blue"]).unwrap();

    let and_ab = store.query_by_tags(&["red".to_string(), "big".to_string()]).unwrap();
    let and_ba = store.query_by_tags(&["big".to_string(), "red".to_string()]).unwrap();
    assert_eq!(
        and_ab.keys().cloned().collect::<BTreeSet<_>>(),
        and_ba.keys().cloned().collect::<BTreeSet<_>>()
    );

    let or_ab = store.query_by_tags_advanced(&["red".to_string(), "blue".to_string()], Operator::Or, 0, 10);
    let or_ba = store.query_by_tags_advanced(&["blue".to_string(), "red".to_string()], Operator::Or, 0, 10);
    assert_eq!(
        or_ab.keys.iter().cloned().collect::<BTreeSet<_>>(),
        or_ba.keys.iter().cloned().collect::<BTreeSet<_>>()
    );

    let not_red = store.query_by_tags_advanced(&["red".to_string()], Operator::Not, 0, 10);
    assert_eq!(not_red.keys.iter().cloned().collect::<BTreeSet<_>>(), BTreeSet::from(["p3".to_string()]));
}

/// Invariant 7: after a crash-free `flush()`, the buffer is empty.
#[quickcheck]
fn invariant_flush_empties_the_buffer(key: String, value: Vec<u8>) -> bool {
    let key = sanitize_key(key);
    let tmp = tempfile::tempdir().unwrap();
    let store = store_in(&tmp, "inv7");
    store.set(&key, &value, Vec::<String>::new()).unwrap();
    store.flush().unwrap();
    store.stats().buffer_bytes == 0 && store.get(&key).unwrap() == value
}

/// Invariant 4: TTL expiration is honored strictly after the deadline.
#[test]
fn invariant_ttl_expires_after_deadline() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_in(&tmp, "inv4");
    store.set_with_ttl("k", b"v", 1, Vec::<String>::new()).unwrap();
    assert_eq!(store.get("k").unwrap(), b"v");
    std::thread::sleep(Duration::from_millis(1200));
    assert!(matches!(store.get("k"), Err(StoreError::NotFound)));
}

/// Invariant 8: metadata-expressible state round-trips through backup.
#[test]
fn invariant_backup_round_trip_preserves_state() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_in(&tmp, "inv8");
    store.set("a", b"1", ["x", "y"]).unwrap();
    store.set_with_ttl("b", b"2", 3_600, ["x"]).unwrap();

    let name = store.backup_full("full").unwrap();
    assert!(store.verify_backup(&name).unwrap().is_clean());

    store.delete("a").unwrap();
    store.set("b", b"changed", Vec::<String>::new()).unwrap();

    store.restore_backup(&name, true).unwrap();

    let (value, meta) = store.get_with_metadata("a").unwrap();
    assert_eq!(value, b"1");
    assert_eq!(meta.tags, BTreeSet::from(["x".to_string(), "y".to_string()]));

    let (value, meta) = store.get_with_metadata("b").unwrap();
    assert_eq!(value, b"2");
    assert_eq!(meta.ttl_seconds, Some(3_600));
}

/// Invariant 10: a rolled-back transaction leaves no trace.
#[test]
fn invariant_rolled_back_transaction_is_a_no_op() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_in(&tmp, "inv10");
    store.set("x", b"1", ["old"]).unwrap();

    let before = store.get_with_metadata("x").unwrap();
    let result: Result<(), StoreError> = store.transaction(|txn| {
        txn.set("x", b"2", ["new"])?;
        txn.delete("does-not-exist-yet")?;
        Err(StoreError::InvalidArgument("abort".into()))
    });
    assert!(result.is_err());

    let after = store.get_with_metadata("x").unwrap();
    assert_eq!(before, after);
    assert!(matches!(store.get("does-not-exist-yet"), Err(StoreError::NotFound)));
}

/// Invariant 12: a replica rejects writes and serves reads.
#[test]
fn invariant_replica_rejects_writes_but_serves_reads() {
    let tmp_primary = tempfile::tempdir().unwrap();
    let primary_config = StoreConfig::builder()
        .data_folder_path(tmp_primary.path())
        .db("inv12p")
        .namespace("default")
        .replication(
            ReplicationConfig::builder()
                .mode(ReplicationMode::Primary)
                .listen("127.0.0.1:18473".to_string())
                .heartbeat(Duration::from_millis(200))
                .build(),
        )
        .build();
    let primary = Store::open(primary_config).unwrap();
    primary.set("seed", b"v", Vec::<String>::new()).unwrap();

    let tmp_secondary = tempfile::tempdir().unwrap();
    let secondary_config = StoreConfig::builder()
        .data_folder_path(tmp_secondary.path())
        .db("inv12s")
        .namespace("default")
        .replication(
            ReplicationConfig::builder()
                .mode(ReplicationMode::Secondary)
                .primary_endpoint("127.0.0.1:18473".to_string())
                .build(),
        )
        .build();
    let secondary = Store::open(secondary_config).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while secondary.get("seed").is_err() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(secondary.get("seed").unwrap(), b"v");
    assert!(matches!(secondary.set("local", b"x", Vec::<String>::new()), Err(StoreError::ReadOnly)));
    assert!(matches!(secondary.delete("seed"), Err(StoreError::ReadOnly)));

    secondary.shutdown();
    primary.shutdown();
}

/// Invariant 9, bounded by the store's Read Committed isolation (no
/// guarantees of repeatable reads or phantom prevention): a
/// concurrent reader never observes a value staged inside a
/// transaction that later rolls back, nor any value until the op that
/// set it has actually committed. Cross-key atomicity across an
/// entire multi-key commit is explicitly not guaranteed by that same
/// isolation note, so this only asserts per-key all-or-nothing.
#[test]
fn invariant_transaction_never_exposes_staged_or_rolled_back_values() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_in(&tmp, "inv9");
    store.set("x", b"committed-0", Vec::<String>::new()).unwrap();

    let reader_store = std::sync::Arc::clone(&store);
    let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let stop_reader = std::sync::Arc::clone(&stop);
    let saw_staged_value = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let saw_staged_reader = std::sync::Arc::clone(&saw_staged_value);

    let reader = std::thread::spawn(move || {
        while !stop_reader.load(std::sync::atomic::Ordering::Relaxed) {
            if reader_store.get("x").unwrap() == b"staged-and-aborted" {
                saw_staged_reader.store(true, std::sync::atomic::Ordering::Relaxed);
            }
        }
    });

    for _ in 0..200 {
        let result: Result<(), StoreError> = store.transaction(|txn| {
            txn.set("x", b"staged-and-aborted", Vec::<String>::new())?;
            Err(StoreError::InvalidArgument("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.get("x").unwrap(), b"committed-0");
    }

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    reader.join().unwrap();
    assert!(!saw_staged_value.load(std::sync::atomic::Ordering::Relaxed));
}
