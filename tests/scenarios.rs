//! Literal scenario tests (S1-S6): each one runs the exact inputs and
//! asserts the exact outcome, real sleeps standing in for wall-clock
//! waits.

use std::collections::BTreeSet;
use std::time::Duration;

use corestore::config::{ReplicationConfig, ReplicationMode, StoreConfig};
use corestore::error::StoreError;
use corestore::query::{Condition, Operator};
use corestore::store::Store;

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter("corestore=debug").try_init();
    });
}

fn open(tmp: &tempfile::TempDir, db: &str) -> std::sync::Arc<Store> {
    init_tracing();
    let config = StoreConfig::builder()
        .data_folder_path(tmp.path())
        .db(db)
        .namespace("default")
        .build();
    Store::open(config).unwrap()
}

#[test]
fn s1_buffered_write_and_timed_flush() {
    let tmp = tempfile::tempdir().unwrap();
    let config = StoreConfig::builder()
        .data_folder_path(tmp.path())
        .db("s1")
        .namespace("default")
        .buffer_size_mb(1)
        .flush_interval(Duration::from_secs(1))
        .build();
    let store = Store::open(config).unwrap();

    store.set("a", b"1", Vec::<String>::new()).unwrap();
    assert!(store.stats().buffer_bytes > 0);

    std::thread::sleep(Duration::from_secs(2));

    assert_eq!(store.stats().buffer_bytes, 0);
    assert_eq!(store.get("a").unwrap(), b"1");
}

#[test]
fn s2_ttl_expiration_path() {
    let tmp = tempfile::tempdir().unwrap();
    let config = StoreConfig::builder()
        .data_folder_path(tmp.path())
        .db("s2")
        .namespace("default")
        .ttl_sweep_interval(Duration::from_secs(1))
        .build();
    let store = Store::open(config).unwrap();

    store.set_with_ttl("k", b"v", 2, Vec::<String>::new()).unwrap();
    assert_eq!(store.get("k").unwrap(), b"v");

    std::thread::sleep(Duration::from_secs(3));
    assert!(matches!(store.get("k"), Err(StoreError::NotFound)));

    let before = store.stats().key_count;
    std::thread::sleep(Duration::from_millis(1500));
    let after = store.stats().key_count;
    assert_eq!(after, before.saturating_sub(1));
    assert_eq!(after, 0);
}

#[test]
fn s3_tag_and_or() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open(&tmp, "s3");

    store.set("p1", b"x", ["a", "b"]).unwrap();
    store.set("p2", b"y", ["a"]).unwrap();
    store.set("p3", b"z", ["b", "c"]).unwrap();

    let and_result = store.query_by_tags(&["a".to_string(), "b".to_string()]).unwrap();
    assert_eq!(and_result.keys().cloned().collect::<BTreeSet<_>>(), BTreeSet::from(["p1".to_string()]));

    let or_result = store.query_by_tags_advanced(&["a".to_string(), "c".to_string()], Operator::Or, 0, 10);
    assert_eq!(
        or_result.keys.iter().cloned().collect::<BTreeSet<_>>(),
        BTreeSet::from(["p1".to_string(), "p2".to_string(), "p3".to_string()])
    );

    let complex = store.complex_query(&[Condition::or("a"), Condition::or("c"), Condition::and("b")], 0, 10);
    assert_eq!(
        complex.keys.iter().cloned().collect::<BTreeSet<_>>(),
        BTreeSet::from(["p1".to_string(), "p3".to_string()])
    );
}

#[test]
fn s4_transaction_rollback_restores_pre_state() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open(&tmp, "s4");

    store.set("x", b"1", ["old"]).unwrap();
    store.set("y", b"2", ["old"]).unwrap();

    let result: Result<(), StoreError> = store.transaction(|txn| {
        txn.set("x", b"11", ["new"])?;
        txn.set("y", b"22", Vec::<String>::new())?;
        Err(StoreError::InvalidArgument("abort".into()))
    });
    assert!(result.is_err());

    let (value, meta) = store.get_with_metadata("x").unwrap();
    assert_eq!(value, b"1");
    assert_eq!(meta.tags, BTreeSet::from(["old".to_string()]));

    let (value, meta) = store.get_with_metadata("y").unwrap();
    assert_eq!(value, b"2");
    assert_eq!(meta.tags, BTreeSet::from(["old".to_string()]));
}

#[test]
fn s5_backup_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open(&tmp, "s5");

    for i in 0..500 {
        let key = format!("key-{i}");
        let value = format!("value-{i}").into_bytes();
        let tags = vec![format!("bucket-{}", i % 5)];
        if i % 10 == 0 {
            store.set_with_ttl(&key, &value, 3_600, tags).unwrap();
        } else {
            store.set(&key, &value, tags).unwrap();
        }
    }

    let b1 = store.backup_full("b1").unwrap();

    for i in 0..100 {
        let key = format!("key-{i}");
        let value = format!("mutated-{i}").into_bytes();
        store.set(&key, &value, vec![format!("bucket-{}", i % 5), "mutated".to_string()]).unwrap();
    }

    let b2 = store.backup_incremental("b2", &b1).unwrap();

    assert!(store.verify_backup(&b1).unwrap().is_clean());
    assert!(store.verify_backup(&b2).unwrap().is_clean());

    let mut expected = std::collections::BTreeMap::new();
    for i in 0..500 {
        let key = format!("key-{i}");
        let (value, meta) = store.get_with_metadata(&key).unwrap();
        expected.insert(key, (value, meta.tags, meta.ttl_seconds));
    }

    store.restore_backup(&b2, true).unwrap();

    for (key, (value, tags, ttl)) in expected {
        let (restored_value, restored_meta) = store.get_with_metadata(&key).unwrap();
        assert_eq!(restored_value, value, "value mismatch for {key}");
        assert_eq!(restored_meta.tags, tags, "tags mismatch for {key}");
        assert_eq!(restored_meta.ttl_seconds, ttl, "ttl mismatch for {key}");
    }
}

#[test]
fn s6_replication_catch_up_across_restart() {
    let tmp_primary = tempfile::tempdir().unwrap();
    let primary_config = StoreConfig::builder()
        .data_folder_path(tmp_primary.path())
        .db("s6p")
        .namespace("default")
        .replication(
            ReplicationConfig::builder()
                .mode(ReplicationMode::Primary)
                .listen("127.0.0.1:18471".to_string())
                .heartbeat(Duration::from_millis(200))
                .build(),
        )
        .build();
    let primary = Store::open(primary_config).unwrap();

    for i in 0..10 {
        primary.set(&format!("k{i}"), format!("v{i}").as_bytes(), Vec::<String>::new()).unwrap();
    }

    let tmp_secondary = tempfile::tempdir().unwrap();
    let secondary_config = || {
        StoreConfig::builder()
            .data_folder_path(tmp_secondary.path())
            .db("s6s")
            .namespace("default")
            .replication(
                ReplicationConfig::builder()
                    .mode(ReplicationMode::Secondary)
                    .primary_endpoint("127.0.0.1:18471".to_string())
                    .build(),
            )
            .build()
    };

    let secondary = Store::open(secondary_config()).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while secondary.stats().key_count < 10 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(secondary.stats().key_count, 10);
    for i in 0..10 {
        assert_eq!(secondary.get(&format!("k{i}")).unwrap(), format!("v{i}").into_bytes());
    }
    secondary.shutdown();
    drop(secondary);

    for i in 10..15 {
        primary.set(&format!("k{i}"), format!("v{i}").as_bytes(), Vec::<String>::new()).unwrap();
    }

    let secondary = Store::open(secondary_config()).unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while secondary.stats().key_count < 15 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(secondary.stats().key_count, 15);
    for i in 10..15 {
        assert_eq!(secondary.get(&format!("k{i}")).unwrap(), format!("v{i}").into_bytes());
    }
    secondary.shutdown();
    primary.shutdown();
}
