//! End-to-end scenarios through the scheduler
//!
//! Every operation here goes through the real path: `exec_*` spawns a
//! task, the worker pool drives the object scheduler, and the notifier
//! reports back over a channel. Covered:
//!
//! 1. **Auto-commit round-trip** - create, insert, get, scan
//! 2. **Transactional ordering** - pending values vs the committed snapshot
//! 3. **Conflict** - key locks, loser retry after the winner commits
//! 4. **Rollback** - explicit rollback leaves the snapshot untouched
//! 5. **Merge/sync** - a thousand keys in random order survive the merge

use rand::seq::SliceRandom;
use rand::SeedableRng;
use raleighsl_engine::sset;
use raleighsl_engine::{ByteRef, Completion, Engine, EngineConfig, Errno, NotifyFn, Oid, TxnId};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Helpers
// ============================================================================

const WAIT: Duration = Duration::from_secs(10);

static TRACING: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
});

fn test_engine() -> Arc<Engine> {
    once_cell::sync::Lazy::force(&TRACING);
    let config = EngineConfig {
        threads: 2,
        ..EngineConfig::default()
    };
    Engine::new(config).unwrap()
}

fn notify_to(tx: mpsc::Sender<Completion>) -> NotifyFn {
    Box::new(move |_fs, completion| {
        let _ = tx.send(completion);
    })
}

fn create_sset(engine: &Arc<Engine>, name: &[u8]) -> Oid {
    let (tx, rx) = mpsc::channel();
    let name = name.to_vec();
    engine.exec_create(
        Box::new(move |fs| fs.semantic_create(&name, sset::sset_type())),
        notify_to(tx),
    );
    let completion = rx.recv_timeout(WAIT).unwrap();
    completion.result.unwrap();
    completion.oid
}

/// Upsert, the way the wire adapters issue a plain "set"
fn sset_insert(
    engine: &Arc<Engine>,
    txn_id: TxnId,
    oid: Oid,
    key: &[u8],
    value: &[u8],
) -> Result<(), Errno> {
    let (tx, rx) = mpsc::channel();
    let key = ByteRef::copy_from(key);
    let value = ByteRef::copy_from(value);
    engine.exec_write(
        txn_id,
        oid,
        Box::new(move |fs, txn, object| sset::insert(fs, txn, object, true, key, value)),
        notify_to(tx),
    );
    rx.recv_timeout(WAIT).unwrap().result
}

fn sset_get(
    engine: &Arc<Engine>,
    txn_id: TxnId,
    oid: Oid,
    key: &[u8],
) -> Result<Vec<u8>, Errno> {
    let (tx, rx) = mpsc::channel();
    let (out_tx, out_rx) = mpsc::channel();
    let key = key.to_vec();
    engine.exec_read(
        txn_id,
        oid,
        Box::new(move |fs, txn, object| {
            let value = sset::get(fs, txn, object, &key)?;
            let _ = out_tx.send(value.as_slice().to_vec());
            Ok(())
        }),
        notify_to(tx),
    );
    rx.recv_timeout(WAIT).unwrap().result?;
    Ok(out_rx.recv_timeout(WAIT).unwrap())
}

#[allow(clippy::type_complexity)]
fn sset_scan(
    engine: &Arc<Engine>,
    txn_id: TxnId,
    oid: Oid,
    start: Option<&[u8]>,
    include_start: bool,
    count: usize,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Errno> {
    let (tx, rx) = mpsc::channel();
    let (out_tx, out_rx) = mpsc::channel();
    let start = start.map(|s| s.to_vec());
    engine.exec_read(
        txn_id,
        oid,
        Box::new(move |fs, txn, object| {
            let (keys, values) =
                sset::scan(fs, txn, object, start.as_deref(), include_start, count)?;
            let pairs: Vec<(Vec<u8>, Vec<u8>)> = keys
                .iter()
                .zip(values.iter())
                .map(|(k, v)| (k.as_slice().to_vec(), v.as_slice().to_vec()))
                .collect();
            let _ = out_tx.send(pairs);
            Ok(())
        }),
        notify_to(tx),
    );
    rx.recv_timeout(WAIT).unwrap().result?;
    Ok(out_rx.recv_timeout(WAIT).unwrap())
}

fn txn_create(engine: &Arc<Engine>) -> TxnId {
    engine.transaction_create().unwrap()
}

fn txn_commit(engine: &Arc<Engine>, txn_id: TxnId) -> Result<(), Errno> {
    let (tx, rx) = mpsc::channel();
    engine.exec_txn_commit(txn_id, notify_to(tx));
    rx.recv_timeout(WAIT).unwrap().result
}

fn txn_rollback(engine: &Arc<Engine>, txn_id: TxnId) -> Result<(), Errno> {
    let (tx, rx) = mpsc::channel();
    engine.exec_txn_rollback(txn_id, notify_to(tx));
    rx.recv_timeout(WAIT).unwrap().result
}

// ============================================================================
// SECTION 1: Auto-commit round-trip
// ============================================================================

#[test]
fn test_autocommit_round_trip() {
    let engine = test_engine();
    let oid = create_sset(&engine, b"scores");

    sset_insert(&engine, TxnId::NONE, oid, b"a", b"1").unwrap();
    sset_insert(&engine, TxnId::NONE, oid, b"b", b"2").unwrap();

    assert_eq!(sset_get(&engine, TxnId::NONE, oid, b"a").unwrap(), b"1");
    assert_eq!(
        sset_get(&engine, TxnId::NONE, oid, b"c"),
        Err(Errno::DataKeyNotFound)
    );

    let pairs = sset_scan(&engine, TxnId::NONE, oid, None, false, 100).unwrap();
    assert_eq!(
        pairs,
        vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"2".to_vec()),
        ]
    );
}

#[test]
fn test_create_twice_fails() {
    let engine = test_engine();
    create_sset(&engine, b"dup");

    let (tx, rx) = mpsc::channel();
    engine.exec_create(
        Box::new(move |fs| fs.semantic_create(b"dup", sset::sset_type())),
        notify_to(tx),
    );
    assert_eq!(
        rx.recv_timeout(WAIT).unwrap().result,
        Err(Errno::ObjectExists)
    );
}

#[test]
fn test_read_of_unknown_transaction_fails() {
    let engine = test_engine();
    let oid = create_sset(&engine, b"t");
    assert_eq!(
        sset_get(&engine, TxnId(777), oid, b"a"),
        Err(Errno::TxnNotFound)
    );
}

// ============================================================================
// SECTION 2: Transactional ordering
// ============================================================================

#[test]
fn test_transactional_ordering() {
    let engine = test_engine();
    let oid = create_sset(&engine, b"scores");
    sset_insert(&engine, TxnId::NONE, oid, b"a", b"1").unwrap();

    let t = txn_create(&engine);
    // inside the transaction: pending overwrite plus a fresh key
    sset_insert(&engine, t, oid, b"a", b"9").unwrap();
    sset_insert(&engine, t, oid, b"c", b"3").unwrap();

    // the committed snapshot is unchanged; the transaction reads its own
    assert_eq!(sset_get(&engine, TxnId::NONE, oid, b"a").unwrap(), b"1");
    assert_eq!(sset_get(&engine, t, oid, b"a").unwrap(), b"9");
    assert_eq!(sset_get(&engine, t, oid, b"c").unwrap(), b"3");

    txn_commit(&engine, t).unwrap();
    assert_eq!(sset_get(&engine, TxnId::NONE, oid, b"a").unwrap(), b"9");
    assert_eq!(sset_get(&engine, TxnId::NONE, oid, b"c").unwrap(), b"3");
}

#[test]
fn test_commit_is_terminal() {
    let engine = test_engine();
    let oid = create_sset(&engine, b"o");
    let t = txn_create(&engine);
    sset_insert(&engine, t, oid, b"k", b"v").unwrap();
    txn_commit(&engine, t).unwrap();

    // the transaction is gone: further use reports TxnNotFound
    assert_eq!(sset_insert(&engine, t, oid, b"k2", b"v"), Err(Errno::TxnNotFound));
    assert_eq!(txn_commit(&engine, t), Err(Errno::TxnNotFound));
}

// ============================================================================
// SECTION 3: Conflict
// ============================================================================

#[test]
fn test_conflicting_transactions_serialize_on_key_locks() {
    let engine = test_engine();
    let oid = create_sset(&engine, b"scores");

    let t1 = txn_create(&engine);
    let t2 = txn_create(&engine);

    sset_insert(&engine, t1, oid, b"a", b"x").unwrap();
    // the loser is refused while the winner holds the key
    assert_eq!(
        sset_insert(&engine, t2, oid, b"a", b"y"),
        Err(Errno::TxnLockedKey)
    );

    txn_commit(&engine, t1).unwrap();
    assert_eq!(sset_get(&engine, TxnId::NONE, oid, b"a").unwrap(), b"x");

    // after the winner completes the loser goes through
    sset_insert(&engine, t2, oid, b"a", b"y").unwrap();
    txn_commit(&engine, t2).unwrap();
    assert_eq!(sset_get(&engine, TxnId::NONE, oid, b"a").unwrap(), b"y");
}

#[test]
fn test_disjoint_transactions_compose() {
    let engine = test_engine();
    let oid_a = create_sset(&engine, b"left");
    let oid_b = create_sset(&engine, b"right");

    let t1 = txn_create(&engine);
    let t2 = txn_create(&engine);
    sset_insert(&engine, t1, oid_a, b"k", b"from-t1").unwrap();
    sset_insert(&engine, t2, oid_b, b"k", b"from-t2").unwrap();

    // commit in reverse creation order; both land
    txn_commit(&engine, t2).unwrap();
    txn_commit(&engine, t1).unwrap();

    assert_eq!(sset_get(&engine, TxnId::NONE, oid_a, b"k").unwrap(), b"from-t1");
    assert_eq!(sset_get(&engine, TxnId::NONE, oid_b, b"k").unwrap(), b"from-t2");
}

// ============================================================================
// SECTION 4: Rollback
// ============================================================================

#[test]
fn test_rollback_restores_snapshot() {
    let engine = test_engine();
    let oid = create_sset(&engine, b"scores");

    let t = txn_create(&engine);
    sset_insert(&engine, t, oid, b"k", b"v").unwrap();
    txn_rollback(&engine, t).unwrap();

    assert_eq!(
        sset_get(&engine, TxnId::NONE, oid, b"k"),
        Err(Errno::DataKeyNotFound)
    );
}

#[test]
fn test_failed_submission_degrades_commit_to_rollback() {
    let engine = test_engine();
    let oid = create_sset(&engine, b"scores");

    let t = txn_create(&engine);
    sset_insert(&engine, t, oid, b"k", b"v").unwrap();

    // updating a missing key fails and poisons the transaction
    let (tx, rx) = mpsc::channel();
    engine.exec_write(
        t,
        oid,
        Box::new(move |fs, txn, object| {
            sset::update(
                fs,
                txn,
                object,
                ByteRef::copy_from(b"missing"),
                ByteRef::copy_from(b"2"),
            )
        }),
        notify_to(tx),
    );
    assert_eq!(
        rx.recv_timeout(WAIT).unwrap().result,
        Err(Errno::DataKeyNotFound)
    );

    assert_eq!(txn_commit(&engine, t), Err(Errno::TxnRolledBack));
    // nothing from the poisoned transaction landed
    assert_eq!(
        sset_get(&engine, TxnId::NONE, oid, b"k"),
        Err(Errno::DataKeyNotFound)
    );
}

// ============================================================================
// SECTION 5: Merge/sync
// ============================================================================

#[test]
fn test_thousand_keys_survive_merge() {
    let config = EngineConfig {
        threads: 2,
        sset_block_size: 1024,
        sset_sync_threshold: 512,
        ..EngineConfig::default()
    };
    let engine = Engine::new(config).unwrap();
    let oid = create_sset(&engine, b"bulk");

    let mut keys: Vec<u32> = (0..1000).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(2024);
    keys.shuffle(&mut rng);

    for k in &keys {
        let key = format!("key-{k:06}");
        let value = format!("value-{k}");
        sset_insert(&engine, TxnId::NONE, oid, key.as_bytes(), value.as_bytes()).unwrap();
    }

    // a full scan returns every key in strictly ascending order
    let pairs = sset_scan(&engine, TxnId::NONE, oid, None, false, 10_000).unwrap();
    assert_eq!(pairs.len(), 1000);
    for window in pairs.windows(2) {
        assert!(window[0].0 < window[1].0, "scan out of order");
    }
    for (i, (key, value)) in pairs.iter().enumerate() {
        assert_eq!(key, format!("key-{i:06}").as_bytes());
        assert_eq!(value, format!("value-{i}").as_bytes());
    }

    // point reads agree regardless of where the key lives now
    for probe in [0u32, 1, 499, 500, 998, 999] {
        let key = format!("key-{probe:06}");
        assert_eq!(
            sset_get(&engine, TxnId::NONE, oid, key.as_bytes()).unwrap(),
            format!("value-{probe}").as_bytes()
        );
    }
}

// ============================================================================
// Concurrency: many writers through the scheduler
// ============================================================================

#[test]
fn test_concurrent_autocommit_writers() {
    let engine = test_engine();
    let oid = create_sset(&engine, b"hot");

    let (tx, rx) = mpsc::channel();
    for i in 0..64u32 {
        let key = ByteRef::copy_from(format!("w{i:03}").as_bytes());
        let value = ByteRef::copy_from(b"v");
        engine.exec_write(
            TxnId::NONE,
            oid,
            Box::new(move |fs, txn, object| sset::insert(fs, txn, object, false, key, value)),
            notify_to(tx.clone()),
        );
    }
    for _ in 0..64 {
        rx.recv_timeout(WAIT).unwrap().result.unwrap();
    }

    let pairs = sset_scan(&engine, TxnId::NONE, oid, None, false, 1000).unwrap();
    assert_eq!(pairs.len(), 64);
}
