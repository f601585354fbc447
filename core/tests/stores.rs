//! End-to-end behaviour of the hash and ordered stores against real files.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::thread;

use cask_core::{BTreeDb, CaskError, HashDb, HashOptions, OpenMode, Tuning};
use pretty_assertions::assert_eq;
use tempfile::tempdir;

fn writer() -> OpenMode {
    OpenMode::WRITER | OpenMode::CREATE
}

#[test]
fn hash_copy_reopens_identically() {
    let dir = tempdir().unwrap();
    let db = HashDb::new();
    db.open(dir.path().join("src.tch"), writer()).unwrap();
    for i in 0..300 {
        db.put(format!("key-{i}").as_bytes(), format!("value-{i}").as_bytes())
            .unwrap();
    }
    db.out(b"key-7").unwrap();

    let copy_path = dir.path().join("copy.tch");
    db.copy(&copy_path).unwrap();

    let copy = HashDb::new();
    copy.open(&copy_path, OpenMode::READER).unwrap();
    assert_eq!(copy.rnum().unwrap(), db.rnum().unwrap());
    assert_eq!(copy.fsiz().unwrap(), db.fsiz().unwrap());
    for key in db.keys().unwrap() {
        assert_eq!(copy.get(&key).unwrap(), db.get(&key).unwrap());
    }
    assert_eq!(copy.get(b"key-7").unwrap(), None);
    assert_eq!(copy.path(), Some(copy_path));
}

#[test]
fn torn_tail_is_discarded_on_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("torn.tch");
    let db = HashDb::new();
    db.open(&path, writer()).unwrap();
    db.put(b"kept", b"1").unwrap();
    let size = db.fsiz().unwrap();
    db.close().unwrap();

    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0x40, 0, 0, 0, 0xde, 0xad]).unwrap();
    drop(file);

    let reader = HashDb::new();
    reader.open(&path, OpenMode::READER).unwrap();
    assert_eq!(reader.get(b"kept").unwrap(), Some(b"1".to_vec()));
    reader.close().unwrap();

    let db = HashDb::new();
    db.open(&path, OpenMode::WRITER).unwrap();
    assert_eq!(db.fsiz().unwrap(), size);
    db.put(b"after", b"2").unwrap();
    db.close().unwrap();

    db.open(&path, OpenMode::READER).unwrap();
    assert_eq!(db.rnum().unwrap(), 2);
}

#[test]
fn aborted_transaction_restores_state_and_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tx.tch");
    let db = HashDb::new();
    db.open(&path, writer()).unwrap();
    db.put(b"a", b"1").unwrap();
    db.addint(b"n", 10).unwrap();

    db.tranbegin().unwrap();
    db.put(b"a", b"2").unwrap();
    db.out(b"n").unwrap();
    db.putcat(b"b", b"new").unwrap();
    db.vanish().unwrap();
    db.put(b"c", b"3").unwrap();
    db.tranabort().unwrap();

    assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.addint(b"n", 0).unwrap(), 10);
    assert_eq!(db.get(b"b").unwrap(), None);
    assert_eq!(db.rnum().unwrap(), 2);
    db.close().unwrap();

    db.open(&path, OpenMode::READER).unwrap();
    assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get(b"c").unwrap(), None);
}

#[test]
fn transaction_misuse_is_reported() {
    let dir = tempdir().unwrap();
    let db = HashDb::new();
    db.open(dir.path().join("misuse.tch"), writer()).unwrap();
    assert_eq!(db.trancommit().unwrap_err().kind(), "transaction_error");

    db.tranbegin().unwrap();
    assert_eq!(db.tranbegin().unwrap_err().kind(), "transaction_error");
    assert_eq!(
        db.optimize(Tuning::default()).unwrap_err().kind(),
        "invalid_operation"
    );
    db.trancommit().unwrap();
    assert_eq!(db.tranabort().unwrap_err().kind(), "transaction_error");
}

#[test]
fn mutex_mode_makes_tranbegin_wait() {
    let dir = tempdir().unwrap();
    let db = Arc::new(HashDb::new());
    db.setmutex().unwrap();
    db.open(dir.path().join("mutex.tch"), writer()).unwrap();

    db.tranbegin().unwrap();
    let waiter = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            db.tranbegin().unwrap();
            let seen = db.get(b"k").unwrap();
            db.trancommit().unwrap();
            seen
        })
    };
    db.put(b"k", b"from first").unwrap();
    db.trancommit().unwrap();

    assert_eq!(waiter.join().unwrap(), Some(b"from first".to_vec()));
}

#[test]
fn nonblocking_lock_conflict() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("locked.tch");
    let first = HashDb::new();
    first.open(&path, writer()).unwrap();

    let second = HashDb::new();
    let err = second
        .open(&path, OpenMode::WRITER | OpenMode::LOCK_NB)
        .unwrap_err();
    assert_eq!(err.kind(), "lock_error");

    first.close().unwrap();
    second
        .open(&path, OpenMode::WRITER | OpenMode::LOCK_NB)
        .unwrap();
}

#[test]
fn wrong_store_kind_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("kind.db");
    let db = HashDb::new();
    db.open(&path, writer()).unwrap();
    db.close().unwrap();

    let tree = BTreeDb::new();
    assert_eq!(
        tree.open(&path, writer()).unwrap_err().kind(),
        "invalid_operation"
    );
}

#[test]
fn stores_are_shared_across_threads() {
    let dir = tempdir().unwrap();
    let db = Arc::new(HashDb::with_options(
        HashOptions::default().with_bucket_count(127),
    ));
    db.open(dir.path().join("threads.tch"), writer()).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for i in 0..50 {
                    db.put(format!("{t}-{i}").as_bytes(), b"x").unwrap();
                    db.addint(b"counter", 1).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(db.rnum().unwrap(), 201);
    assert_eq!(db.addint(b"counter", 0).unwrap(), 200);
}

#[test]
fn closed_store_reports_not_open() {
    let db = BTreeDb::new();
    assert_eq!(db.get(b"k").unwrap_err(), CaskError::NotOpen);
    assert_eq!(db.path(), None);
    assert_eq!(db.close().unwrap_err(), CaskError::NotOpen);
}

#[test]
fn ordered_store_round_trip_with_duplicates() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dups.tcb");
    let db = BTreeDb::new();
    db.open(&path, writer()).unwrap();
    db.putdup(b"fruit", b"apple").unwrap();
    db.putdup(b"fruit", b"pear").unwrap();
    db.put(b"veg", b"leek").unwrap();
    db.close().unwrap();

    db.open(&path, OpenMode::READER).unwrap();
    assert_eq!(
        db.getdup(b"fruit").unwrap(),
        vec![b"apple".to_vec(), b"pear".to_vec()]
    );
    assert_eq!(db.rnum().unwrap(), 3);

    let mut cursor = db.cursor().unwrap();
    assert!(cursor.last().unwrap());
    assert_eq!(cursor.record().unwrap(), (b"veg".to_vec(), b"leek".to_vec()));
    assert!(cursor.prev().unwrap());
    assert_eq!(cursor.value().unwrap(), b"pear".to_vec());
}
