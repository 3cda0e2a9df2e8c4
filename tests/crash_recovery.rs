//! Crash-safety scenarios: torn and corrupted meta slots, a simulated
//! crash between the data-page writes and the meta write, and recovery
//! of the effective page watermark from the last good meta.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;

use tempfile::tempdir;
use zatdb::{error_kind, Database, DatabaseOptions, TxOp, Value, ZatError};

const PS: usize = 512;

fn open_small(path: &Path) -> Database {
    DatabaseOptions::new(path).page_size(PS).open().unwrap()
}

fn name_schema() -> Vec<TxOp> {
    vec![
        TxOp::assert("a", ":db/ident", Value::keyword(":user/name")),
        TxOp::assert("a", ":db/valueType", Value::keyword(":db.type/string")),
        TxOp::assert("a", ":db/cardinality", Value::keyword(":db.cardinality/one")),
    ]
}

fn scribble(path: &Path, offset: u64, len: usize) {
    let file = OpenOptions::new().write(true).open(path).unwrap();
    file.write_all_at(&vec![0xDE; len], offset).unwrap();
    file.sync_data().unwrap();
}

/// The meta slot written by tx N alternates: slot 0 holds even tx ids,
/// slot 1 odd ones.
fn slot_offset(tx_id: u64) -> u64 {
    (tx_id % 2) * PS as u64
}

#[test]
fn corrupting_the_active_slot_falls_back_one_transaction() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("z.db");
    {
        let db = open_small(&path);
        db.transact(&name_schema()).unwrap();
        db.transact(&[TxOp::assert("p", ":user/name", Value::string("Ada"))])
            .unwrap();
        assert_eq!(db.stats().tx_id, 2);
    }

    // tx 2 lives in slot 0; destroy it mid-header
    scribble(&path, slot_offset(2), 64);

    let db = open_small(&path);
    assert_eq!(db.stats().tx_id, 1);
    // the schema tx survived; the datom tx did not
    assert!(db.resolve_ident(":user/name").is_some());

    // the database keeps working from the recovered snapshot
    db.transact(&[TxOp::assert("p", ":user/name", Value::string("Grace"))])
        .unwrap();
    assert_eq!(db.stats().tx_id, 2);
}

#[test]
fn a_torn_meta_write_is_rejected_by_checksum() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("z.db");
    {
        let db = open_small(&path);
        db.transact(&name_schema()).unwrap();
    }

    // zero the tail of slot 1 (tx 1), as if the write tore mid-page
    scribble(&path, slot_offset(1) + 40, 52);

    let db = open_small(&path);
    assert_eq!(db.stats().tx_id, 0);
}

#[test]
fn both_slots_corrupt_fails_with_corrupt_database() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("z.db");
    {
        let db = open_small(&path);
        db.transact(&name_schema()).unwrap();
    }

    scribble(&path, 0, 96);
    scribble(&path, PS as u64, 96);

    let err = DatabaseOptions::new(&path)
        .page_size(PS)
        .open()
        .unwrap_err();
    assert!(matches!(
        error_kind(&err),
        Some(ZatError::CorruptDatabase { .. })
    ));
}

#[test]
fn crash_between_data_writes_and_meta_write_is_invisible() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("z.db");
    let watermark;
    {
        let db = open_small(&path);
        db.transact(&name_schema()).unwrap();
        watermark = db.stats().next_page;
    }

    // simulate a tx that wrote its data pages and died before the meta
    // write: garbage pages appear past the committed watermark
    {
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        for i in 0..8u64 {
            file.write_all_at(&vec![0xAB; PS], (watermark + i) * PS as u64)
                .unwrap();
        }
        file.sync_data().unwrap();
    }

    let db = open_small(&path);
    // the aborted tx is not visible and the committed watermark is the
    // effective upper bound for reachable data
    assert_eq!(db.stats().tx_id, 1);
    assert_eq!(db.stats().next_page, watermark);

    // new transactions overwrite the orphaned garbage
    db.transact(&[TxOp::assert("p", ":user/name", Value::string("Ada"))])
        .unwrap();
    let snap = db.snapshot().unwrap();
    assert_eq!(snap.tx_id(), 2);
}

#[test]
fn recovery_is_stable_across_repeated_reopens() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("z.db");
    {
        let db = open_small(&path);
        db.transact(&name_schema()).unwrap();
        for i in 0..5 {
            db.transact(&[TxOp::assert(
                "p",
                ":user/name",
                Value::string(format!("user{i}")),
            )])
            .unwrap();
        }
        assert_eq!(db.stats().tx_id, 6);
    }

    for _ in 0..3 {
        let db = open_small(&path);
        assert_eq!(db.stats().tx_id, 6);
        let snap = db.snapshot().unwrap();
        assert_eq!(snap.tx_id(), 6);
    }
}
