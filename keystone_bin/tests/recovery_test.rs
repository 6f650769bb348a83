use std::fs;
use std::path::Path;
use std::sync::Arc;

use keystone_bin::concurrency::TransactionManager;
use keystone_bin::database::Database;
use keystone_bin::handlers;
use keystone_bin::recovery::{self, RecoveryManager};
use tempfile::tempdir;
use uuid::Uuid;

fn open_managers(
    base: &Path,
    log: &Path,
) -> (Arc<Database>, Arc<TransactionManager>, Arc<RecoveryManager>) {
    let db = Arc::new(recovery::prime(base).unwrap());
    let tm = Arc::new(TransactionManager::new());
    let rm = Arc::new(RecoveryManager::new(Arc::clone(&db), Arc::clone(&tm), log).unwrap());
    (db, tm, rm)
}

/// One committed write: start, edit, commit, both logged and applied.
fn autocommit_insert(
    db: &Database,
    tm: &TransactionManager,
    rm: &RecoveryManager,
    table: &str,
    key: i64,
    value: i64,
) {
    let id = Uuid::new_v4();
    tm.begin(id).unwrap();
    rm.start(id).unwrap();
    handlers::insert_tx(db, tm, rm, id, table, key, value).unwrap();
    rm.commit(id).unwrap();
    tm.commit(id).unwrap();
}

#[test]
fn recovery_redoes_committed_and_undoes_uncommitted_transactions() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("db");
    let log = dir.path().join("wal.log");

    let t1 = Uuid::new_v4();
    let t2 = Uuid::new_v4();
    let mut text = String::new();
    text.push_str("< create btree table t >\n");
    text.push_str(&format!("< {t1} start >\n"));
    text.push_str(&format!("< {t1}, t, INSERT, 5, 0, 9 >\n"));
    text.push_str(&format!("< {t2} start >\n"));
    text.push_str(&format!("< {t2}, t, INSERT, 6, 0, 11 >\n"));
    text.push_str(&format!("< {t1} commit >\n"));
    fs::write(&log, text).unwrap();

    let (db, tm, rm) = open_managers(&base, &log);
    rm.recover().unwrap();

    let table = db.get_table("t").unwrap();
    assert_eq!(table.find(5).unwrap().value, 9);
    assert!(table.find(6).is_err());
    assert!(!tm.is_active(t2));
}

#[test]
fn running_recovery_twice_reaches_the_same_state() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("db");
    let log = dir.path().join("wal.log");

    let t1 = Uuid::new_v4();
    let t2 = Uuid::new_v4();
    let mut text = String::new();
    text.push_str("< create btree table t >\n");
    text.push_str(&format!("< {t1} start >\n"));
    text.push_str(&format!("< {t1}, t, INSERT, 1, 0, 10 >\n"));
    text.push_str(&format!("< {t1}, t, UPDATE, 1, 10, 20 >\n"));
    text.push_str(&format!("< {t1} commit >\n"));
    text.push_str(&format!("< {t2} start >\n"));
    text.push_str(&format!("< {t2}, t, INSERT, 2, 0, 30 >\n"));
    text.push_str("this line is not a log record\n");
    fs::write(&log, text).unwrap();

    let (db, _tm, rm) = open_managers(&base, &log);
    rm.recover().unwrap();
    let first = db.get_table("t").unwrap().select().unwrap();
    db.close().unwrap();

    let (db, _tm, rm) = open_managers(&base, &log);
    rm.recover().unwrap();
    let second = db.get_table("t").unwrap().select().unwrap();

    assert_eq!(first, second);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].key, 1);
    assert_eq!(first[0].value, 20);
}

#[test]
fn rollback_restores_the_old_value_and_commits_the_transaction() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("db");
    let log = dir.path().join("wal.log");

    let (db, tm, rm) = open_managers(&base, &log);
    let mut sink = std::io::sink();
    handlers::handle_create_table(&db, "create btree table t", &mut sink).unwrap();
    rm.table("btree", "t").unwrap();
    autocommit_insert(&db, &tm, &rm, "t", 1, 10);

    let t = Uuid::new_v4();
    tm.begin(t).unwrap();
    rm.start(t).unwrap();
    handlers::update_tx(&db, &tm, &rm, t, "t", 1, 99).unwrap();
    assert_eq!(db.get_table("t").unwrap().find(1).unwrap().value, 99);

    rm.rollback(t).unwrap();
    assert_eq!(db.get_table("t").unwrap().find(1).unwrap().value, 10);
    assert!(!tm.is_active(t));

    // The rollback left a committed transaction in the log: replaying the
    // whole log reproduces the rolled-back state.
    db.close().unwrap();
    let (db, _tm, rm) = open_managers(&base, &log);
    rm.recover().unwrap();
    assert_eq!(db.get_table("t").unwrap().find(1).unwrap().value, 10);
}

#[test]
fn checkpoint_snapshot_plus_log_tail_restores_everything() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("db");
    let log = dir.path().join("wal.log");

    let (db, tm, rm) = open_managers(&base, &log);
    let mut sink = std::io::sink();
    handlers::handle_create_table(&db, "create hash table t", &mut sink).unwrap();
    rm.table("hash", "t").unwrap();

    for key in 0..50 {
        autocommit_insert(&db, &tm, &rm, "t", key, key * 2);
    }
    rm.checkpoint().unwrap();
    for key in 100..110 {
        autocommit_insert(&db, &tm, &rm, "t", key, key * 2);
    }
    db.close().unwrap();

    // Prime discards the live directory in favor of the snapshot; the log
    // tail re-applies what came after the checkpoint.
    let (db, _tm, rm) = open_managers(&base, &log);
    rm.recover().unwrap();
    let table = db.get_table("t").unwrap();
    assert_eq!(table.select().unwrap().len(), 60);
    assert_eq!(table.find(105).unwrap().value, 210);
    assert_eq!(table.find(42).unwrap().value, 84);
}

#[test]
fn an_uncommitted_transaction_straddling_a_checkpoint_is_undone() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("db");
    let log = dir.path().join("wal.log");

    let (db, tm, rm) = open_managers(&base, &log);
    let mut sink = std::io::sink();
    handlers::handle_create_table(&db, "create btree table t", &mut sink).unwrap();
    rm.table("btree", "t").unwrap();
    autocommit_insert(&db, &tm, &rm, "t", 1, 10);

    // A transaction that is still running when the checkpoint happens and
    // never commits.
    let t = Uuid::new_v4();
    tm.begin(t).unwrap();
    rm.start(t).unwrap();
    handlers::update_tx(&db, &tm, &rm, t, "t", 1, 50).unwrap();
    rm.checkpoint().unwrap();
    handlers::insert_tx(&db, &tm, &rm, t, "t", 2, 20).unwrap();
    // Crash: no commit, no rollback.
    db.close().unwrap();

    let (db, tm2, rm) = open_managers(&base, &log);
    rm.recover().unwrap();
    let table = db.get_table("t").unwrap();
    assert_eq!(table.find(1).unwrap().value, 10);
    assert!(table.find(2).is_err());
    assert!(!tm2.is_active(t));
}
