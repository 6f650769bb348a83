use std::io::Cursor;
use std::sync::Arc;

use keystone_bin::build_repl;
use keystone_bin::concurrency::TransactionManager;
use keystone_bin::recovery::{self, RecoveryManager};
use tempfile::tempdir;

#[test]
fn a_session_creates_edits_aborts_and_selects() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("db");
    let log = dir.path().join("wal.log");

    let db = Arc::new(recovery::prime(&base).unwrap());
    let tm = Arc::new(TransactionManager::new());
    let rm = Arc::new(RecoveryManager::new(Arc::clone(&db), Arc::clone(&tm), &log).unwrap());
    rm.recover().unwrap();
    let repl = build_repl(Arc::clone(&db), tm, rm);

    let script = "create btree table t\n\
                  insert 1 10 into t\n\
                  insert 2 20 into t\n\
                  begin\n\
                  update t 1 99\n\
                  abort\n\
                  select from t\n\
                  delete 5 from t\n\
                  nonsense\n";
    let mut input = Cursor::new(script.as_bytes().to_vec());
    let mut output = Vec::new();
    repl.run(&mut input, &mut output, "").unwrap();

    let text = String::from_utf8(output).unwrap();
    assert!(text.contains("created table t"));
    // The aborted update left the original value behind.
    assert!(text.contains("(1, 10)"));
    assert!(text.contains("(2, 20)"));
    assert!(!text.contains("(1, 99)"));
    // Errors are reported inline, not fatal.
    assert!(text.contains("key 5 not found"));
    assert!(text.contains("command not found"));

    db.close().unwrap();
}

#[test]
fn edits_survive_a_restart_through_the_log() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("db");
    let log = dir.path().join("wal.log");

    {
        let db = Arc::new(recovery::prime(&base).unwrap());
        let tm = Arc::new(TransactionManager::new());
        let rm = Arc::new(RecoveryManager::new(Arc::clone(&db), Arc::clone(&tm), &log).unwrap());
        rm.recover().unwrap();
        let repl = build_repl(Arc::clone(&db), tm, rm);

        let script = "create hash table kv\ninsert 7 70 into kv\ninsert 8 80 into kv\n";
        let mut input = Cursor::new(script.as_bytes().to_vec());
        let mut output = Vec::new();
        repl.run(&mut input, &mut output, "").unwrap();
        db.close().unwrap();
    }

    let db = Arc::new(recovery::prime(&base).unwrap());
    let tm = Arc::new(TransactionManager::new());
    let rm = Arc::new(RecoveryManager::new(Arc::clone(&db), Arc::clone(&tm), &log).unwrap());
    rm.recover().unwrap();
    let table = db.get_table("kv").unwrap();
    assert_eq!(table.find(7).unwrap().value, 70);
    assert_eq!(table.find(8).unwrap().value, 80);
}
