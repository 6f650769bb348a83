use std::collections::HashSet;
use std::sync::Arc;

use granite::Entry;
use keystone_bin::database::{Database, IndexKind};
use keystone_bin::errors::DbError;
use keystone_bin::query::{grace_hash_join, nested_loop_join, CancelToken, EntryPair};
use tempfile::tempdir;

#[test]
fn joins_on_matching_keys_regardless_of_bucket_assignment() {
    let dir = tempdir().unwrap();
    let db = Arc::new(Database::open(dir.path().join("db")).unwrap());

    let left = db.create_table(IndexKind::BTree, "l").unwrap();
    left.insert(1, 100).unwrap();
    left.insert(2, 200).unwrap();
    left.insert(3, 300).unwrap();
    let right = db.create_table(IndexKind::Hash, "r").unwrap();
    right.insert(2, 7).unwrap();
    right.insert(3, 8).unwrap();
    right.insert(4, 9).unwrap();

    let handle = grace_hash_join(&db, &left, &right, true, true, &CancelToken::new()).unwrap();
    let mut pairs: Vec<EntryPair> = handle.results().iter().collect();
    handle.wait().unwrap();
    pairs.sort();

    assert_eq!(
        pairs,
        vec![
            EntryPair {
                left: Entry::new(2, 200),
                right: Entry::new(2, 7),
            },
            EntryPair {
                left: Entry::new(3, 300),
                right: Entry::new(3, 8),
            },
        ]
    );
}

#[test]
fn hash_join_equals_nested_loop_join_on_value_fields() {
    let dir = tempdir().unwrap();
    let db = Arc::new(Database::open(dir.path().join("db")).unwrap());

    // Values repeat, so single join fields match many rows on both sides.
    let left = db.create_table(IndexKind::BTree, "l").unwrap();
    for key in 0..200 {
        left.insert(key, (key * 3) % 50).unwrap();
    }
    let right = db.create_table(IndexKind::Hash, "r").unwrap();
    for key in 1000..1100 {
        right.insert(key, key % 50).unwrap();
    }

    let expected: HashSet<EntryPair> = nested_loop_join(&left, &right, false, false)
        .unwrap()
        .into_iter()
        .collect();
    assert!(!expected.is_empty());

    let handle = grace_hash_join(&db, &left, &right, false, false, &CancelToken::new()).unwrap();
    let got: HashSet<EntryPair> = handle.results().iter().collect();
    handle.wait().unwrap();

    assert_eq!(got, expected);
}

#[test]
fn mixed_key_value_join_flips_back_before_emission() {
    let dir = tempdir().unwrap();
    let db = Arc::new(Database::open(dir.path().join("db")).unwrap());

    let left = db.create_table(IndexKind::BTree, "l").unwrap();
    left.insert(10, 77).unwrap();
    left.insert(11, 78).unwrap();
    let right = db.create_table(IndexKind::Hash, "r").unwrap();
    right.insert(77, 5).unwrap();
    right.insert(79, 6).unwrap();

    // left joins on its value, right on its key: 77 matches.
    let handle = grace_hash_join(&db, &left, &right, false, true, &CancelToken::new()).unwrap();
    let pairs: Vec<EntryPair> = handle.results().iter().collect();
    handle.wait().unwrap();

    assert_eq!(
        pairs,
        vec![EntryPair {
            left: Entry::new(10, 77),
            right: Entry::new(77, 5),
        }]
    );
}

#[test]
fn cancellation_abandons_producers_and_surfaces_in_wait() {
    let dir = tempdir().unwrap();
    let db = Arc::new(Database::open(dir.path().join("db")).unwrap());

    // More matches than the channel holds, so producers must block.
    let left = db.create_table(IndexKind::BTree, "l").unwrap();
    let right = db.create_table(IndexKind::Hash, "r").unwrap();
    for key in 0..3000 {
        left.insert(key, key).unwrap();
        right.insert(key, key).unwrap();
    }

    let handle = grace_hash_join(&db, &left, &right, true, true, &CancelToken::new()).unwrap();
    handle.cancel();
    assert!(matches!(handle.wait(), Err(DbError::Cancelled)));
}

#[test]
fn temporary_databases_are_removed_after_the_join() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("db");
    let db = Arc::new(Database::open(&base).unwrap());

    let left = db.create_table(IndexKind::BTree, "l").unwrap();
    let right = db.create_table(IndexKind::Hash, "r").unwrap();
    for key in 0..10 {
        left.insert(key, key).unwrap();
        right.insert(key, key).unwrap();
    }

    let handle = grace_hash_join(&db, &left, &right, true, true, &CancelToken::new()).unwrap();
    let count = handle.results().iter().count();
    handle.wait().unwrap();
    assert_eq!(count, 10);

    let leftovers: Vec<String> = std::fs::read_dir(&base)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(".tmp-"))
        .collect();
    assert!(leftovers.is_empty(), "leftover temp files: {leftovers:?}");
}
