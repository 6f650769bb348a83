//! Command handlers with string payloads.
//!
//! The payload grammars (`create … table …`, `insert K V into T`,
//! `update T K V`, `delete K from T`, `select from T`) are a stable
//! contract: the recovery manager reconstructs exactly these strings when it
//! redoes the log. Each string handler is a thin parser over a typed core;
//! undo and rollback call the typed transactional cores directly.

use std::io::Write;

use uuid::Uuid;

use crate::concurrency::{LockMode, TransactionManager};
use crate::database::{Database, IndexKind};
use crate::errors::{DbError, Result};
use crate::recovery::{Action, RecoveryManager};

fn parse_i64(field: &str, usage: &'static str) -> Result<i64> {
    field.parse().map_err(|_| DbError::Usage(usage))
}

/// `create <btree|hash> table <name>`
pub fn handle_create_table(db: &Database, payload: &str, w: &mut dyn Write) -> Result<()> {
    const USAGE: &str = "create <btree|hash> table <name>";
    let fields: Vec<&str> = payload.split_whitespace().collect();
    match fields.as_slice() {
        ["create", kind, "table", name] => {
            let kind = IndexKind::parse(kind)?;
            db.create_table(kind, name)?;
            writeln!(w, "created table {name}")?;
            Ok(())
        }
        _ => Err(DbError::Usage(USAGE)),
    }
}

/// `insert <key> <value> into <table>`
pub fn handle_insert(db: &Database, payload: &str) -> Result<()> {
    const USAGE: &str = "insert <key> <value> into <table>";
    let fields: Vec<&str> = payload.split_whitespace().collect();
    match fields.as_slice() {
        ["insert", key, value, "into", table] => {
            let key = parse_i64(key, USAGE)?;
            let value = parse_i64(value, USAGE)?;
            db.get_table(table)?.insert(key, value)?;
            Ok(())
        }
        _ => Err(DbError::Usage(USAGE)),
    }
}

/// `update <table> <key> <value>`
pub fn handle_update(db: &Database, payload: &str) -> Result<()> {
    const USAGE: &str = "update <table> <key> <value>";
    let fields: Vec<&str> = payload.split_whitespace().collect();
    match fields.as_slice() {
        ["update", table, key, value] => {
            let key = parse_i64(key, USAGE)?;
            let value = parse_i64(value, USAGE)?;
            db.get_table(table)?.update(key, value)?;
            Ok(())
        }
        _ => Err(DbError::Usage(USAGE)),
    }
}

/// `delete <key> from <table>`
pub fn handle_delete(db: &Database, payload: &str) -> Result<()> {
    const USAGE: &str = "delete <key> from <table>";
    let fields: Vec<&str> = payload.split_whitespace().collect();
    match fields.as_slice() {
        ["delete", key, "from", table] => {
            let key = parse_i64(key, USAGE)?;
            let table = db.get_table(table)?;
            // Deleting an absent key is an error at the command surface.
            table.find(key)?;
            table.delete(key)?;
            Ok(())
        }
        _ => Err(DbError::Usage(USAGE)),
    }
}

/// `select from <table>`
pub fn handle_select(db: &Database, payload: &str, w: &mut dyn Write) -> Result<()> {
    const USAGE: &str = "select from <table>";
    let fields: Vec<&str> = payload.split_whitespace().collect();
    match fields.as_slice() {
        ["select", "from", table] => {
            for entry in db.get_table(table)?.select()? {
                writeln!(w, "({}, {})", entry.key, entry.value)?;
            }
            Ok(())
        }
        _ => Err(DbError::Usage(USAGE)),
    }
}

// Transactional cores. Each one locks the entry through the transaction
// manager, applies the change, and records the edit with the recovery
// manager so the transaction can be rolled back or undone.

pub fn insert_tx(
    db: &Database,
    tm: &TransactionManager,
    rm: &RecoveryManager,
    tx_id: Uuid,
    table_name: &str,
    key: i64,
    value: i64,
) -> Result<()> {
    let table = db.get_table(table_name)?;
    tm.lock(tx_id, table_name, key, LockMode::Exclusive)?;
    table.insert(key, value)?;
    rm.edit(tx_id, table_name, Action::Insert, key, 0, value)?;
    Ok(())
}

pub fn update_tx(
    db: &Database,
    tm: &TransactionManager,
    rm: &RecoveryManager,
    tx_id: Uuid,
    table_name: &str,
    key: i64,
    value: i64,
) -> Result<()> {
    let table = db.get_table(table_name)?;
    tm.lock(tx_id, table_name, key, LockMode::Exclusive)?;
    let old = table.find(key)?;
    table.update(key, value)?;
    rm.edit(tx_id, table_name, Action::Update, key, old.value, value)?;
    Ok(())
}

pub fn delete_tx(
    db: &Database,
    tm: &TransactionManager,
    rm: &RecoveryManager,
    tx_id: Uuid,
    table_name: &str,
    key: i64,
) -> Result<()> {
    let table = db.get_table(table_name)?;
    tm.lock(tx_id, table_name, key, LockMode::Exclusive)?;
    let old = table.find(key)?;
    table.delete(key)?;
    rm.edit(tx_id, table_name, Action::Delete, key, old.value, 0)?;
    Ok(())
}

/// `insert <key> <value> into <table>`, inside a transaction.
pub fn handle_insert_tx(
    db: &Database,
    tm: &TransactionManager,
    rm: &RecoveryManager,
    payload: &str,
    tx_id: Uuid,
) -> Result<()> {
    const USAGE: &str = "insert <key> <value> into <table>";
    let fields: Vec<&str> = payload.split_whitespace().collect();
    match fields.as_slice() {
        ["insert", key, value, "into", table] => {
            let key = parse_i64(key, USAGE)?;
            let value = parse_i64(value, USAGE)?;
            insert_tx(db, tm, rm, tx_id, table, key, value)
        }
        _ => Err(DbError::Usage(USAGE)),
    }
}

/// `update <table> <key> <value>`, inside a transaction.
pub fn handle_update_tx(
    db: &Database,
    tm: &TransactionManager,
    rm: &RecoveryManager,
    payload: &str,
    tx_id: Uuid,
) -> Result<()> {
    const USAGE: &str = "update <table> <key> <value>";
    let fields: Vec<&str> = payload.split_whitespace().collect();
    match fields.as_slice() {
        ["update", table, key, value] => {
            let key = parse_i64(key, USAGE)?;
            let value = parse_i64(value, USAGE)?;
            update_tx(db, tm, rm, tx_id, table, key, value)
        }
        _ => Err(DbError::Usage(USAGE)),
    }
}

/// `delete <key> from <table>`, inside a transaction.
pub fn handle_delete_tx(
    db: &Database,
    tm: &TransactionManager,
    rm: &RecoveryManager,
    payload: &str,
    tx_id: Uuid,
) -> Result<()> {
    const USAGE: &str = "delete <key> from <table>";
    let fields: Vec<&str> = payload.split_whitespace().collect();
    match fields.as_slice() {
        ["delete", key, "from", table] => {
            let key = parse_i64(key, USAGE)?;
            delete_tx(db, tm, rm, tx_id, table, key)
        }
        _ => Err(DbError::Usage(USAGE)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn grammars_are_enforced() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("db")).unwrap();
        let mut out = Vec::new();

        handle_create_table(&db, "create btree table t", &mut out).unwrap();
        assert!(matches!(
            handle_create_table(&db, "create ternary table t", &mut out),
            Err(DbError::Usage(_))
        ));
        assert!(matches!(
            handle_insert(&db, "insert five 6 into t"),
            Err(DbError::Usage(_))
        ));

        handle_insert(&db, "insert 5 6 into t").unwrap();
        handle_update(&db, "update t 5 7").unwrap();
        let mut rows = Vec::new();
        handle_select(&db, "select from t", &mut rows).unwrap();
        assert_eq!(String::from_utf8(rows).unwrap(), "(5, 7)\n");

        handle_delete(&db, "delete 5 from t").unwrap();
        assert!(handle_delete(&db, "delete 5 from t").is_err());
    }
}
