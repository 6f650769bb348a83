//! # Keystone
//! The front end of the Keystone database: named tables over the granite
//! storage engine, a textual write-ahead log with checkpoint/recovery, a
//! Grace hash join operator, and the line-oriented REPL that ties them
//! together.

pub mod concurrency;
pub mod config;
pub mod database;
pub mod errors;
pub mod handlers;
pub mod query;
pub mod recovery;
pub mod repl;

use std::io::Write;
use std::sync::Arc;

use uuid::Uuid;

use crate::concurrency::TransactionManager;
use crate::config::Config;
use crate::database::Database;
use crate::errors::{DbError, Result};
use crate::query::{grace_hash_join, CancelToken};
use crate::recovery::RecoveryManager;
use crate::repl::Repl;

/// Runs `f` under the session's open transaction, or wraps it in a fresh
/// autocommitted one: start and commit records bracket the edit, and a
/// failure rolls the fresh transaction back.
fn with_transaction<F>(
    tm: &TransactionManager,
    rm: &RecoveryManager,
    open_txn: Option<Uuid>,
    f: F,
) -> Result<()>
where
    F: FnOnce(Uuid) -> Result<()>,
{
    match open_txn {
        Some(id) => f(id),
        None => {
            let id = Uuid::new_v4();
            tm.begin(id)?;
            rm.start(id)?;
            match f(id) {
                Ok(()) => {
                    rm.commit(id)?;
                    tm.commit(id)?;
                    Ok(())
                }
                Err(e) => {
                    if let Err(rollback_err) = rm.rollback(id) {
                        tracing::warn!(%rollback_err, "autocommit rollback failed");
                    }
                    Err(e)
                }
            }
        }
    }
}

/// Wires every REPL command to the database, transaction and recovery
/// managers.
pub fn build_repl(
    db: Arc<Database>,
    tm: Arc<TransactionManager>,
    rm: Arc<RecoveryManager>,
) -> Repl {
    let mut repl = Repl::new();

    {
        let (db, rm) = (Arc::clone(&db), Arc::clone(&rm));
        repl.add_command(
            "create",
            "create a table. usage: create <btree|hash> table <name>",
            move |payload, state| {
                handlers::handle_create_table(&db, payload, state.writer)?;
                let fields: Vec<&str> = payload.split_whitespace().collect();
                rm.table(fields[1], fields[3])
            },
        );
    }
    {
        let (db, tm, rm) = (Arc::clone(&db), Arc::clone(&tm), Arc::clone(&rm));
        repl.add_command(
            "insert",
            "insert a pair. usage: insert <key> <value> into <table>",
            move |payload, state| {
                with_transaction(&tm, &rm, state.txn, |id| {
                    handlers::handle_insert_tx(&db, &tm, &rm, payload, id)
                })
            },
        );
    }
    {
        let (db, tm, rm) = (Arc::clone(&db), Arc::clone(&tm), Arc::clone(&rm));
        repl.add_command(
            "update",
            "update a pair. usage: update <table> <key> <value>",
            move |payload, state| {
                with_transaction(&tm, &rm, state.txn, |id| {
                    handlers::handle_update_tx(&db, &tm, &rm, payload, id)
                })
            },
        );
    }
    {
        let (db, tm, rm) = (Arc::clone(&db), Arc::clone(&tm), Arc::clone(&rm));
        repl.add_command(
            "delete",
            "delete a pair. usage: delete <key> from <table>",
            move |payload, state| {
                with_transaction(&tm, &rm, state.txn, |id| {
                    handlers::handle_delete_tx(&db, &tm, &rm, payload, id)
                })
            },
        );
    }
    {
        let db = Arc::clone(&db);
        repl.add_command(
            "select",
            "print every pair. usage: select from <table>",
            move |payload, state| handlers::handle_select(&db, payload, state.writer),
        );
    }
    {
        let db = Arc::clone(&db);
        repl.add_command(
            "print",
            "pretty-print an index. usage: print <table>",
            move |payload, state| {
                let fields: Vec<&str> = payload.split_whitespace().collect();
                match fields.as_slice() {
                    ["print", table] => {
                        db.get_table(table)?.print(state.writer)?;
                        Ok(())
                    }
                    _ => Err(DbError::Usage("print <table>")),
                }
            },
        );
    }
    {
        let (tm, rm) = (Arc::clone(&tm), Arc::clone(&rm));
        repl.add_command(
            "begin",
            "open an explicit transaction. usage: begin",
            move |_payload, state| {
                if let Some(id) = state.txn {
                    return Err(DbError::TransactionActive(id));
                }
                let id = Uuid::new_v4();
                tm.begin(id)?;
                rm.start(id)?;
                state.txn = Some(id);
                Ok(())
            },
        );
    }
    {
        let (tm, rm) = (Arc::clone(&tm), Arc::clone(&rm));
        repl.add_command(
            "commit",
            "commit the open transaction. usage: commit",
            move |_payload, state| {
                let Some(id) = state.txn.take() else {
                    return Err(DbError::NoTransaction);
                };
                rm.commit(id)?;
                tm.commit(id)?;
                Ok(())
            },
        );
    }
    {
        let rm = Arc::clone(&rm);
        repl.add_command(
            "abort",
            "roll back the open transaction. usage: abort",
            move |_payload, state| {
                let Some(id) = state.txn.take() else {
                    return Err(DbError::NoTransaction);
                };
                rm.rollback(id)
            },
        );
    }
    {
        let rm = Arc::clone(&rm);
        repl.add_command(
            "checkpoint",
            "flush all tables and snapshot the database. usage: checkpoint",
            move |_payload, _state| rm.checkpoint(),
        );
    }
    {
        let db = Arc::clone(&db);
        repl.add_command(
            "join",
            "hash-join two tables. usage: join <t1> on <key|value> with <t2> on <key|value>",
            move |payload, state| {
                const USAGE: &str = "join <t1> on <key|value> with <t2> on <key|value>";
                let fields: Vec<&str> = payload.split_whitespace().collect();
                let ["join", t1, "on", f1, "with", t2, "on", f2] = fields.as_slice() else {
                    return Err(DbError::Usage(USAGE));
                };
                let field_flag = |f: &str| match f {
                    "key" => Ok(true),
                    "value" => Ok(false),
                    _ => Err(DbError::Usage(USAGE)),
                };
                let left = db.get_table(t1)?;
                let right = db.get_table(t2)?;
                let handle = grace_hash_join(
                    &db,
                    &left,
                    &right,
                    field_flag(f1)?,
                    field_flag(f2)?,
                    &CancelToken::new(),
                )?;
                for pair in handle.results().iter() {
                    writeln!(
                        state.writer,
                        "({}, {}) ({}, {})",
                        pair.left.key, pair.left.value, pair.right.key, pair.right.value
                    )
                    .map_err(DbError::Io)?;
                }
                handle.wait()
            },
        );
    }

    repl
}

/// Opens (or restores) the database, replays the log, then serves the REPL
/// on the given reader/writer until end of input.
pub fn run(config: &Config) -> Result<()> {
    let db = Arc::new(recovery::prime(&config.db_dir)?);
    let tm = Arc::new(TransactionManager::new());
    let rm = Arc::new(RecoveryManager::new(
        Arc::clone(&db),
        Arc::clone(&tm),
        &config.log_file,
    )?);
    rm.recover()?;

    let repl = build_repl(Arc::clone(&db), tm, rm);
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    repl.run(&mut stdin.lock(), &mut stdout.lock(), config.prompt())?;

    db.close()
}
