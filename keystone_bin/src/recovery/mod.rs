//! The recovery manager: append-only textual log, checkpointing with a
//! copy-on-checkpoint snapshot directory, redo/undo recovery and online
//! per-transaction rollback.

mod log;

pub use log::{Action, LogRecord};

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::concurrency::TransactionManager;
use crate::database::Database;
use crate::errors::{DbError, Result};
use crate::handlers;

struct RmInner {
    file: File,
    /// Per-transaction record stack, from `start` through the latest edit.
    /// Rollback walks it backward; commit clears it.
    tx_stack: HashMap<Uuid, Vec<LogRecord>>,
}

pub struct RecoveryManager {
    db: Arc<Database>,
    tm: Arc<TransactionManager>,
    log_path: PathBuf,
    inner: Mutex<RmInner>,
}

/// The snapshot directory that pairs with a database directory:
/// `<base>-recovery`.
fn recovery_path(base: &Path) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push("-recovery");
    PathBuf::from(name)
}

fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

/// Prepares the database directory for startup. A missing live directory is
/// created alongside an empty snapshot directory; if both the live and the
/// snapshot directories exist, the live one is discarded and restored from
/// the snapshot taken at the last checkpoint.
pub fn prime<P: AsRef<Path>>(base: P) -> Result<Database> {
    let base = base.as_ref();
    let snapshot = recovery_path(base);
    if !base.exists() {
        fs::create_dir_all(&snapshot)?;
        return Database::open(base);
    }
    if !snapshot.exists() {
        return Database::open(base);
    }
    tracing::debug!(base = %base.display(), "restoring database from snapshot");
    fs::remove_dir_all(base)?;
    copy_dir(&snapshot, base)?;
    Database::open(base)
}

impl RecoveryManager {
    pub fn new<P: AsRef<Path>>(
        db: Arc<Database>,
        tm: Arc<TransactionManager>,
        log_path: P,
    ) -> Result<Self> {
        let log_path = log_path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&log_path)?;
        Ok(Self {
            db,
            tm,
            log_path,
            inner: Mutex::new(RmInner {
                file,
                tx_stack: HashMap::new(),
            }),
        })
    }

    /// Appends a record and fsyncs before returning.
    fn write_to_buffer(inner: &mut RmInner, record: &LogRecord) -> Result<()> {
        writeln!(inner.file, "{record}")?;
        inner.file.sync_all()?;
        Ok(())
    }

    /// Logs a table creation.
    pub fn table(&self, kind: &str, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::write_to_buffer(
            &mut inner,
            &LogRecord::Table {
                kind: kind.to_owned(),
                name: name.to_owned(),
            },
        )
    }

    /// Logs a transaction start and opens its in-memory stack.
    pub fn start(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let record = LogRecord::Start { id };
        Self::write_to_buffer(&mut inner, &record)?;
        inner.tx_stack.insert(id, vec![record]);
        Ok(())
    }

    /// Logs one edit and pushes it onto the transaction's stack.
    pub fn edit(
        &self,
        id: Uuid,
        table: &str,
        action: Action,
        key: i64,
        oldval: i64,
        newval: i64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let record = LogRecord::Edit {
            id,
            table: table.to_owned(),
            action,
            key,
            oldval,
            newval,
        };
        Self::write_to_buffer(&mut inner, &record)?;
        inner.tx_stack.entry(id).or_default().push(record);
        Ok(())
    }

    /// Logs a commit and drops the transaction's stack.
    pub fn commit(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.tx_stack.remove(&id);
        Self::write_to_buffer(&mut inner, &LogRecord::Commit { id })
    }

    /// Flushes every table under its update barrier, logs the checkpoint
    /// with the set of running transactions, then mirrors the database
    /// directory into the snapshot directory.
    pub fn checkpoint(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for table in self.db.get_tables() {
            let pager = table.pager();
            let freeze = pager.lock_all_updates();
            table.flush()?;
            drop(freeze);
        }
        let ids: Vec<Uuid> = inner.tx_stack.keys().copied().collect();
        Self::write_to_buffer(&mut inner, &LogRecord::Checkpoint { ids })?;
        self.delta()
    }

    /// Mirrors the live database directory into `<base>-recovery/`.
    fn delta(&self) -> Result<()> {
        let base = self.db.base_path();
        let snapshot = recovery_path(base);
        if snapshot.exists() {
            fs::remove_dir_all(&snapshot)?;
        }
        copy_dir(base, &snapshot)?;
        Ok(())
    }

    /// Reapplies a table or edit record through the normal string handlers.
    /// Edits fall back to the complementary handler so replay stays
    /// idempotent against whatever state survived on disk.
    fn redo(&self, record: &LogRecord) -> Result<()> {
        match record {
            LogRecord::Table { kind, name } => {
                let payload = format!("create {kind} table {name}");
                handlers::handle_create_table(&self.db, &payload, &mut std::io::sink())
            }
            LogRecord::Edit {
                table,
                action,
                key,
                newval,
                ..
            } => match action {
                Action::Insert => {
                    let payload = format!("insert {key} {newval} into {table}");
                    handlers::handle_insert(&self.db, &payload).or_else(|_| {
                        let payload = format!("update {table} {key} {newval}");
                        handlers::handle_update(&self.db, &payload)
                    })
                }
                Action::Update => {
                    let payload = format!("update {table} {key} {newval}");
                    handlers::handle_update(&self.db, &payload).or_else(|_| {
                        let payload = format!("insert {key} {newval} into {table}");
                        handlers::handle_insert(&self.db, &payload)
                    })
                }
                Action::Delete => {
                    let payload = format!("delete {key} from {table}");
                    handlers::handle_delete(&self.db, &payload)
                }
            },
            _ => Err(DbError::LogParse(
                "can only redo table and edit records".into(),
            )),
        }
    }

    /// Applies the inverse of an edit through the transactional cores, so
    /// the undoing transaction holds the locks and the compensation is
    /// logged.
    fn undo(&self, record: &LogRecord) -> Result<()> {
        let LogRecord::Edit {
            id,
            table,
            action,
            key,
            oldval,
            ..
        } = record
        else {
            return Err(DbError::LogParse("can only undo edit records".into()));
        };
        match action {
            Action::Insert => handlers::delete_tx(&self.db, &self.tm, self, *id, table, *key),
            Action::Update => {
                handlers::update_tx(&self.db, &self.tm, self, *id, table, *key, *oldval)
            }
            Action::Delete => {
                handlers::insert_tx(&self.db, &self.tm, self, *id, table, *key, *oldval)
            }
        }
    }

    /// Full recovery at startup: replay table records from the top of the
    /// log, redo forward from the most recent checkpoint, then undo every
    /// transaction that never committed, newest edit first.
    pub fn recover(&self) -> Result<()> {
        let text = fs::read_to_string(&self.log_path)?;
        let mut records = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<LogRecord>() {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(%e, "skipping malformed log line"),
            }
        }

        for record in &records {
            if matches!(record, LogRecord::Table { .. }) {
                if let Err(e) = self.redo(record) {
                    tracing::warn!(%e, "table replay failed");
                }
            }
        }

        // Redo forward from just past the most recent checkpoint, seeding
        // the active set with the transactions it recorded.
        let mut actives: HashSet<Uuid> = HashSet::new();
        let mut pos = 0;
        for (i, record) in records.iter().enumerate() {
            if let LogRecord::Checkpoint { ids } = record {
                actives = ids.iter().copied().collect();
                pos = i + 1;
            }
        }
        for id in &actives {
            let _ = self.tm.begin(*id);
        }

        while pos < records.len() {
            match &records[pos] {
                LogRecord::Edit { id, .. } => {
                    if actives.insert(*id) {
                        let _ = self.tm.begin(*id);
                    }
                    if let Err(e) = self.redo(&records[pos]) {
                        tracing::warn!(%e, "redo failed");
                    }
                }
                LogRecord::Start { id } => {
                    actives.insert(*id);
                    let _ = self.tm.begin(*id);
                }
                LogRecord::Commit { id } => {
                    actives.remove(id);
                    let _ = self.tm.commit(*id);
                }
                _ => {}
            }
            pos += 1;
        }

        // Undo backward. When a live transaction's start record is reached
        // it has been fully compensated, so it is committed in both the log
        // and the transaction manager.
        for record in records.iter().rev() {
            match record {
                LogRecord::Edit { id, .. } if actives.contains(id) => {
                    if let Err(e) = self.undo(record) {
                        tracing::warn!(%e, "undo failed");
                    }
                }
                LogRecord::Start { id } if actives.contains(id) => {
                    self.commit(*id)?;
                    let _ = self.tm.commit(*id);
                    actives.remove(id);
                }
                _ => {}
            }
        }
        // Transactions seeded from the checkpoint record whose start lies
        // before the log head are ended here as well.
        for id in actives {
            self.commit(id)?;
            let _ = self.tm.commit(id);
        }
        Ok(())
    }

    /// Rolls back one running transaction: undoes its edits newest first,
    /// then commits it in the log and the transaction manager.
    pub fn rollback(&self, id: Uuid) -> Result<()> {
        let stack = {
            let inner = self.inner.lock().unwrap();
            inner.tx_stack.get(&id).cloned().unwrap_or_default()
        };
        if stack.is_empty() {
            return Err(DbError::TransactionUnknown(id));
        }
        for record in stack.iter().skip(1).rev() {
            self.undo(record)?;
        }
        self.commit(id)?;
        self.tm.commit(id)?;
        Ok(())
    }
}
