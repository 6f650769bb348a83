//! The named-table registry over a base directory.
//!
//! Every table is one database file plus its `.meta` sidecar inside the base
//! directory; the sidecar records which index kind owns the file. Creating a
//! table that already exists returns the existing table, which keeps table
//! creation idempotent under log replay.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use granite::btree::BTreeIndex;
use granite::hash::HashIndex;
use granite::{Index, IndexMeta};
use uuid::Uuid;

use crate::errors::{DbError, Result};

/// Prefix for the scratch tables the join operator builds and deletes.
const TEMP_PREFIX: &str = ".tmp-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    BTree,
    Hash,
}

impl IndexKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "btree" => Ok(IndexKind::BTree),
            "hash" => Ok(IndexKind::Hash),
            _ => Err(DbError::Usage("create <btree|hash> table <name>")),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::BTree => "btree",
            IndexKind::Hash => "hash",
        }
    }
}

pub struct Database {
    base: PathBuf,
    tables: RwLock<HashMap<String, Arc<dyn Index>>>,
}

impl Database {
    /// Opens the database directory, loading every table that has a meta
    /// sidecar. Scratch files left behind by interrupted joins are skipped.
    pub fn open<P: AsRef<Path>>(base: P) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base)?;
        let mut tables: HashMap<String, Arc<dyn Index>> = HashMap::new();
        for entry in fs::read_dir(&base)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("meta") {
                continue;
            }
            let table_path = path.with_extension("");
            let Some(name) = table_path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_owned)
            else {
                continue;
            };
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let index: Arc<dyn Index> = match IndexMeta::read_from(&table_path)? {
                IndexMeta::BTree { .. } => Arc::new(BTreeIndex::open(&table_path)?),
                IndexMeta::Hash { .. } => Arc::new(HashIndex::open(&table_path)?),
            };
            tracing::debug!(table = %name, "opened table");
            tables.insert(name, index);
        }
        Ok(Self {
            base,
            tables: RwLock::new(tables),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    /// Creates a table of the given kind, or returns the existing one.
    pub fn create_table(&self, kind: IndexKind, name: &str) -> Result<Arc<dyn Index>> {
        if name.is_empty() || name.contains(['/', '\\', '.']) {
            return Err(DbError::Usage("create <btree|hash> table <name>"));
        }
        let mut tables = self.tables.write().unwrap();
        if let Some(existing) = tables.get(name) {
            return Ok(Arc::clone(existing));
        }
        let path = self.base.join(name);
        let index: Arc<dyn Index> = match kind {
            IndexKind::BTree => Arc::new(BTreeIndex::open(&path)?),
            IndexKind::Hash => Arc::new(HashIndex::open(&path)?),
        };
        tables.insert(name.to_owned(), Arc::clone(&index));
        Ok(index)
    }

    pub fn get_table(&self, name: &str) -> Result<Arc<dyn Index>> {
        self.tables
            .read()
            .unwrap()
            .get(name)
            .map(Arc::clone)
            .ok_or_else(|| DbError::TableNotFound(name.to_owned()))
    }

    pub fn get_tables(&self) -> Vec<Arc<dyn Index>> {
        self.tables.read().unwrap().values().map(Arc::clone).collect()
    }

    /// A fresh path for a scratch table inside the base directory.
    pub fn temp_table_path(&self) -> PathBuf {
        self.base.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4()))
    }

    /// Closes every table, flushing pages and metadata.
    pub fn close(&self) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        for (name, table) in tables.iter() {
            tracing::debug!(table = %name, "closing table");
            table.close()?;
        }
        tables.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_table_is_idempotent_and_reopens() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("db");
        {
            let db = Database::open(&base).unwrap();
            db.create_table(IndexKind::BTree, "orders").unwrap();
            db.create_table(IndexKind::Hash, "users").unwrap();
            // A second create returns the same table.
            db.create_table(IndexKind::BTree, "orders").unwrap();
            db.get_table("orders").unwrap().insert(1, 100).unwrap();
            db.close().unwrap();
        }
        let db = Database::open(&base).unwrap();
        assert_eq!(db.get_tables().len(), 2);
        assert_eq!(db.get_table("orders").unwrap().find(1).unwrap().value, 100);
        assert!(matches!(
            db.get_table("missing"),
            Err(DbError::TableNotFound(_))
        ));
    }

    #[test]
    fn rejects_names_that_escape_the_directory() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("db")).unwrap();
        assert!(db.create_table(IndexKind::BTree, "../evil").is_err());
        assert!(db.create_table(IndexKind::BTree, "").is_err());
    }
}
