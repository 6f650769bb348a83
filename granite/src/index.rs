//! The common surface shared by both index kinds.

use crate::error::Result;
use crate::pager::Pager;
use crate::varint::{self, MAX_VARINT_LEN};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Byte stride of a (key, value) cell on a page: two fixed varint slots.
pub const ENTRYSIZE: usize = 2 * MAX_VARINT_LEN;

/// A single key/value pair stored in an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Entry {
    pub key: i64,
    pub value: i64,
}

impl Entry {
    pub fn new(key: i64, value: i64) -> Self {
        Self { key, value }
    }

    /// Writes the cell into a full [`ENTRYSIZE`] slot.
    pub fn marshal(&self, dst: &mut [u8]) {
        varint::put_i64(&mut dst[..MAX_VARINT_LEN], self.key);
        varint::put_i64(&mut dst[MAX_VARINT_LEN..ENTRYSIZE], self.value);
    }

    /// Reads a cell back out of an [`ENTRYSIZE`] slot.
    pub fn unmarshal(src: &[u8]) -> Self {
        Self {
            key: varint::get_i64(&src[..MAX_VARINT_LEN]),
            value: varint::get_i64(&src[MAX_VARINT_LEN..ENTRYSIZE]),
        }
    }
}

/// Durable per-index metadata, serialized to the `.meta` sidecar file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IndexMeta {
    BTree {
        root_pn: i64,
    },
    Hash {
        global_depth: i64,
        directory: Vec<i64>,
    },
}

impl IndexMeta {
    /// The sidecar path for a database file: `<path>.meta`.
    pub fn meta_path(db_path: &std::path::Path) -> std::path::PathBuf {
        let mut name = db_path.as_os_str().to_os_string();
        name.push(".meta");
        std::path::PathBuf::from(name)
    }

    pub fn exists_for(db_path: &std::path::Path) -> bool {
        Self::meta_path(db_path).exists()
    }

    pub fn read_from(db_path: &std::path::Path) -> Result<Self> {
        let bytes = std::fs::read(Self::meta_path(db_path)).map_err(crate::Error::Io)?;
        bincode::deserialize(&bytes).map_err(|e| {
            crate::Error::CorruptFile(format!("bad meta file for {}: {e}", db_path.display()))
        })
    }

    pub fn write_for(&self, db_path: &std::path::Path) -> Result<()> {
        let bytes = bincode::serialize(self)
            .map_err(|e| crate::Error::CorruptFile(format!("meta encoding failed: {e}")))?;
        std::fs::write(Self::meta_path(db_path), bytes).map_err(crate::Error::Io)?;
        Ok(())
    }
}

/// A location in a table. Cursors do not hold page pins between calls;
/// every operation re-pins the page it needs.
pub trait Cursor: Send {
    /// True when the cursor points past the last entry.
    fn is_end(&self) -> bool;

    /// Advances by one entry, following leaf links where needed.
    /// Returns [`Error::EndOfScan`](crate::Error::EndOfScan) when there is
    /// nothing left to advance to.
    fn step_forward(&mut self) -> Result<()>;

    /// The entry currently pointed to.
    fn entry(&self) -> Result<Entry>;
}

/// An ordered or point index over `i64 -> i64`.
pub trait Index: Send + Sync {
    /// The table name this index was opened under.
    fn name(&self) -> &str;

    /// The pager backing this index.
    fn pager(&self) -> &Arc<Pager>;

    /// Point lookup.
    fn find(&self, key: i64) -> Result<Entry>;

    /// Inserts a new pair. B+-trees reject duplicates; hash tables append.
    fn insert(&self, key: i64, value: i64) -> Result<()>;

    /// Overwrites the value of an existing key.
    fn update(&self, key: i64, value: i64) -> Result<()>;

    /// Removes a key if present.
    fn delete(&self, key: i64) -> Result<()>;

    /// All entries in the table.
    fn select(&self) -> Result<Vec<Entry>>;

    /// A cursor at the first entry of the table.
    fn table_start(&self) -> Result<Box<dyn Cursor>>;

    /// A cursor at the given key, or at its insertion position.
    fn table_find(&self, key: i64) -> Result<Box<dyn Cursor>>;

    /// Entries with keys in `[start_key, end_key]`, in key order for
    /// ordered indexes.
    fn table_find_range(&self, start_key: i64, end_key: i64) -> Result<Vec<Entry>>;

    /// Writes all dirty pages and current metadata to disk, keeping the
    /// index open. Checkpointing calls this under the update barrier.
    fn flush(&self) -> Result<()>;

    /// Flushes pages and metadata and releases the backing file.
    fn close(&self) -> Result<()>;

    /// Pretty-prints the index structure.
    fn print(&self, w: &mut dyn std::io::Write) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_marshals_into_fixed_stride() {
        let mut slot = [0u8; ENTRYSIZE];
        let entry = Entry::new(-42, 1 << 40);
        entry.marshal(&mut slot);
        assert_eq!(Entry::unmarshal(&slot), entry);
    }
}
