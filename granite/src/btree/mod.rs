//! An ordered integer-to-integer index laid out as a B+-tree over pages.
//!
//! The root always lives on page 0. Splits propagate upward through a split
//! carrier; when the root itself splits, page 0 is rewritten in place as a
//! new internal node so the root's page number never changes. Deletes do
//! not rebalance.

mod cursor;
mod node;

pub use cursor::BTreeCursor;
pub use node::{ENTRIES_PER_LEAF, KEYS_PER_INTERNAL, ROOT_PN};

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::index::{Cursor, Entry, Index, IndexMeta};
use crate::pager::Pager;
use node::{fetch_node, init_leaf, Node, Split};

pub struct BTreeIndex {
    name: String,
    path: PathBuf,
    pager: Arc<Pager>,
    /// Serializes mutations against each other and against readers, making
    /// insert/update/delete on one index serializable.
    lock: RwLock<()>,
}

impl BTreeIndex {
    /// Opens (or creates) a B+-tree index stored at `path`, with its
    /// metadata in the `<path>.meta` sidecar.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let pager = Arc::new(Pager::open(&path)?);
        if pager.num_pages() == 0 {
            let root = pager.get_page(ROOT_PN)?;
            init_leaf(&root);
        }
        if IndexMeta::exists_for(&path) {
            match IndexMeta::read_from(&path)? {
                IndexMeta::BTree { .. } => {}
                IndexMeta::Hash { .. } => {
                    return Err(Error::CorruptFile(format!(
                        "{} is a hash index, not a btree",
                        path.display()
                    )))
                }
            }
        } else {
            IndexMeta::BTree { root_pn: ROOT_PN }.write_for(&path)?;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "table".to_string());
        Ok(Self {
            name,
            path,
            pager,
            lock: RwLock::new(()),
        })
    }

    /// Rewrites page 0 in place after a root split: the shrunken old root
    /// is copied out to a fresh page, and page 0 becomes an internal node
    /// with the promoted key and the two children.
    fn handle_root_split(&self, split: Split) -> Result<()> {
        let Split::Promote { key, right_pn, .. } = split else {
            return Ok(());
        };
        let left_pn = {
            let root_page = self.pager.get_page(ROOT_PN)?;
            let left_page = self.pager.get_page(self.pager.get_free_pn())?;
            let src = root_page.read();
            left_page.write().copy_from_slice(&src[..]);
            left_page.pagenum()
        };
        node::rewrite_root(&self.pager, key, left_pn, right_pn)
    }

    /// A cursor at the last entry of the table.
    pub fn table_end(&self) -> Result<BTreeCursor> {
        let _g = self.lock.read().unwrap();
        BTreeCursor::table_end(Arc::clone(&self.pager))
    }
}

impl Index for BTreeIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    fn find(&self, key: i64) -> Result<Entry> {
        let _g = self.lock.read().unwrap();
        let root = fetch_node(&self.pager, ROOT_PN)?;
        match root.get(key)? {
            Some(value) => Ok(Entry::new(key, value)),
            None => Err(Error::NotFound(key)),
        }
    }

    fn insert(&self, key: i64, value: i64) -> Result<()> {
        let _g = self.lock.write().unwrap();
        let _permit = self.pager.begin_update();
        let mut root = fetch_node(&self.pager, ROOT_PN)?;
        let split = root.insert(key, value, false)?;
        drop(root);
        if let Split::Promote { .. } = split {
            self.handle_root_split(split)?;
        }
        Ok(())
    }

    fn update(&self, key: i64, value: i64) -> Result<()> {
        let _g = self.lock.write().unwrap();
        let _permit = self.pager.begin_update();
        let mut root = fetch_node(&self.pager, ROOT_PN)?;
        root.insert(key, value, true)?;
        Ok(())
    }

    fn delete(&self, key: i64) -> Result<()> {
        let _g = self.lock.write().unwrap();
        let _permit = self.pager.begin_update();
        let mut root = fetch_node(&self.pager, ROOT_PN)?;
        root.delete(key)
    }

    fn select(&self) -> Result<Vec<Entry>> {
        let _g = self.lock.read().unwrap();
        let mut cursor = BTreeCursor::table_start(Arc::clone(&self.pager))?;
        let mut entries = Vec::new();
        while !cursor.is_end() {
            entries.push(cursor.entry()?);
            cursor.step_forward()?;
        }
        Ok(entries)
    }

    fn table_start(&self) -> Result<Box<dyn Cursor>> {
        let _g = self.lock.read().unwrap();
        Ok(Box::new(BTreeCursor::table_start(Arc::clone(&self.pager))?))
    }

    fn table_find(&self, key: i64) -> Result<Box<dyn Cursor>> {
        let _g = self.lock.read().unwrap();
        Ok(Box::new(BTreeCursor::table_find(
            Arc::clone(&self.pager),
            key,
        )?))
    }

    fn table_find_range(&self, start_key: i64, end_key: i64) -> Result<Vec<Entry>> {
        let _g = self.lock.read().unwrap();
        let mut cursor = BTreeCursor::table_find(Arc::clone(&self.pager), start_key)?;
        let mut entries = Vec::new();
        while !cursor.is_end() {
            let entry = cursor.entry()?;
            if entry.key > end_key {
                break;
            }
            entries.push(entry);
            cursor.step_forward()?;
        }
        Ok(entries)
    }

    fn flush(&self) -> Result<()> {
        IndexMeta::BTree { root_pn: ROOT_PN }.write_for(&self.path)?;
        self.pager.flush_all_pages()
    }

    fn close(&self) -> Result<()> {
        let _g = self.lock.write().unwrap();
        IndexMeta::BTree { root_pn: ROOT_PN }.write_for(&self.path)?;
        self.pager.close()
    }

    fn print(&self, w: &mut dyn Write) -> Result<()> {
        let _g = self.lock.read().unwrap();
        let root = fetch_node(&self.pager, ROOT_PN)?;
        root.print_node(w, "", "")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::node::fetch_leaf;
    use super::*;
    use tempfile::tempdir;

    fn open_index(dir: &tempfile::TempDir, name: &str) -> BTreeIndex {
        BTreeIndex::open(dir.path().join(name)).unwrap()
    }

    #[test]
    fn fills_one_leaf_then_splits_the_root() {
        let dir = tempdir().unwrap();
        let index = open_index(&dir, "t");

        for key in 1..=ENTRIES_PER_LEAF + 1 {
            index.insert(key, key * 10).unwrap();
        }

        // The root is now internal with a single separator equal to the
        // first key of the right half.
        let expected_median = ENTRIES_PER_LEAF / 2 + 1;
        let root = fetch_node(&index.pager, ROOT_PN).unwrap();
        let Node::Internal(root) = root else {
            panic!("root should be internal after the split");
        };
        assert_eq!(root.num_keys, 1);
        assert_eq!(root.key_at(0), expected_median);

        // The two leaves are linked through the right-sibling pointer.
        let left = fetch_leaf(&index.pager, root.pn_at(0)).unwrap();
        assert_eq!(left.right_sibling, root.pn_at(1));
        let right = fetch_leaf(&index.pager, root.pn_at(1)).unwrap();
        assert_eq!(right.key_at(0), expected_median);
        drop(root);

        for key in 1..=ENTRIES_PER_LEAF + 1 {
            assert_eq!(index.find(key).unwrap().value, key * 10);
        }
    }

    #[test]
    fn range_scan_is_inclusive_of_both_bounds() {
        let dir = tempdir().unwrap();
        let index = open_index(&dir, "t");
        for key in [10, 20, 30, 40, 50] {
            index.insert(key, key).unwrap();
        }
        let hits = index.table_find_range(15, 45).unwrap();
        let keys: Vec<i64> = hits.iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![20, 30, 40]);
    }

    #[test]
    fn rejects_duplicates_and_updates_of_missing_keys() {
        let dir = tempdir().unwrap();
        let index = open_index(&dir, "t");
        index.insert(7, 70).unwrap();
        assert!(matches!(index.insert(7, 71), Err(Error::DuplicateKey(7))));
        assert!(matches!(index.update(8, 80), Err(Error::NotFound(8))));
        index.update(7, 77).unwrap();
        assert_eq!(index.find(7).unwrap().value, 77);
    }

    #[test]
    fn deleted_keys_stop_resolving() {
        let dir = tempdir().unwrap();
        let index = open_index(&dir, "t");
        for key in 0..20 {
            index.insert(key, key).unwrap();
        }
        index.delete(11).unwrap();
        assert!(matches!(index.find(11), Err(Error::NotFound(11))));
        // Deleting an absent key is a no-op.
        index.delete(11).unwrap();
        assert_eq!(index.select().unwrap().len(), 19);
    }

    #[test]
    fn traversal_is_strictly_increasing_after_mixed_edits() {
        let dir = tempdir().unwrap();
        let index = open_index(&dir, "t");
        // A fixed permutation of 0..1000 exercises out-of-order inserts.
        for i in 0..1000i64 {
            let key = (i * 619) % 1000;
            index.insert(key, i).unwrap();
        }
        for key in (0..1000i64).step_by(3) {
            index.delete(key).unwrap();
        }

        let entries = index.select().unwrap();
        assert_eq!(entries.len(), 666);
        for pair in entries.windows(2) {
            assert!(pair[0].key < pair[1].key);
        }
    }

    #[test]
    fn sequential_load_cascades_splits_through_internal_nodes() {
        let dir = tempdir().unwrap();
        let index = open_index(&dir, "t");
        let total = (ENTRIES_PER_LEAF / 2 + 1) * (KEYS_PER_INTERNAL + 4);
        for key in 0..total {
            index.insert(key, key).unwrap();
        }
        let Node::Internal(_) = fetch_node(&index.pager, ROOT_PN).unwrap() else {
            panic!("root should be internal");
        };
        for key in (0..total).step_by(997) {
            assert_eq!(index.find(key).unwrap().value, key);
        }
        assert_eq!(index.select().unwrap().len(), total as usize);
    }

    #[test]
    fn contents_survive_close_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t");
        {
            let index = BTreeIndex::open(&path).unwrap();
            for key in 0..300 {
                index.insert(key, key + 1).unwrap();
            }
            index.close().unwrap();
        }
        let index = BTreeIndex::open(&path).unwrap();
        assert_eq!(index.find(250).unwrap().value, 251);
        assert_eq!(index.select().unwrap().len(), 300);
    }
}
