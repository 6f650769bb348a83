//! Cursors over the B+-tree leaf chain.
//!
//! A cursor is just (pager, leaf page number, cell number, at-end flag).
//! It never keeps a page pinned between calls; every operation re-pins the
//! leaf it needs and releases it before returning.

use std::sync::Arc;

use crate::btree::node::{fetch_leaf, fetch_node, Node, ROOT_PN};
use crate::error::{Error, Result};
use crate::index::{Cursor, Entry};
use crate::pager::Pager;
use crate::PageNum;

pub struct BTreeCursor {
    pager: Arc<Pager>,
    leaf_pn: PageNum,
    cellnum: i64,
    is_end: bool,
}

#[derive(Clone, Copy)]
enum Descent {
    Leftmost,
    Rightmost,
    ToKey(i64),
}

/// Walks from the root to a leaf, following the requested edge.
fn descend(pager: &Arc<Pager>, how: Descent) -> Result<(PageNum, i64)> {
    let mut pn = ROOT_PN;
    loop {
        match fetch_node(pager, pn)? {
            Node::Internal(node) => {
                pn = match how {
                    Descent::Leftmost => node.pn_at(0),
                    Descent::Rightmost => node.pn_at(node.num_keys),
                    Descent::ToKey(key) => node.pn_at(node.search(key)),
                };
            }
            Node::Leaf(leaf) => {
                let cellnum = match how {
                    Descent::Leftmost => 0,
                    Descent::Rightmost => (leaf.num_keys - 1).max(0),
                    Descent::ToKey(key) => leaf.search(key),
                };
                return Ok((leaf.page.pagenum(), cellnum));
            }
        }
    }
}

impl BTreeCursor {
    /// A cursor at the first entry of the table.
    pub fn table_start(pager: Arc<Pager>) -> Result<Self> {
        let (leaf_pn, cellnum) = descend(&pager, Descent::Leftmost)?;
        let mut cursor = Self {
            pager,
            leaf_pn,
            cellnum,
            is_end: false,
        };
        cursor.settle()?;
        Ok(cursor)
    }

    /// A cursor at the last entry of the table, or at the insertion
    /// position if the table is empty.
    pub fn table_end(pager: Arc<Pager>) -> Result<Self> {
        let (leaf_pn, cellnum) = descend(&pager, Descent::Rightmost)?;
        let is_end = {
            let leaf = fetch_leaf(&pager, leaf_pn)?;
            leaf.num_keys == 0
        };
        Ok(Self {
            pager,
            leaf_pn,
            cellnum,
            is_end,
        })
    }

    /// A cursor at the given key, or at the position where it would be
    /// inserted.
    pub fn table_find(pager: Arc<Pager>, key: i64) -> Result<Self> {
        let (leaf_pn, cellnum) = descend(&pager, Descent::ToKey(key))?;
        let mut cursor = Self {
            pager,
            leaf_pn,
            cellnum,
            is_end: false,
        };
        cursor.settle()?;
        Ok(cursor)
    }

    /// If the cell number points past the current leaf, follows the sibling
    /// chain to the next entry, marking the end of the table on the
    /// rightmost sentinel.
    fn settle(&mut self) -> Result<()> {
        loop {
            let leaf = fetch_leaf(&self.pager, self.leaf_pn)?;
            if self.cellnum < leaf.num_keys {
                return Ok(());
            }
            if leaf.right_sibling < 0 {
                self.is_end = true;
                return Ok(());
            }
            self.leaf_pn = leaf.right_sibling;
            self.cellnum = 0;
        }
    }
}

impl Cursor for BTreeCursor {
    fn is_end(&self) -> bool {
        self.is_end
    }

    fn step_forward(&mut self) -> Result<()> {
        if self.is_end {
            return Err(Error::EndOfScan);
        }
        self.cellnum += 1;
        self.settle()
    }

    fn entry(&self) -> Result<Entry> {
        if self.is_end {
            return Err(Error::EndOfScan);
        }
        let leaf = fetch_leaf(&self.pager, self.leaf_pn)?;
        Ok(leaf.cell_at(self.cellnum))
    }
}
