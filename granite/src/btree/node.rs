//! Node layout and node-level routines for the B+-tree.
//!
//! Each node occupies exactly one page. The header starts with a node-type
//! byte (leaf = 1, internal = 0) followed by a varint key count. Leaves add
//! a right-sibling page number and then (key, value) cells at a fixed
//! stride; internal nodes store `cap + 1` key slots followed by `cap + 2`
//! child page-number slots, all varints in fixed slots.

use std::io::Write;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::index::{Entry, ENTRYSIZE};
use crate::pager::{Page, Pager};
use crate::varint::{self, MAX_VARINT_LEN};
use crate::{PageNum, NOPAGE, PAGESIZE};

/// The root of a B+-tree lives on page 0 of its file, always. When the root
/// splits, page 0 is rewritten in place so this never changes.
pub const ROOT_PN: PageNum = 0;

const NODETYPE_OFFSET: usize = 0;
const NODETYPE_SIZE: usize = 1;
const NUM_KEYS_OFFSET: usize = NODETYPE_OFFSET + NODETYPE_SIZE;
const NUM_KEYS_SIZE: usize = MAX_VARINT_LEN;
const NODE_HEADER_SIZE: usize = NODETYPE_SIZE + NUM_KEYS_SIZE;

const RIGHT_SIBLING_OFFSET: usize = NODE_HEADER_SIZE;
const RIGHT_SIBLING_SIZE: usize = MAX_VARINT_LEN;
const LEAF_HEADER_SIZE: usize = NODE_HEADER_SIZE + RIGHT_SIBLING_SIZE;

/// Leaf capacity, with one slot of slack for the overflowing cell that
/// triggers a split.
pub const ENTRIES_PER_LEAF: i64 = ((PAGESIZE - LEAF_HEADER_SIZE) / ENTRYSIZE - 1) as i64;

const KEY_SIZE: usize = MAX_VARINT_LEN;
const PN_SIZE: usize = MAX_VARINT_LEN;
const PTR_SPACE: usize = PAGESIZE - NODE_HEADER_SIZE - KEY_SIZE;

/// Internal-node key capacity, again with one slot of slack.
pub const KEYS_PER_INTERNAL: i64 = (PTR_SPACE / (KEY_SIZE + PN_SIZE) - 1) as i64;

const KEYS_OFFSET: usize = NODE_HEADER_SIZE;
const KEYS_SIZE: usize = KEY_SIZE * (KEYS_PER_INTERNAL as usize + 1);
const PNS_OFFSET: usize = KEYS_OFFSET + KEYS_SIZE;

const LEAF_TYPE: u8 = 1;
const INTERNAL_TYPE: u8 = 0;

/// The split carrier: propagated up the insertion path so internal callers
/// can cascade splits toward the root.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Split {
    None,
    Promote {
        key: i64,
        left_pn: PageNum,
        right_pn: PageNum,
    },
}

pub(crate) enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

pub(crate) struct LeafNode {
    pub(crate) page: Page,
    pub(crate) num_keys: i64,
    pub(crate) right_sibling: PageNum,
}

pub(crate) struct InternalNode {
    pub(crate) page: Page,
    pub(crate) num_keys: i64,
}

/// Reinitializes a page as an empty leaf with no right sibling.
pub(crate) fn init_leaf(page: &Page) {
    let mut data = page.write();
    data.fill(0);
    data[NODETYPE_OFFSET] = LEAF_TYPE;
    varint::put_i64(
        &mut data[RIGHT_SIBLING_OFFSET..RIGHT_SIBLING_OFFSET + RIGHT_SIBLING_SIZE],
        NOPAGE,
    );
}

/// Reinitializes a page as an empty internal node.
pub(crate) fn init_internal(page: &Page) {
    let mut data = page.write();
    data.fill(0);
    data[NODETYPE_OFFSET] = INTERNAL_TYPE;
}

/// Reads the node stored on the given page.
pub(crate) fn fetch_node(pager: &Arc<Pager>, pn: PageNum) -> Result<Node> {
    let page = pager.get_page(pn)?;
    Ok(node_from_page(page))
}

/// Reads the leaf stored on the given page; errors on an internal node.
pub(crate) fn fetch_leaf(pager: &Arc<Pager>, pn: PageNum) -> Result<LeafNode> {
    match fetch_node(pager, pn)? {
        Node::Leaf(leaf) => Ok(leaf),
        Node::Internal(_) => Err(Error::CorruptFile(format!(
            "page {pn} is not a leaf node"
        ))),
    }
}

fn node_from_page(page: Page) -> Node {
    let (node_type, num_keys, right_sibling) = {
        let data = page.read();
        (
            data[NODETYPE_OFFSET],
            varint::get_i64(&data[NUM_KEYS_OFFSET..NUM_KEYS_OFFSET + NUM_KEYS_SIZE]),
            varint::get_i64(
                &data[RIGHT_SIBLING_OFFSET..RIGHT_SIBLING_OFFSET + RIGHT_SIBLING_SIZE],
            ),
        )
    };
    if node_type == LEAF_TYPE {
        Node::Leaf(LeafNode {
            page,
            num_keys,
            right_sibling,
        })
    } else {
        Node::Internal(InternalNode { page, num_keys })
    }
}

/// Rewrites page 0 in place as a fresh internal root holding one promoted
/// key and two children. Used when the old root has already been split and
/// copied out to `left_pn`.
pub(crate) fn rewrite_root(pager: &Arc<Pager>, key: i64, left_pn: PageNum, right_pn: PageNum) -> Result<()> {
    let root_page = pager.get_page(ROOT_PN)?;
    init_internal(&root_page);
    let mut root = InternalNode {
        page: root_page,
        num_keys: 0,
    };
    root.set_key_at(0, key);
    root.set_pn_at(0, left_pn);
    root.set_pn_at(1, right_pn);
    root.set_num_keys(1);
    Ok(())
}

/// Allocates and initializes a fresh leaf.
pub(crate) fn create_leaf(pager: &Arc<Pager>) -> Result<LeafNode> {
    let page = pager.get_page(pager.get_free_pn())?;
    init_leaf(&page);
    Ok(LeafNode {
        page,
        num_keys: 0,
        right_sibling: NOPAGE,
    })
}

/// Allocates and initializes a fresh internal node.
pub(crate) fn create_internal(pager: &Arc<Pager>) -> Result<InternalNode> {
    let page = pager.get_page(pager.get_free_pn())?;
    init_internal(&page);
    Ok(InternalNode { page, num_keys: 0 })
}

impl Node {
    pub(crate) fn insert(&mut self, key: i64, value: i64, update: bool) -> Result<Split> {
        match self {
            Node::Leaf(leaf) => leaf.insert(key, value, update),
            Node::Internal(node) => node.insert(key, value, update),
        }
    }

    pub(crate) fn delete(&mut self, key: i64) -> Result<()> {
        match self {
            Node::Leaf(leaf) => {
                leaf.delete(key);
                Ok(())
            }
            Node::Internal(node) => node.delete(key),
        }
    }

    pub(crate) fn get(&self, key: i64) -> Result<Option<i64>> {
        match self {
            Node::Leaf(leaf) => Ok(leaf.get(key)),
            Node::Internal(node) => node.get(key),
        }
    }

    pub(crate) fn print_node(
        &self,
        w: &mut dyn Write,
        first_prefix: &str,
        prefix: &str,
    ) -> std::io::Result<()> {
        match self {
            Node::Leaf(leaf) => leaf.print_node(w, first_prefix, prefix),
            Node::Internal(node) => node.print_node(w, first_prefix, prefix),
        }
    }
}

impl LeafNode {
    fn cell_pos(index: i64) -> usize {
        LEAF_HEADER_SIZE + index as usize * ENTRYSIZE
    }

    pub(crate) fn cell_at(&self, index: i64) -> Entry {
        let pos = Self::cell_pos(index);
        Entry::unmarshal(&self.page.read()[pos..pos + ENTRYSIZE])
    }

    pub(crate) fn key_at(&self, index: i64) -> i64 {
        self.cell_at(index).key
    }

    fn set_cell(&self, index: i64, entry: Entry) {
        let pos = Self::cell_pos(index);
        entry.marshal(&mut self.page.write()[pos..pos + ENTRYSIZE]);
    }

    fn set_num_keys(&mut self, n: i64) {
        self.num_keys = n;
        varint::put_i64(
            &mut self.page.write()[NUM_KEYS_OFFSET..NUM_KEYS_OFFSET + NUM_KEYS_SIZE],
            n,
        );
    }

    fn set_right_sibling(&mut self, pn: PageNum) {
        self.right_sibling = pn;
        varint::put_i64(
            &mut self.page.write()[RIGHT_SIBLING_OFFSET..RIGHT_SIBLING_OFFSET + RIGHT_SIBLING_SIZE],
            pn,
        );
    }

    /// The first index whose key is `>= key`; `num_keys` if none is.
    pub(crate) fn search(&self, key: i64) -> i64 {
        let mut low = 0;
        let mut high = self.num_keys;
        while low < high {
            let mid = low + (high - low) / 2;
            if self.key_at(mid) < key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low
    }

    fn insert(&mut self, key: i64, value: i64, update: bool) -> Result<Split> {
        let idx = self.search(key);
        let exists = idx < self.num_keys && self.key_at(idx) == key;

        if update {
            if !exists {
                return Err(Error::NotFound(key));
            }
            self.set_cell(idx, Entry::new(key, value));
            return Ok(Split::None);
        }
        if exists {
            return Err(Error::DuplicateKey(key));
        }

        for i in (idx..self.num_keys).rev() {
            let cell = self.cell_at(i);
            self.set_cell(i + 1, cell);
        }
        self.set_cell(idx, Entry::new(key, value));
        let n = self.num_keys + 1;
        self.set_num_keys(n);
        if self.num_keys > ENTRIES_PER_LEAF {
            return self.split();
        }
        Ok(Split::None)
    }

    /// Moves the upper half of this leaf into a fresh right sibling and
    /// promotes the sibling's first key.
    fn split(&mut self) -> Result<Split> {
        let mid = self.num_keys / 2;
        let mut new_node = create_leaf(self.page.pager())?;
        for i in mid..self.num_keys {
            let cell = self.cell_at(i);
            let n = new_node.num_keys;
            new_node.set_cell(n, cell);
            new_node.set_num_keys(n + 1);
        }
        self.set_num_keys(mid);
        new_node.set_right_sibling(self.right_sibling);
        self.set_right_sibling(new_node.page.pagenum());
        Ok(Split::Promote {
            key: new_node.key_at(0),
            left_pn: self.page.pagenum(),
            right_pn: new_node.page.pagenum(),
        })
    }

    fn delete(&mut self, key: i64) {
        let idx = self.search(key);
        if idx == self.num_keys || self.key_at(idx) != key {
            return;
        }
        for i in idx + 1..self.num_keys {
            let cell = self.cell_at(i);
            self.set_cell(i - 1, cell);
        }
        let n = self.num_keys - 1;
        self.set_num_keys(n);
    }

    fn get(&self, key: i64) -> Option<i64> {
        let idx = self.search(key);
        if idx >= self.num_keys || self.key_at(idx) != key {
            return None;
        }
        Some(self.cell_at(idx).value)
    }

    fn print_node(
        &self,
        w: &mut dyn Write,
        first_prefix: &str,
        prefix: &str,
    ) -> std::io::Result<()> {
        let root_tag = if self.page.pagenum() == ROOT_PN {
            " (root)"
        } else {
            ""
        };
        writeln!(
            w,
            "{}[{}] Leaf{} size: {}",
            first_prefix,
            self.page.pagenum(),
            root_tag,
            self.num_keys
        )?;
        for i in 0..self.num_keys {
            let entry = self.cell_at(i);
            writeln!(w, "{} |--> ({}, {})", prefix, entry.key, entry.value)?;
        }
        if self.right_sibling >= 0 {
            writeln!(w, "{} |--+", prefix)?;
            writeln!(w, "{}    | node @ {}", prefix, self.right_sibling)?;
            writeln!(w, "{}    v", prefix)?;
        }
        Ok(())
    }
}

impl InternalNode {
    fn key_pos(index: i64) -> usize {
        KEYS_OFFSET + index as usize * KEY_SIZE
    }

    fn pn_pos(index: i64) -> usize {
        PNS_OFFSET + index as usize * PN_SIZE
    }

    pub(crate) fn key_at(&self, index: i64) -> i64 {
        let pos = Self::key_pos(index);
        varint::get_i64(&self.page.read()[pos..pos + KEY_SIZE])
    }

    fn set_key_at(&self, index: i64, key: i64) {
        let pos = Self::key_pos(index);
        varint::put_i64(&mut self.page.write()[pos..pos + KEY_SIZE], key);
    }

    pub(crate) fn pn_at(&self, index: i64) -> PageNum {
        let pos = Self::pn_pos(index);
        varint::get_i64(&self.page.read()[pos..pos + PN_SIZE])
    }

    fn set_pn_at(&self, index: i64, pn: PageNum) {
        let pos = Self::pn_pos(index);
        varint::put_i64(&mut self.page.write()[pos..pos + PN_SIZE], pn);
    }

    fn set_num_keys(&mut self, n: i64) {
        self.num_keys = n;
        varint::put_i64(
            &mut self.page.write()[NUM_KEYS_OFFSET..NUM_KEYS_OFFSET + NUM_KEYS_SIZE],
            n,
        );
    }

    /// The index of the child to follow for `key`. Keys are right
    /// separators of their left subtree, so an equal key routes right.
    pub(crate) fn search(&self, key: i64) -> i64 {
        let mut low = 0;
        let mut high = self.num_keys;
        while low < high {
            let mid = low + (high - low) / 2;
            if self.key_at(mid) <= key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low
    }

    /// The slot where a promoted key belongs: first index with key `>= key`.
    fn promote_position(&self, key: i64) -> i64 {
        let mut low = 0;
        let mut high = self.num_keys;
        while low < high {
            let mid = low + (high - low) / 2;
            if self.key_at(mid) < key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low
    }

    fn insert(&mut self, key: i64, value: i64, update: bool) -> Result<Split> {
        let idx = self.search(key);
        let mut child = fetch_node(self.page.pager(), self.pn_at(idx))?;
        match child.insert(key, value, update)? {
            split @ Split::Promote { .. } => {
                drop(child);
                self.insert_split(split)
            }
            Split::None => Ok(Split::None),
        }
    }

    /// Folds a child split into this node, cascading upward when this node
    /// overflows in turn.
    fn insert_split(&mut self, split: Split) -> Result<Split> {
        let Split::Promote {
            key,
            left_pn,
            right_pn,
        } = split
        else {
            return Ok(Split::None);
        };
        let idx = self.promote_position(key);
        if idx < self.num_keys && self.key_at(idx) == key {
            // Degenerate re-promotion of an existing separator: only the
            // child pointers change.
            self.set_pn_at(idx, left_pn);
            self.set_pn_at(idx + 1, right_pn);
            return Ok(Split::None);
        }
        for i in (idx..self.num_keys).rev() {
            let k = self.key_at(i);
            let pn = self.pn_at(i + 1);
            self.set_key_at(i + 1, k);
            self.set_pn_at(i + 2, pn);
        }
        self.set_key_at(idx, key);
        self.set_pn_at(idx, left_pn);
        self.set_pn_at(idx + 1, right_pn);
        let n = self.num_keys + 1;
        self.set_num_keys(n);
        if self.num_keys > KEYS_PER_INTERNAL {
            return self.split();
        }
        Ok(Split::None)
    }

    /// Splits this node around the median key, which is promoted and
    /// retained in neither half.
    fn split(&mut self) -> Result<Split> {
        let mut new_node = create_internal(self.page.pager())?;
        let mid = (self.num_keys - 1) / 2;
        for i in mid + 1..self.num_keys {
            let n = new_node.num_keys;
            new_node.set_key_at(n, self.key_at(i));
            new_node.set_pn_at(n, self.pn_at(i));
            new_node.set_num_keys(n + 1);
        }
        new_node.set_pn_at(new_node.num_keys, self.pn_at(self.num_keys));
        let split_key = self.key_at(mid);
        self.set_num_keys(mid);
        Ok(Split::Promote {
            key: split_key,
            left_pn: self.page.pagenum(),
            right_pn: new_node.page.pagenum(),
        })
    }

    fn delete(&mut self, key: i64) -> Result<()> {
        let idx = self.search(key);
        let mut child = fetch_node(self.page.pager(), self.pn_at(idx))?;
        child.delete(key)
    }

    fn get(&self, key: i64) -> Result<Option<i64>> {
        let idx = self.search(key);
        let child = fetch_node(self.page.pager(), self.pn_at(idx))?;
        child.get(key)
    }

    fn print_node(
        &self,
        w: &mut dyn Write,
        first_prefix: &str,
        prefix: &str,
    ) -> std::io::Result<()> {
        let root_tag = if self.page.pagenum() == ROOT_PN {
            " (root)"
        } else {
            ""
        };
        writeln!(
            w,
            "{}[{}] Internal{} size: {}",
            first_prefix,
            self.page.pagenum(),
            root_tag,
            self.num_keys + 1
        )?;
        let next_first_prefix = format!("{} |--> ", prefix);
        let next_prefix = format!("{} |    ", prefix);
        for idx in 0..=self.num_keys {
            writeln!(w, "{}", next_prefix)?;
            match fetch_node(self.page.pager(), self.pn_at(idx)) {
                Ok(child) => child.print_node(w, &next_first_prefix, &next_prefix)?,
                Err(_) => return Ok(()),
            }
        }
        Ok(())
    }
}
