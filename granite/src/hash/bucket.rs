//! Bucket pages for the extendible-hash index.
//!
//! A bucket page is `[local-depth varint | key-count varint | cells…]` with
//! cells at the shared [`ENTRYSIZE`] stride. Each bucket operation runs as a
//! single critical section over the bucket page's reader/writer lock, so
//! concurrent callers see whole operations only.

use std::io::Write;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::index::{Entry, ENTRYSIZE};
use crate::pager::{Page, Pager};
use crate::varint::{self, MAX_VARINT_LEN};
use crate::{PageNum, PAGESIZE};

const DEPTH_OFFSET: usize = 0;
const DEPTH_SIZE: usize = MAX_VARINT_LEN;
const NUM_KEYS_OFFSET: usize = DEPTH_OFFSET + DEPTH_SIZE;
const NUM_KEYS_SIZE: usize = MAX_VARINT_LEN;
const BUCKET_HEADER_SIZE: usize = DEPTH_SIZE + NUM_KEYS_SIZE;

/// Bucket capacity, with one slot of slack for the overflowing cell that
/// triggers a split.
pub const BUCKETSIZE: i64 = ((PAGESIZE - BUCKET_HEADER_SIZE) / ENTRYSIZE - 1) as i64;

fn cell_pos(index: i64) -> usize {
    BUCKET_HEADER_SIZE + index as usize * ENTRYSIZE
}

pub(crate) fn read_num_keys(data: &[u8]) -> i64 {
    varint::get_i64(&data[NUM_KEYS_OFFSET..NUM_KEYS_OFFSET + NUM_KEYS_SIZE])
}

fn write_num_keys(data: &mut [u8], n: i64) {
    varint::put_i64(&mut data[NUM_KEYS_OFFSET..NUM_KEYS_OFFSET + NUM_KEYS_SIZE], n);
}

pub(crate) fn read_cell(data: &[u8], index: i64) -> Entry {
    let pos = cell_pos(index);
    Entry::unmarshal(&data[pos..pos + ENTRYSIZE])
}

fn write_cell(data: &mut [u8], index: i64, entry: Entry) {
    let pos = cell_pos(index);
    entry.marshal(&mut data[pos..pos + ENTRYSIZE]);
}

pub struct HashBucket {
    pub(crate) page: Page,
    pub(crate) depth: i64,
    pub(crate) num_keys: i64,
}

impl HashBucket {
    /// Allocates a fresh, empty bucket with the given local depth.
    pub(crate) fn create(pager: &Arc<Pager>, depth: i64) -> Result<Self> {
        let page = pager.get_page(pager.get_free_pn())?;
        {
            let mut data = page.write();
            data.fill(0);
            varint::put_i64(&mut data[DEPTH_OFFSET..DEPTH_OFFSET + DEPTH_SIZE], depth);
        }
        Ok(Self {
            page,
            depth,
            num_keys: 0,
        })
    }

    /// Pins the bucket stored at `pn`.
    pub fn fetch(pager: &Arc<Pager>, pn: PageNum) -> Result<Self> {
        let page = pager.get_page(pn)?;
        let (depth, num_keys) = {
            let data = page.read();
            (
                varint::get_i64(&data[DEPTH_OFFSET..DEPTH_OFFSET + DEPTH_SIZE]),
                read_num_keys(&data[..]),
            )
        };
        Ok(Self {
            page,
            depth,
            num_keys,
        })
    }

    pub fn page_num(&self) -> PageNum {
        self.page.pagenum()
    }

    pub fn local_depth(&self) -> i64 {
        self.depth
    }

    pub fn num_keys(&self) -> i64 {
        self.num_keys
    }

    pub(crate) fn set_depth(&mut self, depth: i64) {
        self.depth = depth;
        let mut data = self.page.write();
        varint::put_i64(&mut data[DEPTH_OFFSET..DEPTH_OFFSET + DEPTH_SIZE], depth);
    }

    /// Linear scan for `key`.
    pub fn find(&self, key: i64) -> Option<Entry> {
        let data = self.page.read();
        let n = read_num_keys(&data[..]);
        for i in 0..n {
            let entry = read_cell(&data[..], i);
            if entry.key == key {
                return Some(entry);
            }
        }
        None
    }

    /// Appends the pair and reports whether the bucket has overflowed.
    pub(crate) fn insert(&mut self, key: i64, value: i64) -> Result<bool> {
        let mut data = self.page.write();
        let n = read_num_keys(&data[..]);
        write_cell(&mut data[..], n, Entry::new(key, value));
        write_num_keys(&mut data[..], n + 1);
        self.num_keys = n + 1;
        Ok(self.num_keys > BUCKETSIZE)
    }

    /// Overwrites the value for an existing key; never splits.
    pub(crate) fn update(&mut self, key: i64, value: i64) -> Result<()> {
        let mut data = self.page.write();
        let n = read_num_keys(&data[..]);
        for i in 0..n {
            if read_cell(&data[..], i).key == key {
                write_cell(&mut data[..], i, Entry::new(key, value));
                return Ok(());
            }
        }
        Err(Error::NotFound(key))
    }

    /// Removes the key and compacts the cells; buckets never coalesce.
    pub(crate) fn delete(&mut self, key: i64) -> Result<()> {
        let mut data = self.page.write();
        let n = read_num_keys(&data[..]);
        for i in 0..n {
            if read_cell(&data[..], i).key == key {
                for j in i + 1..n {
                    let cell = read_cell(&data[..], j);
                    write_cell(&mut data[..], j - 1, cell);
                }
                write_num_keys(&mut data[..], n - 1);
                self.num_keys = n - 1;
                return Ok(());
            }
        }
        Err(Error::NotFound(key))
    }

    /// All entries currently in the bucket.
    pub fn select(&self) -> Vec<Entry> {
        let data = self.page.read();
        let n = read_num_keys(&data[..]);
        (0..n).map(|i| read_cell(&data[..], i)).collect()
    }

    /// Overwrites the cell at `index` without touching the key count. Used
    /// by splits while redistributing under the directory's exclusive lock.
    pub(crate) fn set_cell(&self, index: i64, entry: Entry) {
        let mut data = self.page.write();
        write_cell(&mut data[..], index, entry);
    }

    pub(crate) fn set_num_keys(&mut self, n: i64) {
        let mut data = self.page.write();
        write_num_keys(&mut data[..], n);
        self.num_keys = n;
    }

    /// Pretty-prints the bucket contents.
    pub fn print(&self, w: &mut dyn Write) -> std::io::Result<()> {
        writeln!(w, "bucket depth: {}", self.depth)?;
        write!(w, "entries:")?;
        for entry in self.select() {
            write!(w, " ({}, {})", entry.key, entry.value)?;
        }
        writeln!(w)
    }
}
