//! An extendible-hash index laid out on pages.
//!
//! The in-memory directory maps the low `global_depth` bits of a key's hash
//! to bucket page numbers; it is persisted through the `.meta` sidecar and
//! round-trips across close/open. Bucket splits raise the local depth and,
//! when it would pass the global depth, double the directory in place.

mod bucket;

pub use bucket::{HashBucket, BUCKETSIZE};

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Error, Result};
use crate::index::{Cursor, Entry, Index, IndexMeta};
use crate::pager::Pager;
use crate::PageNum;

const INITIAL_DEPTH: i64 = 2;

/// The directory index for `key` at the given depth: the low `depth` bits
/// of the key's 64-bit hash.
pub fn hasher(key: i64, depth: i64) -> i64 {
    let mask = (1u64 << depth) - 1;
    (xxh3_64(&key.to_le_bytes()) & mask) as i64
}

struct Directory {
    depth: i64,
    buckets: Vec<PageNum>,
}

impl Directory {
    /// Doubles the directory: the new upper half mirrors the lower half.
    fn extend(&mut self) {
        self.depth += 1;
        let mirror = self.buckets.clone();
        self.buckets.extend(mirror);
    }
}

pub struct HashIndex {
    name: String,
    path: PathBuf,
    pager: Arc<Pager>,
    dir: RwLock<Directory>,
}

impl HashIndex {
    /// Opens (or creates) a hash index stored at `path`, with its directory
    /// in the `<path>.meta` sidecar.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let pager = Arc::new(Pager::open(&path)?);

        let dir = if IndexMeta::exists_for(&path) {
            match IndexMeta::read_from(&path)? {
                IndexMeta::Hash {
                    global_depth,
                    directory,
                } => Directory {
                    depth: global_depth,
                    buckets: directory,
                },
                IndexMeta::BTree { .. } => {
                    return Err(Error::CorruptFile(format!(
                        "{} is a btree index, not a hash table",
                        path.display()
                    )))
                }
            }
        } else if pager.num_pages() == 0 {
            let mut buckets = Vec::with_capacity(1 << INITIAL_DEPTH);
            for _ in 0..1 << INITIAL_DEPTH {
                let bucket = HashBucket::create(&pager, INITIAL_DEPTH)?;
                buckets.push(bucket.page_num());
            }
            let dir = Directory {
                depth: INITIAL_DEPTH,
                buckets,
            };
            IndexMeta::Hash {
                global_depth: dir.depth,
                directory: dir.buckets.clone(),
            }
            .write_for(&path)?;
            dir
        } else {
            return Err(Error::CorruptFile(format!(
                "{} has pages but no meta file",
                path.display()
            )));
        };

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "table".to_string());
        Ok(Self {
            name,
            path,
            pager,
            dir: RwLock::new(dir),
        })
    }

    /// Current global depth.
    pub fn global_depth(&self) -> i64 {
        self.dir.read().unwrap().depth
    }

    /// A snapshot of the directory's bucket page numbers.
    pub fn directory(&self) -> Vec<PageNum> {
        self.dir.read().unwrap().buckets.clone()
    }

    /// Doubles the directory without splitting any bucket. The join
    /// operator uses this to equalize two tables' global depths.
    pub fn extend_directory(&self) {
        self.dir.write().unwrap().extend();
    }

    /// Pins the bucket stored at the given page number.
    pub fn get_bucket_by_pn(&self, pn: PageNum) -> Result<HashBucket> {
        HashBucket::fetch(&self.pager, pn)
    }

    /// Splits the given bucket, doubling the directory first when the local
    /// depth has caught up with the global depth, and recursing while either
    /// half remains overfull. The caller holds the directory exclusively.
    fn split(&self, dir: &mut Directory, mut bucket: HashBucket, hash: i64) -> Result<()> {
        let old_hash = hash % (1 << bucket.depth);
        let new_hash = old_hash + (1 << bucket.depth);
        if bucket.depth == dir.depth {
            dir.extend();
        }
        bucket.set_depth(bucket.depth + 1);
        let mut new_bucket = HashBucket::create(&self.pager, bucket.depth)?;

        // Redistribute: entries whose hash matches the new slot move over.
        let entries = bucket.select();
        let mut old_n = 0;
        let mut new_n = 0;
        for entry in entries {
            if hasher(entry.key, bucket.depth) == new_hash {
                new_bucket.set_cell(new_n, entry);
                new_n += 1;
            } else {
                bucket.set_cell(old_n, entry);
                old_n += 1;
            }
        }
        bucket.set_num_keys(old_n);
        new_bucket.set_num_keys(new_n);

        // Walk the directory by the new stride, repointing the mirrored
        // slots at the new bucket.
        let stride = 1i64 << bucket.depth;
        let mut slot = new_hash;
        while slot < (1i64 << dir.depth) {
            dir.buckets[slot as usize] = new_bucket.page_num();
            slot += stride;
        }

        if old_n >= BUCKETSIZE {
            return self.split(dir, bucket, old_hash);
        }
        if new_n >= BUCKETSIZE {
            return self.split(dir, new_bucket, new_hash);
        }
        Ok(())
    }

    /// Checks the extendible-hashing invariants: the directory has `2^d`
    /// slots, every bucket's local depth is at most the global depth, slots
    /// that share low `ld` bits point at the same bucket, and every resident
    /// key hashes to its bucket.
    pub fn verify_structure(&self) -> Result<bool> {
        let dir = self.dir.read().unwrap();
        if dir.buckets.len() != 1usize << dir.depth {
            return Ok(false);
        }
        for (slot, &pn) in dir.buckets.iter().enumerate() {
            let bucket = HashBucket::fetch(&self.pager, pn)?;
            let ld = bucket.local_depth();
            if ld > dir.depth {
                return Ok(false);
            }
            let canonical = slot as i64 % (1 << ld);
            if dir.buckets[canonical as usize] != pn {
                return Ok(false);
            }
            for entry in bucket.select() {
                if hasher(entry.key, ld) != canonical {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn write_meta(&self, dir: &Directory) -> Result<()> {
        IndexMeta::Hash {
            global_depth: dir.depth,
            directory: dir.buckets.clone(),
        }
        .write_for(&self.path)
    }
}

impl Index for HashIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    fn find(&self, key: i64) -> Result<Entry> {
        let dir = self.dir.read().unwrap();
        let slot = hasher(key, dir.depth);
        if slot < 0 || slot as usize >= dir.buckets.len() {
            return Err(Error::NotFound(key));
        }
        let bucket = HashBucket::fetch(&self.pager, dir.buckets[slot as usize])?;
        // Take the bucket's shared lock before releasing the directory so a
        // concurrent split cannot slip between the two.
        let data = bucket.page.read();
        drop(dir);
        let n = bucket::read_num_keys(&data[..]);
        for i in 0..n {
            let entry = bucket::read_cell(&data[..], i);
            if entry.key == key {
                return Ok(entry);
            }
        }
        Err(Error::NotFound(key))
    }

    fn insert(&self, key: i64, value: i64) -> Result<()> {
        let _permit = self.pager.begin_update();
        let mut dir = self.dir.write().unwrap();
        let slot = hasher(key, dir.depth);
        let mut bucket = HashBucket::fetch(&self.pager, dir.buckets[slot as usize])?;
        // A bucket that cannot overflow on this insert releases the
        // directory early.
        if bucket.num_keys < BUCKETSIZE - 1 {
            drop(dir);
            bucket.insert(key, value)?;
            return Ok(());
        }
        let overflow = bucket.insert(key, value)?;
        if overflow {
            self.split(&mut dir, bucket, slot)?;
        }
        Ok(())
    }

    fn update(&self, key: i64, value: i64) -> Result<()> {
        let _permit = self.pager.begin_update();
        let dir = self.dir.read().unwrap();
        let slot = hasher(key, dir.depth);
        let mut bucket = HashBucket::fetch(&self.pager, dir.buckets[slot as usize])?;
        drop(dir);
        bucket.update(key, value)
    }

    fn delete(&self, key: i64) -> Result<()> {
        let _permit = self.pager.begin_update();
        let dir = self.dir.read().unwrap();
        let slot = hasher(key, dir.depth);
        let mut bucket = HashBucket::fetch(&self.pager, dir.buckets[slot as usize])?;
        drop(dir);
        bucket.delete(key)
    }

    fn select(&self) -> Result<Vec<Entry>> {
        let _dir = self.dir.read().unwrap();
        let mut entries = Vec::new();
        for pn in 0..self.pager.num_pages() {
            let bucket = HashBucket::fetch(&self.pager, pn)?;
            entries.extend(bucket.select());
        }
        Ok(entries)
    }

    fn table_start(&self) -> Result<Box<dyn Cursor>> {
        let mut cursor = HashCursor {
            pager: Arc::clone(&self.pager),
            pn: 0,
            cell: 0,
            is_end: false,
        };
        cursor.settle()?;
        Ok(Box::new(cursor))
    }

    fn table_find(&self, key: i64) -> Result<Box<dyn Cursor>> {
        let dir = self.dir.read().unwrap();
        let slot = hasher(key, dir.depth);
        let pn = dir.buckets[slot as usize];
        drop(dir);
        let bucket = HashBucket::fetch(&self.pager, pn)?;
        let n = bucket.num_keys();
        let cell = bucket
            .select()
            .iter()
            .position(|e| e.key == key)
            .map(|i| i as i64)
            .unwrap_or(n);
        Ok(Box::new(HashCursor {
            pager: Arc::clone(&self.pager),
            pn,
            cell,
            is_end: cell >= n,
        }))
    }

    fn table_find_range(&self, start_key: i64, end_key: i64) -> Result<Vec<Entry>> {
        // Hash tables have no key order on disk; scan, filter and sort.
        let mut entries: Vec<Entry> = self
            .select()?
            .into_iter()
            .filter(|e| e.key >= start_key && e.key <= end_key)
            .collect();
        entries.sort();
        Ok(entries)
    }

    fn flush(&self) -> Result<()> {
        let dir = self.dir.read().unwrap();
        self.write_meta(&dir)?;
        self.pager.flush_all_pages()
    }

    fn close(&self) -> Result<()> {
        let dir = self.dir.read().unwrap();
        self.write_meta(&dir)?;
        self.pager.close()
    }

    fn print(&self, w: &mut dyn Write) -> Result<()> {
        let dir = self.dir.read().unwrap();
        writeln!(w, "====").map_err(Error::Io)?;
        writeln!(w, "global depth: {}", dir.depth).map_err(Error::Io)?;
        for (slot, &pn) in dir.buckets.iter().enumerate() {
            writeln!(w, "====").map_err(Error::Io)?;
            writeln!(w, "bucket {slot}").map_err(Error::Io)?;
            let bucket = HashBucket::fetch(&self.pager, pn)?;
            bucket.print(w).map_err(Error::Io)?;
        }
        writeln!(w, "====").map_err(Error::Io)?;
        Ok(())
    }
}

/// Iterates every bucket page in page order; each entry lives in exactly
/// one bucket, so the scan visits each entry once.
pub struct HashCursor {
    pager: Arc<Pager>,
    pn: PageNum,
    cell: i64,
    is_end: bool,
}

impl HashCursor {
    fn settle(&mut self) -> Result<()> {
        loop {
            if self.pn >= self.pager.num_pages() {
                self.is_end = true;
                return Ok(());
            }
            let bucket = HashBucket::fetch(&self.pager, self.pn)?;
            if self.cell < bucket.num_keys() {
                return Ok(());
            }
            self.pn += 1;
            self.cell = 0;
        }
    }
}

impl Cursor for HashCursor {
    fn is_end(&self) -> bool {
        self.is_end
    }

    fn step_forward(&mut self) -> Result<()> {
        if self.is_end {
            return Err(Error::EndOfScan);
        }
        self.cell += 1;
        self.settle()
    }

    fn entry(&self) -> Result<Entry> {
        if self.is_end {
            return Err(Error::EndOfScan);
        }
        let bucket = HashBucket::fetch(&self.pager, self.pn)?;
        Ok(bucket.select()[self.cell as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_index(dir: &tempfile::TempDir, name: &str) -> HashIndex {
        HashIndex::open(dir.path().join(name)).unwrap()
    }

    #[test]
    fn inserts_and_finds_across_buckets() {
        let dir = tempdir().unwrap();
        let index = open_index(&dir, "h");
        for key in 0..500 {
            index.insert(key, key * 2).unwrap();
        }
        for key in 0..500 {
            assert_eq!(index.find(key).unwrap().value, key * 2);
        }
        assert!(matches!(index.find(1 << 40), Err(Error::NotFound(_))));
        assert_eq!(index.select().unwrap().len(), 500);
    }

    #[test]
    fn update_and_delete_work_in_place() {
        let dir = tempdir().unwrap();
        let index = open_index(&dir, "h");
        index.insert(1, 10).unwrap();
        index.update(1, 11).unwrap();
        assert_eq!(index.find(1).unwrap().value, 11);
        assert!(matches!(index.update(2, 20), Err(Error::NotFound(2))));
        index.delete(1).unwrap();
        assert!(matches!(index.find(1), Err(Error::NotFound(1))));
        assert!(matches!(index.delete(1), Err(Error::NotFound(1))));
    }

    #[test]
    fn overflow_of_a_max_depth_bucket_doubles_the_directory() {
        let dir = tempdir().unwrap();
        let index = open_index(&dir, "h");
        assert_eq!(index.global_depth(), INITIAL_DEPTH);

        // Keys that all land in directory slot 0b11 at depth 2.
        let mut colliders = Vec::new();
        let mut candidate = 0i64;
        while (colliders.len() as i64) <= BUCKETSIZE {
            if hasher(candidate, INITIAL_DEPTH) == 0b11 {
                colliders.push(candidate);
            }
            candidate += 1;
        }
        for (i, &key) in colliders.iter().enumerate() {
            index.insert(key, i as i64).unwrap();
        }

        assert_eq!(index.global_depth(), 3);
        let directory = index.directory();
        assert_eq!(directory.len(), 8);
        // The split bucket's halves are reachable from exactly the slots
        // whose low three bits are 0b011 and 0b111 respectively.
        assert_ne!(directory[0b011], directory[0b111]);
        for key in &colliders {
            assert!(index.find(*key).is_ok());
        }
        assert!(index.verify_structure().unwrap());
    }

    #[test]
    fn directory_slots_share_buckets_by_local_depth() {
        let dir = tempdir().unwrap();
        let index = open_index(&dir, "h");
        for key in 0..2000 {
            index.insert(key, key).unwrap();
        }
        assert!(index.verify_structure().unwrap());

        let directory = index.directory();
        for (slot, &pn) in directory.iter().enumerate() {
            let ld = index.get_bucket_by_pn(pn).unwrap().local_depth();
            let canonical = slot as i64 % (1 << ld);
            assert_eq!(directory[canonical as usize], pn);
        }
        assert_eq!(index.select().unwrap().len(), 2000);
    }

    #[test]
    fn directory_round_trips_through_the_meta_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("h");
        let (depth, directory) = {
            let index = HashIndex::open(&path).unwrap();
            for key in 0..1500 {
                index.insert(key, -key).unwrap();
            }
            let snapshot = (index.global_depth(), index.directory());
            index.close().unwrap();
            snapshot
        };
        let index = HashIndex::open(&path).unwrap();
        assert_eq!(index.global_depth(), depth);
        assert_eq!(index.directory(), directory);
        for key in (0..1500).step_by(97) {
            assert_eq!(index.find(key).unwrap().value, -key);
        }
    }
}
