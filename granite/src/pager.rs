//! The pager: a fixed pool of in-memory frames caching pages of a database
//! file, with pin counts and a free/unpinned/pinned list discipline.
//!
//! A single mutex guards the page table, the three frame lists and all
//! pin/dirty metadata. Page payloads sit behind per-frame reader/writer
//! locks that the index layers take while reading or mutating page bytes.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};
use crate::{PageNum, NOPAGE, PAGESIZE};

/// Default number of frames in the buffer pool.
pub const DEFAULT_POOL_SIZE: usize = 256;

type PageBuf = Box<[u8; PAGESIZE]>;

#[derive(Debug, Clone, Copy)]
struct FrameMeta {
    pagenum: PageNum,
    pin_count: u32,
    dirty: bool,
}

impl FrameMeta {
    fn vacant() -> Self {
        Self {
            pagenum: NOPAGE,
            pin_count: 0,
            dirty: false,
        }
    }
}

struct PagerState {
    n_pages: i64,
    frames: Vec<FrameMeta>,
    free: VecDeque<usize>,
    unpinned: VecDeque<usize>,
    pinned: Vec<usize>,
    page_table: HashMap<PageNum, usize>,
}

/// Pagers manage pages of data read from a file.
pub struct Pager {
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
    /// Page payloads, one slot per frame. Indexed in lockstep with
    /// `PagerState::frames`.
    data: Vec<RwLock<PageBuf>>,
    state: Mutex<PagerState>,
    /// Checkpointing takes the exclusive side to freeze index mutations;
    /// every mutating index operation holds the shared side.
    update_lock: RwLock<()>,
}

/// A pinned page. The pin is released when the guard is dropped; matching
/// every `get_page` with exactly one drop is the caller's contract.
pub struct Page {
    pager: Arc<Pager>,
    frame: usize,
    pagenum: PageNum,
}

impl Page {
    pub fn pagenum(&self) -> PageNum {
        self.pagenum
    }

    pub fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    /// Shared access to the page bytes.
    pub fn read(&self) -> RwLockReadGuard<'_, PageBuf> {
        self.pager.data[self.frame].read().unwrap()
    }

    /// Exclusive access to the page bytes; marks the page dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, PageBuf> {
        self.pager.mark_dirty(self.frame);
        self.pager.data[self.frame].write().unwrap()
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        self.pager.unpin(self.frame, self.pagenum);
    }
}

/// Exclusive hold on the update barrier, returned by
/// [`Pager::lock_all_updates`]. Dropping it unlocks updates again.
pub struct UpdateFreeze<'a>(#[allow(dead_code)] RwLockWriteGuard<'a, ()>);

/// Shared hold on the update barrier, taken by index mutations.
pub struct UpdatePermit<'a>(#[allow(dead_code)] RwLockReadGuard<'a, ()>);

impl Pager {
    /// Constructs a pager with no backing file, for scratch use.
    pub fn in_memory(pool_size: usize) -> Self {
        Self::build(None, None, 0, pool_size)
    }

    /// Opens (or creates) the database file at `path`, creating parent
    /// directories as needed. Fails with [`Error::CorruptFile`] if the file
    /// length is not a multiple of the page size.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_pool(path, DEFAULT_POOL_SIZE)
    }

    pub fn open_with_pool<P: AsRef<Path>>(path: P, pool_size: usize) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        if len % PAGESIZE as u64 != 0 {
            return Err(Error::CorruptFile(format!(
                "{} has length {len}, not a multiple of the page size",
                path.display()
            )));
        }
        let n_pages = (len / PAGESIZE as u64) as i64;
        tracing::debug!(path = %path.display(), n_pages, "opened database file");
        Ok(Self::build(
            Some(path.to_path_buf()),
            Some(file),
            n_pages,
            pool_size,
        ))
    }

    fn build(path: Option<PathBuf>, file: Option<File>, n_pages: i64, pool_size: usize) -> Self {
        let mut data = Vec::with_capacity(pool_size);
        let mut frames = Vec::with_capacity(pool_size);
        let mut free = VecDeque::with_capacity(pool_size);
        for i in 0..pool_size {
            data.push(RwLock::new(Box::new([0u8; PAGESIZE])));
            frames.push(FrameMeta::vacant());
            free.push_back(i);
        }
        Self {
            path,
            file: Mutex::new(file),
            data,
            state: Mutex::new(PagerState {
                n_pages,
                frames,
                free,
                unpinned: VecDeque::new(),
                pinned: Vec::new(),
                page_table: HashMap::new(),
            }),
            update_lock: RwLock::new(()),
        }
    }

    /// Whether the pager is backed by a file on disk.
    pub fn has_file(&self) -> bool {
        self.file.lock().unwrap().is_some()
    }

    /// The path of the backing file, if any.
    pub fn file_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The number of pages used by this database.
    pub fn num_pages(&self) -> i64 {
        self.state.lock().unwrap().n_pages
    }

    /// The next unallocated page number. Turning it into a resident page is
    /// the caller's job, via [`Pager::get_page`].
    pub fn get_free_pn(&self) -> PageNum {
        self.state.lock().unwrap().n_pages
    }

    /// Returns a pinned page for `pagenum`, reading it from disk only on a
    /// cache miss. Requesting `pagenum == num_pages` allocates the page.
    pub fn get_page(self: &Arc<Self>, pagenum: PageNum) -> Result<Page> {
        let mut state = self.state.lock().unwrap();
        if pagenum < 0 || pagenum > state.n_pages {
            return Err(Error::InvalidPageNumber(pagenum));
        }

        if let Some(&frame) = state.page_table.get(&pagenum) {
            if state.frames[frame].pin_count == 0 {
                state.frames[frame].pin_count = 1;
                state.unpinned.retain(|&f| f != frame);
                state.pinned.push(frame);
            } else {
                state.frames[frame].pin_count += 1;
            }
            return Ok(Page {
                pager: Arc::clone(self),
                frame,
                pagenum,
            });
        }

        let frame = self.take_victim(&mut state)?;
        if let Err(e) = self.load_frame(&state, frame, pagenum) {
            // The frame was already detached from every list; park it on the
            // free list so it is not leaked.
            state.frames[frame] = FrameMeta::vacant();
            state.free.push_front(frame);
            return Err(e);
        }
        if pagenum == state.n_pages {
            state.n_pages += 1;
        }
        state.frames[frame] = FrameMeta {
            pagenum,
            pin_count: 1,
            dirty: false,
        };
        state.pinned.push(frame);
        state.page_table.insert(pagenum, frame);
        Ok(Page {
            pager: Arc::clone(self),
            frame,
            pagenum,
        })
    }

    /// Picks a frame for reuse: free-list head first, then the head of the
    /// unpinned list, flushing it if dirty. The chosen frame is removed from
    /// its list and from the page table.
    fn take_victim(&self, state: &mut PagerState) -> Result<usize> {
        if let Some(frame) = state.free.pop_front() {
            return Ok(frame);
        }
        let Some(frame) = state.unpinned.pop_front() else {
            return Err(Error::NoFreePage);
        };
        let meta = state.frames[frame];
        if meta.dirty {
            if let Err(e) = self.write_frame(frame, meta.pagenum) {
                state.unpinned.push_front(frame);
                return Err(e);
            }
            state.frames[frame].dirty = false;
        }
        state.page_table.remove(&meta.pagenum);
        Ok(frame)
    }

    /// Zeroes the frame and fills it from disk when the page exists there.
    /// Reads past end-of-file leave the buffer zeroed.
    fn load_frame(&self, state: &PagerState, frame: usize, pagenum: PageNum) -> Result<()> {
        let mut buf = self.data[frame].write().unwrap();
        buf.fill(0);
        if pagenum >= state.n_pages {
            return Ok(());
        }
        let file_guard = self.file.lock().unwrap();
        let Some(file) = file_guard.as_ref() else {
            return Ok(());
        };
        let mut offset = pagenum as u64 * PAGESIZE as u64;
        let mut filled = 0;
        while filled < PAGESIZE {
            let n = file.read_at(&mut buf[filled..], offset)?;
            if n == 0 {
                break;
            }
            filled += n;
            offset += n as u64;
        }
        Ok(())
    }

    fn write_frame(&self, frame: usize, pagenum: PageNum) -> Result<()> {
        let file_guard = self.file.lock().unwrap();
        let Some(file) = file_guard.as_ref() else {
            return Ok(());
        };
        let buf = self.data[frame].read().unwrap();
        file.write_all_at(&buf[..], pagenum as u64 * PAGESIZE as u64)?;
        Ok(())
    }

    fn mark_dirty(&self, frame: usize) {
        self.state.lock().unwrap().frames[frame].dirty = true;
    }

    fn unpin(&self, frame: usize, pagenum: PageNum) {
        let mut state = self.state.lock().unwrap();
        if state.frames[frame].pagenum != pagenum {
            return;
        }
        if state.frames[frame].pin_count == 0 {
            return;
        }
        state.frames[frame].pin_count -= 1;
        if state.frames[frame].pin_count == 0 {
            state.pinned.retain(|&f| f != frame);
            state.unpinned.push_back(frame);
        }
    }

    /// Flushes the given page to disk if it is dirty. The caller must not be
    /// holding the page's write guard.
    pub fn flush_page(&self, page: &Page) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.flush_frame_locked(&mut state, page.frame)
    }

    /// Flushes every dirty resident page.
    pub fn flush_all_pages(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let resident: Vec<usize> = state.page_table.values().copied().collect();
        for frame in resident {
            self.flush_frame_locked(&mut state, frame)?;
        }
        Ok(())
    }

    fn flush_frame_locked(&self, state: &mut PagerState, frame: usize) -> Result<()> {
        let meta = state.frames[frame];
        if !meta.dirty || meta.pagenum == NOPAGE {
            return Ok(());
        }
        self.write_frame(frame, meta.pagenum)?;
        state.frames[frame].dirty = false;
        Ok(())
    }

    /// Freezes all index mutations until the returned guard is dropped.
    /// Used by checkpointing while it snapshots the database directory.
    pub fn lock_all_updates(&self) -> UpdateFreeze<'_> {
        UpdateFreeze(self.update_lock.write().unwrap())
    }

    /// Shared side of the update barrier; held across a single index
    /// mutation.
    pub fn begin_update(&self) -> UpdatePermit<'_> {
        UpdatePermit(self.update_lock.read().unwrap())
    }

    /// Flushes all dirty pages and releases the backing file. Pages still
    /// pinned at close are a caller bug and are logged, not fatal.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.pinned.is_empty() {
            tracing::warn!(
                pinned = state.pinned.len(),
                "pages are still pinned on close"
            );
        }
        let resident: Vec<usize> = state.page_table.values().copied().collect();
        for frame in resident {
            self.flush_frame_locked(&mut state, frame)?;
        }
        *self.file.lock().unwrap() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn persists_page_contents_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let pager = Arc::new(Pager::open(&path).unwrap());
        let pn = pager.get_free_pn();
        assert_eq!(pn, 0);
        {
            let page = pager.get_page(pn).unwrap();
            page.write()[0] = 123;
        }
        pager.close().unwrap();

        let pager = Arc::new(Pager::open(&path).unwrap());
        assert_eq!(pager.num_pages(), 1);
        let page = pager.get_page(pn).unwrap();
        assert_eq!(page.read()[0], 123);
    }

    #[test]
    fn rejects_file_with_partial_page() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("torn.db");
        std::fs::write(&path, vec![0u8; PAGESIZE + 7]).unwrap();
        assert!(matches!(Pager::open(&path), Err(Error::CorruptFile(_))));
    }

    #[test]
    fn allocating_beyond_the_pool_fails_when_all_pages_are_pinned() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("small.db");
        let pager = Arc::new(Pager::open_with_pool(&path, 2).unwrap());

        let _a = pager.get_page(0).unwrap();
        let _b = pager.get_page(1).unwrap();
        assert!(matches!(pager.get_page(2), Err(Error::NoFreePage)));
    }

    #[test]
    fn evicts_dirty_unpinned_pages_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("evict.db");
        let pager = Arc::new(Pager::open_with_pool(&path, 1).unwrap());

        {
            let page = pager.get_page(0).unwrap();
            page.write()[10] = 42;
        }
        // The single frame is reused for page 1, which forces a flush of
        // page 0 first.
        {
            let page = pager.get_page(1).unwrap();
            page.write()[10] = 43;
        }
        let page = pager.get_page(0).unwrap();
        assert_eq!(page.read()[10], 42);
    }

    #[test]
    fn pin_counts_balance_and_reads_do_not_grow_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pins.db");
        let pager = Arc::new(Pager::open(&path).unwrap());

        let first = pager.get_page(0).unwrap();
        let second = pager.get_page(0).unwrap();
        drop(first);
        drop(second);
        // One allocation happened; re-reads of page 0 must not bump n_pages.
        let _again = pager.get_page(0).unwrap();
        assert_eq!(pager.num_pages(), 1);
    }

    #[test]
    fn invalid_page_numbers_are_rejected() {
        let pager = Arc::new(Pager::in_memory(4));
        assert!(matches!(
            pager.get_page(-1),
            Err(Error::InvalidPageNumber(-1))
        ));
        assert!(matches!(
            pager.get_page(5),
            Err(Error::InvalidPageNumber(5))
        ));
    }
}
