//! The Grace hash join.
//!
//! Both inputs are first partitioned into temporary on-disk hash tables
//! (hashing by key, or by value with the fields flipped so the hashed field
//! occupies the key slot). The directories are then extended to the same
//! global depth, and matching bucket pairs are probed concurrently on a
//! scoped task group. Matches stream through a bounded channel; producers
//! abandon their sends as soon as the join is cancelled.

mod bloom;

pub use bloom::{BloomFilter, DEFAULT_FILTER_SIZE};

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use granite::hash::{HashBucket, HashIndex};
use granite::{Entry, Index, IndexMeta};

use crate::database::Database;
use crate::errors::{DbError, Result};

/// Result channel capacity.
const RESULTS_CAPACITY: usize = 1024;

/// One matched pair emitted by a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryPair {
    pub left: Entry,
    pub right: Entry,
}

/// Cooperative cancellation shared between a join and its parent. A child
/// token observes its parent's cancellation as well as its own.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flags: Vec<Arc<AtomicBool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flags: vec![Arc::new(AtomicBool::new(false))],
        }
    }

    /// A token linked to this one: cancelling the parent cancels the child,
    /// not the other way around.
    pub fn child(&self) -> Self {
        let mut flags = self.flags.clone();
        flags.push(Arc::new(AtomicBool::new(false)));
        Self { flags }
    }

    pub fn cancel(&self) {
        if let Some(own) = self.flags.last() {
            own.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flags.iter().any(|f| f.load(Ordering::SeqCst))
    }
}

/// A running join: the stream of matches, a cancellation handle, and the
/// cleanup of the two temporary databases.
pub struct JoinHandle {
    results: Receiver<EntryPair>,
    cancel: CancelToken,
    worker: Option<thread::JoinHandle<Result<()>>>,
    temp_paths: [PathBuf; 2],
}

impl JoinHandle {
    /// The bounded stream of matched pairs. Iterating it to disconnection
    /// drains the join.
    pub fn results(&self) -> &Receiver<EntryPair> {
        &self.results
    }

    /// Abandons the join; producers stop at their next send.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for every probe task and deletes the temporary databases.
    /// Returns the first error any task hit.
    pub fn wait(mut self) -> Result<()> {
        let result = match self.worker.take() {
            Some(worker) => worker.join().unwrap_or(Err(DbError::Cancelled)),
            None => Ok(()),
        };
        self.cleanup();
        result
    }

    fn cleanup(&self) {
        for path in &self.temp_paths {
            let _ = std::fs::remove_file(path);
            let _ = std::fs::remove_file(IndexMeta::meta_path(path));
        }
    }
}

impl Drop for JoinHandle {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.cancel.cancel();
            let _ = worker.join();
        }
        self.cleanup();
    }
}

fn flip(entry: Entry) -> Entry {
    Entry::new(entry.value, entry.key)
}

/// Streams every entry of `source` into a fresh temporary hash table. When
/// `use_key` is false the entry is flipped so the join field lands in the
/// key slot.
fn build_hash_index(
    db: &Database,
    source: &Arc<dyn Index>,
    use_key: bool,
) -> Result<(HashIndex, PathBuf)> {
    let path = db.temp_table_path();
    let temp = HashIndex::open(&path)?;
    let mut cursor = source.table_start()?;
    while !cursor.is_end() {
        let entry = cursor.entry()?;
        if use_key {
            temp.insert(entry.key, entry.value)?;
        } else {
            temp.insert(entry.value, entry.key)?;
        }
        cursor.step_forward()?;
    }
    Ok((temp, path))
}

/// Attempts one send, giving up when the join is cancelled or the consumer
/// has gone away.
fn send_result(
    cancel: &CancelToken,
    results: &Sender<EntryPair>,
    pair: EntryPair,
) -> Result<()> {
    let mut pending = pair;
    loop {
        if cancel.is_cancelled() {
            return Err(DbError::Cancelled);
        }
        match results.send_timeout(pending, Duration::from_millis(20)) {
            Ok(()) => return Ok(()),
            Err(SendTimeoutError::Timeout(p)) => pending = p,
            Err(SendTimeoutError::Disconnected(_)) => return Err(DbError::Cancelled),
        }
    }
}

/// Emits every match between one pair of buckets: a Bloom filter built from
/// the right bucket's keys screens the left bucket's entries before the
/// real lookups. Flipped sides are un-flipped on emission.
fn probe_buckets(
    cancel: &CancelToken,
    results: &Sender<EntryPair>,
    l_bucket: &HashBucket,
    r_bucket: &HashBucket,
    join_on_left_key: bool,
    join_on_right_key: bool,
) -> Result<()> {
    let l_entries = l_bucket.select();
    let r_entries = r_bucket.select();
    let mut filter = BloomFilter::new(DEFAULT_FILTER_SIZE);
    for re in &r_entries {
        filter.insert(re.key);
    }
    for le in &l_entries {
        if !filter.contains(le.key) {
            continue;
        }
        // Every right entry with the same join field is a match; the join
        // is a set equality with the nested-loop result.
        for re in r_entries.iter().filter(|re| re.key == le.key) {
            let left = if join_on_left_key { *le } else { flip(*le) };
            let right = if join_on_right_key { *re } else { flip(*re) };
            send_result(cancel, results, EntryPair { left, right })?;
        }
    }
    Ok(())
}

/// Joins `left` and `right` with a Grace hash join, matching on the key or
/// value of each side as requested. Returns a handle carrying the bounded
/// result stream; the caller drains it and then calls
/// [`JoinHandle::wait`].
pub fn grace_hash_join(
    db: &Database,
    left: &Arc<dyn Index>,
    right: &Arc<dyn Index>,
    join_on_left_key: bool,
    join_on_right_key: bool,
    parent: &CancelToken,
) -> Result<JoinHandle> {
    let (left_temp, left_path) = build_hash_index(db, left, join_on_left_key)?;
    let (right_temp, right_path) = match build_hash_index(db, right, join_on_right_key) {
        Ok(built) => built,
        Err(e) => {
            let _ = std::fs::remove_file(&left_path);
            let _ = std::fs::remove_file(IndexMeta::meta_path(&left_path));
            return Err(e);
        }
    };

    // Equalize the directories so bucket i on one side pairs with bucket i
    // on the other.
    while left_temp.global_depth() != right_temp.global_depth() {
        if left_temp.global_depth() < right_temp.global_depth() {
            left_temp.extend_directory();
        } else {
            right_temp.extend_directory();
        }
    }

    let cancel = parent.child();
    let (sender, receiver) = bounded(RESULTS_CAPACITY);
    let token = cancel.clone();
    let worker = thread::spawn(move || -> Result<()> {
        let l_directory = left_temp.directory();
        let r_directory = right_temp.directory();
        let first_err: Mutex<Option<DbError>> = Mutex::new(None);

        thread::scope(|scope| {
            // Directory slots that share buckets on both sides would probe
            // the same pair twice; skip the repeats.
            let mut seen = HashSet::new();
            for (i, &l_pn) in l_directory.iter().enumerate() {
                let r_pn = r_directory[i];
                if !seen.insert((l_pn, r_pn)) {
                    continue;
                }
                let buckets = left_temp
                    .get_bucket_by_pn(l_pn)
                    .and_then(|lb| right_temp.get_bucket_by_pn(r_pn).map(|rb| (lb, rb)));
                let (l_bucket, r_bucket) = match buckets {
                    Ok(pair) => pair,
                    Err(e) => {
                        let mut slot = first_err.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(e.into());
                        }
                        token.cancel();
                        break;
                    }
                };
                let task_token = token.clone();
                let task_sender = sender.clone();
                let err_slot = &first_err;
                scope.spawn(move || {
                    let outcome = probe_buckets(
                        &task_token,
                        &task_sender,
                        &l_bucket,
                        &r_bucket,
                        join_on_left_key,
                        join_on_right_key,
                    );
                    if let Err(e) = outcome {
                        let mut slot = err_slot.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                        task_token.cancel();
                    }
                });
            }
        });

        drop(sender);
        left_temp.close()?;
        right_temp.close()?;
        match first_err.into_inner().unwrap() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    });

    Ok(JoinHandle {
        results: receiver,
        cancel,
        worker: Some(worker),
        temp_paths: [left_path, right_path],
    })
}

/// The quadratic oracle: every pair whose join fields match, by scanning
/// the full cross product. Used to cross-check the hash join.
pub fn nested_loop_join(
    left: &Arc<dyn Index>,
    right: &Arc<dyn Index>,
    join_on_left_key: bool,
    join_on_right_key: bool,
) -> Result<Vec<EntryPair>> {
    let l_entries = left.select()?;
    let r_entries = right.select()?;
    let mut pairs = Vec::new();
    for le in &l_entries {
        let l_field = if join_on_left_key { le.key } else { le.value };
        for re in &r_entries {
            let r_field = if join_on_right_key { re.key } else { re.value };
            if l_field == r_field {
                pairs.push(EntryPair {
                    left: *le,
                    right: *re,
                });
            }
        }
    }
    Ok(pairs)
}
