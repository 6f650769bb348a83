//! Transaction bookkeeping and entry-level locking.
//!
//! The lock manager keeps a FIFO request queue per resource and a waits-for
//! graph for deadlock detection; the transaction manager tracks which
//! transactions are running and which resources each one holds, releasing
//! everything at commit (strict two-phase locking).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Condvar, Mutex};

use uuid::Uuid;

use crate::errors::{DbError, Result};

pub type TransactionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// A lockable entry: one key in one table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Resource {
    pub table: String,
    pub key: i64,
}

#[derive(Debug, Clone)]
struct LockRequest {
    tx_id: TransactionId,
    mode: LockMode,
    granted: bool,
}

#[derive(Debug, Default)]
struct LockRequestQueue {
    requests: VecDeque<LockRequest>,
    shared_granted: usize,
    exclusive_granted: bool,
}

#[derive(Debug)]
pub enum LockError {
    Deadlock,
}

/// The lock manager. Requests are granted in FIFO order; an incompatible
/// request blocks itself and everything queued behind it.
#[derive(Debug, Default)]
pub struct LockManager {
    lock_table: Mutex<HashMap<Resource, LockRequestQueue>>,
    cvar: Condvar,
    /// Maps a waiting transaction to the transactions it waits for.
    waits_for: Mutex<HashMap<TransactionId, HashSet<TransactionId>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(
        &self,
        tx_id: TransactionId,
        resource: Resource,
        mode: LockMode,
    ) -> std::result::Result<(), LockError> {
        let mut lock_table = self.lock_table.lock().unwrap();
        let queue = lock_table.entry(resource.clone()).or_default();
        queue.requests.push_back(LockRequest {
            tx_id,
            mode,
            granted: false,
        });

        loop {
            Self::try_grant_locks(&resource, &mut lock_table);

            let granted = lock_table
                .get(&resource)
                .and_then(|q| q.requests.iter().find(|r| r.tx_id == tx_id))
                .is_some_and(|r| r.granted);
            if granted {
                self.remove_from_waits_for(tx_id);
                return Ok(());
            }

            self.update_waits_for_graph(tx_id, &lock_table);
            if self.detect_deadlock(tx_id) {
                let queue = lock_table.get_mut(&resource).unwrap();
                queue.requests.retain(|r| r.tx_id != tx_id);
                if queue.requests.is_empty() {
                    lock_table.remove(&resource);
                }
                self.remove_from_waits_for(tx_id);
                self.cvar.notify_all();
                return Err(LockError::Deadlock);
            }

            lock_table = self.cvar.wait(lock_table).unwrap();
        }
    }

    pub fn unlock_all(&self, tx_id: TransactionId) {
        let mut lock_table = self.lock_table.lock().unwrap();
        let mut affected = Vec::new();

        lock_table.retain(|resource, queue| {
            let before = queue.requests.len();
            queue.requests.retain(|req| req.tx_id != tx_id);
            if queue.requests.len() < before {
                affected.push(resource.clone());
            }
            !queue.requests.is_empty()
        });

        self.remove_from_waits_for(tx_id);

        for resource in affected {
            if let Some(queue) = lock_table.get_mut(&resource) {
                queue.shared_granted = queue
                    .requests
                    .iter()
                    .filter(|r| r.granted && r.mode == LockMode::Shared)
                    .count();
                queue.exclusive_granted = queue
                    .requests
                    .iter()
                    .any(|r| r.granted && r.mode == LockMode::Exclusive);
            }
            Self::try_grant_locks(&resource, &mut lock_table);
        }

        self.cvar.notify_all();
    }

    fn try_grant_locks(resource: &Resource, lock_table: &mut HashMap<Resource, LockRequestQueue>) {
        let Some(queue) = lock_table.get_mut(resource) else {
            return;
        };
        for req in queue.requests.iter_mut() {
            if req.granted {
                continue;
            }
            let compatible = match req.mode {
                LockMode::Shared => !queue.exclusive_granted,
                LockMode::Exclusive => queue.shared_granted == 0 && !queue.exclusive_granted,
            };
            if compatible {
                req.granted = true;
                match req.mode {
                    LockMode::Shared => queue.shared_granted += 1,
                    LockMode::Exclusive => queue.exclusive_granted = true,
                }
            } else {
                // The first incompatible request blocks the rest of the
                // queue, preserving FIFO order.
                break;
            }
        }
    }

    fn update_waits_for_graph(
        &self,
        waiter: TransactionId,
        lock_table: &HashMap<Resource, LockRequestQueue>,
    ) {
        let mut waits_for = self.waits_for.lock().unwrap();
        let waiting_on = waits_for.entry(waiter).or_default();
        waiting_on.clear();

        for queue in lock_table.values() {
            let Some(waiter_req) = queue
                .requests
                .iter()
                .find(|r| r.tx_id == waiter && !r.granted)
            else {
                continue;
            };
            for holder in queue.requests.iter().filter(|r| r.granted) {
                let compatible = match waiter_req.mode {
                    LockMode::Shared => holder.mode != LockMode::Exclusive,
                    LockMode::Exclusive => false,
                };
                if !compatible && holder.tx_id != waiter {
                    waiting_on.insert(holder.tx_id);
                }
            }
        }
    }

    fn remove_from_waits_for(&self, tx_id: TransactionId) {
        let mut waits_for = self.waits_for.lock().unwrap();
        waits_for.remove(&tx_id);
        for waiting_on in waits_for.values_mut() {
            waiting_on.remove(&tx_id);
        }
    }

    fn detect_deadlock(&self, start: TransactionId) -> bool {
        let waits_for = self.waits_for.lock().unwrap();
        let mut visited = HashSet::new();
        let mut path = HashSet::new();
        Self::dfs_detect(start, &waits_for, &mut visited, &mut path)
    }

    fn dfs_detect(
        current: TransactionId,
        waits_for: &HashMap<TransactionId, HashSet<TransactionId>>,
        visited: &mut HashSet<TransactionId>,
        path: &mut HashSet<TransactionId>,
    ) -> bool {
        visited.insert(current);
        path.insert(current);
        if let Some(next_set) = waits_for.get(&current) {
            for &next in next_set {
                if path.contains(&next) {
                    return true;
                }
                if !visited.contains(&next) && Self::dfs_detect(next, waits_for, visited, path) {
                    return true;
                }
            }
        }
        path.remove(&current);
        false
    }
}

/// Tracks running transactions and the resources they hold.
#[derive(Debug, Default)]
pub struct TransactionManager {
    lm: LockManager,
    active: Mutex<HashMap<TransactionId, HashSet<Resource>>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, tx_id: TransactionId) -> Result<()> {
        let mut active = self.active.lock().unwrap();
        if active.contains_key(&tx_id) {
            return Err(DbError::TransactionActive(tx_id));
        }
        active.insert(tx_id, HashSet::new());
        tracing::debug!(%tx_id, "transaction started");
        Ok(())
    }

    /// Ends the transaction, releasing every lock it holds.
    pub fn commit(&self, tx_id: TransactionId) -> Result<()> {
        let mut active = self.active.lock().unwrap();
        if active.remove(&tx_id).is_none() {
            return Err(DbError::TransactionUnknown(tx_id));
        }
        drop(active);
        self.lm.unlock_all(tx_id);
        tracing::debug!(%tx_id, "transaction committed");
        Ok(())
    }

    pub fn is_active(&self, tx_id: TransactionId) -> bool {
        self.active.lock().unwrap().contains_key(&tx_id)
    }

    /// Acquires a lock on one table entry on behalf of the transaction.
    /// Re-locking a resource the transaction already holds is a no-op.
    pub fn lock(&self, tx_id: TransactionId, table: &str, key: i64, mode: LockMode) -> Result<()> {
        let resource = Resource {
            table: table.to_owned(),
            key,
        };
        {
            let active = self.active.lock().unwrap();
            let Some(held) = active.get(&tx_id) else {
                return Err(DbError::TransactionUnknown(tx_id));
            };
            if held.contains(&resource) {
                return Ok(());
            }
        }
        self.lm
            .lock(tx_id, resource.clone(), mode)
            .map_err(|LockError::Deadlock| DbError::Deadlock)?;
        if let Some(held) = self.active.lock().unwrap().get_mut(&tx_id) {
            held.insert(resource);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn begin_commit_lifecycle_is_enforced() {
        let tm = TransactionManager::new();
        let id = Uuid::new_v4();
        tm.begin(id).unwrap();
        assert!(matches!(tm.begin(id), Err(DbError::TransactionActive(_))));
        assert!(tm.is_active(id));
        tm.commit(id).unwrap();
        assert!(!tm.is_active(id));
        assert!(matches!(
            tm.commit(id),
            Err(DbError::TransactionUnknown(_))
        ));
    }

    #[test]
    fn exclusive_locks_block_until_release() {
        let tm = Arc::new(TransactionManager::new());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        tm.begin(a).unwrap();
        tm.begin(b).unwrap();
        tm.lock(a, "t", 1, LockMode::Exclusive).unwrap();
        // Re-locking the same resource does not deadlock with itself.
        tm.lock(a, "t", 1, LockMode::Exclusive).unwrap();

        let tm2 = Arc::clone(&tm);
        let waiter = std::thread::spawn(move || {
            tm2.lock(b, "t", 1, LockMode::Exclusive).unwrap();
            tm2.commit(b).unwrap();
        });
        std::thread::sleep(Duration::from_millis(50));
        tm.commit(a).unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn crossed_lock_orders_report_a_deadlock() {
        let tm = Arc::new(TransactionManager::new());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        tm.begin(a).unwrap();
        tm.begin(b).unwrap();
        tm.lock(a, "t", 1, LockMode::Exclusive).unwrap();
        tm.lock(b, "t", 2, LockMode::Exclusive).unwrap();

        let tm2 = Arc::clone(&tm);
        let other = std::thread::spawn(move || {
            // Blocks on key 1, held by `a`.
            let res = tm2.lock(b, "t", 1, LockMode::Exclusive);
            if res.is_ok() {
                tm2.commit(b).unwrap();
            }
            res
        });
        std::thread::sleep(Duration::from_millis(50));
        // Closes the cycle; this request observes the deadlock immediately.
        let res = tm.lock(a, "t", 2, LockMode::Exclusive);
        assert!(matches!(res, Err(DbError::Deadlock)));
        // Releasing `a`'s locks lets the blocked transaction finish.
        tm.commit(a).unwrap();
        other.join().unwrap().unwrap();
    }
}
