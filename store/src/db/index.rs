//! The persistent entry index.
//!
//! Maps `(strong-hash prefix, size, client)` to the id of the one file
//! entry whose `pointed_to` flag is set for that client. Writes are queued
//! (`put_delayed`/`del_delayed`) and flushed in a single transaction;
//! readers consult the queue before the committed table so they observe
//! their own writes in order.
//!
//! Per-fingerprint advisory locks serialize an `add_file` against a
//! concurrent cleanup of the same content.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};

use rusqlite::OptionalExtension;
use tracing::debug;

use crate::db::entries::BYTES_IN_INDEX;
use crate::db::Database;
use crate::Result;

/// Key of one index row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexKey {
    pub prefix: [u8; BYTES_IN_INDEX],
    pub filesize: i64,
    pub clientid: i64,
}

impl IndexKey {
    /// Build a key from a full (or already truncated) strong hash.
    pub fn new(shahash: &[u8], filesize: i64, clientid: i64) -> Self {
        let mut prefix = [0u8; BYTES_IN_INDEX];
        let n = shahash.len().min(BYTES_IN_INDEX);
        prefix[..n].copy_from_slice(&shahash[..n]);
        IndexKey {
            prefix,
            filesize,
            clientid,
        }
    }
}

#[derive(Debug, Clone)]
enum PendingOp {
    Put { key: IndexKey, entry_id: i64 },
    Del { key: IndexKey },
}

#[derive(Default)]
struct KeyLocks {
    held: Mutex<std::collections::HashSet<([u8; BYTES_IN_INDEX], i64)>>,
    released: Condvar,
}

/// Holds the advisory lock for one `(hash, size)` fingerprint.
pub struct KeyLockGuard {
    locks: Arc<KeyLocks>,
    key: ([u8; BYTES_IN_INDEX], i64),
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().expect("key lock mutex poisoned");
        held.remove(&self.key);
        self.locks.released.notify_all();
    }
}

pub struct EntryIndex {
    db: Arc<Database>,
    pending: Mutex<Vec<PendingOp>>,
    locks: Arc<KeyLocks>,
}

impl EntryIndex {
    pub fn new(db: Arc<Database>) -> Self {
        EntryIndex {
            db,
            pending: Mutex::new(Vec::new()),
            locks: Arc::new(KeyLocks::default()),
        }
    }

    /// Entry id for exactly this `(hash, size, client)`, or 0.
    pub fn get_with_cache_exact(&self, key: &IndexKey) -> Result<i64> {
        if let Some(hit) = self.pending_lookup(key) {
            return Ok(hit);
        }
        self.committed_get(key)
    }

    /// Entry id preferring this client, falling back to any client that
    /// has the fingerprint.
    pub fn get_with_cache_prefer_client(&self, key: &IndexKey) -> Result<i64> {
        let own = self.get_with_cache_exact(key)?;
        if own != 0 {
            return Ok(own);
        }
        let all = self.all_clients(&key.prefix, key.filesize)?;
        Ok(all.values().copied().find(|&id| id != 0).unwrap_or(0))
    }

    /// Every client that currently owns a live entry for the fingerprint,
    /// with queued writes overlaid on the committed table.
    pub fn all_clients(
        &self,
        prefix: &[u8; BYTES_IN_INDEX],
        filesize: i64,
    ) -> Result<BTreeMap<i64, i64>> {
        let mut map: BTreeMap<i64, i64> = self.db.with(|c| {
            let mut stmt = c.prepare(
                "SELECT clientid, entry_id FROM files_index
                 WHERE hash_prefix = ?1 AND filesize = ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![prefix.as_slice(), filesize], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?;
            rows.collect()
        })?;

        let pending = self.pending.lock().expect("index queue mutex poisoned");
        for op in pending.iter() {
            match op {
                PendingOp::Put { key, entry_id }
                    if key.prefix == *prefix && key.filesize == filesize =>
                {
                    map.insert(key.clientid, *entry_id);
                }
                PendingOp::Del { key } if key.prefix == *prefix && key.filesize == filesize => {
                    map.remove(&key.clientid);
                }
                _ => {}
            }
        }
        Ok(map)
    }

    pub fn put_delayed(&self, key: IndexKey, entry_id: i64) {
        debug!(clientid = key.clientid, entry_id, "index put queued");
        self.pending
            .lock()
            .expect("index queue mutex poisoned")
            .push(PendingOp::Put { key, entry_id });
    }

    pub fn del_delayed(&self, key: IndexKey) {
        debug!(clientid = key.clientid, "index del queued");
        self.pending
            .lock()
            .expect("index queue mutex poisoned")
            .push(PendingOp::Del { key });
    }

    /// Number of queued, unflushed operations.
    pub fn pending_ops(&self) -> usize {
        self.pending.lock().expect("index queue mutex poisoned").len()
    }

    /// Flush all queued operations in arrival order inside one committed
    /// transaction.
    pub fn commit_transaction(&self) -> Result<()> {
        let ops: Vec<PendingOp> = {
            let mut pending = self.pending.lock().expect("index queue mutex poisoned");
            std::mem::take(&mut *pending)
        };
        if ops.is_empty() {
            return Ok(());
        }

        self.db.with_tx(|tx| {
            for op in &ops {
                match op {
                    PendingOp::Put { key, entry_id } => {
                        tx.execute(
                            "INSERT OR REPLACE INTO files_index
                             (hash_prefix, filesize, clientid, entry_id)
                             VALUES (?1, ?2, ?3, ?4)",
                            rusqlite::params![
                                key.prefix.as_slice(),
                                key.filesize,
                                key.clientid,
                                entry_id
                            ],
                        )?;
                    }
                    PendingOp::Del { key } => {
                        tx.execute(
                            "DELETE FROM files_index
                             WHERE hash_prefix = ?1 AND filesize = ?2 AND clientid = ?3",
                            rusqlite::params![key.prefix.as_slice(), key.filesize, key.clientid],
                        )?;
                    }
                }
            }
            Ok(())
        })?;

        debug!(count = ops.len(), "index queue flushed");
        Ok(())
    }

    /// Take the advisory lock for one fingerprint, blocking while another
    /// thread holds it.
    pub fn lock_key(&self, prefix: [u8; BYTES_IN_INDEX], filesize: i64) -> KeyLockGuard {
        let key = (prefix, filesize);
        let mut held = self.locks.held.lock().expect("key lock mutex poisoned");
        while held.contains(&key) {
            held = self
                .locks
                .released
                .wait(held)
                .expect("key lock mutex poisoned");
        }
        held.insert(key);
        KeyLockGuard {
            locks: Arc::clone(&self.locks),
            key,
        }
    }

    fn pending_lookup(&self, key: &IndexKey) -> Option<i64> {
        let pending = self.pending.lock().expect("index queue mutex poisoned");
        for op in pending.iter().rev() {
            match op {
                PendingOp::Put { key: k, entry_id } if k == key => return Some(*entry_id),
                PendingOp::Del { key: k } if k == key => return Some(0),
                _ => {}
            }
        }
        None
    }

    fn committed_get(&self, key: &IndexKey) -> Result<i64> {
        let hit: Option<i64> = self.db.with(|c| {
            c.query_row(
                "SELECT entry_id FROM files_index
                 WHERE hash_prefix = ?1 AND filesize = ?2 AND clientid = ?3",
                rusqlite::params![key.prefix.as_slice(), key.filesize, key.clientid],
                |row| row.get(0),
            )
            .optional()
        })?;
        Ok(hit.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> EntryIndex {
        EntryIndex::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    fn key(seed: u8, clientid: i64) -> IndexKey {
        IndexKey::new(&[seed; 64], 1000, clientid)
    }

    #[test]
    fn readers_see_their_own_queued_writes() {
        let idx = index();
        let k = key(1, 7);

        assert_eq!(idx.get_with_cache_exact(&k).unwrap(), 0);
        idx.put_delayed(k, 42);
        assert_eq!(idx.get_with_cache_exact(&k).unwrap(), 42);
        idx.del_delayed(k);
        assert_eq!(idx.get_with_cache_exact(&k).unwrap(), 0);

        // queue order survives the flush
        idx.commit_transaction().unwrap();
        assert_eq!(idx.get_with_cache_exact(&k).unwrap(), 0);
        assert_eq!(idx.pending_ops(), 0);
    }

    #[test]
    fn flush_persists_last_write_per_key() {
        let idx = index();
        let k = key(2, 1);
        idx.put_delayed(k, 10);
        idx.put_delayed(k, 11);
        idx.commit_transaction().unwrap();
        assert_eq!(idx.get_with_cache_exact(&k).unwrap(), 11);
    }

    #[test]
    fn prefer_client_falls_back_to_other_clients() {
        let idx = index();
        idx.put_delayed(key(3, 1), 100);
        idx.commit_transaction().unwrap();

        let own = key(3, 2);
        assert_eq!(idx.get_with_cache_exact(&own).unwrap(), 0);
        assert_eq!(idx.get_with_cache_prefer_client(&own).unwrap(), 100);
    }

    #[test]
    fn all_clients_overlays_pending_ops() {
        let idx = index();
        idx.put_delayed(key(4, 1), 100);
        idx.commit_transaction().unwrap();
        idx.put_delayed(key(4, 2), 200);
        idx.del_delayed(key(4, 1));

        let all = idx.all_clients(&key(4, 0).prefix, 1000).unwrap();
        assert_eq!(all.get(&2), Some(&200));
        assert!(!all.contains_key(&1));
    }

    #[test]
    fn key_locks_are_exclusive_per_fingerprint() {
        let idx = Arc::new(index());
        let guard = idx.lock_key([5u8; BYTES_IN_INDEX], 1);

        // a different fingerprint is not blocked
        let other = idx.lock_key([6u8; BYTES_IN_INDEX], 1);
        drop(other);

        let contended = Arc::clone(&idx);
        let t = std::thread::spawn(move || {
            let _g = contended.lock_key([5u8; BYTES_IN_INDEX], 1);
        });
        // give the thread a moment to block, then release
        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(guard);
        t.join().unwrap();
    }
}
