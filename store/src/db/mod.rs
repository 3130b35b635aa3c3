//! SQLite-backed store metadata.
//!
//! One database holds the file-entry table (the per-fingerprint linked
//! lists) and the entry index (the `(hash-prefix, size, client)` key map).
//! The connection is wrapped in a mutex so worker threads can share one
//! handle; batched index writes run in explicit transactions.

pub mod entries;
pub mod index;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, Transaction};

use crate::Result;

pub use entries::{CorrectionJournal, FileEntry, BYTES_IN_INDEX, LINK_MIN_SIZE};
pub use index::{EntryIndex, IndexKey, KeyLockGuard};

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests and tooling.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                backupid INTEGER NOT NULL,
                clientid INTEGER NOT NULL,
                incremental INTEGER NOT NULL DEFAULT 0,
                fullpath TEXT NOT NULL,
                hashpath TEXT NOT NULL,
                shahash BLOB NOT NULL,
                filesize INTEGER NOT NULL,
                rsize INTEGER NOT NULL DEFAULT 0,
                next_entry INTEGER NOT NULL DEFAULT 0,
                prev_entry INTEGER NOT NULL DEFAULT 0,
                pointed_to INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS files_index (
                hash_prefix BLOB NOT NULL,
                filesize INTEGER NOT NULL,
                clientid INTEGER NOT NULL,
                entry_id INTEGER NOT NULL,
                PRIMARY KEY (hash_prefix, filesize, clientid)
            );

            CREATE TABLE IF NOT EXISTS files_incoming_stat (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filesize INTEGER NOT NULL,
                clientid INTEGER NOT NULL,
                backupid INTEGER NOT NULL,
                existing_clients TEXT NOT NULL DEFAULT '',
                direction INTEGER NOT NULL,
                incremental INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS old_backupfolders (
                path TEXT PRIMARY KEY
            );
            "#,
        )?;
        Ok(())
    }

    pub(crate) fn with<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        Ok(f(&conn)?)
    }

    pub(crate) fn with_tx<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().expect("database mutex poisoned");
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Known historical backup folder roots, oldest first.
    pub fn old_backup_folders(&self) -> Result<Vec<String>> {
        self.with(|c| {
            let mut stmt = c.prepare("SELECT path FROM old_backupfolders ORDER BY path")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect()
        })
    }

    pub fn add_old_backup_folder(&self, path: &str) -> Result<()> {
        self.with(|c| {
            c.execute(
                "INSERT OR IGNORE INTO old_backupfolders (path) VALUES (?1)",
                [path],
            )
            .map(|_| ())
        })
    }
}
