//! The file-entry table and its per-fingerprint linked lists.
//!
//! Every stored file copy is one row. Rows sharing `(shahash, filesize)`
//! form one doubly-linked list ordered by insertion, spanning clients; per
//! `(fingerprint, client)` exactly one row carries `pointed_to = 1`: the
//! row the entry index names for that client. The insert/delete operations
//! here keep both structures consistent; a damaged index is logged and
//! handled best-effort, never auto-repaired.

use std::collections::{HashMap, HashSet};

use rusqlite::OptionalExtension;
use tracing::{debug, warn};

use crate::db::index::{EntryIndex, IndexKey};
use crate::db::Database;
use crate::Result;

/// Files below this size skip linking and the index entirely.
pub const LINK_MIN_SIZE: i64 = 2048;
/// Strong-hash prefix length used for index keys.
pub const BYTES_IN_INDEX: usize = 16;

/// Transfer direction recorded in the incoming-file statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatDirection {
    Incoming = 0,
    Outgoing = 1,
    OutgoingNoBackupStat = 2,
}

/// One row of the `files` table.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub id: i64,
    pub backupid: i64,
    pub clientid: i64,
    pub incremental: i64,
    pub fullpath: String,
    pub hashpath: String,
    pub shahash: Vec<u8>,
    pub filesize: i64,
    pub rsize: i64,
    pub next_entry: i64,
    pub prev_entry: i64,
    pub pointed_to: bool,
}

/// Parameters of a new entry insert.
#[derive(Debug, Clone)]
pub struct NewFileEntry {
    pub backupid: i64,
    pub clientid: i64,
    pub incremental: i64,
    pub fullpath: String,
    pub hashpath: String,
    pub shahash: Vec<u8>,
    pub filesize: i64,
    pub rsize: i64,
    /// Entry this copy was linked from (0 for a fresh copy).
    pub prev_entry: i64,
    /// Client that owns `prev_entry` (0 when none).
    pub prev_entry_clientid: i64,
    pub next_entry: i64,
    /// Force the index key over to the new entry.
    pub update_fileindex: bool,
}

/// Deferred sibling mutations for a caller that is itself rewriting the
/// rows a delete would touch; applied explicitly at commit.
#[derive(Debug, Default)]
pub struct CorrectionJournal {
    tracked: HashSet<i64>,
    pub pointed_to: HashMap<i64, bool>,
    pub next_entries: HashMap<i64, i64>,
    pub prev_entries: HashMap<i64, i64>,
}

impl CorrectionJournal {
    /// Mark an entry as being rewritten by the caller; mutations against
    /// it will be journaled instead of written.
    pub fn track(&mut self, id: i64) {
        self.tracked.insert(id);
    }

    pub fn needs_correction(&self, id: i64) -> bool {
        self.tracked.contains(&id)
    }

    /// Write the journaled mutations out.
    pub fn apply(&self, db: &Database) -> Result<()> {
        db.with_tx(|tx| {
            for (&id, &v) in &self.pointed_to {
                tx.execute(
                    "UPDATE files SET pointed_to = ?1 WHERE id = ?2",
                    rusqlite::params![v as i64, id],
                )?;
            }
            for (&id, &next) in &self.next_entries {
                tx.execute(
                    "UPDATE files SET next_entry = ?1 WHERE id = ?2",
                    rusqlite::params![next, id],
                )?;
            }
            for (&id, &prev) in &self.prev_entries {
                tx.execute(
                    "UPDATE files SET prev_entry = ?1 WHERE id = ?2",
                    rusqlite::params![prev, id],
                )?;
            }
            Ok(())
        })
    }
}

const ENTRY_COLUMNS: &str = "id, backupid, clientid, incremental, fullpath, hashpath, \
     shahash, filesize, rsize, next_entry, prev_entry, pointed_to";

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileEntry> {
    Ok(FileEntry {
        id: row.get(0)?,
        backupid: row.get(1)?,
        clientid: row.get(2)?,
        incremental: row.get(3)?,
        fullpath: row.get(4)?,
        hashpath: row.get(5)?,
        shahash: row.get(6)?,
        filesize: row.get(7)?,
        rsize: row.get(8)?,
        next_entry: row.get(9)?,
        prev_entry: row.get(10)?,
        pointed_to: row.get::<_, i64>(11)? != 0,
    })
}

pub fn get_entry(db: &Database, id: i64) -> Result<Option<FileEntry>> {
    db.with(|c| {
        c.query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM files WHERE id = ?1"),
            [id],
            row_to_entry,
        )
        .optional()
    })
}

pub fn set_pointed_to(db: &Database, id: i64, pointed_to: bool) -> Result<()> {
    db.with(|c| {
        c.execute(
            "UPDATE files SET pointed_to = ?1 WHERE id = ?2",
            rusqlite::params![pointed_to as i64, id],
        )
        .map(|_| ())
    })
}

fn set_next_entry(db: &Database, id: i64, next: i64) -> Result<()> {
    db.with(|c| {
        c.execute(
            "UPDATE files SET next_entry = ?1 WHERE id = ?2",
            rusqlite::params![next, id],
        )
        .map(|_| ())
    })
}

fn set_prev_entry(db: &Database, id: i64, prev: i64) -> Result<()> {
    db.with(|c| {
        c.execute(
            "UPDATE files SET prev_entry = ?1 WHERE id = ?2",
            rusqlite::params![prev, id],
        )
        .map(|_| ())
    })
}

fn delete_row(db: &Database, id: i64) -> Result<()> {
    db.with(|c| c.execute("DELETE FROM files WHERE id = ?1", [id]).map(|_| ()))
}

/// Record one incoming/outgoing file for the statistics table.
pub fn add_incoming_stat(
    db: &Database,
    filesize: i64,
    clientid: i64,
    backupid: i64,
    existing_clients: &str,
    direction: StatDirection,
    incremental: i64,
) -> Result<()> {
    db.with(|c| {
        c.execute(
            "INSERT INTO files_incoming_stat
             (filesize, clientid, backupid, existing_clients, direction, incremental)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                filesize,
                clientid,
                backupid,
                existing_clients,
                direction as i64,
                incremental
            ],
        )
        .map(|_| ())
    })
}

fn insert_row(db: &Database, e: &NewFileEntry, pointed_to: bool) -> Result<i64> {
    db.with(|c| {
        c.execute(
            "INSERT INTO files
             (backupid, clientid, incremental, fullpath, hashpath, shahash,
              filesize, rsize, next_entry, prev_entry, pointed_to)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                e.backupid,
                e.clientid,
                e.incremental,
                e.fullpath,
                e.hashpath,
                e.shahash,
                e.filesize,
                e.rsize,
                e.next_entry,
                e.prev_entry,
                pointed_to as i64
            ],
        )?;
        Ok(c.last_insert_rowid())
    })
}

/// Insert a file entry, splicing it into the fingerprint's linked list and
/// updating the entry index when the new entry becomes the pointed-to one
/// for its client.
///
/// Returns the new entry id. Queued index writes are flushed by the
/// caller's `commit_transaction`.
pub fn add_file_entry(db: &Database, index: &EntryIndex, mut e: NewFileEntry) -> Result<i64> {
    if e.filesize < LINK_MIN_SIZE {
        // small files bypass linking and the index
        add_incoming_stat(
            db,
            e.filesize,
            e.clientid,
            e.backupid,
            "",
            StatDirection::Incoming,
            e.incremental,
        )?;
        e.prev_entry = 0;
        e.next_entry = 0;
        return insert_row(db, &e, false);
    }

    let mut new_for_client = false;
    let mut update_fileindex = e.update_fileindex;
    let candidate_prev = e.prev_entry;
    let candidate_clientid = e.prev_entry_clientid;

    if candidate_clientid != e.clientid || candidate_prev == 0 {
        new_for_client = true;
        e.prev_entry = 0;
        e.next_entry = 0;

        let mut clients = String::new();
        if candidate_clientid != 0 {
            // other clients have this content; this client may too (an
            // earlier link attempt could have failed after the insert)
            let all = index.all_clients(
                &IndexKey::new(&e.shahash, e.filesize, 0).prefix,
                e.filesize,
            )?;
            for (&clientid, &entry_id) in &all {
                if entry_id == 0 {
                    continue;
                }
                if clientid == e.clientid {
                    e.prev_entry = entry_id;
                }
                if !clients.is_empty() {
                    clients.push(',');
                }
                clients.push_str(&clientid.to_string());
            }
        }

        if e.prev_entry == 0 {
            add_incoming_stat(
                db,
                e.filesize,
                e.clientid,
                e.backupid,
                &clients,
                StatDirection::Incoming,
                e.incremental,
            )?;
            // first copy for this client; join the fingerprint chain
            // behind the link candidate when there is one
            if candidate_prev != 0 {
                if let Some(cand) = get_entry(db, candidate_prev)? {
                    e.prev_entry = cand.id;
                    e.next_entry = cand.next_entry;
                }
            }
        } else {
            match get_entry(db, e.prev_entry)? {
                Some(own) => {
                    e.next_entry = own.next_entry;
                    if own.pointed_to {
                        update_fileindex = true;
                    }
                }
                None => e.prev_entry = 0,
            }
        }
    }

    let pointed_to = new_for_client || update_fileindex;
    if pointed_to {
        // at most one pointed-to row per (fingerprint, client)
        let old = index.get_with_cache_exact(&IndexKey::new(&e.shahash, e.filesize, e.clientid))?;
        if old != 0 {
            set_pointed_to(db, old, false)?;
        }
    }

    let id = insert_row(db, &e, pointed_to)?;

    // splice into the doubly-linked list
    if e.prev_entry != 0 {
        set_next_entry(db, e.prev_entry, id)?;
    }
    if e.next_entry != 0 {
        set_prev_entry(db, e.next_entry, id)?;
    }

    if pointed_to {
        debug!(id, fullpath = %e.fullpath, "new index entry");
        index.put_delayed(IndexKey::new(&e.shahash, e.filesize, e.clientid), id);
    }

    Ok(id)
}

/// First list sibling owned by the same client, searching forward then
/// backward from `entry`. Used to hand the index key over on delete.
fn same_client_heir(db: &Database, entry: &FileEntry) -> Result<Option<i64>> {
    let mut seen = HashSet::new();
    seen.insert(entry.id);

    for (mut cur, forward) in [(entry.next_entry, true), (entry.prev_entry, false)] {
        while cur != 0 {
            if !seen.insert(cur) {
                warn!(id = entry.id, "cycle in file entry list; the entry index may be damaged");
                return Ok(None);
            }
            match get_entry(db, cur)? {
                Some(sib) => {
                    if sib.clientid == entry.clientid {
                        return Ok(Some(sib.id));
                    }
                    cur = if forward { sib.next_entry } else { sib.prev_entry };
                }
                None => {
                    warn!(
                        id = entry.id,
                        missing = cur,
                        "dangling sibling pointer; the entry index may be damaged"
                    );
                    break;
                }
            }
        }
    }
    Ok(None)
}

/// Remove a file entry by id, rebalancing its linked list and the index.
pub fn delete_file_entry(
    db: &Database,
    index: &EntryIndex,
    id: i64,
    journal: Option<&mut CorrectionJournal>,
) -> Result<()> {
    match get_entry(db, id)? {
        Some(entry) => delete_file_entry_loaded(db, index, &entry, journal, true),
        None => Ok(()),
    }
}

/// Remove an already-loaded file entry.
///
/// `with_backupstat` selects which outgoing direction the statistics row
/// gets; cleanup passes that bypass backup accounting use `false`.
pub fn delete_file_entry_loaded(
    db: &Database,
    index: &EntryIndex,
    entry: &FileEntry,
    mut journal: Option<&mut CorrectionJournal>,
    with_backupstat: bool,
) -> Result<()> {
    let prev_id = entry.prev_entry;
    let next_id = entry.next_entry;
    let direction = if with_backupstat {
        StatDirection::Outgoing
    } else {
        StatDirection::OutgoingNoBackupStat
    };
    let key = IndexKey::new(&entry.shahash, entry.filesize, entry.clientid);

    if prev_id == 0 && next_id == 0 {
        if entry.filesize < LINK_MIN_SIZE {
            if entry.pointed_to {
                warn!(
                    id = entry.id,
                    filesize = entry.filesize,
                    "small file entry has pointed_to set; the entry index may be damaged"
                );
            }
            add_incoming_stat(
                db,
                entry.filesize,
                entry.clientid,
                entry.backupid,
                &entry.clientid.to_string(),
                direction,
                entry.incremental,
            )?;
            return delete_row(db, entry.id);
        }

        // last entry of this fingerprint anywhere
        let all = index.all_clients(
            &IndexKey::new(&entry.shahash, entry.filesize, 0).prefix,
            entry.filesize,
        )?;

        let mut clients = String::new();
        let mut target_entryid = 0;
        if all.is_empty() {
            warn!(
                id = entry.id,
                hash = %hex::encode(&entry.shahash[..BYTES_IN_INDEX.min(entry.shahash.len())]),
                "entry missing from the index while deleting; the entry index may be damaged"
            );
            clients = entry.clientid.to_string();
        } else {
            for (&clientid, &entry_id) in &all {
                if entry_id == 0 {
                    continue;
                }
                if !clients.is_empty() {
                    clients.push(',');
                }
                clients.push_str(&clientid.to_string());
                if clientid == entry.clientid {
                    target_entryid = entry_id;
                }
            }
        }

        if target_entryid == 0 {
            warn!(
                id = entry.id,
                clientid = entry.clientid,
                "no index entry for this client while deleting; the entry index may be damaged"
            );
            if !clients.is_empty() {
                clients.push(',');
            }
            clients.push_str(&entry.clientid.to_string());
        } else if target_entryid != entry.id {
            warn!(
                id = entry.id,
                target_entryid,
                "index points at a different entry for the last copy; leaving the index key alone"
            );
        }

        if !entry.pointed_to {
            warn!(
                id = entry.id,
                "last entry for its fingerprint has pointed_to unset; the entry index may be damaged"
            );
        }

        add_incoming_stat(
            db,
            entry.filesize,
            entry.clientid,
            entry.backupid,
            &clients,
            direction,
            entry.incremental,
        )?;

        if entry.pointed_to && !all.is_empty() && (target_entryid == 0 || target_entryid == entry.id)
        {
            debug!(id = entry.id, "deleting index key");
            index.del_delayed(key);
        }
    } else if entry.pointed_to {
        // the index key needs a new holder among this client's copies
        match same_client_heir(db, entry)? {
            Some(heir) => {
                match journal.as_deref_mut() {
                    Some(j) if j.needs_correction(heir) => {
                        j.pointed_to.insert(heir, true);
                    }
                    _ => set_pointed_to(db, heir, true)?,
                }
                index.put_delayed(key, heir);
                debug!(from = entry.id, to = heir, "index key moved to sibling");
            }
            None => {
                // the chain lives on through other clients, but this was
                // the client's own last copy
                index.del_delayed(key);
                add_incoming_stat(
                    db,
                    entry.filesize,
                    entry.clientid,
                    entry.backupid,
                    &entry.clientid.to_string(),
                    direction,
                    entry.incremental,
                )?;
                debug!(id = entry.id, clientid = entry.clientid, "client lost its last copy");
            }
        }
    }

    if next_id != 0 {
        match journal.as_deref_mut() {
            Some(j) if j.needs_correction(next_id) => {
                j.prev_entries.insert(next_id, prev_id);
            }
            _ => set_prev_entry(db, next_id, prev_id)?,
        }
    }
    if prev_id != 0 {
        match journal.as_deref_mut() {
            Some(j) if j.needs_correction(prev_id) => {
                j.next_entries.insert(prev_id, next_id);
            }
            _ => set_next_entry(db, prev_id, next_id)?,
        }
    }

    delete_row(db, entry.id)
}
