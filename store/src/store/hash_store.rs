//! Ingest path of the store: link against identical stored content or
//! copy, then record the new entry.
//!
//! `add_file` takes a freshly received file whose strong hash is already
//! known, walks the entry index for candidates with the same fingerprint,
//! and hard-links the destination to the first live candidate. When no
//! candidate works the payload is copied (or patched from an old version),
//! its chunk-hash sidecar is built, and the entry is inserted as the new
//! head of its fingerprint list.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::db::entries::{self, CorrectionJournal, FileEntry, NewFileEntry, LINK_MIN_SIZE};
use crate::db::index::{EntryIndex, IndexKey};
use crate::db::Database;
use crate::error::is_too_many_links;
use crate::hash::{StrongHash, STRONG_HASH_LEN};
use crate::patcher::{ChunkPatcher, PatchEvent};
use crate::sidecar::{self, FileMetadata};
use crate::sparse::{self, ExtentIterator, SparseExtent, SparseFile};
use crate::{Result, StoreError};

/// Reserve subtracted from reported free space before the capacity check.
const FREESPACE_MOD: u64 = 50 * 1024 * 1024;
const OPEN_RETRIES: u32 = 10;

pub type CleanupFn = dyn Fn(u64) -> bool + Send + Sync;

/// Shared context for all store workers: database handles, the backup
/// folder layout and the cleanup hook invoked when space runs out.
pub struct StoreEnv {
    pub db: Arc<Database>,
    pub index: Arc<EntryIndex>,
    /// Current backup folder root; historical roots live in the database
    /// and are consulted by the candidate path correction.
    pub backup_folder: PathBuf,
    /// Called with the number of bytes needed; returns true when it freed
    /// enough. Serialized across workers.
    pub cleanup: Option<Box<CleanupFn>>,
    pub cleanup_lock: Mutex<()>,
    /// Copy from the link candidate's bytes when hard-linking fails with
    /// an unexpected error, keeping the dedup source.
    pub copy_on_link_failure: bool,
    /// Backoff between destination open retries.
    pub open_retry_wait: Duration,
}

impl StoreEnv {
    pub fn new(db: Arc<Database>, index: Arc<EntryIndex>, backup_folder: PathBuf) -> Self {
        StoreEnv {
            db,
            index,
            backup_folder,
            cleanup: None,
            cleanup_lock: Mutex::new(()),
            copy_on_link_failure: false,
            open_retry_wait: Duration::from_millis(500),
        }
    }
}

/// Where the payload bytes come from.
pub enum IngestSource {
    /// A complete received file, consumed by the ingest.
    Full { temp_path: PathBuf },
    /// A block-diff patch to apply against an old stored version.
    Patch(PatchInput),
}

pub struct PatchInput {
    /// Old version the patch applies to.
    pub source: PathBuf,
    /// Patch stream produced by the transfer client.
    pub patch_file: PathBuf,
    /// Sidecar the transfer client refreshed alongside the patch.
    pub hash_output: PathBuf,
}

pub struct AddFileRequest {
    pub source: IngestSource,
    pub dest_path: PathBuf,
    pub hash_dest_path: PathBuf,
    pub strong_hash: [u8; STRONG_HASH_LEN],
    pub file_size: i64,
    pub backupid: i64,
    pub incremental: i64,
    pub metadata: FileMetadata,
    /// Sparse extents of the payload, sub-chunk aligned.
    pub extents: Vec<SparseExtent>,
}

#[derive(Debug)]
pub struct AddFileOutcome {
    pub entry_id: i64,
    /// True when the destination is a hard link to existing content.
    pub linked: bool,
    /// Physical bytes written (0 for a plain link).
    pub rsize: i64,
}

enum LinkAttempt {
    Linked(AddFileOutcome),
    Copy { update_fileindex: bool },
}

/// Iteration state of the candidate walk: the client's own indexed entry,
/// its forward chain, its backward chain, then other clients' entries the
/// same way.
#[derive(Default)]
struct FindState {
    state: u8,
    orig_prev: i64,
    prev: Option<FileEntry>,
    clients: Vec<(i64, i64)>,
    client_pos: usize,
}

pub struct HashStore {
    env: Arc<StoreEnv>,
    clientid: i64,
    has_error: bool,
    old_folders: Option<Vec<String>>,
    link_logcnt: u32,
}

impl HashStore {
    pub fn new(env: Arc<StoreEnv>, clientid: i64) -> Self {
        HashStore {
            env,
            clientid,
            has_error: false,
            old_folders: None,
            link_logcnt: 0,
        }
    }

    /// Error flag query; reading it clears it.
    pub fn has_error(&mut self) -> bool {
        std::mem::take(&mut self.has_error)
    }

    /// Ingest one received file per the store's dedup rules.
    pub fn add_file(&mut self, req: AddFileRequest) -> Result<AddFileOutcome> {
        let outcome = self.add_file_inner(req);
        if outcome.is_err() {
            self.has_error = true;
        }
        outcome
    }

    fn add_file_inner(&mut self, req: AddFileRequest) -> Result<AddFileOutcome> {
        if req.file_size < LINK_MIN_SIZE {
            return self.add_small_file(req);
        }

        let fingerprint = IndexKey::new(&req.strong_hash, req.file_size, 0).prefix;
        let _guard = self.env.index.lock_key(fingerprint, req.file_size);

        let update_fileindex = match self.find_and_link(&req)? {
            LinkAttempt::Linked(outcome) => {
                self.env.index.commit_transaction()?;
                return Ok(outcome);
            }
            LinkAttempt::Copy { update_fileindex } => update_fileindex,
        };

        self.ensure_free_space(req.file_size as u64, &req.dest_path)?;

        let rsize = match &req.source {
            IngestSource::Full { temp_path } => {
                let rsize = self.copy_with_sidecar(&req, temp_path)?;
                fs::remove_file(temp_path).ok();
                rsize
            }
            IngestSource::Patch(patch) => self.patch_into_dest(&req, patch)?,
        };

        let entry_id = entries::add_file_entry(
            &self.env.db,
            &self.env.index,
            NewFileEntry {
                backupid: req.backupid,
                clientid: self.clientid,
                incremental: req.incremental,
                fullpath: req.dest_path.to_string_lossy().into_owned(),
                hashpath: req.hash_dest_path.to_string_lossy().into_owned(),
                shahash: req.strong_hash.to_vec(),
                filesize: req.file_size,
                rsize,
                prev_entry: 0,
                prev_entry_clientid: 0,
                next_entry: 0,
                update_fileindex,
            },
        )?;
        self.env.index.commit_transaction()?;

        info!(dest = %req.dest_path.display(), entry_id, rsize, "stored file copy");
        Ok(AddFileOutcome {
            entry_id,
            linked: false,
            rsize,
        })
    }

    /// Fast path below the link threshold: move the payload, record the
    /// entry, touch neither the index nor a sidecar.
    fn add_small_file(&mut self, req: AddFileRequest) -> Result<AddFileOutcome> {
        let temp_path = match &req.source {
            IngestSource::Full { temp_path } => temp_path,
            IngestSource::Patch(_) => {
                return Err(StoreError::Protocol(
                    "patch ingest below the link threshold".into(),
                ))
            }
        };

        if fs::rename(temp_path, &req.dest_path).is_err() {
            fs::copy(temp_path, &req.dest_path)?;
            fs::remove_file(temp_path).ok();
        }

        let entry_id = entries::add_file_entry(
            &self.env.db,
            &self.env.index,
            NewFileEntry {
                backupid: req.backupid,
                clientid: self.clientid,
                incremental: req.incremental,
                fullpath: req.dest_path.to_string_lossy().into_owned(),
                hashpath: String::new(),
                shahash: req.strong_hash.to_vec(),
                filesize: req.file_size,
                rsize: req.file_size,
                prev_entry: 0,
                prev_entry_clientid: 0,
                next_entry: 0,
                update_fileindex: false,
            },
        )?;

        Ok(AddFileOutcome {
            entry_id,
            linked: false,
            rsize: req.file_size,
        })
    }

    fn find_and_link(&mut self, req: &AddFileRequest) -> Result<LinkAttempt> {
        let mut state = FindState::default();
        let mut tries_once = false;
        let mut hardlink_limit = false;
        let mut first_logmsg = true;

        let mut existing = self.find_file_hash(&req.strong_hash, req.file_size, &mut state)?;

        while let Some(candidate) = existing {
            tries_once = true;

            match fs::hard_link(&candidate.fullpath, &req.dest_path) {
                Ok(()) => {
                    self.prepare_linked_sidecar(req, &candidate)?;

                    // carry a partial-copy rsize through the link chain
                    let rsize = if candidate.rsize != 0 && candidate.rsize != candidate.filesize {
                        candidate.rsize
                    } else {
                        0
                    };

                    let entry_id = entries::add_file_entry(
                        &self.env.db,
                        &self.env.index,
                        NewFileEntry {
                            backupid: req.backupid,
                            clientid: self.clientid,
                            incremental: req.incremental,
                            fullpath: req.dest_path.to_string_lossy().into_owned(),
                            hashpath: req.hash_dest_path.to_string_lossy().into_owned(),
                            shahash: req.strong_hash.to_vec(),
                            filesize: req.file_size,
                            rsize,
                            prev_entry: candidate.id,
                            prev_entry_clientid: candidate.clientid,
                            next_entry: candidate.next_entry,
                            update_fileindex: false,
                        },
                    )?;

                    if let IngestSource::Full { temp_path } = &req.source {
                        fs::remove_file(temp_path).ok();
                    }

                    info!(
                        dest = %req.dest_path.display(),
                        source = %candidate.fullpath,
                        entry_id,
                        "linked file"
                    );
                    return Ok(LinkAttempt::Linked(AddFileOutcome {
                        entry_id,
                        linked: true,
                        rsize,
                    }));
                }
                Err(e) if is_too_many_links(&e) => {
                    debug!(
                        source = %candidate.fullpath,
                        "hardlink failed: maximum link count reached"
                    );
                    hardlink_limit = true;
                    break;
                }
                Err(link_err) => {
                    match File::open(&candidate.fullpath) {
                        Err(open_err) => {
                            let open_err = StoreError::Io(open_err);
                            if !open_err.is_candidate_dead() {
                                // transient trouble, not a vanished file;
                                // keep the entry and fall back to copying
                                warn!(
                                    source = %candidate.fullpath,
                                    error = %open_err,
                                    "candidate unreadable"
                                );
                                break;
                            }

                            // candidate is gone; maybe the backup folder moved
                            let mut corrected = candidate.clone();
                            if self.correct_path(&mut corrected)? {
                                debug!(path = %corrected.fullpath, "using new backup folder for candidate");
                                existing = Some(corrected);
                                continue;
                            }

                            if first_logmsg {
                                debug!(
                                    path = %candidate.fullpath,
                                    "hardlink failed: candidate no longer exists"
                                );
                            }
                            first_logmsg = false;

                            entries::delete_file_entry_loaded(
                                &self.env.db,
                                &self.env.index,
                                &candidate,
                                None,
                                false,
                            )?;
                            existing =
                                self.find_file_hash(&req.strong_hash, req.file_size, &mut state)?;
                            continue;
                        }
                        Ok(mut candidate_file) => {
                            warn!(
                                source = %candidate.fullpath,
                                dest = %req.dest_path.display(),
                                error = %link_err,
                                "hardlink failed"
                            );

                            if self.env.copy_on_link_failure {
                                // keep the dedup source even though linking failed
                                info!(source = %candidate.fullpath, "copying from link candidate");
                                let rsize =
                                    self.copy_from_candidate(req, &mut candidate_file)?;
                                self.prepare_linked_sidecar(req, &candidate)?;

                                let entry_id = entries::add_file_entry(
                                    &self.env.db,
                                    &self.env.index,
                                    NewFileEntry {
                                        backupid: req.backupid,
                                        clientid: self.clientid,
                                        incremental: req.incremental,
                                        fullpath: req.dest_path.to_string_lossy().into_owned(),
                                        hashpath: req
                                            .hash_dest_path
                                            .to_string_lossy()
                                            .into_owned(),
                                        shahash: req.strong_hash.to_vec(),
                                        filesize: req.file_size,
                                        rsize,
                                        prev_entry: candidate.id,
                                        prev_entry_clientid: candidate.clientid,
                                        next_entry: candidate.next_entry,
                                        update_fileindex: true,
                                    },
                                )?;

                                if let IngestSource::Full { temp_path } = &req.source {
                                    fs::remove_file(temp_path).ok();
                                }
                                return Ok(LinkAttempt::Linked(AddFileOutcome {
                                    entry_id,
                                    linked: false,
                                    rsize,
                                }));
                            }
                            break;
                        }
                    }
                }
            }
        }

        if tries_once && !hardlink_limit {
            if self.link_logcnt < 5 {
                warn!(dest = %req.dest_path.display(), "falling back to copy after link errors");
            } else if self.link_logcnt == 5 {
                warn!("more hardlink errors, skipping further messages");
            }
            self.link_logcnt += 1;
        }

        Ok(LinkAttempt::Copy {
            update_fileindex: tries_once || hardlink_limit,
        })
    }

    /// Candidate iterator of the dedup walk (see [`FindState`]).
    fn find_file_hash(
        &self,
        hash: &[u8; STRONG_HASH_LEN],
        filesize: i64,
        state: &mut FindState,
    ) -> Result<Option<FileEntry>> {
        let index = &self.env.index;

        let mut save_orig = false;
        let mut switch_all_clients = false;
        let mut switch_next_client = false;
        let mut entryid: i64 = 0;

        let prev_next = state.prev.as_ref().map(|p| p.next_entry).unwrap_or(0);
        let prev_prev = state.prev.as_ref().map(|p| p.prev_entry).unwrap_or(0);

        match state.state {
            0 => {
                entryid = index
                    .get_with_cache_prefer_client(&IndexKey::new(hash, filesize, self.clientid))?;
                state.state = 1;
                save_orig = true;
            }
            1 => {
                if prev_next != 0 {
                    entryid = prev_next;
                } else if state.orig_prev != 0 {
                    entryid = state.orig_prev;
                    state.state = 2;
                } else {
                    switch_all_clients = true;
                }
            }
            2 => {
                if prev_prev != 0 {
                    entryid = prev_prev;
                } else {
                    switch_all_clients = true;
                }
            }
            3 => {
                if prev_next == 0 {
                    if state.orig_prev != 0 {
                        entryid = state.orig_prev;
                        state.state = 4;
                    } else {
                        switch_next_client = true;
                    }
                } else {
                    entryid = prev_next;
                }
            }
            _ => {
                if prev_prev == 0 {
                    switch_next_client = true;
                } else {
                    entryid = prev_prev;
                }
            }
        }

        if switch_all_clients {
            state.state = 3;
            state.clients = index
                .all_clients(&IndexKey::new(hash, filesize, 0).prefix, filesize)?
                .into_iter()
                .collect();
            state.client_pos = 0;
            match state.clients.first() {
                Some(&(_, id)) => {
                    entryid = id;
                    save_orig = true;
                }
                None => entryid = 0,
            }
        }

        if switch_next_client {
            state.client_pos += 1;
            entryid = state
                .clients
                .get(state.client_pos)
                .map(|&(_, id)| id)
                .unwrap_or(0);
        }

        if entryid == 0 {
            return Ok(None);
        }

        let row = match entries::get_entry(&self.env.db, entryid)? {
            Some(row) => row,
            None => {
                debug!(entryid, "index names a missing entry; file entry index probably out of sync");
                return Ok(None);
            }
        };

        if row.shahash != hash.as_slice() || row.filesize != filesize {
            debug!(
                entryid,
                path = %row.fullpath,
                "entry hash differs from index result; possible index damage or hash collision, \
                 ignoring the stored file"
            );
            return Ok(None);
        }

        if save_orig {
            state.orig_prev = row.prev_entry;
        }

        state.prev = Some(row.clone());
        Ok(Some(row))
    }

    /// Give the linked destination a sidecar: copy the candidate's when it
    /// covers the payload, rebuild from the linked bytes otherwise; then
    /// stamp this entry's metadata.
    fn prepare_linked_sidecar(&self, req: &AddFileRequest, candidate: &FileEntry) -> Result<()> {
        let area = sidecar::hash_area_len(req.file_size as u64);

        let copied = !candidate.hashpath.is_empty()
            && fs::metadata(&candidate.hashpath)
                .map(|m| m.len() >= area)
                .unwrap_or(false)
            && fs::copy(&candidate.hashpath, &req.hash_dest_path).is_ok();

        let mut side = if copied {
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(&req.hash_dest_path)?
        } else {
            warn!(
                candidate = %candidate.hashpath,
                "candidate sidecar unusable, rebuilding from linked bytes"
            );
            let mut linked = self.open_retry(&req.dest_path, false)?;
            let mut side = self.open_retry(&req.hash_dest_path, true)?;
            let mut extents = ExtentIterator::new(req.extents.clone());
            sidecar::build_chunk_hashes(&mut linked, &mut side, Some(&mut extents), None)?;
            side
        };

        let meta = self.finalize_metadata(req, 0);
        sidecar::write_metadata(&mut side, req.file_size as u64, &meta)?;
        Ok(())
    }

    fn copy_with_sidecar(&self, req: &AddFileRequest, temp_path: &Path) -> Result<i64> {
        let mut src = File::open(temp_path)?;
        let mut dest = self.open_retry(&req.dest_path, true)?;
        let mut side = self.open_retry(&req.hash_dest_path, true)?;
        let mut extents = ExtentIterator::new(req.extents.clone());

        let build =
            sidecar::build_chunk_hashes(&mut src, &mut side, Some(&mut extents), Some(&mut dest))?;

        if build.strong_hash != req.strong_hash {
            // a file changing while it is read produces this; a full
            // backup of the path resolves it
            warn!(
                dest = %req.dest_path.display(),
                "announced content hash differs from the bytes received"
            );
        }

        let rsize = build.bytes_written as i64;
        let meta = self.finalize_metadata(req, rsize);
        sidecar::write_metadata(&mut side, req.file_size as u64, &meta)?;
        Ok(rsize)
    }

    fn copy_from_candidate(&self, req: &AddFileRequest, src: &mut File) -> Result<i64> {
        let mut dest = self.open_retry(&req.dest_path, true)?;
        let mut written = 0i64;
        let mut extent_iter = ExtentIterator::new(req.extents.clone());
        let mut curr_extent = extent_iter.next_extent();
        let total = SparseFile::len(src)? as i64;
        let mut buf = vec![0u8; 64 * 1024];
        let mut pos = 0i64;

        while pos < total {
            if let Some(e) = curr_extent {
                if e.offset <= pos && e.end() > pos {
                    dest.punch_hole(pos as u64, (e.end() - pos) as u64)?;
                    pos = e.end();
                    curr_extent = extent_iter.next_extent();
                    continue;
                }
            }
            let mut limit = total - pos;
            if let Some(e) = curr_extent {
                if e.offset > pos {
                    limit = limit.min(e.offset - pos);
                }
            }
            let n = (limit as usize).min(buf.len());
            let read = src.read_at(pos as u64, &mut buf[..n])?;
            if read == 0 {
                break;
            }
            dest.write_at(pos as u64, &buf[..read])?;
            written += read as i64;
            pos += read as i64;
        }

        if SparseFile::len(&mut dest)? < total as u64 {
            dest.resize(total as u64)?;
        }
        Ok(written)
    }

    fn patch_into_dest(&self, req: &AddFileRequest, patch: &PatchInput) -> Result<i64> {
        let mut source = self.open_retry(&patch.source, false)?;
        let mut patch_file = File::open(&patch.patch_file)?;
        let mut dest = self.open_retry(&req.dest_path, true)?;
        let mut extents = ExtentIterator::new(req.extents.clone());

        // base the destination on a copy-on-write clone of the old
        // version when the filesystem allows it; then only changed ranges
        // flow through the patcher and get written
        let cloned = sparse::reflink(&source, &dest);
        if cloned {
            debug!(source = %patch.source.display(), "patching onto a reflink of the old version");
        }

        // unchanged bytes only stream when the patcher must supply them,
        // so the inline hash check is limited to the plain-copy path; on
        // the clone path the hash from the prepare stage stands
        let verify = !cloned;

        let mut strong = StrongHash::new();
        let mut written = 0i64;

        let mut patcher = ChunkPatcher::new();
        patcher.set_require_unchanged(cloned);
        patcher.apply(&mut source, &mut patch_file, Some(&mut extents), |ev| {
            match ev {
                PatchEvent::Data { pos, buf, changed } => {
                    if verify {
                        strong.update(buf);
                    }
                    if changed || !cloned {
                        dest.write_at(pos as u64, buf)?;
                        written += buf.len() as i64;
                    }
                }
                PatchEvent::Sparse { pos, len } => {
                    dest.punch_hole(pos as u64, len as u64)?;
                }
            }
            Ok(())
        })?;

        if verify {
            for e in extents.extents() {
                strong.sparse_extent(e.offset, e.size);
            }
            if strong.finalize() != req.strong_hash {
                warn!(
                    dest = %req.dest_path.display(),
                    "announced content hash differs from the patched result"
                );
            }
        }

        let target_size = patcher.filesize() as u64;
        let dest_len = SparseFile::len(&mut dest)?;
        if dest_len != target_size {
            dest.resize(target_size)?;
        }

        // a clone with no changed bytes still occupies its full logical
        // size as far as accounting is concerned
        let rsize = if written > 0 || !cloned {
            written
        } else {
            req.file_size
        };

        // the transfer client refreshed this sidecar block by block
        fs::copy(&patch.hash_output, &req.hash_dest_path)?;
        let mut side = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&req.hash_dest_path)?;
        let meta = self.finalize_metadata(req, rsize);
        sidecar::write_metadata(&mut side, req.file_size as u64, &meta)?;

        Ok(rsize)
    }

    fn finalize_metadata(&self, req: &AddFileRequest, rsize: i64) -> FileMetadata {
        let mut meta = req.metadata.clone();
        meta.file_size = req.file_size;
        meta.rsize = rsize;
        meta.strong_hash = hex::encode(req.strong_hash);
        meta
    }

    fn ensure_free_space(&self, needed: u64, dest: &Path) -> Result<()> {
        let dir = dest.parent().unwrap_or(Path::new("."));
        let available = match sparse::free_space(dir) {
            Some(a) => a,
            None => return Ok(()),
        };

        if available.saturating_sub(FREESPACE_MOD) > needed {
            return Ok(());
        }

        warn!(needed, available, "no free space available, running cleanup");
        let _serialize = self
            .env
            .cleanup_lock
            .lock()
            .expect("cleanup mutex poisoned");

        let freed = match &self.env.cleanup {
            Some(cb) => cb(FREESPACE_MOD + needed),
            None => false,
        };

        let available = sparse::free_space(dir).unwrap_or(0);
        if freed && available.saturating_sub(FREESPACE_MOD) > needed {
            return Ok(());
        }

        Err(StoreError::Capacity {
            needed,
            path: dest.display().to_string(),
        })
    }

    /// Rewrite a dead candidate's paths against the current backup folder
    /// when they point into a historical one.
    fn correct_path(&mut self, entry: &mut FileEntry) -> Result<bool> {
        if self.old_folders.is_none() {
            self.old_folders = Some(self.env.db.old_backup_folders()?);
        }
        let backup_folder = self.env.backup_folder.to_string_lossy();

        for old in self.old_folders.as_deref().unwrap_or(&[]) {
            let old_prefix = format!("{}/", old.trim_end_matches('/'));
            let Some(rest) = entry.fullpath.strip_prefix(&old_prefix) else {
                continue;
            };

            let moved = format!("{}/{}", backup_folder.trim_end_matches('/'), rest);
            if File::open(&moved).is_err() {
                continue;
            }

            if let Some(hash_rest) = entry.hashpath.strip_prefix(&old_prefix) {
                entry.hashpath =
                    format!("{}/{}", backup_folder.trim_end_matches('/'), hash_rest);
            }
            entry.fullpath = moved;
            return Ok(true);
        }

        Ok(false)
    }

    fn open_retry(&self, path: &Path, create: bool) -> Result<File> {
        let mut opts = OpenOptions::new();
        opts.read(true);
        if create {
            opts.write(true).create(true).truncate(true);
        }

        let mut last_err = None;
        for attempt in 0..OPEN_RETRIES {
            match opts.open(path) {
                Ok(f) => return Ok(f),
                Err(e) => {
                    debug!(path = %path.display(), attempt, error = %e, "open failed, retrying");
                    last_err = Some(e);
                    std::thread::sleep(self.env.open_retry_wait);
                }
            }
        }
        Err(last_err
            .map(StoreError::Io)
            .unwrap_or_else(|| StoreError::Corruption("open retry loop without error".into())))
    }

    /// Remove one entry, rebalancing its list and index key. The physical
    /// file is left alone; unlinking it is the cleanup's business.
    pub fn delete_entry(
        &mut self,
        id: i64,
        journal: Option<&mut CorrectionJournal>,
    ) -> Result<()> {
        let entry = match entries::get_entry(&self.env.db, id)? {
            Some(e) => e,
            None => return Ok(()),
        };

        let fingerprint = IndexKey::new(&entry.shahash, entry.filesize, 0).prefix;
        let _guard = self.env.index.lock_key(fingerprint, entry.filesize);

        entries::delete_file_entry_loaded(&self.env.db, &self.env.index, &entry, journal, true)?;
        self.env.index.commit_transaction()
    }
}
