//! Chunk-level patch application.
//!
//! A patch stream is a sequence of `(i64 pos, u32 len, payload)` records in
//! little-endian, opened by a size record (`pos = -1`, `len = 8`, payload =
//! target file size). Ranges of the target not covered by a record come
//! from the source file at the same offset; ranges declared sparse by the
//! extent iterator are holes and are never read from either side.
//!
//! The patcher walks the target address space once and reports it to a sink
//! as a series of events, so the same pass can write a file, feed a hasher,
//! or both.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crate::hash::{StrongHash, STRONG_HASH_LEN};
use crate::sparse::{ExtentIterator, SparseFile};
use crate::{Result, StoreError};

const IO_CHUNK: usize = 32 * 1024;

/// Marker position of the patch stream's size record.
pub const PATCH_SIZE_RECORD: i64 = -1;

/// One slice of the reconstructed target, in ascending position order.
#[derive(Debug)]
pub enum PatchEvent<'a> {
    /// Bytes at `pos`; `changed` is true when they came from the patch
    /// stream rather than the unchanged source.
    Data {
        pos: i64,
        buf: &'a [u8],
        changed: bool,
    },
    /// A sparse region: logically zero, physically absent.
    Sparse { pos: i64, len: i64 },
}

/// Applies a patch stream to a source file.
#[derive(Debug, Default)]
pub struct ChunkPatcher {
    require_unchanged: bool,
    filesize: i64,
    cow_filesize: u64,
}

impl ChunkPatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, ranges not covered by a patch record are skipped entirely
    /// instead of being read and reported: the destination already shares
    /// those bytes with the source (a reflink or hardlink of it).
    pub fn set_require_unchanged(&mut self, v: bool) {
        self.require_unchanged = v;
    }

    pub fn require_unchanged(&self) -> bool {
        self.require_unchanged
    }

    /// Target file size announced by the last applied patch stream.
    pub fn filesize(&self) -> i64 {
        self.filesize
    }

    /// Bytes that physically changed during the last apply.
    pub fn cow_filesize(&self) -> u64 {
        self.cow_filesize
    }

    /// Apply `patch` to `source`, reporting the reconstructed target to
    /// `sink` in ascending position order.
    pub fn apply<F>(
        &mut self,
        source: &mut File,
        patch: &mut File,
        mut extents: Option<&mut ExtentIterator>,
        mut sink: F,
    ) -> Result<()>
    where
        F: FnMut(PatchEvent<'_>) -> Result<()>,
    {
        let (filesize, records) = scan_patch(patch)?;
        self.filesize = filesize;
        self.cow_filesize = 0;

        if let Some(it) = extents.as_deref_mut() {
            it.reset();
        }
        let mut curr_extent = extents.as_deref_mut().and_then(|it| it.next_extent());

        let mut buf = vec![0u8; IO_CHUNK];
        let mut cursor: i64 = 0;
        let mut next_records = records.iter();
        let mut next_record = next_records.next();

        while cursor < filesize {
            // drop extents and records that end at or before the cursor
            while let Some(e) = curr_extent {
                if e.end() > cursor {
                    break;
                }
                curr_extent = extents.as_deref_mut().and_then(|it| it.next_extent());
            }
            while let Some((pos, loc)) = next_record {
                if *pos + loc.len as i64 > cursor {
                    break;
                }
                next_record = next_records.next();
            }

            if let Some((pos, loc)) = next_record {
                if *pos <= cursor {
                    // patched bytes (entered mid-record only after overlap)
                    let skip = (cursor - *pos) as u64;
                    let len = loc.len as i64 - skip as i64;
                    self.emit_patch_bytes(patch, loc.offset + skip, cursor, len, &mut buf, &mut sink)?;
                    self.cow_filesize += len as u64;
                    cursor += len;
                    next_record = next_records.next();
                    continue;
                }
            }

            let mut bound = filesize;
            if let Some((pos, _)) = next_record {
                bound = bound.min(*pos);
            }

            if let Some(e) = curr_extent {
                if e.offset <= cursor {
                    let end = e.end().min(bound).min(filesize);
                    sink(PatchEvent::Sparse {
                        pos: cursor,
                        len: end - cursor,
                    })?;
                    cursor = end;
                    continue;
                }
                bound = bound.min(e.offset);
            }

            // unchanged range
            if self.require_unchanged {
                // the destination holds these bytes already
                cursor = bound;
                continue;
            }

            let mut remaining = bound - cursor;
            while remaining > 0 {
                let n = (remaining as usize).min(IO_CHUNK);
                let read = source.read_at(cursor as u64, &mut buf[..n])?;
                if read == 0 {
                    return Err(StoreError::Corruption(format!(
                        "patch source ends at {} but target needs {} bytes",
                        cursor, filesize
                    )));
                }
                sink(PatchEvent::Data {
                    pos: cursor,
                    buf: &buf[..read],
                    changed: false,
                })?;
                cursor += read as i64;
                remaining -= read as i64;
            }
        }

        Ok(())
    }

    fn emit_patch_bytes<F>(
        &mut self,
        patch: &mut File,
        mut at: u64,
        mut pos: i64,
        len: i64,
        buf: &mut [u8],
        sink: &mut F,
    ) -> Result<()>
    where
        F: FnMut(PatchEvent<'_>) -> Result<()>,
    {
        let mut remaining = len;
        while remaining > 0 {
            let n = (remaining as usize).min(buf.len());
            let read = patch.read_at(at, &mut buf[..n])?;
            if read < n {
                return Err(StoreError::Corruption("patch stream truncated".into()));
            }
            sink(PatchEvent::Data {
                pos,
                buf: &buf[..n],
                changed: true,
            })?;
            at += n as u64;
            pos += n as i64;
            remaining -= n as i64;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct RecordLocation {
    /// Byte offset of the payload inside the patch file.
    offset: u64,
    len: u32,
}

/// Index the patch stream: target size plus position-ordered records.
///
/// Records are indexed rather than streamed so that out-of-order entries
/// (a retried block appended late) still apply in ascending target order.
fn scan_patch(patch: &mut File) -> Result<(i64, BTreeMap<i64, RecordLocation>)> {
    patch.seek(SeekFrom::Start(0))?;

    let mut header = [0u8; 12];
    let mut records = BTreeMap::new();
    let mut filesize: Option<i64> = None;
    let mut off = 0u64;

    loop {
        match read_exact_or_eof(patch, &mut header)? {
            0 => break,
            n if n < header.len() => {
                return Err(StoreError::Corruption("patch record header truncated".into()))
            }
            _ => {}
        }
        let pos = i64::from_le_bytes(header[..8].try_into().unwrap());
        let len = u32::from_le_bytes(header[8..].try_into().unwrap());
        off += 12;

        if pos == PATCH_SIZE_RECORD {
            if len != 8 {
                return Err(StoreError::Corruption("bad patch size record".into()));
            }
            let mut raw = [0u8; 8];
            if read_exact_or_eof(patch, &mut raw)? != 8 {
                return Err(StoreError::Corruption("patch size record truncated".into()));
            }
            filesize = Some(i64::from_le_bytes(raw));
            off += 8;
            continue;
        }

        if pos < 0 {
            return Err(StoreError::Corruption(format!("negative patch position {}", pos)));
        }
        records.insert(pos, RecordLocation { offset: off, len });
        off += len as u64;
        patch.seek(SeekFrom::Start(off))?;
    }

    let filesize =
        filesize.ok_or_else(|| StoreError::Corruption("patch stream has no size record".into()))?;

    for (pos, loc) in &records {
        if pos + loc.len as i64 > filesize {
            return Err(StoreError::Corruption(format!(
                "patch record at {} overruns target size {}",
                pos, filesize
            )));
        }
    }

    Ok((filesize, records))
}

fn read_exact_or_eof(f: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match f.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(read)
}

/// Write one patch record.
pub fn write_patch_record(patch: &mut File, pos: i64, payload: &[u8]) -> Result<()> {
    use std::io::Write;
    patch.write_all(&pos.to_le_bytes())?;
    patch.write_all(&(payload.len() as u32).to_le_bytes())?;
    patch.write_all(payload)?;
    Ok(())
}

/// Write the opening size record of a patch stream.
pub fn write_patch_size(patch: &mut File, filesize: i64) -> Result<()> {
    write_patch_record(patch, PATCH_SIZE_RECORD, &filesize.to_le_bytes())
}

/// Strong hash of the file a patch stream would reconstruct, without
/// materializing it.
///
/// Matches [`crate::sidecar::build_chunk_hashes`] over the reconstructed
/// bytes with the same extent list: data feeds the content digest, each
/// extent tuple feeds the shape digest once.
pub fn hash_with_patch(
    source: &mut File,
    patch: &mut File,
    mut extents: Option<&mut ExtentIterator>,
) -> Result<[u8; STRONG_HASH_LEN]> {
    let mut strong = StrongHash::new();

    let mut patcher = ChunkPatcher::new();
    patcher.apply(source, patch, extents.as_deref_mut(), |ev| {
        if let PatchEvent::Data { buf, .. } = ev {
            strong.update(buf);
        }
        Ok(())
    })?;

    if let Some(it) = extents {
        it.reset();
        while let Some(e) = it.next_extent() {
            strong.sparse_extent(e.offset, e.size);
        }
    }

    Ok(strong.finalize())
}
