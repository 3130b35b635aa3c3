//! Per-file chunk-hash sidecars.
//!
//! A sidecar holds, for every 512 KiB checkpoint block of its payload file,
//! one fixed-size record: the 16-byte block hash followed by 128 adler32
//! sub-chunk hashes. After the records comes a JSON metadata blob, followed
//! by its own little-endian u32 length, so the sidecar is self-describing
//! from the tail.
//!
//! Sidecars are the local knowledge both ends of the block-diff transfer
//! compare against, and they travel with stored files when entries are
//! hard-linked.

use std::fs::File;

use serde::{Deserialize, Serialize};

use crate::hash::{self, BigHash, StrongHash, BIG_HASH_LEN, SMALL_HASH_LEN, STRONG_HASH_LEN};
use crate::sparse::{ExtentIterator, SparseFile};
use crate::{Result, StoreError};

/// Transfer checkpoint block size.
pub const CHECKPOINT_SIZE: u64 = 512 * 1024;
/// Transfer sub-chunk size.
pub const SUBCHUNK_SIZE: usize = 4096;
/// Sub-chunks per checkpoint block.
pub const SMALL_PER_BLOCK: usize = (CHECKPOINT_SIZE as usize) / SUBCHUNK_SIZE;
/// On-disk size of one sidecar record.
pub const RECORD_LEN: usize = BIG_HASH_LEN + SMALL_PER_BLOCK * SMALL_HASH_LEN;

/// Hashes of one checkpoint block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHashes {
    pub big: [u8; BIG_HASH_LEN],
    pub small: [u32; SMALL_PER_BLOCK],
}

impl Default for BlockHashes {
    fn default() -> Self {
        BlockHashes {
            big: [0; BIG_HASH_LEN],
            small: [0; SMALL_PER_BLOCK],
        }
    }
}

impl BlockHashes {
    pub fn to_bytes(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[..BIG_HASH_LEN].copy_from_slice(&self.big);
        for (i, s) in self.small.iter().enumerate() {
            let at = BIG_HASH_LEN + i * SMALL_HASH_LEN;
            out[at..at + SMALL_HASH_LEN].copy_from_slice(&s.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(raw: &[u8; RECORD_LEN]) -> Self {
        let mut big = [0u8; BIG_HASH_LEN];
        big.copy_from_slice(&raw[..BIG_HASH_LEN]);
        let mut small = [0u32; SMALL_PER_BLOCK];
        for (i, s) in small.iter_mut().enumerate() {
            let at = BIG_HASH_LEN + i * SMALL_HASH_LEN;
            *s = u32::from_le_bytes(raw[at..at + SMALL_HASH_LEN].try_into().unwrap());
        }
        BlockHashes { big, small }
    }
}

/// Metadata blob stored in the sidecar tail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub orig_path: String,
    pub file_size: i64,
    /// Physical bytes written for this copy; 0 when hard-linked.
    pub rsize: i64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub created: i64,
    pub modified: i64,
    /// Hex of the 512-bit content hash (data plus sparse shape).
    pub strong_hash: String,
}

/// Number of sidecar hash bytes for a payload of `file_size` bytes.
pub fn hash_area_len(file_size: u64) -> u64 {
    file_size.div_ceil(CHECKPOINT_SIZE) * RECORD_LEN as u64
}

/// Write the record for checkpoint block `index`.
pub fn write_record(sidecar: &mut File, index: u64, hashes: &BlockHashes) -> Result<()> {
    sidecar.write_at(index * RECORD_LEN as u64, &hashes.to_bytes())?;
    Ok(())
}

/// Read the record for checkpoint block `index`, or `None` when the sidecar
/// does not cover that block.
pub fn read_record(sidecar: &mut File, index: u64) -> Result<Option<BlockHashes>> {
    let mut raw = [0u8; RECORD_LEN];
    let n = sidecar.read_at(index * RECORD_LEN as u64, &mut raw)?;
    if n < RECORD_LEN {
        return Ok(None);
    }
    Ok(Some(BlockHashes::from_bytes(&raw)))
}

/// Truncate the sidecar to its hash area and append a fresh metadata blob.
pub fn write_metadata(sidecar: &mut File, file_size: u64, metadata: &FileMetadata) -> Result<()> {
    let area = hash_area_len(file_size);
    sidecar.resize(area)?;
    let blob = serde_json::to_vec(metadata)?;
    sidecar.write_at(area, &blob)?;
    sidecar.write_at(area + blob.len() as u64, &(blob.len() as u32).to_le_bytes())?;
    Ok(())
}

/// Read the metadata blob back from the sidecar tail.
pub fn read_metadata(sidecar: &mut File) -> Result<FileMetadata> {
    let total = SparseFile::len(sidecar)?;
    if total < 4 {
        return Err(StoreError::Corruption("sidecar too short for metadata".into()));
    }
    let mut len_raw = [0u8; 4];
    sidecar.read_at(total - 4, &mut len_raw)?;
    let blob_len = u32::from_le_bytes(len_raw) as u64;
    if blob_len + 4 > total {
        return Err(StoreError::Corruption("sidecar metadata length out of range".into()));
    }
    let mut blob = vec![0u8; blob_len as usize];
    let n = sidecar.read_at(total - 4 - blob_len, &mut blob)?;
    if n as u64 != blob_len {
        return Err(StoreError::Corruption("sidecar metadata truncated".into()));
    }
    Ok(serde_json::from_slice(&blob)?)
}

/// Result of a sidecar build pass.
pub struct BuildResult {
    pub strong_hash: [u8; STRONG_HASH_LEN],
    pub file_size: u64,
    /// Data bytes written to the destination (0 without a destination).
    pub bytes_written: u64,
}

/// Build the chunk-hash sidecar for `src`, optionally copying the payload
/// into `dst` in the same pass.
///
/// Sub-chunks covered by a sparse extent are treated as zeros without
/// reading them, are punched in the destination, and contribute their
/// `(offset, size)` coordinates to the strong hash instead of bytes.
/// Extent coordinates must be sub-chunk aligned.
pub fn build_chunk_hashes(
    src: &mut File,
    sidecar: &mut File,
    mut extent_iter: Option<&mut ExtentIterator>,
    mut dst: Option<&mut File>,
) -> Result<BuildResult> {
    let file_size = SparseFile::len(src)?;
    let nblocks = file_size.div_ceil(CHECKPOINT_SIZE);

    let mut strong = StrongHash::new();
    let mut bytes_written = 0u64;
    let mut curr_extent = extent_iter.as_mut().and_then(|it| it.next_extent());
    let mut buf = vec![0u8; SUBCHUNK_SIZE];

    for block in 0..nblocks {
        let block_start = block * CHECKPOINT_SIZE;
        let block_len = (file_size - block_start).min(CHECKPOINT_SIZE);

        let mut big = BigHash::new();
        let mut hashes = BlockHashes::default();

        let mut sub = 0usize;
        let mut pos = 0u64;
        while pos < block_len {
            let sub_len = ((block_len - pos) as usize).min(SUBCHUNK_SIZE);
            let abs = (block_start + pos) as i64;

            // advance past extents that end before this sub-chunk
            while let Some(e) = curr_extent {
                if e.end() > abs {
                    break;
                }
                curr_extent = extent_iter.as_mut().and_then(|it| it.next_extent());
            }

            let in_hole = curr_extent
                .map(|e| e.offset <= abs && e.end() >= abs + sub_len as i64)
                .unwrap_or(false);

            if in_hole {
                let e = curr_extent.unwrap();
                if e.offset == abs {
                    // first covered sub-chunk of this extent
                    strong.sparse_extent(e.offset, e.size);
                    if let Some(d) = dst.as_deref_mut() {
                        d.punch_hole(e.offset as u64, e.size as u64)?;
                    }
                }
                buf[..sub_len].fill(0);
            } else {
                let n = src.read_at(block_start + pos, &mut buf[..sub_len])?;
                // a concurrently truncated source reads short; pad the
                // remainder with zeros so the record stays deterministic
                buf[n..sub_len].fill(0);
                strong.update(&buf[..sub_len]);
                if let Some(d) = dst.as_deref_mut() {
                    d.write_at(block_start + pos, &buf[..sub_len])?;
                    bytes_written += sub_len as u64;
                }
            }

            big.update(&buf[..sub_len]);
            hashes.small[sub] = hash::small_hash(&buf[..sub_len]);

            sub += 1;
            pos += sub_len as u64;
        }

        hashes.big = big.finalize();
        write_record(sidecar, block, &hashes)?;
    }

    if let Some(d) = dst {
        if SparseFile::len(d)? < file_size {
            d.resize(file_size)?;
        }
    }

    Ok(BuildResult {
        strong_hash: strong.finalize(),
        file_size,
        bytes_written,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::SparseExtent;
    use rand::{RngCore, SeedableRng};
    use std::io::{Read, Seek, SeekFrom, Write};

    fn temp_with(data: &[u8]) -> File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(data).unwrap();
        f
    }

    fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut data = vec![0u8; len];
        rng.fill_bytes(&mut data);
        data
    }

    #[test]
    fn record_roundtrip() {
        let mut r = BlockHashes::default();
        r.big = [7u8; BIG_HASH_LEN];
        r.small[0] = 1;
        r.small[127] = 0xDEADBEEF;
        assert_eq!(BlockHashes::from_bytes(&r.to_bytes()), r);
    }

    #[test]
    fn build_produces_expected_record_count() {
        let data = random_bytes(11, (CHECKPOINT_SIZE + 1000) as usize);
        let mut src = temp_with(&data);
        let mut side = tempfile::tempfile().unwrap();

        let res = build_chunk_hashes(&mut src, &mut side, None, None).unwrap();
        assert_eq!(res.file_size, data.len() as u64);
        assert_eq!(
            SparseFile::len(&mut side).unwrap(),
            hash_area_len(data.len() as u64)
        );
        assert_eq!(hash_area_len(data.len() as u64), 2 * RECORD_LEN as u64);

        // big hash of the first full block must match a direct md5
        let rec = read_record(&mut side, 0).unwrap().unwrap();
        assert_eq!(rec.big, hash::big_hash(&data[..CHECKPOINT_SIZE as usize]));
    }

    #[test]
    fn build_tees_payload_into_destination() {
        let data = random_bytes(12, 700_000);
        let mut src = temp_with(&data);
        let mut side = tempfile::tempfile().unwrap();
        let mut dst = tempfile::tempfile().unwrap();

        let res = build_chunk_hashes(&mut src, &mut side, None, Some(&mut dst)).unwrap();
        assert_eq!(res.bytes_written, data.len() as u64);

        let mut copied = Vec::new();
        dst.seek(SeekFrom::Start(0)).unwrap();
        dst.read_to_end(&mut copied).unwrap();
        assert_eq!(copied, data);
    }

    #[test]
    fn sparse_extents_change_strong_hash_only_by_shape() {
        // file of zeros: hashing it with a declared hole differs from
        // hashing it plain, even though every byte is equal
        let data = vec![0u8; (2 * CHECKPOINT_SIZE) as usize];
        let mut plain_src = temp_with(&data);
        let mut plain_side = tempfile::tempfile().unwrap();
        let plain = build_chunk_hashes(&mut plain_src, &mut plain_side, None, None).unwrap();

        let mut sparse_src = temp_with(&data);
        let mut sparse_side = tempfile::tempfile().unwrap();
        let mut it = ExtentIterator::new(vec![SparseExtent {
            offset: CHECKPOINT_SIZE as i64,
            size: CHECKPOINT_SIZE as i64,
        }]);
        let sparse =
            build_chunk_hashes(&mut sparse_src, &mut sparse_side, Some(&mut it), None).unwrap();

        assert_ne!(plain.strong_hash, sparse.strong_hash);

        // the per-block records are equal: holes read as zeros either way
        let a = read_record(&mut plain_side, 1).unwrap().unwrap();
        let b = read_record(&mut sparse_side, 1).unwrap().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn identical_layouts_produce_identical_sidecars() {
        let data = random_bytes(13, 600_000);
        let mut out = Vec::new();
        for _ in 0..2 {
            let mut src = temp_with(&data);
            let mut side = tempfile::tempfile().unwrap();
            build_chunk_hashes(&mut src, &mut side, None, None).unwrap();
            let mut raw = Vec::new();
            side.seek(SeekFrom::Start(0)).unwrap();
            side.read_to_end(&mut raw).unwrap();
            out.push(raw);
        }
        assert_eq!(out[0], out[1]);
    }

    #[test]
    fn metadata_roundtrip() {
        let data = random_bytes(14, 10_000);
        let mut src = temp_with(&data);
        let mut side = tempfile::tempfile().unwrap();
        let res = build_chunk_hashes(&mut src, &mut side, None, None).unwrap();

        let meta = FileMetadata {
            orig_path: "/clients/alpha/docs/report.bin".into(),
            file_size: data.len() as i64,
            rsize: data.len() as i64,
            uid: 1000,
            gid: 1000,
            mode: 0o644,
            created: 1_700_000_000,
            modified: 1_700_000_100,
            strong_hash: hex::encode(res.strong_hash),
        };
        write_metadata(&mut side, data.len() as u64, &meta).unwrap();
        assert_eq!(read_metadata(&mut side).unwrap(), meta);

        // records survive the metadata append
        assert!(read_record(&mut side, 0).unwrap().is_some());
    }
}
