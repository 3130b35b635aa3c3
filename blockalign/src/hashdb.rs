//! Memory-mapped hash table of the previous encoder run.
//!
//! The file is a flat array of `(u32 crc, i32 signed_offset)` records in
//! little-endian, one per block written last time. Record `i` encoded a
//! block whose output position was `i * AVG + signed_offset`. A missing or
//! unreadable file puts the table into an error state in which every
//! lookup misses; the encoder then behaves as if it had no prior
//! knowledge.

use std::fs::File;

use chunkstore::cdc::AVG_CHUNK;
use memmap2::Mmap;
use tracing::debug;

/// Forward-scan window of [`HashDb::find`], in records.
pub const HASH_SEARCH_LIMIT: usize = 10_000;

pub struct HashDb {
    map: Option<Mmap>,
    /// Number of i32 slots (two per record).
    num_slots: usize,
    next_idx: usize,
    has_error: bool,
}

impl HashDb {
    pub fn open(path: &str) -> Self {
        let mapped = File::open(path).and_then(|f| {
            let len = f.metadata()?.len();
            // safety: the previous-run table is never written while mapped
            let map = unsafe { Mmap::map(&f)? };
            Ok((map, len))
        });

        match mapped {
            Ok((map, len)) => HashDb {
                num_slots: (len / 4) as usize,
                map: Some(map),
                next_idx: 0,
                has_error: false,
            },
            Err(e) => {
                debug!(path, error = %e, "no usable hash db, encoding without prior knowledge");
                HashDb {
                    map: None,
                    num_slots: 0,
                    next_idx: 0,
                    has_error: true,
                }
            }
        }
    }

    pub fn has_error(&self) -> bool {
        self.has_error
    }

    fn slot(&self, i: usize) -> u32 {
        let raw = self.map.as_ref().expect("slot read on errored hash db");
        u32::from_le_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap())
    }

    /// First record at or after the scan cursor whose crc matches and
    /// whose reconstructed offset is `>= min_offset`, within the bounded
    /// forward window. Returns `(slot_index, offset)`.
    pub fn find(&self, crc: u32, min_offset: i64) -> Option<(usize, i64)> {
        if self.has_error {
            return None;
        }
        let end = self.next_idx + HASH_SEARCH_LIMIT * 2;
        let mut i = self.next_idx;
        while i < end && i + 1 < self.num_slots {
            if self.slot(i) == crc {
                let avg_offset = (i / 2) as i64 * AVG_CHUNK as i64;
                let b_offset = avg_offset + self.slot(i + 1) as i32 as i64;
                if b_offset >= min_offset {
                    return Some((i, b_offset));
                }
            }
            i += 2;
        }
        None
    }

    /// Unbounded scan from the start of the table; used for whole-run
    /// match statistics.
    pub fn find_all(&self, crc: u32) -> Option<(usize, i64)> {
        if self.has_error {
            return None;
        }
        let mut i = 0;
        while i + 1 < self.num_slots {
            if self.slot(i) == crc {
                let avg_offset = (i / 2) as i64 * AVG_CHUNK as i64;
                return Some((i, avg_offset + self.slot(i + 1) as i32 as i64));
            }
            i += 2;
        }
        None
    }

    /// Advance the forward-scan cursor after a confirmed match.
    pub fn set_next_idx(&mut self, idx: usize) {
        self.next_idx = idx;
    }
}
