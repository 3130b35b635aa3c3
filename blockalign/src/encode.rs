//! The aligning encoder.
//!
//! The input stream is chunked content-defined; every chunk that already
//! appeared in the previous run (per the hash db) wants to land at its old
//! output offset, so unchanged content stays physically stable across
//! runs. Chunks with a future target offset wait in an offset-keyed
//! buffer, chunks with no prior match wait in an "anywhere" buffer that
//! plugs gaps, and zero-payload padding blocks fill whatever remains.
//!
//! While encoding, the table for the next run is written alongside the
//! container; the caller renames it over the old one on success.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use anyhow::{bail, Context};
use chunkstore::cdc::{self, AVG_CHUNK, MAX_CHUNK};
use tracing::debug;

use crate::hashdb::HashDb;

pub const MAGIC: &[u8; 12] = b"BLOCKALIGN#1";

/// Bytes of the u16 length header accounted by gap fitting.
const FIT_PAD: usize = 2;
/// Pending chunks farther than this get re-verified before we pad toward
/// them.
const DOUBLE_CHECK_LIM: i64 = 100 * 1024;
/// Upper bound on buffered chunk bytes.
const MAX_BACKLOG: usize = 10 * 1024 * 1024;
/// Read-buffer compaction period, in chunks.
const BUFFER_RESET: usize = 20;
/// Block-map marker of a padding block.
pub const PAD_MARKER: i32 = i32::MAX;

struct PendingChunk {
    crc: u32,
    data: Vec<u8>,
    input_pos: i64,
}

/// The two wait queues of the encoder.
#[derive(Default)]
struct OutputBuffer {
    size: usize,
    pending: BTreeMap<i64, Vec<PendingChunk>>,
    anywhere: Vec<PendingChunk>,
}

impl OutputBuffer {
    fn add(&mut self, offset: i64, chunk: PendingChunk) {
        self.size += chunk.data.len();
        self.pending.entry(offset).or_default().push(chunk);
    }

    fn add_anywhere(&mut self, chunk: PendingChunk) {
        self.size += chunk.data.len();
        self.anywhere.push(chunk);
    }

    /// Smallest pending offset at or after `from`.
    fn next_offset(&self, from: i64) -> Option<i64> {
        self.pending.range(from..).next().map(|(k, _)| *k)
    }

    fn peek_at(&self, offset: i64) -> Option<&PendingChunk> {
        self.pending.get(&offset).and_then(|v| v.first())
    }

    fn pop_at(&mut self, offset: i64) -> Option<PendingChunk> {
        let queue = self.pending.get_mut(&offset)?;
        let chunk = queue.remove(0);
        if queue.is_empty() {
            self.pending.remove(&offset);
        }
        self.size -= chunk.data.len();
        Some(chunk)
    }

    /// Largest anywhere-chunk that fits into `space` bytes: either exactly
    /// (its length header included) or leaving room for another header.
    fn best_fit(&mut self, space: usize, pad: usize) -> Option<PendingChunk> {
        if space < pad {
            return None;
        }

        let mut best: Option<usize> = None;
        for (i, chunk) in self.anywhere.iter().enumerate() {
            let len = chunk.data.len();
            let fits = len == space - pad || len + pad * 2 <= space;
            let better = best
                .map(|b| self.anywhere[b].data.len() < len)
                .unwrap_or(true);
            if fits && better {
                best = Some(i);
                if space == usize::MAX || len + pad == space {
                    break;
                }
            }
        }

        best.map(|i| {
            let chunk = self.anywhere.remove(i);
            self.size -= chunk.data.len();
            chunk
        })
    }

    fn size(&self) -> usize {
        self.size
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.anywhere.is_empty()
    }
}

/// Counters reported after an encode run.
#[derive(Debug, Default, Clone, Copy)]
pub struct EncodeStats {
    pub blocks: u64,
    pub chunk_bytes: u64,
    pub hashes_total: u64,
    pub hashes_found: u64,
}

impl EncodeStats {
    /// Mean on-disk block size including the length header.
    pub fn avg_block_size(&self) -> f64 {
        if self.blocks == 0 {
            return 0.0;
        }
        self.chunk_bytes as f64 / self.blocks as f64 + FIT_PAD as f64
    }

    pub fn found_ratio(&self) -> f64 {
        if self.hashes_total == 0 {
            return 0.0;
        }
        self.hashes_found as f64 / self.hashes_total as f64
    }
}

pub struct AlignEncoder<W: Write, H: Write> {
    out: W,
    hash_out: H,
    hashdb: HashDb,
    buffer: OutputBuffer,
    blockmap: Vec<i32>,
    nblock: u64,
    output_pos: i64,
    input_pos: i64,
    zeroes: Vec<u8>,
    stats: EncodeStats,
}

impl<W: Write, H: Write> AlignEncoder<W, H> {
    pub fn new(out: W, hash_out: H, hashdb: HashDb) -> Self {
        AlignEncoder {
            out,
            hash_out,
            hashdb,
            buffer: OutputBuffer::default(),
            blockmap: Vec::new(),
            nblock: 0,
            output_pos: 0,
            input_pos: 0,
            zeroes: vec![0u8; u16::MAX as usize],
            stats: EncodeStats::default(),
        }
    }

    /// Encode the whole input stream and finish the container.
    pub fn run(mut self, input: &mut impl Read) -> anyhow::Result<EncodeStats> {
        self.out
            .write_all(MAGIC)
            .and_then(|_| self.out.write_all(&AVG_CHUNK.to_le_bytes()))
            .context("writing container header")?;

        let mut buf = vec![0u8; MAX_CHUNK * BUFFER_RESET];
        let mut start = 0usize;
        let mut end = 0usize;
        let mut eof = false;

        loop {
            if !eof && end - start < MAX_CHUNK {
                if buf.len() - end < MAX_CHUNK {
                    buf.copy_within(start..end, 0);
                    end -= start;
                    start = 0;
                }
                while end - start < MAX_CHUNK && !eof {
                    let n = input.read(&mut buf[end..]).context("reading input")?;
                    if n == 0 {
                        eof = true;
                    } else {
                        end += n;
                    }
                }
            }

            if start == end {
                break;
            }

            let window_end = end.min(start + MAX_CHUNK);
            let boundary = cdc::next_chunk(&buf[start..window_end]);

            self.stats.hashes_total += 1;
            if self.hashdb.find_all(boundary.crc).is_some() {
                self.stats.hashes_found += 1;
            }

            let chunk = &buf[start..start + boundary.len];
            self.process_block(boundary.crc, chunk)?;

            self.input_pos += boundary.len as i64;
            start += boundary.len;
        }

        self.finish()
    }

    /// Place one freshly cut chunk per the alignment rules.
    fn process_block(&mut self, crc: u32, data: &[u8]) -> anyhow::Result<()> {
        let mut can_write = true;

        if let Some(pending_off) = self.buffer.next_offset(self.output_pos) {
            let mut write_pending = true;

            if !self.hashdb.has_error() && pending_off - self.output_pos > DOUBLE_CHECK_LIM {
                // the gap is large; only pad toward the pending chunk if
                // the current chunk confirms the old layout by matching
                // directly behind it
                let pending_len = self
                    .buffer
                    .peek_at(pending_off)
                    .map(|c| c.data.len())
                    .unwrap_or(0);
                let confirm = self.hashdb.find(crc, self.output_pos);
                let confirmed = confirm
                    .map(|(_, off)| off == pending_off + pending_len as i64 + FIT_PAD as i64)
                    .unwrap_or(false);

                if confirmed {
                    let (idx, _) = confirm.expect("confirmed match vanished");
                    self.hashdb.set_next_idx(idx);
                    self.fill_with_backlog(data.len())?;
                } else {
                    let chunk = self
                        .buffer
                        .pop_at(pending_off)
                        .expect("pending offset without chunk");
                    self.buffer.add_anywhere(chunk);
                    write_pending = false;
                }
            }

            if write_pending {
                self.write_zeroes(pending_off)?;
                let chunk = self
                    .buffer
                    .pop_at(pending_off)
                    .expect("pending offset without chunk");
                self.write_item(chunk.crc, &chunk.data, chunk.input_pos)?;
            }
        }

        match self.hashdb.find(crc, self.output_pos) {
            Some((idx, offset)) => {
                if offset == self.output_pos && can_write {
                    self.hashdb.set_next_idx(idx);
                    self.write_item(crc, data, self.input_pos)?;
                    return Ok(());
                }
                self.buffer.add(
                    offset,
                    PendingChunk {
                        crc,
                        data: data.to_vec(),
                        input_pos: self.input_pos,
                    },
                );
                if offset - self.output_pos > DOUBLE_CHECK_LIM {
                    can_write = false;
                }
            }
            None if self.hashdb.has_error() => {
                // no prior knowledge at all: stream straight through
                self.write_item(crc, data, self.input_pos)?;
                can_write = false;
            }
            None => {
                self.buffer.add_anywhere(PendingChunk {
                    crc,
                    data: data.to_vec(),
                    input_pos: self.input_pos,
                });
                can_write = false;
            }
        }

        if can_write {
            self.fill_with_backlog(data.len())?;
        } else {
            self.enforce_backlog()?;
        }
        Ok(())
    }

    /// Emit one block and its next-run hash record.
    fn write_item(&mut self, crc: u32, data: &[u8], input_pos: i64) -> anyhow::Result<()> {
        let avg_pos = self.nblock as i64 * AVG_CHUNK as i64;
        let blen = data.len() as u16;

        self.blockmap.push((input_pos - avg_pos) as i32);

        self.out.write_all(&blen.to_le_bytes())?;
        self.out.write_all(data)?;

        let pos_offset_output = (self.output_pos - avg_pos) as i32;
        self.hash_out.write_all(&crc.to_le_bytes())?;
        self.hash_out.write_all(&pos_offset_output.to_le_bytes())?;

        self.output_pos += FIT_PAD as i64 + data.len() as i64;
        self.nblock += 1;
        self.stats.blocks += 1;
        self.stats.chunk_bytes += data.len() as u64;
        Ok(())
    }

    /// Pad with zero-payload blocks until the write position reaches
    /// `offset`. Padding blocks get no hash record and a block-map marker.
    fn write_zeroes(&mut self, offset: i64) -> anyhow::Result<()> {
        while self.output_pos < offset {
            let blen = (offset - self.output_pos - FIT_PAD as i64)
                .clamp(0, u16::MAX as i64) as u16;

            self.out.write_all(&blen.to_le_bytes())?;
            self.out.write_all(&self.zeroes[..blen as usize])?;

            self.output_pos += FIT_PAD as i64 + blen as i64;
            self.blockmap.push(PAD_MARKER);
            self.nblock += 1;
        }
        Ok(())
    }

    /// Plug the gap before the next pending chunk with anywhere-chunks.
    fn fill_with_backlog(&mut self, fallback_space: usize) -> anyhow::Result<()> {
        loop {
            let available = match self.buffer.next_offset(self.output_pos) {
                Some(k) => (k - self.output_pos) as usize,
                None => fallback_space,
            };
            if available == 0 {
                break;
            }
            match self.buffer.best_fit(available, FIT_PAD) {
                Some(chunk) => self.write_item(chunk.crc, &chunk.data, chunk.input_pos)?,
                None => break,
            }
        }
        Ok(())
    }

    /// Force out one buffered chunk, alignment be damned. Returns false
    /// when nothing is buffered.
    fn flush_one(&mut self) -> anyhow::Result<bool> {
        if let Some(k) = self.buffer.next_offset(self.output_pos) {
            let chunk = self.buffer.pop_at(k).expect("pending offset without chunk");
            self.write_item(chunk.crc, &chunk.data, chunk.input_pos)?;
            return Ok(true);
        }
        match self.buffer.best_fit(usize::MAX, 6) {
            Some(chunk) => {
                self.write_item(chunk.crc, &chunk.data, chunk.input_pos)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn enforce_backlog(&mut self) -> anyhow::Result<()> {
        while self.buffer.size() > MAX_BACKLOG {
            if !self.flush_one()? {
                return Ok(());
            }
        }
        Ok(())
    }

    fn finish(mut self) -> anyhow::Result<EncodeStats> {
        while !self.buffer.is_empty() {
            if !self.flush_one()? {
                bail!("buffered chunks remain but none can be written");
            }
        }

        // align the body so the block-map region starts 4-byte aligned
        if self.output_pos % 4 != 0 {
            let base = self.output_pos + FIT_PAD as i64;
            let target = base + (8 - base % 4);
            self.write_zeroes(target)?;
        }

        for entry in &self.blockmap {
            self.out.write_all(&entry.to_le_bytes())?;
        }
        self.out
            .write_all(&(self.blockmap.len() as i64).to_le_bytes())?;
        self.out.flush()?;
        self.hash_out.flush()?;

        debug!(
            blocks = self.stats.blocks,
            found = self.stats.hashes_found,
            total = self.stats.hashes_total,
            "encode finished"
        );
        Ok(self.stats)
    }
}
