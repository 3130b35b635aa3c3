//! Initiator side of the block-diff transfer.
//!
//! For every checkpoint block the client sends the hashes of its old copy
//! (or `transfer_all` when it has none) and applies whatever the server
//! answers: nothing, individual sub-chunks, or the whole block. Replies
//! arrive in request order, so a single reader drives a pipeline of up to
//! [`MAX_QUEUED_CHUNKS`](super::MAX_QUEUED_CHUNKS) outstanding requests.
//!
//! Whole-block payloads are verified against the trailing `BLOCK_HASH`
//! before they touch the target; a mismatch re-requests the block once and
//! then fails the file.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Write};

use tracing::{debug, warn};

use crate::hash::{self, BIG_HASH_LEN};
use crate::patcher::{write_patch_record, write_patch_size};
use crate::protocol::{read_reply, write_request, BlockRequest, Reply, Request};
use crate::sidecar::{self, BlockHashes, CHECKPOINT_SIZE, SUBCHUNK_SIZE};
use crate::sparse::{SparseExtent, SparseFile};
use crate::transfer::MAX_QUEUED_CHUNKS;
use crate::{Result, StoreError};

/// Where received bytes go.
pub enum TransferMode<'a> {
    /// Write changed ranges directly into the target file.
    InPlace { file: &'a mut File },
    /// Emit a patch stream for [`crate::patcher::ChunkPatcher`].
    Patch { patch: &'a mut File },
}

/// Session parameters.
pub struct FetchOptions {
    /// Byte range of the old file covered by the old sidecar.
    pub old_hash_size: u64,
    /// Outstanding request limit; clamped to the protocol maximum.
    pub max_queued: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        FetchOptions {
            old_hash_size: 0,
            max_queued: MAX_QUEUED_CHUNKS,
        }
    }
}

/// Outcome of a completed session.
#[derive(Debug)]
pub struct TransferResult {
    pub remote_size: i64,
    /// Hole layout announced by the server, already applied in in-place
    /// mode; patch-mode callers hand it to the patcher.
    pub extents: Vec<SparseExtent>,
    /// Payload bytes received (update chunks plus whole blocks).
    pub transferred_bytes: u64,
}

struct PendingBlock {
    index: u64,
    start: i64,
    /// Record of the old sidecar, the basis for `NO_CHANGE` and partial
    /// updates.
    old_rec: Option<BlockHashes>,
    /// Working copy of the new sidecar record for this block.
    new_rec: BlockHashes,
    /// Whole-block payload held back until its hash verifies.
    whole: Option<Vec<u8>>,
    saw_update: bool,
    retried: bool,
}

struct BlockPlan {
    index: u64,
    transfer_all: bool,
    retried: bool,
}

/// Fetch the remote file over an established pipe.
///
/// The hashes of the client's old copy come from `old_sidecar`, absent for
/// a full download. The refreshed sidecar records are written to
/// `new_sidecar` as replies arrive (its metadata blob is the caller's
/// business).
pub fn fetch<R: Read, W: Write>(
    rx: &mut R,
    tx: &mut W,
    mut old_sidecar: Option<&mut File>,
    new_sidecar: &mut File,
    mut mode: TransferMode<'_>,
    opts: FetchOptions,
) -> Result<TransferResult> {
    let max_queued = opts.max_queued.clamp(1, MAX_QUEUED_CHUNKS);

    write_request(
        tx,
        &Request::StartSession {
            hash_size: opts.old_hash_size,
        },
    )?;
    tx.flush()?;

    let (remote_size, extents) = match read_reply(rx)? {
        Reply::FileSize { size } => (size as i64, Vec::new()),
        Reply::FileSizeAndExtents { size, extents } => (size as i64, extents),
        Reply::CouldntOpen => {
            return Err(StoreError::Protocol("server could not open the file".into()))
        }
        Reply::BaseDirLost => {
            return Err(StoreError::Protocol("server lost its base directory".into()))
        }
        other => {
            return Err(StoreError::Protocol(format!(
                "expected session open, got {:?}",
                other
            )))
        }
    };

    if let TransferMode::Patch { patch } = &mut mode {
        write_patch_size(patch, remote_size)?;
    }

    let nblocks = (remote_size as u64).div_ceil(CHECKPOINT_SIZE);
    let mut plans: VecDeque<BlockPlan> = (0..nblocks)
        .map(|index| BlockPlan {
            index,
            transfer_all: false,
            retried: false,
        })
        .collect();

    let mut pending: VecDeque<PendingBlock> = VecDeque::new();
    let mut transferred = 0u64;

    while !plans.is_empty() || !pending.is_empty() {
        // keep the request window full
        while pending.len() < max_queued {
            let Some(plan) = plans.pop_front() else { break };
            let start = (plan.index * CHECKPOINT_SIZE) as i64;

            let old_rec = if plan.transfer_all {
                None
            } else {
                match old_sidecar.as_deref_mut() {
                    Some(sc) if (start as u64) < opts.old_hash_size => {
                        sidecar::read_record(sc, plan.index)?
                    }
                    _ => None,
                }
            };

            let request = BlockRequest {
                start,
                transfer_all: old_rec.is_none(),
                hashes: old_rec.clone().unwrap_or_default(),
            };
            // one buffered write per request so a full pipeline never
            // interleaves with reply reads mid-frame
            let mut frame = Vec::with_capacity(600);
            write_request(&mut frame, &Request::Block(request))?;
            tx.write_all(&frame)?;

            pending.push_back(PendingBlock {
                index: plan.index,
                start,
                new_rec: old_rec.clone().unwrap_or_default(),
                old_rec,
                whole: None,
                saw_update: false,
                retried: plan.retried,
            });
        }
        tx.flush()?;

        // drive the front block until its terminating reply
        let front = pending.front_mut().expect("request window is empty");
        let outcome = match read_reply(rx)? {
            Reply::NoChange { start } => {
                expect_start(front.start, start)?;
                let rec = front.old_rec.clone().ok_or_else(|| {
                    StoreError::Protocol("NO_CHANGE for a block without local hashes".into())
                })?;
                sidecar::write_record(new_sidecar, front.index, &rec)?;
                Outcome::Done
            }
            Reply::UpdateChunk { pos, size } => {
                let block_end = front.start + CHECKPOINT_SIZE as i64;
                if pos < front.start || pos + size as i64 > block_end {
                    return Err(StoreError::Protocol(format!(
                        "update chunk at {} outside block {}",
                        pos, front.start
                    )));
                }
                let mut payload = vec![0u8; size as usize];
                rx.read_exact(&mut payload)?;
                transferred += size as u64;
                front.saw_update = true;

                if !payload.is_empty() {
                    let sub = ((pos - front.start) as usize) / SUBCHUNK_SIZE;
                    front.new_rec.small[sub] = hash::small_hash(&payload);
                    match &mut mode {
                        TransferMode::InPlace { file } => file.write_at(pos as u64, &payload)?,
                        TransferMode::Patch { patch } => write_patch_record(patch, pos, &payload)?,
                    }
                }
                Outcome::Streaming
            }
            Reply::WholeBlock { start, size } => {
                expect_start(front.start, start)?;
                let mut payload = vec![0u8; size as usize];
                rx.read_exact(&mut payload)?;
                transferred += size as u64;
                front.whole = Some(payload);
                Outcome::Streaming
            }
            Reply::BlockHash { start, hash } => {
                expect_start(front.start, start)?;
                if finish_block(front, hash, new_sidecar, &mut mode)? {
                    Outcome::Done
                } else {
                    warn!(start, "received block failed its hash check");
                    Outcome::Retry
                }
            }
            Reply::BlockError { code1, code2 } => {
                return Err(StoreError::Block { code1, code2 });
            }
            other => {
                return Err(StoreError::Protocol(format!(
                    "unexpected reply {:?} inside block",
                    other
                )))
            }
        };

        match outcome {
            Outcome::Streaming => {}
            Outcome::Done => {
                pending.pop_front();
            }
            Outcome::Retry => {
                let failed = pending.pop_front().expect("retry without a front block");
                if failed.retried {
                    return Err(StoreError::BlockHashMismatch { start: failed.start });
                }
                plans.push_front(BlockPlan {
                    index: failed.index,
                    transfer_all: true,
                    retried: true,
                });
            }
        }
    }

    write_request(tx, &Request::Flush)?;
    write_request(tx, &Request::Finish)?;
    tx.flush()?;

    if let TransferMode::InPlace { file } = &mut mode {
        for e in &extents {
            file.punch_hole(e.offset as u64, e.size as u64)?;
        }
        if file.len()? != remote_size as u64 {
            file.resize(remote_size as u64)?;
        }
    }

    debug!(remote_size, transferred, "transfer session complete");

    Ok(TransferResult {
        remote_size,
        extents,
        transferred_bytes: transferred,
    })
}

fn expect_start(want: i64, got: i64) -> Result<()> {
    if want != got {
        return Err(StoreError::Protocol(format!(
            "reply for block {} while waiting for {}",
            got, want
        )));
    }
    Ok(())
}

enum Outcome {
    /// More frames belong to the front block.
    Streaming,
    Done,
    /// The whole-block payload failed verification.
    Retry,
}

/// Handle a `BLOCK_HASH` terminator. Returns `Ok(true)` when the block is
/// complete, `Ok(false)` when the payload failed verification and the
/// caller should re-request it.
fn finish_block(
    front: &mut PendingBlock,
    hash: [u8; BIG_HASH_LEN],
    new_sidecar: &mut File,
    mode: &mut TransferMode<'_>,
) -> Result<bool> {
    if let Some(payload) = front.whole.take() {
        if hash::big_hash(&payload) != hash {
            return Ok(false);
        }

        let mut rec = BlockHashes::default();
        for (i, sub) in payload.chunks(SUBCHUNK_SIZE).enumerate() {
            rec.small[i] = hash::small_hash(sub);
        }
        rec.big = hash;
        sidecar::write_record(new_sidecar, front.index, &rec)?;

        if !payload.is_empty() {
            match mode {
                TransferMode::InPlace { file } => file.write_at(front.start as u64, &payload)?,
                TransferMode::Patch { patch } => write_patch_record(patch, front.start, &payload)?,
            }
        }
        return Ok(true);
    }

    // update-chunk block: the server's hash is authoritative for the record
    front.new_rec.big = hash;
    sidecar::write_record(new_sidecar, front.index, &front.new_rec)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_use_protocol_window() {
        let opts = FetchOptions::default();
        assert_eq!(opts.max_queued, MAX_QUEUED_CHUNKS);
        assert_eq!(opts.old_hash_size, 0);
    }
}
