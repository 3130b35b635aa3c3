//! Responder side of the block-diff transfer.
//!
//! A session serves exactly one source file. The request reader enqueues
//! work into a bounded queue; a send worker drains it and owns the write
//! half of the pipe. Dropping the queue is the stop signal: the worker
//! finishes the blocks already queued, flushes and exits.

use std::fs::File;
use std::io::{Read, Write};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread;

use tracing::debug;

use crate::hash::{self, BigHash};
use crate::protocol::{
    read_request, write_reply, BlockRequest, Reply, Request, ERR_READING_FAILED,
    ERR_SEEKING_FAILED,
};
use crate::sidecar::{self, BlockHashes, CHECKPOINT_SIZE, SUBCHUNK_SIZE};
use crate::sparse::{SparseExtent, SparseFile};
use crate::transfer::MAX_QUEUED_CHUNKS;
use crate::{Result, StoreError};

/// Per-session configuration.
#[derive(Default)]
pub struct ServeOptions {
    /// Changed-block-tracking sidecar: when a block's stored record equals
    /// the client's hashes the source is not even read.
    pub cbt: Option<File>,
    /// Sparse extents of the source; announced to the client at session
    /// open so it can reproduce the hole layout.
    pub extents: Option<Vec<SparseExtent>>,
}

enum Job {
    Block(BlockRequest),
    Flush,
}

/// Serve one block-diff session over the given pipe halves.
///
/// Returns after the client sends `Finish`/`FreeFile` or closes its write
/// half.
pub fn serve<R, W>(mut rx: R, tx: W, file: File, opts: ServeOptions) -> Result<()>
where
    R: Read,
    W: Write + Send,
{
    let hash_size = match read_request(&mut rx)? {
        Some(Request::StartSession { hash_size }) => hash_size,
        Some(_) => {
            return Err(StoreError::Protocol(
                "expected session start as first request".into(),
            ))
        }
        None => return Ok(()),
    };

    let file_size = file.metadata()?.len() as i64;

    let (job_tx, job_rx): (SyncSender<Job>, Receiver<Job>) = sync_channel(MAX_QUEUED_CHUNKS);

    thread::scope(|s| {
        let worker = s.spawn(move || -> Result<()> {
            let mut sender = BlockSender {
                tx,
                file,
                file_size,
                hash_size,
                cbt: opts.cbt,
            };
            sender.open_session(opts.extents)?;
            while let Ok(job) = job_rx.recv() {
                match job {
                    Job::Block(req) => sender.send_block(&req)?,
                    Job::Flush => sender.tx.flush()?,
                }
            }
            sender.tx.flush()?;
            Ok(())
        });

        let produced: Result<()> = (|| {
            loop {
                match read_request(&mut rx)? {
                    None | Some(Request::Finish) | Some(Request::FreeFile) => break,
                    Some(Request::Block(b)) => {
                        if job_tx.send(Job::Block(b)).is_err() {
                            break; // worker died; its error is authoritative
                        }
                    }
                    Some(Request::Flush) => {
                        if job_tx.send(Job::Flush).is_err() {
                            break;
                        }
                    }
                    Some(Request::MetadataEnd) => {
                        // metadata streams are the surrounding server's
                        // concern; nothing to do per block session
                    }
                    Some(Request::StartSession { .. }) => {
                        return Err(StoreError::Protocol(
                            "session restart inside a running session".into(),
                        ));
                    }
                }
            }
            Ok(())
        })();

        drop(job_tx);
        let sent = worker.join().expect("chunk send worker panicked");
        produced.and(sent)
    })
}

struct BlockSender<W: Write> {
    tx: W,
    file: File,
    file_size: i64,
    /// Byte range of the client's old file covered by its sidecar; sub-
    /// chunks beyond it are always sent.
    hash_size: u64,
    cbt: Option<File>,
}

impl<W: Write> BlockSender<W> {
    fn open_session(&mut self, extents: Option<Vec<SparseExtent>>) -> Result<()> {
        let reply = match extents {
            Some(extents) if !extents.is_empty() => Reply::FileSizeAndExtents {
                size: self.file_size as u64,
                extents,
            },
            _ => Reply::FileSize {
                size: self.file_size as u64,
            },
        };
        write_reply(&mut self.tx, &reply)?;
        self.tx.flush()?;
        Ok(())
    }

    fn block_len(&self, start: i64) -> u32 {
        if start >= self.file_size {
            0
        } else {
            (self.file_size - start).min(CHECKPOINT_SIZE as i64) as u32
        }
    }

    fn send_block(&mut self, req: &BlockRequest) -> Result<()> {
        if req.start < 0 || req.start % CHECKPOINT_SIZE as i64 != 0 {
            return self.send_error(ERR_SEEKING_FAILED, 0);
        }

        if req.transfer_all {
            return self.send_whole_block(req.start);
        }

        let start = req.start;
        let block_len = self.block_len(start);
        let block_index = (start / CHECKPOINT_SIZE as i64) as u64;

        // changed-block tracking: an up-to-date record equal to the
        // client's hashes means nothing to read and nothing to send
        let cbt_covers = start + (CHECKPOINT_SIZE as i64) <= self.file_size;
        if cbt_covers {
            if let Some(cbt) = self.cbt.as_mut() {
                if let Some(rec) = sidecar::read_record(cbt, block_index)? {
                    if rec == req.hashes {
                        debug!(start, "cbt unchanged");
                        write_reply(&mut self.tx, &Reply::NoChange { start })?;
                        return Ok(());
                    }
                }
            }
        }

        let mut big = BigHash::new();
        let mut new_rec = BlockHashes::default();
        let mut block_buf = vec![0u8; block_len as usize];
        let mut sent_update = false;

        let mut pos = 0u32;
        let mut sub = 0usize;
        while pos < block_len {
            let sub_len = ((block_len - pos) as usize).min(SUBCHUNK_SIZE);
            let range = &mut block_buf[pos as usize..pos as usize + sub_len];

            let read = match self.file.read_at((start + pos as i64) as u64, range) {
                Ok(n) => n,
                Err(e) => {
                    let code = e.raw_os_error().unwrap_or(0) as u32;
                    return self.send_error(ERR_READING_FAILED, code);
                }
            };
            // concurrent truncation reads short; the padded zeros keep the
            // block deterministic for both ends
            range[read..].fill(0);

            big.update(range);
            let adler = hash::small_hash(range);
            new_rec.small[sub] = adler;

            let beyond_hashes = (start + pos as i64 + sub_len as i64) as u64 > self.hash_size;
            if adler != req.hashes.small[sub] || beyond_hashes {
                sent_update = true;
                write_reply(
                    &mut self.tx,
                    &Reply::UpdateChunk {
                        pos: start + pos as i64,
                        size: sub_len as u32,
                    },
                )?;
                self.tx.write_all(&block_buf[pos as usize..pos as usize + sub_len])?;
                debug!(pos = start + pos as i64, size = sub_len, "update chunk");
            }

            pos += sub_len as u32;
            sub += 1;
        }

        let md5 = big.finalize();
        new_rec.big = md5;

        if cbt_covers {
            if let Some(cbt) = self.cbt.as_mut() {
                sidecar::write_record(cbt, block_index, &new_rec)?;
            }
        }

        if !sent_update && md5 != req.hashes.big {
            // every sub-chunk matched but the block hash does not: the
            // client's record is stale as a whole, resend everything
            debug!(start, size = block_len, "whole block (hash mismatch)");
            write_reply(
                &mut self.tx,
                &Reply::WholeBlock {
                    start,
                    size: block_len,
                },
            )?;
            self.tx.write_all(&block_buf)?;
            write_reply(&mut self.tx, &Reply::BlockHash { start, hash: md5 })?;
        } else if !sent_update {
            write_reply(&mut self.tx, &Reply::NoChange { start })?;
        } else {
            write_reply(&mut self.tx, &Reply::BlockHash { start, hash: md5 })?;
        }

        Ok(())
    }

    fn send_whole_block(&mut self, start: i64) -> Result<()> {
        let block_len = self.block_len(start);

        write_reply(
            &mut self.tx,
            &Reply::WholeBlock {
                start,
                size: block_len,
            },
        )?;

        let mut big = BigHash::new();
        let mut buf = vec![0u8; SUBCHUNK_SIZE];
        let mut pos = 0u32;
        let mut read_err: Option<u32> = None;

        while pos < block_len {
            let n = ((block_len - pos) as usize).min(SUBCHUNK_SIZE);
            match self.file.read_at((start + pos as i64) as u64, &mut buf[..n]) {
                Ok(read) => buf[read..n].fill(0),
                Err(e) => {
                    // the frame size is committed; stream zeros and report
                    // the failure in place of the block hash
                    read_err = Some(e.raw_os_error().unwrap_or(0) as u32);
                    buf[..n].fill(0);
                }
            }
            big.update(&buf[..n]);
            self.tx.write_all(&buf[..n])?;
            pos += n as u32;
        }

        if let Some(code) = read_err {
            return self.send_error(ERR_READING_FAILED, code);
        }

        write_reply(
            &mut self.tx,
            &Reply::BlockHash {
                start,
                hash: big.finalize(),
            },
        )?;
        Ok(())
    }

    fn send_error(&mut self, code1: u32, code2: u32) -> Result<()> {
        debug!(code1, code2, "sending block error");
        write_reply(&mut self.tx, &Reply::BlockError { code1, code2 })?;
        self.tx.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::memory_duplex;
    use crate::protocol::{read_reply, write_request};
    use std::io::{Seek, SeekFrom, Write as _};

    fn temp_with(data: &[u8]) -> File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(data).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f
    }

    /// Drive one request against a served file and collect the replies
    /// (with payloads skipped) until the block terminator.
    fn run_one(
        file_data: &[u8],
        req: BlockRequest,
        hash_size: u64,
    ) -> Vec<Reply> {
        let ((mut c_rx, mut c_tx), (s_rx, s_tx)) = memory_duplex();
        let file = temp_with(file_data);

        let server = std::thread::spawn(move || {
            serve(s_rx, s_tx, file, ServeOptions::default()).unwrap();
        });

        write_request(&mut c_tx, &Request::StartSession { hash_size }).unwrap();
        let open = read_reply(&mut c_rx).unwrap();
        assert!(matches!(open, Reply::FileSize { .. }));

        write_request(&mut c_tx, &Request::Block(req)).unwrap();

        let mut replies = Vec::new();
        loop {
            let reply = read_reply(&mut c_rx).unwrap();
            let done = matches!(
                reply,
                Reply::NoChange { .. } | Reply::BlockHash { .. } | Reply::BlockError { .. }
            );
            if let Reply::WholeBlock { size, .. } | Reply::UpdateChunk { size, .. } = &reply {
                let mut sink = vec![0u8; *size as usize];
                c_rx.read_exact(&mut sink).unwrap();
            }
            replies.push(reply);
            if done {
                break;
            }
        }

        write_request(&mut c_tx, &Request::Finish).unwrap();
        c_tx.shutdown();
        server.join().unwrap();
        replies
    }

    fn hashes_of(data: &[u8]) -> BlockHashes {
        let mut rec = BlockHashes::default();
        let mut big = BigHash::new();
        for (i, sub) in data.chunks(SUBCHUNK_SIZE).enumerate() {
            big.update(sub);
            rec.small[i] = hash::small_hash(sub);
        }
        rec.big = big.finalize();
        rec
    }

    #[test]
    fn matching_hashes_get_no_change() {
        let data = vec![7u8; CHECKPOINT_SIZE as usize];
        let replies = run_one(
            &data,
            BlockRequest {
                start: 0,
                transfer_all: false,
                hashes: hashes_of(&data),
            },
            data.len() as u64,
        );
        assert_eq!(replies, vec![Reply::NoChange { start: 0 }]);
    }

    #[test]
    fn single_changed_subchunk_sends_one_update() {
        let mut data = vec![7u8; CHECKPOINT_SIZE as usize];
        let old_hashes = hashes_of(&data);
        data[10 * SUBCHUNK_SIZE + 3] = 0;

        let replies = run_one(
            &data,
            BlockRequest {
                start: 0,
                transfer_all: false,
                hashes: old_hashes,
            },
            data.len() as u64,
        );

        assert_eq!(replies.len(), 2);
        assert_eq!(
            replies[0],
            Reply::UpdateChunk {
                pos: (10 * SUBCHUNK_SIZE) as i64,
                size: SUBCHUNK_SIZE as u32,
            }
        );
        assert!(matches!(replies[1], Reply::BlockHash { start: 0, .. }));
    }

    #[test]
    fn transfer_all_streams_whole_block() {
        let data = vec![9u8; 100_000];
        let replies = run_one(
            &data,
            BlockRequest {
                start: 0,
                transfer_all: true,
                hashes: BlockHashes::default(),
            },
            0,
        );
        assert_eq!(
            replies[0],
            Reply::WholeBlock {
                start: 0,
                size: 100_000,
            }
        );
        match replies[1] {
            Reply::BlockHash { start: 0, hash } => {
                assert_eq!(hash, hash::big_hash(&data));
            }
            ref other => panic!("expected block hash, got {:?}", other),
        }
    }

    #[test]
    fn misaligned_request_is_a_seek_error() {
        let data = vec![1u8; 10_000];
        let replies = run_one(
            &data,
            BlockRequest {
                start: 17,
                transfer_all: false,
                hashes: BlockHashes::default(),
            },
            0,
        );
        assert_eq!(
            replies,
            vec![Reply::BlockError {
                code1: ERR_SEEKING_FAILED,
                code2: 0,
            }]
        );
    }
}
