//! Wire format of the block-diff transfer protocol.
//!
//! Every frame starts with a one-byte tag. Integers are little-endian.
//! Payload bytes of `WHOLE_BLOCK` and `UPDATE_CHUNK` follow their headers
//! raw on the stream. Unknown tags terminate the connection; the
//! surrounding server owns reconnects.

use std::io::{Read, Write};

use crate::hash::BIG_HASH_LEN;
use crate::sidecar::{BlockHashes, RECORD_LEN};
use crate::sparse::SparseExtent;
use crate::{Result, StoreError};

// requests (client -> server)
pub const ID_GET_FILE_BLOCKDIFF: u8 = 8;
pub const ID_BLOCK_REQUEST: u8 = 9;
pub const ID_INFORM_METADATA_STREAM_END: u8 = 11;
pub const ID_FLUSH_SOCKET: u8 = 13;
pub const ID_SCRIPT_FINISH: u8 = 14;
pub const ID_FREE_SERVER_FILE: u8 = 18;

// replies (server -> client)
pub const ID_COULDNT_OPEN: u8 = 0;
pub const ID_PONG: u8 = 0;
pub const ID_FILESIZE: u8 = 1;
pub const ID_BASE_DIR_LOST: u8 = 2;
pub const ID_FILESIZE_AND_EXTENTS: u8 = 3;
pub const ID_WHOLE_BLOCK: u8 = 13;
pub const ID_UPDATE_CHUNK: u8 = 14;
pub const ID_NO_CHANGE: u8 = 15;
pub const ID_BLOCK_HASH: u8 = 16;
pub const ID_FILE_HASH_AND_METADATA: u8 = 17;
pub const ID_BLOCK_ERROR: u8 = 18;

// BLOCK_ERROR subcodes
pub const ERR_SEEKING_FAILED: u32 = 0;
pub const ERR_READING_FAILED: u32 = 1;

/// One block-diff request: hashes the client holds for the checkpoint
/// block at `start`, or `transfer_all` when it has none.
#[derive(Debug, Clone)]
pub struct BlockRequest {
    pub start: i64,
    pub transfer_all: bool,
    pub hashes: BlockHashes,
}

/// Client-to-server frames.
#[derive(Debug, Clone)]
pub enum Request {
    /// Opens a block-diff session; `hash_size` is the byte range of the
    /// client's file covered by its sidecar.
    StartSession { hash_size: u64 },
    Block(BlockRequest),
    Flush,
    /// The metadata side channel of the surrounding session ended.
    MetadataEnd,
    FreeFile,
    Finish,
}

/// Server-to-client frame headers. Raw payload bytes follow `WholeBlock`
/// and `UpdateChunk` on the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    FileSize {
        size: u64,
    },
    FileSizeAndExtents {
        size: u64,
        extents: Vec<SparseExtent>,
    },
    WholeBlock {
        start: i64,
        size: u32,
    },
    UpdateChunk {
        pos: i64,
        size: u32,
    },
    NoChange {
        start: i64,
    },
    BlockHash {
        start: i64,
        hash: [u8; BIG_HASH_LEN],
    },
    BlockError {
        code1: u32,
        code2: u32,
    },
    CouldntOpen,
    BaseDirLost,
}

pub fn write_request<W: Write>(w: &mut W, req: &Request) -> Result<()> {
    match req {
        Request::StartSession { hash_size } => {
            w.write_all(&[ID_GET_FILE_BLOCKDIFF])?;
            w.write_all(&hash_size.to_le_bytes())?;
        }
        Request::Block(b) => {
            w.write_all(&[ID_BLOCK_REQUEST])?;
            w.write_all(&b.start.to_le_bytes())?;
            w.write_all(&[b.transfer_all as u8])?;
            w.write_all(&b.hashes.to_bytes())?;
        }
        Request::Flush => w.write_all(&[ID_FLUSH_SOCKET])?,
        Request::MetadataEnd => w.write_all(&[ID_INFORM_METADATA_STREAM_END])?,
        Request::FreeFile => w.write_all(&[ID_FREE_SERVER_FILE])?,
        Request::Finish => w.write_all(&[ID_SCRIPT_FINISH])?,
    }
    Ok(())
}

/// Read the next request frame. `None` means clean EOF between frames.
pub fn read_request<R: Read>(r: &mut R) -> Result<Option<Request>> {
    let tag = match read_tag(r)? {
        Some(t) => t,
        None => return Ok(None),
    };

    let req = match tag {
        ID_GET_FILE_BLOCKDIFF => Request::StartSession {
            hash_size: read_u64(r)?,
        },
        ID_BLOCK_REQUEST => {
            let start = read_i64(r)?;
            let transfer_all = read_u8(r)? != 0;
            let mut raw = [0u8; RECORD_LEN];
            r.read_exact(&mut raw)?;
            Request::Block(BlockRequest {
                start,
                transfer_all,
                hashes: BlockHashes::from_bytes(&raw),
            })
        }
        ID_FLUSH_SOCKET => Request::Flush,
        ID_INFORM_METADATA_STREAM_END => Request::MetadataEnd,
        ID_FREE_SERVER_FILE => Request::FreeFile,
        ID_SCRIPT_FINISH => Request::Finish,
        other => {
            return Err(StoreError::Protocol(format!(
                "unknown request tag {}",
                other
            )))
        }
    };
    Ok(Some(req))
}

pub fn write_reply<W: Write>(w: &mut W, reply: &Reply) -> Result<()> {
    match reply {
        Reply::FileSize { size } => {
            w.write_all(&[ID_FILESIZE])?;
            w.write_all(&size.to_le_bytes())?;
        }
        Reply::FileSizeAndExtents { size, extents } => {
            w.write_all(&[ID_FILESIZE_AND_EXTENTS])?;
            w.write_all(&size.to_le_bytes())?;
            w.write_all(&(extents.len() as u64).to_le_bytes())?;
            let mut digest = crate::hash::BigHash::new();
            for e in extents {
                let raw = e.to_bytes();
                digest.update(&raw);
                w.write_all(&raw)?;
            }
            w.write_all(&digest.finalize())?;
        }
        Reply::WholeBlock { start, size } => {
            w.write_all(&[ID_WHOLE_BLOCK])?;
            w.write_all(&start.to_le_bytes())?;
            w.write_all(&size.to_le_bytes())?;
        }
        Reply::UpdateChunk { pos, size } => {
            w.write_all(&[ID_UPDATE_CHUNK])?;
            w.write_all(&pos.to_le_bytes())?;
            w.write_all(&size.to_le_bytes())?;
        }
        Reply::NoChange { start } => {
            w.write_all(&[ID_NO_CHANGE])?;
            w.write_all(&start.to_le_bytes())?;
        }
        Reply::BlockHash { start, hash } => {
            w.write_all(&[ID_BLOCK_HASH])?;
            w.write_all(&start.to_le_bytes())?;
            w.write_all(hash)?;
        }
        Reply::BlockError { code1, code2 } => {
            w.write_all(&[ID_BLOCK_ERROR])?;
            w.write_all(&code1.to_le_bytes())?;
            w.write_all(&code2.to_le_bytes())?;
        }
        Reply::CouldntOpen => w.write_all(&[ID_COULDNT_OPEN])?,
        Reply::BaseDirLost => w.write_all(&[ID_BASE_DIR_LOST])?,
    }
    Ok(())
}

/// Read the next reply header. Payload bytes of `WholeBlock`/`UpdateChunk`
/// are left on the stream for the caller.
pub fn read_reply<R: Read>(r: &mut R) -> Result<Reply> {
    let tag = read_tag(r)?
        .ok_or_else(|| StoreError::Protocol("connection closed mid-session".into()))?;

    let reply = match tag {
        ID_COULDNT_OPEN => Reply::CouldntOpen,
        ID_FILESIZE => Reply::FileSize { size: read_u64(r)? },
        ID_BASE_DIR_LOST => Reply::BaseDirLost,
        ID_FILESIZE_AND_EXTENTS => {
            let size = read_u64(r)?;
            let count = read_u64(r)?;
            if count > (1 << 32) {
                return Err(StoreError::Protocol(format!(
                    "extent count {} overflows",
                    count
                )));
            }
            let mut digest = crate::hash::BigHash::new();
            let mut extents = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let mut raw = [0u8; 16];
                r.read_exact(&mut raw)?;
                digest.update(&raw);
                extents.push(SparseExtent::from_bytes(&raw));
            }
            let mut sent = [0u8; BIG_HASH_LEN];
            r.read_exact(&mut sent)?;
            if sent != digest.finalize() {
                return Err(StoreError::Corruption(
                    "sparse extent list failed its hash check".into(),
                ));
            }
            Reply::FileSizeAndExtents { size, extents }
        }
        ID_WHOLE_BLOCK => Reply::WholeBlock {
            start: read_i64(r)?,
            size: read_u32(r)?,
        },
        ID_UPDATE_CHUNK => Reply::UpdateChunk {
            pos: read_i64(r)?,
            size: read_u32(r)?,
        },
        ID_NO_CHANGE => Reply::NoChange { start: read_i64(r)? },
        ID_BLOCK_HASH => {
            let start = read_i64(r)?;
            let mut hash = [0u8; BIG_HASH_LEN];
            r.read_exact(&mut hash)?;
            Reply::BlockHash { start, hash }
        }
        ID_BLOCK_ERROR => Reply::BlockError {
            code1: read_u32(r)?,
            code2: read_u32(r)?,
        },
        other => {
            return Err(StoreError::Protocol(format!("unknown reply tag {}", other)))
        }
    };
    Ok(reply)
}

fn read_tag<R: Read>(r: &mut R) -> Result<Option<u8>> {
    let mut tag = [0u8; 1];
    match r.read(&mut tag)? {
        0 => Ok(None),
        _ => Ok(Some(tag[0])),
    }
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

fn read_i64<R: Read>(r: &mut R) -> Result<i64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(i64::from_le_bytes(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn request_roundtrip() {
        let mut hashes = BlockHashes::default();
        hashes.big = [9u8; BIG_HASH_LEN];
        hashes.small[5] = 12345;

        let reqs = vec![
            Request::StartSession { hash_size: 1 << 33 },
            Request::Block(BlockRequest {
                start: 512 * 1024,
                transfer_all: true,
                hashes,
            }),
            Request::Flush,
            Request::MetadataEnd,
            Request::FreeFile,
            Request::Finish,
        ];

        let mut wire = Vec::new();
        for r in &reqs {
            write_request(&mut wire, r).unwrap();
        }

        let mut cur = Cursor::new(wire);
        for want in &reqs {
            let got = read_request(&mut cur).unwrap().unwrap();
            match (want, got) {
                (Request::StartSession { hash_size: a }, Request::StartSession { hash_size: b }) => {
                    assert_eq!(*a, b)
                }
                (Request::Block(a), Request::Block(b)) => {
                    assert_eq!(a.start, b.start);
                    assert_eq!(a.transfer_all, b.transfer_all);
                    assert_eq!(a.hashes, b.hashes);
                }
                (Request::Flush, Request::Flush)
                | (Request::MetadataEnd, Request::MetadataEnd)
                | (Request::FreeFile, Request::FreeFile)
                | (Request::Finish, Request::Finish) => {}
                other => panic!("mismatched request {:?}", other),
            }
        }
        assert!(read_request(&mut cur).unwrap().is_none());
    }

    #[test]
    fn reply_roundtrip() {
        let replies = vec![
            Reply::FileSize { size: 42 },
            Reply::FileSizeAndExtents {
                size: 1 << 24,
                extents: vec![
                    SparseExtent { offset: 0, size: 4096 },
                    SparseExtent {
                        offset: 8192,
                        size: 4096,
                    },
                ],
            },
            Reply::WholeBlock {
                start: 0,
                size: 512 * 1024,
            },
            Reply::UpdateChunk {
                pos: 12288,
                size: 4096,
            },
            Reply::NoChange { start: 1024 * 1024 },
            Reply::BlockHash {
                start: 0,
                hash: [3u8; BIG_HASH_LEN],
            },
            Reply::BlockError {
                code1: ERR_READING_FAILED,
                code2: 5,
            },
        ];

        let mut wire = Vec::new();
        for r in &replies {
            write_reply(&mut wire, r).unwrap();
        }
        let mut cur = Cursor::new(wire);
        for want in &replies {
            assert_eq!(&read_reply(&mut cur).unwrap(), want);
        }
    }

    #[test]
    fn corrupted_extent_hash_is_detected() {
        let reply = Reply::FileSizeAndExtents {
            size: 100,
            extents: vec![SparseExtent { offset: 0, size: 4096 }],
        };
        let mut wire = Vec::new();
        write_reply(&mut wire, &reply).unwrap();
        let flip = wire.len() - 1;
        wire[flip] ^= 0xFF;

        let err = read_reply(&mut Cursor::new(wire)).unwrap_err();
        assert!(matches!(err, StoreError::Corruption(_)));
    }

    #[test]
    fn unknown_tag_is_a_protocol_violation() {
        let err = read_reply(&mut Cursor::new(vec![99u8])).unwrap_err();
        assert!(matches!(err, StoreError::Protocol(_)));
        let err = read_request(&mut Cursor::new(vec![77u8])).unwrap_err();
        assert!(matches!(err, StoreError::Protocol(_)));
    }
}
