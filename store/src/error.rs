//! Error types shared across the crate.

use std::io;

/// Errors surfaced by the store, the transfer protocol and the patcher.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("remote block error (code1={code1}, code2={code2})")]
    Block { code1: u32, code2: u32 },

    #[error("block hash mismatch at offset {start}")]
    BlockHashMismatch { start: i64 },

    #[error("not enough free space for {needed} bytes at {path}")]
    Capacity { needed: u64, path: String },

    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl StoreError {
    /// True for errors that mean a stored link candidate is gone and the
    /// caller should drop its entry and move on to the next one.
    pub fn is_candidate_dead(&self) -> bool {
        match self {
            StoreError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
            ),
            _ => false,
        }
    }
}

/// Whether an I/O error is the filesystem's "too many links" condition.
///
/// Hitting the hard-link count limit is success-equivalent for dedup: the
/// content exists, we just cannot add another name for it.
pub fn is_too_many_links(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::EMLINK)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}
