//! Deduplicating chunk store.
//!
//! The crate has two halves that share one idea: split byte streams into
//! content-defined chunks, identify each chunk by a cheap rolling checksum
//! plus a strong hash, and reuse previously stored bytes wherever the
//! hashes match.
//!
//! - [`cdc`] and [`hash`] are the shared core: the randomized cut test and
//!   the three hash families (rolling crc32c, 128-bit block hash, 512-bit
//!   content hash).
//! - [`sidecar`], [`transfer`] and [`patcher`] implement the block-diff
//!   transfer: per-512KiB hash records, the request/reply wire protocol and
//!   the patch application that reconstructs the target file.
//! - [`store`] and [`db`] implement the hash-linked file store: incoming
//!   files are hard-linked against identical stored content, tracked in a
//!   per-fingerprint doubly-linked entry list with a secondary key index.

pub mod cdc;
pub mod db;
pub mod error;
pub mod hash;
pub mod patcher;
pub mod pipe;
pub mod protocol;
pub mod sidecar;
pub mod sparse;
pub mod store;
pub mod transfer;

pub use error::StoreError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
