//! The block-diff transfer: a client that knows the hashes of its old copy
//! and a server that streams only what changed.
//!
//! Both ends work in 512 KiB checkpoint blocks with 4 KiB sub-chunks. The
//! client pipelines up to [`MAX_QUEUED_CHUNKS`] block requests; the server
//! answers them in request order through a bounded send queue drained by a
//! worker thread.

pub mod client;
pub mod server;

/// Upper bound on in-flight block requests per session.
pub const MAX_QUEUED_CHUNKS: usize = 20;

pub use client::{fetch, FetchOptions, TransferMode, TransferResult};
pub use server::{serve, ServeOptions};
