//! The hash-linked file store.

mod hash_store;

pub use hash_store::{
    AddFileOutcome, AddFileRequest, CleanupFn, HashStore, IngestSource, PatchInput, StoreEnv,
};
