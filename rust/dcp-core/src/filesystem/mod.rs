// rust/dcp-core/src/filesystem/mod.rs

//! Filesystem-backed storage writer and reader.
//!
//! Both sides talk to an [`AsyncStorageBackend`](crate::storage::AsyncStorageBackend),
//! so the same layout works over any backend that can list, rename and read
//! ranges.

pub mod layout;
mod reader;
mod writer;

pub use reader::FileSystemReader;
pub use writer::FileSystemWriter;

use tokio::task::JoinError;

use crate::error::{CheckpointError, Result};

/// Flattens the outcome of one spawned file task.
pub(crate) fn join_outcome<T>(joined: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    match joined {
        Ok(outcome) => outcome,
        Err(e) if e.is_cancelled() => Err(CheckpointError::checkpoint("file task was cancelled")),
        Err(e) => Err(CheckpointError::checkpoint_with_source("file task panicked", e)),
    }
}
