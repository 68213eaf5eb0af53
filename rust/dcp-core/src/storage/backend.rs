// rust/dcp-core/src/storage/backend.rs

//! Byte storage medium underneath the checkpoint protocol.
//!
//! The protocol layer only needs whole-object writes, ranged reads, listing
//! and rename. Backends that cannot rename atomically still work, but lose
//! per-file atomicity for data files.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Size of the object in bytes.
    pub size: u64,
    /// Last modification time as Unix timestamp (seconds since epoch).
    pub modified: Option<i64>,
    pub is_dir: bool,
}

/// Random-access read handle for one object.
#[async_trait]
pub trait ObjectReader: Send + Sync {
    /// Returns the total size of the object in bytes.
    fn size(&self) -> u64;

    /// Reads `length` bytes starting at `start`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the range is out of bounds.
    async fn read_range(&mut self, start: u64, length: usize) -> Result<Bytes>;

    /// Reads the entire object into memory.
    async fn read_all(&mut self) -> Result<Bytes>;
}

/// Sequential write handle for one object.
#[async_trait]
pub trait ObjectWriter: Send + Sync {
    async fn write_all_bytes(&mut self, data: &[u8]) -> Result<()>;

    fn bytes_written(&self) -> u64;

    /// Flushes and persists everything written so far.
    ///
    /// Data is not guaranteed durable until this returns.
    async fn finish(self: Box<Self>) -> Result<()>;
}

/// Storage operations a checkpoint backend must support.
///
/// Paths are relative to the backend root unless absolute.
#[async_trait]
pub trait AsyncStorageBackend: Send + Sync {
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// # Errors
    ///
    /// Returns an error if the object doesn't exist or metadata cannot be read.
    async fn metadata(&self, path: &Path) -> Result<ObjectMeta>;

    async fn open_read(&self, path: &Path) -> Result<Box<dyn ObjectReader>>;

    /// Opens an object for writing, truncating any existing object and
    /// creating parent directories.
    async fn open_write(&self, path: &Path) -> Result<Box<dyn ObjectWriter>>;

    async fn delete(&self, path: &Path) -> Result<()>;

    /// Lists the names directly under `prefix`, sorted. A missing prefix lists
    /// as empty.
    async fn list(&self, prefix: &Path) -> Result<Vec<String>>;

    /// Moves an object, replacing any object at `to`.
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Returns the backend type name (e.g., "local").
    fn backend_type(&self) -> &'static str;

    /// Returns true if `rename` replaces the destination atomically.
    fn supports_atomic_rename(&self) -> bool;
}
