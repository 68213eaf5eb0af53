// rust/dcp-core/src/storage/mod.rs

//! Byte storage backends used by the checkpoint layout.
//!
//! # Example
//!
//! ```no_run
//! use dcp_core::config::StorageConfig;
//! use dcp_core::storage::{AsyncLocalStorage, AsyncStorageBackend, ObjectReader, ObjectWriter};
//! use std::path::Path;
//!
//! # async fn example() -> dcp_core::Result<()> {
//! let config = StorageConfig::default();
//! let storage = AsyncLocalStorage::new(&config).await?;
//!
//! let mut writer = storage.open_write(Path::new("example.bin")).await?;
//! writer.write_all_bytes(b"Hello, world!").await?;
//! writer.finish().await?;
//!
//! let mut reader = storage.open_read(Path::new("example.bin")).await?;
//! let content = reader.read_all().await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod local;

pub use backend::{AsyncStorageBackend, ObjectMeta, ObjectReader, ObjectWriter};
pub use local::{AsyncLocalStorage, LocalObjectReader, LocalObjectWriter};
