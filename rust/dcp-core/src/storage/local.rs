// rust/dcp-core/src/storage/local.rs

//! Local filesystem backend built on tokio's async file operations.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, BufWriter};

use super::backend::{AsyncStorageBackend, ObjectMeta, ObjectReader, ObjectWriter};
use crate::config::StorageConfig;
use crate::error::{CheckpointError, Result};

/// Async local filesystem storage backend.
pub struct AsyncLocalStorage {
    base_path: PathBuf,
    buffer_size: usize,
}

impl AsyncLocalStorage {
    /// Creates the backend, creating `base_path` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the base path cannot be created.
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let base_path = config.base_path.clone();
        fs::create_dir_all(&base_path).await.map_err(|e| {
            CheckpointError::storage_with_source(&base_path, "failed to create base directory", e)
        })?;

        Ok(Self {
            base_path,
            buffer_size: config.buffer_size,
        })
    }

    /// Creates a backend rooted at `base_path` with default buffering, without
    /// touching the filesystem.
    pub fn with_base_path(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            buffer_size: StorageConfig::default().buffer_size,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                CheckpointError::storage_with_source(
                    parent,
                    "failed to create parent directories",
                    e,
                )
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl AsyncStorageBackend for AsyncLocalStorage {
    async fn exists(&self, path: &Path) -> Result<bool> {
        let full_path = self.resolve_path(path);
        Ok(fs::try_exists(&full_path).await.unwrap_or(false))
    }

    async fn metadata(&self, path: &Path) -> Result<ObjectMeta> {
        let full_path = self.resolve_path(path);
        let meta = fs::metadata(&full_path).await.map_err(|e| {
            CheckpointError::storage_with_source(&full_path, "failed to read metadata", e)
        })?;

        let modified = meta.modified().ok().map(|t| {
            t.duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0)
        });

        Ok(ObjectMeta {
            size: meta.len(),
            modified,
            is_dir: meta.is_dir(),
        })
    }

    async fn open_read(&self, path: &Path) -> Result<Box<dyn ObjectReader>> {
        let full_path = self.resolve_path(path);
        let file = File::open(&full_path).await.map_err(|e| {
            CheckpointError::storage_with_source(&full_path, "failed to open file", e)
        })?;
        let size = file
            .metadata()
            .await
            .map_err(|e| {
                CheckpointError::storage_with_source(&full_path, "failed to read file metadata", e)
            })?
            .len();

        Ok(Box::new(LocalObjectReader {
            reader: BufReader::with_capacity(self.buffer_size, file),
            path: full_path,
            size,
        }))
    }

    async fn open_write(&self, path: &Path) -> Result<Box<dyn ObjectWriter>> {
        let full_path = self.resolve_path(path);
        Self::ensure_parent(&full_path).await?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full_path)
            .await
            .map_err(|e| {
                CheckpointError::storage_with_source(&full_path, "failed to create file", e)
            })?;

        Ok(Box::new(LocalObjectWriter {
            writer: BufWriter::with_capacity(self.buffer_size, file),
            path: full_path,
            bytes_written: 0,
        }))
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let full_path = self.resolve_path(path);
        let meta = fs::metadata(&full_path).await.map_err(|e| {
            CheckpointError::storage_with_source(&full_path, "failed to read metadata", e)
        })?;

        if meta.is_dir() {
            fs::remove_dir_all(&full_path).await.map_err(|e| {
                CheckpointError::storage_with_source(&full_path, "failed to delete directory", e)
            })
        } else {
            fs::remove_file(&full_path).await.map_err(|e| {
                CheckpointError::storage_with_source(&full_path, "failed to delete file", e)
            })
        }
    }

    async fn list(&self, prefix: &Path) -> Result<Vec<String>> {
        let full_path = self.resolve_path(prefix);
        let mut dir = match fs::read_dir(&full_path).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CheckpointError::storage_with_source(
                    &full_path,
                    "failed to read directory",
                    e,
                ))
            }
        };

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| {
            CheckpointError::storage_with_source(&full_path, "failed to read directory entry", e)
        })? {
            if let Some(name) = entry.file_name().to_str() {
                entries.push(name.to_string());
            }
        }

        entries.sort();
        Ok(entries)
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from_path = self.resolve_path(from);
        let to_path = self.resolve_path(to);
        Self::ensure_parent(&to_path).await?;

        fs::rename(&from_path, &to_path).await.map_err(|e| {
            CheckpointError::storage_with_source(
                &from_path,
                format!("failed to rename to {}", to_path.display()),
                e,
            )
        })
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        let full_path = self.resolve_path(path);
        fs::create_dir_all(&full_path).await.map_err(|e| {
            CheckpointError::storage_with_source(&full_path, "failed to create directories", e)
        })
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }

    fn supports_atomic_rename(&self) -> bool {
        true
    }
}

/// Buffered file reader for local storage.
pub struct LocalObjectReader {
    reader: BufReader<File>,
    path: PathBuf,
    size: u64,
}

#[async_trait]
impl ObjectReader for LocalObjectReader {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_range(&mut self, start: u64, length: usize) -> Result<Bytes> {
        if start + length as u64 > self.size {
            return Err(CheckpointError::storage(
                &self.path,
                format!(
                    "range {start}..{} is beyond the end of a {} byte file",
                    start + length as u64,
                    self.size
                ),
            ));
        }

        self.reader.seek(SeekFrom::Start(start)).await.map_err(|e| {
            CheckpointError::storage_with_source(
                &self.path,
                format!("failed to seek to position {start}"),
                e,
            )
        })?;

        let mut buf = vec![0u8; length];
        self.reader.read_exact(&mut buf).await.map_err(|e| {
            CheckpointError::storage_with_source(
                &self.path,
                format!("failed to read {length} bytes at position {start}"),
                e,
            )
        })?;

        Ok(Bytes::from(buf))
    }

    async fn read_all(&mut self) -> Result<Bytes> {
        self.reader.seek(SeekFrom::Start(0)).await.map_err(|e| {
            CheckpointError::storage_with_source(&self.path, "failed to seek to start", e)
        })?;

        let mut buf = Vec::with_capacity(self.size as usize);
        self.reader.read_to_end(&mut buf).await.map_err(|e| {
            CheckpointError::storage_with_source(&self.path, "failed to read file", e)
        })?;

        Ok(Bytes::from(buf))
    }
}

/// Buffered file writer for local storage.
pub struct LocalObjectWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    bytes_written: u64,
}

#[async_trait]
impl ObjectWriter for LocalObjectWriter {
    async fn write_all_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data).await.map_err(|e| {
            CheckpointError::storage_with_source(&self.path, "failed to write data", e)
        })?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    async fn finish(mut self: Box<Self>) -> Result<()> {
        self.writer.flush().await.map_err(|e| {
            CheckpointError::storage_with_source(&self.path, "failed to flush writer", e)
        })?;

        self.writer.get_ref().sync_all().await.map_err(|e| {
            CheckpointError::storage_with_source(&self.path, "failed to sync file to disk", e)
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_storage() -> (AsyncLocalStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig {
            base_path: temp_dir.path().to_path_buf(),
            buffer_size: 4096,
        };
        let storage = AsyncLocalStorage::new(&config).await.unwrap();
        (storage, temp_dir)
    }

    async fn put(storage: &AsyncLocalStorage, path: &str, data: &[u8]) {
        let mut writer = storage.open_write(Path::new(path)).await.unwrap();
        writer.write_all_bytes(data).await.unwrap();
        writer.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (storage, _temp) = create_test_storage().await;
        put(&storage, "ckpt/__0_0.distcp", b"hello world").await;

        let mut reader = storage.open_read(Path::new("ckpt/__0_0.distcp")).await.unwrap();
        assert_eq!(reader.size(), 11);
        assert_eq!(reader.read_all().await.unwrap().as_ref(), b"hello world");
        assert_eq!(reader.read_range(6, 5).await.unwrap().as_ref(), b"world");
    }

    #[tokio::test]
    async fn test_read_range_past_end() {
        let (storage, _temp) = create_test_storage().await;
        put(&storage, "short.bin", b"abc").await;

        let mut reader = storage.open_read(Path::new("short.bin")).await.unwrap();
        assert!(reader.read_range(2, 4).await.is_err());
    }

    #[tokio::test]
    async fn test_list_missing_dir_is_empty() {
        let (storage, _temp) = create_test_storage().await;
        assert!(storage.list(Path::new("nope")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_sorted() {
        let (storage, _temp) = create_test_storage().await;
        for name in ["c.distcp", "a.distcp", "b.distcp"] {
            put(&storage, &format!("dir/{name}"), b"data").await;
        }

        let entries = storage.list(Path::new("dir")).await.unwrap();
        assert_eq!(entries, vec!["a.distcp", "b.distcp", "c.distcp"]);
    }

    #[tokio::test]
    async fn test_rename_replaces_destination() {
        let (storage, _temp) = create_test_storage().await;
        put(&storage, ".metadata", b"old").await;
        put(&storage, ".metadata.tmp", b"new").await;

        storage
            .rename(Path::new(".metadata.tmp"), Path::new(".metadata"))
            .await
            .unwrap();

        assert!(!storage.exists(Path::new(".metadata.tmp")).await.unwrap());
        let mut reader = storage.open_read(Path::new(".metadata")).await.unwrap();
        assert_eq!(reader.read_all().await.unwrap().as_ref(), b"new");
    }

    #[tokio::test]
    async fn test_delete_and_metadata() {
        let (storage, _temp) = create_test_storage().await;
        put(&storage, "x.bin", b"12345").await;

        let meta = storage.metadata(Path::new("x.bin")).await.unwrap();
        assert_eq!(meta.size, 5);
        assert!(!meta.is_dir);

        storage.delete(Path::new("x.bin")).await.unwrap();
        assert!(!storage.exists(Path::new("x.bin")).await.unwrap());
        assert!(storage.metadata(Path::new("x.bin")).await.is_err());
    }

    #[tokio::test]
    async fn test_absolute_path_bypasses_base() {
        let (storage, _temp) = create_test_storage().await;
        let other = TempDir::new().unwrap();
        let target = other.path().join("abs.bin");

        let mut writer = storage.open_write(&target).await.unwrap();
        writer.write_all_bytes(b"abs").await.unwrap();
        assert_eq!(writer.bytes_written(), 3);
        writer.finish().await.unwrap();

        assert!(target.exists());
    }

    #[tokio::test]
    async fn test_backend_properties() {
        let (storage, temp) = create_test_storage().await;
        assert_eq!(storage.backend_type(), "local");
        assert!(storage.supports_atomic_rename());
        assert_eq!(storage.base_path(), temp.path());
    }
}
