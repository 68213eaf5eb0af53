// rust/dcp-core/src/config.rs

//! Configuration for checkpoint storage.
//!
//! Configuration is parsed from TOML, then environment variable overrides are
//! applied, then values are validated.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{CheckpointError, Result};
use crate::transform::StreamTransform;

// Top-level checkpoint configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DcpConfig {
    pub storage: StorageConfig,
    pub writer: WriterConfig,
    pub reader: ReaderConfig,
}

// Storage backend options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    // Root that relative checkpoint ids are resolved against.
    pub base_path: PathBuf,
    // Buffer size in bytes for I/O operations.
    pub buffer_size: usize,
}

/// Options for the save path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Number of data files a rank writes concurrently.
    pub thread_count: usize,
    /// Pack a rank's items into `thread_count` files instead of one file per item.
    pub single_file_per_rank: bool,
    /// Per-item compression: "none", "lz4", or "zstd".
    pub compression: String,
    /// Compression level (zstd only).
    pub compression_level: i32,
    /// Allow replacing committed metadata at the same checkpoint id.
    pub overwrite: bool,
    /// Remove data files the new metadata no longer references after a commit.
    pub cleanup_stale_files: bool,
}

/// Options for the load path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Number of data files a rank reads concurrently.
    pub thread_count: usize,
    /// Verify the recorded xxHash64 of every item after reading it.
    pub verify_checksums: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./checkpoints"),
            buffer_size: 64 * 1024, // 64 KB
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            thread_count: 1,
            single_file_per_rank: true,
            compression: "none".to_string(),
            compression_level: 3,
            overwrite: true,
            cleanup_stale_files: true,
        }
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            thread_count: 1,
            verify_checksums: true,
        }
    }
}

impl WriterConfig {
    /// Returns the per-item transform selected by `compression`.
    pub fn transform(&self) -> Result<StreamTransform> {
        StreamTransform::from_config(&self.compression, self.compression_level)
    }
}

impl FromStr for DcpConfig {
    type Err = CheckpointError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| CheckpointError::config_with_source("failed to parse TOML config", e))
    }
}

impl DcpConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed, or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CheckpointError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Variables are named `DCP_<SECTION>_<FIELD>`, e.g. `DCP_STORAGE_BASE_PATH`
    // or `DCP_WRITER_THREAD_COUNT`. Values that fail to parse are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("DCP_STORAGE_BASE_PATH") {
            self.storage.base_path = PathBuf::from(val);
        }
        override_parsed("DCP_STORAGE_BUFFER_SIZE", &mut self.storage.buffer_size);

        override_parsed("DCP_WRITER_THREAD_COUNT", &mut self.writer.thread_count);
        override_parsed(
            "DCP_WRITER_SINGLE_FILE_PER_RANK",
            &mut self.writer.single_file_per_rank,
        );
        if let Ok(val) = std::env::var("DCP_WRITER_COMPRESSION") {
            self.writer.compression = val.to_lowercase();
        }
        override_parsed(
            "DCP_WRITER_COMPRESSION_LEVEL",
            &mut self.writer.compression_level,
        );
        override_parsed("DCP_WRITER_OVERWRITE", &mut self.writer.overwrite);
        override_parsed(
            "DCP_WRITER_CLEANUP_STALE_FILES",
            &mut self.writer.cleanup_stale_files,
        );

        override_parsed("DCP_READER_THREAD_COUNT", &mut self.reader.thread_count);
        override_parsed(
            "DCP_READER_VERIFY_CHECKSUMS",
            &mut self.reader.verify_checksums,
        );

        self
    }

    // Validate all configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.storage.buffer_size == 0 {
            return Err(CheckpointError::config(
                "storage.buffer_size must be greater than 0",
            ));
        }

        if self.writer.thread_count == 0 {
            return Err(CheckpointError::config(
                "writer.thread_count must be greater than 0",
            ));
        }

        let valid_compression = ["none", "lz4", "zstd"];
        if !valid_compression.contains(&self.writer.compression.as_str()) {
            return Err(CheckpointError::config(format!(
                "writer.compression must be one of: {}",
                valid_compression.join(", ")
            )));
        }

        if self.writer.compression == "zstd" && !(1..=22).contains(&self.writer.compression_level)
        {
            return Err(CheckpointError::config(
                "writer.compression_level must be between 1 and 22 for zstd",
            ));
        }

        if self.reader.thread_count == 0 {
            return Err(CheckpointError::config(
                "reader.thread_count must be greater than 0",
            ));
        }

        Ok(())
    }
}

fn override_parsed<T: FromStr>(var: &str, target: &mut T) {
    if let Ok(val) = std::env::var(var) {
        if let Ok(v) = val.parse() {
            *target = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = DcpConfig::default();

        assert_eq!(config.storage.base_path, PathBuf::from("./checkpoints"));
        assert_eq!(config.storage.buffer_size, 64 * 1024);

        assert_eq!(config.writer.thread_count, 1);
        assert!(config.writer.single_file_per_rank);
        assert_eq!(config.writer.compression, "none");
        assert!(config.writer.overwrite);
        assert!(config.writer.cleanup_stale_files);

        assert_eq!(config.reader.thread_count, 1);
        assert!(config.reader.verify_checksums);
    }

    #[test]
    fn test_default_validates() {
        assert!(DcpConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_str_empty() {
        let config: DcpConfig = "".parse().unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_partial() {
        let toml = r#"
            [writer]
            thread_count = 4
            compression = "lz4"
        "#;
        let config: DcpConfig = toml.parse().unwrap();

        assert_eq!(config.writer.thread_count, 4);
        assert_eq!(config.writer.compression, "lz4");
        // Untouched fields keep their defaults
        assert!(config.writer.single_file_per_rank);
        assert_eq!(config.reader.thread_count, 1);
    }

    #[test]
    fn test_from_str_full() {
        let toml = r#"
            [storage]
            base_path = "/mnt/ckpt"
            buffer_size = 131072

            [writer]
            thread_count = 8
            single_file_per_rank = false
            compression = "zstd"
            compression_level = 5
            overwrite = false
            cleanup_stale_files = false

            [reader]
            thread_count = 2
            verify_checksums = false
        "#;

        let config: DcpConfig = toml.parse().unwrap();

        assert_eq!(config.storage.base_path, PathBuf::from("/mnt/ckpt"));
        assert_eq!(config.storage.buffer_size, 131072);
        assert_eq!(config.writer.thread_count, 8);
        assert!(!config.writer.single_file_per_rank);
        assert_eq!(config.writer.compression, "zstd");
        assert_eq!(config.writer.compression_level, 5);
        assert!(!config.writer.overwrite);
        assert!(!config.writer.cleanup_stale_files);
        assert_eq!(config.reader.thread_count, 2);
        assert!(!config.reader.verify_checksums);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_invalid_toml() {
        let result: std::result::Result<DcpConfig, _> = "writer = [".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [storage]
            base_path = "/tmp/dcp"
            "#
        )
        .unwrap();

        let config = DcpConfig::from_file(file.path()).unwrap();
        assert_eq!(config.storage.base_path, PathBuf::from("/tmp/dcp"));
    }

    #[test]
    fn test_from_file_not_found() {
        assert!(DcpConfig::from_file("/nonexistent/dcp.toml").is_err());
    }

    #[test]
    fn test_validate_rejects_zero_threads() {
        let mut config = DcpConfig::default();
        config.writer.thread_count = 0;
        assert!(config.validate().is_err());

        let mut config = DcpConfig::default();
        config.reader.thread_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_compression() {
        let mut config = DcpConfig::default();
        config.writer.compression = "gzip".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("writer.compression"));
    }

    #[test]
    fn test_validate_rejects_zstd_level_out_of_range() {
        let mut config = DcpConfig::default();
        config.writer.compression = "zstd".to_string();
        config.writer.compression_level = 40;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_writer_transform() {
        let mut config = WriterConfig::default();
        assert_eq!(config.transform().unwrap(), StreamTransform::None);
        config.compression = "lz4".to_string();
        assert_eq!(config.transform().unwrap(), StreamTransform::Lz4);
    }

    fn clear_dcp_env_vars() {
        for (key, _) in std::env::vars() {
            if key.starts_with("DCP_") {
                std::env::remove_var(&key);
            }
        }
    }

    // Env vars are process-global, so all override cases live in one test.
    #[test]
    fn test_env_overrides() {
        clear_dcp_env_vars();

        std::env::set_var("DCP_STORAGE_BASE_PATH", "/env/ckpt");
        std::env::set_var("DCP_WRITER_THREAD_COUNT", "6");
        std::env::set_var("DCP_WRITER_COMPRESSION", "ZSTD");
        std::env::set_var("DCP_READER_VERIFY_CHECKSUMS", "false");

        let config = DcpConfig::default().with_env_overrides();

        assert_eq!(config.storage.base_path, PathBuf::from("/env/ckpt"));
        assert_eq!(config.writer.thread_count, 6);
        assert_eq!(config.writer.compression, "zstd");
        assert!(!config.reader.verify_checksums);

        clear_dcp_env_vars();

        std::env::set_var("DCP_WRITER_THREAD_COUNT", "many");
        let config = DcpConfig::default().with_env_overrides();
        assert_eq!(config.writer.thread_count, 1);

        clear_dcp_env_vars();
    }

    #[test]
    fn test_serialize_roundtrip() {
        let original = DcpConfig::default();
        let toml_str = toml::to_string(&original).unwrap();
        let parsed: DcpConfig = toml_str.parse().unwrap();

        assert_eq!(original.storage.base_path, parsed.storage.base_path);
        assert_eq!(original.writer.compression, parsed.writer.compression);
        assert_eq!(original.reader.thread_count, parsed.reader.thread_count);
    }
}
