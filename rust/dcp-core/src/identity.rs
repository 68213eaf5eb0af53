// rust/dcp-core/src/identity.rs

//! Checkpoint identifiers and their resolution to storage locations.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CheckpointError, Result};

const FILE_SCHEME: &str = "file://";

/// User-supplied name of one checkpoint instance.
///
/// The value is opaque until a backend resolves it. For the storage backends
/// in this crate it is a directory path, optionally written as a `file://` URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointId(String);

impl CheckpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolves the identifier to a path understood by an
    /// [`AsyncStorageBackend`](crate::storage::AsyncStorageBackend).
    ///
    /// Relative paths stay relative; the backend anchors them at its base path.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCheckpointId` for empty identifiers and for URI schemes
    /// other than `file://`.
    pub fn resolve_path(&self) -> Result<PathBuf> {
        let raw = self.0.trim();
        if raw.is_empty() {
            return Err(CheckpointError::invalid_checkpoint_id(
                &self.0,
                "checkpoint id must not be empty",
            ));
        }

        let path = match raw.strip_prefix(FILE_SCHEME) {
            Some(rest) if rest.is_empty() => {
                return Err(CheckpointError::invalid_checkpoint_id(
                    &self.0,
                    "file:// uri has no path",
                ));
            }
            Some(rest) => rest,
            None => {
                if let Some((scheme, _)) = raw.split_once("://") {
                    return Err(CheckpointError::invalid_checkpoint_id(
                        &self.0,
                        format!("unsupported scheme '{scheme}'"),
                    ));
                }
                raw
            }
        };

        Ok(PathBuf::from(path))
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CheckpointId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CheckpointId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&Path> for CheckpointId {
    fn from(value: &Path) -> Self {
        Self(value.to_string_lossy().into_owned())
    }
}

impl From<PathBuf> for CheckpointId {
    fn from(value: PathBuf) -> Self {
        Self::from(value.as_path())
    }
}
