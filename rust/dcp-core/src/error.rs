// rust/dcp-core/src/error.rs

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum CheckpointError {

    #[error("invalid protocol state: cannot {operation} while {state}: {detail}")]
    InvalidState {
        operation: String,
        state: String,
        detail: String,
    },

    #[error("no committed checkpoint at '{checkpoint_id}': {message}")]
    NotFound {
        checkpoint_id: String,
        message: String,
    },

    #[error("item '{index}' is not present in the checkpoint metadata")]
    ItemNotFound {
        index: String,
    },

    #[error("write failed for {items:?}: {message}")]
    WriteFailure {
        items: Vec<String>,
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    #[error("read failed for {items:?}: {message}")]
    ReadFailure {
        items: Vec<String>,
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    #[error("metadata commit for '{checkpoint_id}' did not complete: {message}")]
    PartialCommit {
        checkpoint_id: String,
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("invalid checkpoint id '{id}': {reason}")]
    InvalidCheckpointId {
        id: String,
        reason: String,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    #[error("Checkpoint error: {message}")]
    Checkpoint {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Coarse classification of a [`CheckpointError`].
///
/// Orchestrators branch on this instead of matching variants, e.g. to decide
/// whether a missing checkpoint should fall back to a fresh start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidState,
    NotFound,
    ItemNotFound,
    WriteFailure,
    ReadFailure,
    PartialCommit,
    Storage,
    Config,
    Checkpoint,
    Serialization,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ItemNotFound => "item_not_found",
            ErrorKind::WriteFailure => "write_failure",
            ErrorKind::ReadFailure => "read_failure",
            ErrorKind::PartialCommit => "partial_commit",
            ErrorKind::Storage => "storage",
            ErrorKind::Config => "config",
            ErrorKind::Checkpoint => "checkpoint",
            ErrorKind::Serialization => "serialization",
        };
        f.write_str(name)
    }
}

// Convenience constructors
impl CheckpointError {

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::ItemNotFound { .. } => ErrorKind::ItemNotFound,
            Self::WriteFailure { .. } => ErrorKind::WriteFailure,
            Self::ReadFailure { .. } => ErrorKind::ReadFailure,
            Self::PartialCommit { .. } => ErrorKind::PartialCommit,
            Self::Storage { .. } => ErrorKind::Storage,
            Self::InvalidCheckpointId { .. } | Self::Config { .. } => ErrorKind::Config,
            Self::Checkpoint { .. } => ErrorKind::Checkpoint,
            Self::Serialization { .. } => ErrorKind::Serialization,
        }
    }

    pub fn invalid_state(
        operation: impl fmt::Display,
        state: impl fmt::Display,
        detail: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            operation: operation.to_string(),
            state: state.to_string(),
            detail: detail.into(),
        }
    }

    pub fn not_found(checkpoint_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NotFound {
            checkpoint_id: checkpoint_id.into(),
            message: message.into(),
        }
    }

    pub fn item_not_found(index: impl fmt::Display) -> Self {
        Self::ItemNotFound {
            index: index.to_string(),
        }
    }

    pub fn write_failure(items: Vec<String>, message: impl Into<String>) -> Self {
        Self::WriteFailure {
            items,
            message: message.into(),
            source: None,
        }
    }

    /// Wraps `source` as the cause of a failed write of `items`.
    pub fn write_failure_with_source(
        items: Vec<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::WriteFailure {
            items,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn read_failure(items: Vec<String>, message: impl Into<String>) -> Self {
        Self::ReadFailure {
            items,
            message: message.into(),
            source: None,
        }
    }

    pub fn read_failure_with_source(
        items: Vec<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ReadFailure {
            items,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn partial_commit(
        checkpoint_id: impl Into<String>,
        message: impl Into<String>,
        source: Option<CheckpointError>,
    ) -> Self {
        Self::PartialCommit {
            checkpoint_id: checkpoint_id.into(),
            message: message.into(),
            source: source.map(|e| Box::new(e) as BoxedSource),
        }
    }

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn invalid_checkpoint_id(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCheckpointId {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint {
            message: message.into(),
            source: None,
        }
    }

    pub fn checkpoint_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Checkpoint {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}
