// rust/dcp-core/src/lib.rs

//! Distributed Checkpoint Storage - Core Library
//!
//! This crate provides the storage side of distributed checkpointing: the
//! writer and reader protocols every rank runs, a filesystem implementation
//! of them, default planners for named tensors and byte values, and an
//! in-process orchestrator that drives several ranks through a save or load.

pub mod config;
pub mod error;
pub mod identity;
pub mod transform;

// Re-export commonly used types for convenience
pub use config::{DcpConfig, ReaderConfig, StorageConfig, WriterConfig};
pub use error::{CheckpointError, ErrorKind, Result};
pub use identity::CheckpointId;
pub use transform::StreamTransform;

pub mod metadata;
pub mod plan;
pub mod tensor;
pub use metadata::{Metadata, MetadataIndex, StorageInfo, StorageMeta, StorageMetadata};
pub use plan::{LoadPlan, ReadItem, SavePlan, WriteItem};
pub use tensor::{DType, TensorView};

pub mod future;
pub mod planner;
pub mod protocol;
pub mod serialization;
pub use future::{join_ranks, PendingIo};
pub use planner::{DefaultLoadPlanner, DefaultSavePlanner, LoadPlanner, SavePlanner, StateDict};
pub use protocol::{StorageReader, StorageWriter, WriteResult};

pub mod filesystem;
pub mod storage;
pub use filesystem::{FileSystemReader, FileSystemWriter};
pub use storage::{AsyncLocalStorage, AsyncStorageBackend};

pub mod orchestrator;
pub use orchestrator::{load_state_dict, save_state_dict, LoadRank, SaveRank};
