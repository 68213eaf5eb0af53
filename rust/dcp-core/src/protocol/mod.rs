// rust/dcp-core/src/protocol/mod.rs

//! The storage half of the checkpoint protocol.
//!
//! # Save
//!
//! ```text
//! all ranks     set_checkpoint_id -> set_up_storage_writer -> prepare_local_plan
//! coordinator   prepare_global_plan
//! all ranks     write_data (returns a PendingIo)
//! coordinator   finish, once every rank's write completed
//! ```
//!
//! # Load
//!
//! ```text
//! all ranks     set_checkpoint_id -> read_metadata -> set_up_storage_reader
//!               -> prepare_local_plan
//! coordinator   prepare_global_plan
//! all ranks     read_data (returns a PendingIo)
//! ```
//!
//! A checkpoint is recoverable only after `finish` returned successfully.
//! Steps called out of order, and coordinator-only steps called on a
//! follower, fail with `InvalidState`.

mod state;

pub use state::{ProtocolState, ProtocolTracker, Role, StateHandle};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::future::PendingIo;
use crate::identity::CheckpointId;
use crate::metadata::{Metadata, MetadataIndex, StorageInfo, StorageMeta};
use crate::plan::{LoadPlan, SavePlan};
use crate::planner::{LoadPlanner, SavePlanner};

/// Outcome of writing one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub index: MetadataIndex,
    /// Size of the serialized item before any stream transform.
    pub size_in_bytes: u64,
    /// Location token, only meaningful to the storage that produced it.
    pub storage_data: StorageInfo,
}

/// Storage side of a save.
#[async_trait]
pub trait StorageWriter: Send + Sync {
    /// Starts a new operation against `checkpoint_id`, discarding any state
    /// left by a previous one. Calling it twice with the same id is the same
    /// as calling it once.
    fn set_checkpoint_id(&mut self, checkpoint_id: CheckpointId) -> Result<()>;

    /// Fixes this instance's role for the operation.
    fn set_up_storage_writer(&mut self, is_coordinator: bool) -> Result<()>;

    /// Storage-specific local transform. Never changes the set of items.
    async fn prepare_local_plan(&mut self, plan: SavePlan) -> Result<SavePlan>;

    /// Coordinator only. Returns one plan per input plan, in rank order.
    fn prepare_global_plan(&mut self, plans: Vec<SavePlan>) -> Result<Vec<SavePlan>>;

    /// Writes every item of `plan`, resolving each one through `planner`
    /// right before it is written. Returns without waiting for the writes.
    fn write_data(
        &mut self,
        plan: &SavePlan,
        planner: Arc<dyn SavePlanner>,
    ) -> Result<PendingIo<Vec<WriteResult>>>;

    /// Coordinator only. Commits `metadata` once all ranks' results are in.
    ///
    /// Results are validated before anything is written; on failure the
    /// previously committed checkpoint, if any, is left untouched.
    async fn finish(&mut self, metadata: Metadata, results: Vec<Vec<WriteResult>>) -> Result<()>;

    /// Identity of the current operation, recorded into committed metadata.
    fn storage_meta(&self) -> Option<StorageMeta> {
        None
    }

    /// Whether this storage can handle `checkpoint_id`.
    fn validate_checkpoint_id(checkpoint_id: &CheckpointId) -> bool
    where
        Self: Sized;
}

/// Storage side of a load.
#[async_trait]
pub trait StorageReader: Send + Sync {
    fn set_checkpoint_id(&mut self, checkpoint_id: CheckpointId) -> Result<()>;

    /// Reads the committed metadata.
    ///
    /// # Errors
    ///
    /// `NotFound` when no committed checkpoint exists at the identifier.
    async fn read_metadata(&mut self) -> Result<Metadata>;

    fn set_up_storage_reader(&mut self, metadata: Metadata, is_coordinator: bool) -> Result<()>;

    /// Checks every item against the metadata; fails with `ItemNotFound` on
    /// the first item it cannot locate.
    async fn prepare_local_plan(&mut self, plan: LoadPlan) -> Result<LoadPlan>;

    /// Coordinator only.
    fn prepare_global_plan(&mut self, plans: Vec<LoadPlan>) -> Result<Vec<LoadPlan>>;

    /// Delivers every item of `plan` to `planner`. Returns without waiting;
    /// the handle completes once every item has been delivered.
    fn read_data(&mut self, plan: &LoadPlan, planner: Arc<dyn LoadPlanner>)
        -> Result<PendingIo<()>>;

    fn storage_meta(&self) -> Option<StorageMeta> {
        None
    }

    fn validate_checkpoint_id(checkpoint_id: &CheckpointId) -> bool
    where
        Self: Sized;
}
