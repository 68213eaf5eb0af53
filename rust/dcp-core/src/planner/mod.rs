// rust/dcp-core/src/planner/mod.rs

//! The "what to persist" half of a checkpoint.
//!
//! Planners turn in-memory state into plan items and back. Storage never looks
//! inside the state; it pulls item data through [`SavePlanner::resolve_data`]
//! and pushes loaded data through [`LoadPlanner::load_bytes`] and
//! [`LoadPlanner::commit_tensor`].

mod default;

pub use default::{DefaultLoadPlanner, DefaultSavePlanner, LoadTarget};

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

use crate::error::Result;
use crate::metadata::Metadata;
use crate::plan::{LoadPlan, ReadItem, SavePlan, WriteItem};
use crate::tensor::TensorView;

/// Data resolved for one write item.
#[derive(Debug, Clone)]
pub enum ItemData {
    Bytes(Bytes),
    Tensor(TensorView),
}

/// One locally held shard of a distributed tensor.
#[derive(Debug, Clone)]
pub struct LocalShard {
    /// Position of the shard in global coordinates.
    pub offsets: Vec<usize>,
    pub tensor: TensorView,
}

#[derive(Debug, Clone)]
pub enum StateValue {
    Bytes(Bytes),
    /// A tensor held whole by this rank.
    Tensor(TensorView),
    /// The shards of a distributed tensor held by this rank.
    Sharded {
        global_size: Vec<usize>,
        shards: Vec<LocalShard>,
    },
}

/// Named state of one rank.
pub type StateDict = BTreeMap<String, StateValue>;

/// Save-side planner.
pub trait SavePlanner: Send + Sync {
    /// Describes everything this rank holds.
    fn create_local_plan(&self) -> Result<SavePlan>;

    /// Coordinator only: reconciles all local plans and builds the metadata
    /// schema. Returns exactly one plan per input plan, in rank order.
    fn create_global_plan(&self, plans: Vec<SavePlan>) -> Result<(Vec<SavePlan>, Metadata)>;

    /// Applies the coordinator's decision to this rank's plan.
    fn finish_plan(&self, plan: SavePlan) -> Result<SavePlan> {
        Ok(plan)
    }

    /// Produces the data of `item`. Called lazily, right before the item is
    /// written.
    fn resolve_data(&self, item: &WriteItem) -> Result<ItemData>;
}

/// Load-side planner.
pub trait LoadPlanner: Send + Sync {
    /// Describes what this rank needs from the committed checkpoint.
    fn create_local_plan(&self, metadata: &Metadata) -> Result<LoadPlan>;

    fn create_global_plan(&self, plans: Vec<LoadPlan>) -> Result<Vec<LoadPlan>> {
        Ok(plans)
    }

    fn finish_plan(&self, plan: LoadPlan) -> Result<LoadPlan> {
        Ok(plan)
    }

    /// Receives a byte item.
    fn load_bytes(&self, item: &ReadItem, data: Bytes) -> Result<()>;

    /// Returns a zeroed buffer sized for the region `item` delivers.
    fn resolve_tensor(&self, item: &ReadItem) -> Result<BytesMut>;

    /// Receives the buffer from [`resolve_tensor`](Self::resolve_tensor) once
    /// storage has filled it.
    fn commit_tensor(&self, item: &ReadItem, data: Bytes) -> Result<()>;
}
