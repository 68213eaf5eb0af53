// rust/dcp-core/src/plan.rs

//! Plan item model shared by planners and storage.
//!
//! Plans are values: every transformation returns a new plan, so a planner
//! never observes storage rewriting a plan it still holds.

use serde::{Deserialize, Serialize};

use crate::metadata::{ChunkStorageMetadata, MetadataIndex, TensorProperties};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteItemType {
    /// A whole tensor owned by one rank.
    Tensor,
    /// One shard of a tensor distributed across ranks.
    Shard,
    /// An opaque byte payload.
    Bytes,
}

/// Projection of the tensor data a write item covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorWriteData {
    pub chunk: ChunkStorageMetadata,
    pub properties: TensorProperties,
    /// Global shape of the tensor the chunk belongs to.
    pub size: Vec<usize>,
}

/// One unit of data to persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteItem {
    pub index: MetadataIndex,
    pub item_type: WriteItemType,
    pub tensor_data: Option<TensorWriteData>,
}

impl WriteItem {
    pub fn bytes(fqn: impl Into<String>) -> Self {
        Self {
            index: MetadataIndex::new(fqn),
            item_type: WriteItemType::Bytes,
            tensor_data: None,
        }
    }

    pub fn is_tensor(&self) -> bool {
        self.item_type != WriteItemType::Bytes
    }

    /// Number of bytes the serialized item will occupy, when known up front.
    pub fn tensor_nbytes(&self) -> Option<usize> {
        self.tensor_data.as_ref().map(|td| {
            td.chunk.sizes.iter().product::<usize>() * td.properties.dtype.element_size()
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadItemType {
    Tensor,
    Bytes,
}

/// One unit of data to restore: a region of a stored item delivered into a
/// region of a destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadItem {
    pub item_type: LoadItemType,
    /// Destination entry in the planner's state.
    pub dest_index: MetadataIndex,
    /// Offsets inside the destination region.
    pub dest_offsets: Vec<usize>,
    /// Stored item to read from.
    pub storage_index: MetadataIndex,
    /// Offsets inside the stored chunk.
    pub storage_offsets: Vec<usize>,
    pub lengths: Vec<usize>,
}

impl ReadItem {
    pub fn bytes(dest_index: MetadataIndex, storage_index: MetadataIndex) -> Self {
        Self {
            item_type: LoadItemType::Bytes,
            dest_index,
            dest_offsets: Vec::new(),
            storage_index,
            storage_offsets: Vec::new(),
            lengths: Vec::new(),
        }
    }

    /// Two read items are redundant when they deliver the same stored region
    /// into the same destination region.
    pub fn same_request(&self, other: &ReadItem) -> bool {
        self == other
    }
}

/// Storage annotation attached to a plan during storage planning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanStorageData {
    /// Data file name prefix assigned to a rank by the coordinator.
    WritePrefix { prefix: String, attempt: String },
    /// Data files a rank will read, in access order.
    ReadFiles { files: Vec<String> },
}

/// Items one rank will write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavePlan {
    pub items: Vec<WriteItem>,
    pub storage_data: Option<PlanStorageData>,
}

impl SavePlan {
    pub fn new(items: Vec<WriteItem>) -> Self {
        Self {
            items,
            storage_data: None,
        }
    }

    #[must_use]
    pub fn with_items(self, items: Vec<WriteItem>) -> Self {
        Self { items, ..self }
    }

    #[must_use]
    pub fn with_storage_data(self, storage_data: PlanStorageData) -> Self {
        Self {
            storage_data: Some(storage_data),
            ..self
        }
    }
}

/// Items one rank will read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadPlan {
    pub items: Vec<ReadItem>,
    pub storage_data: Option<PlanStorageData>,
}

impl LoadPlan {
    pub fn new(items: Vec<ReadItem>) -> Self {
        Self {
            items,
            storage_data: None,
        }
    }

    #[must_use]
    pub fn with_items(self, items: Vec<ReadItem>) -> Self {
        Self { items, ..self }
    }

    #[must_use]
    pub fn with_storage_data(self, storage_data: PlanStorageData) -> Self {
        Self {
            storage_data: Some(storage_data),
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;

    #[test]
    fn test_transform_leaves_original_untouched() {
        let plan = SavePlan::new(vec![WriteItem::bytes("step")]);
        let annotated = plan.clone().with_storage_data(PlanStorageData::WritePrefix {
            prefix: "__0_ab_".to_string(),
            attempt: "ab".to_string(),
        });

        assert!(plan.storage_data.is_none());
        assert_eq!(annotated.items, plan.items);
    }

    #[test]
    fn test_tensor_nbytes() {
        let item = WriteItem {
            index: MetadataIndex::with_offset("w", vec![0, 0]),
            item_type: WriteItemType::Shard,
            tensor_data: Some(TensorWriteData {
                chunk: ChunkStorageMetadata {
                    offsets: vec![0, 0],
                    sizes: vec![3, 5],
                },
                properties: TensorProperties { dtype: DType::F64 },
                size: vec![6, 5],
            }),
        };
        assert!(item.is_tensor());
        assert_eq!(item.tensor_nbytes(), Some(3 * 5 * 8));
        assert_eq!(WriteItem::bytes("b").tensor_nbytes(), None);
    }
}
