// rust/dcp-core/src/metadata.rs

//! Durable checkpoint metadata.
//!
//! [`Metadata`] is written once by the coordinator and is the only thing a
//! reader needs to locate every item of a checkpoint. It describes items in
//! global coordinates, so it does not depend on how many ranks wrote them.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::tensor::DType;
use crate::transform::StreamTransform;

/// Current layout version of [`Metadata`].
pub const METADATA_VERSION: u32 = 1;

/// Key correlating a logical item with its physical location.
///
/// `index` is only a lookup hint into the chunk list of a tensor entry and
/// takes no part in equality, hashing or ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataIndex {
    /// Fully qualified name of the state entry.
    pub fqn: String,
    /// Chunk offset for tensor items, `None` for byte items.
    pub offset: Option<Vec<usize>>,
    pub index: Option<usize>,
}

impl MetadataIndex {
    pub fn new(fqn: impl Into<String>) -> Self {
        Self {
            fqn: fqn.into(),
            offset: None,
            index: None,
        }
    }

    pub fn with_offset(fqn: impl Into<String>, offset: Vec<usize>) -> Self {
        Self {
            fqn: fqn.into(),
            offset: Some(offset),
            index: None,
        }
    }

    #[must_use]
    pub fn with_hint(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }
}

impl PartialEq for MetadataIndex {
    fn eq(&self, other: &Self) -> bool {
        self.fqn == other.fqn && self.offset == other.offset
    }
}

impl Eq for MetadataIndex {}

impl Hash for MetadataIndex {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fqn.hash(state);
        self.offset.hash(state);
    }
}

impl PartialOrd for MetadataIndex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MetadataIndex {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.fqn, &self.offset).cmp(&(&other.fqn, &other.offset))
    }
}

impl fmt::Display for MetadataIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.offset {
            Some(offset) => write!(f, "{}@{:?}", self.fqn, offset),
            None => f.write_str(&self.fqn),
        }
    }
}

/// Offsets and sizes of one saved chunk, in global tensor coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkStorageMetadata {
    pub offsets: Vec<usize>,
    pub sizes: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorProperties {
    pub dtype: DType,
}

/// A tensor entry: global shape plus every chunk that was saved for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorStorageMetadata {
    pub properties: TensorProperties,
    pub size: Vec<usize>,
    pub chunks: Vec<ChunkStorageMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageMetadata {
    Tensor(TensorStorageMetadata),
    Bytes,
}

/// Storage-specific location token produced by a write.
///
/// Only the storage layer that produced it interprets these fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    /// Data file, relative to the checkpoint directory.
    pub relative_path: String,
    /// Byte offset of the encoded item inside the data file.
    pub offset: u64,
    /// Encoded length in bytes.
    pub length: u64,
    /// Serialized length before the transform.
    pub raw_length: u64,
    pub transform: StreamTransform,
    /// xxHash64 of the serialized (pre-transform) item.
    pub checksum: u64,
}

/// Identity of the save and load operations that touched a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMeta {
    pub checkpoint_id: Option<String>,
    pub save_id: String,
    pub load_id: Option<String>,
}

/// The committed record of one checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub version: u32,
    /// Logical schema: one entry per fully qualified name.
    pub state_dict_metadata: BTreeMap<String, StorageMetadata>,
    /// Physical locations, filled in by the storage writer at commit time.
    pub storage_data: BTreeMap<MetadataIndex, StorageInfo>,
    pub storage_meta: Option<StorageMeta>,
    pub created_at_ms: i64,
}

impl Metadata {
    pub fn new(state_dict_metadata: BTreeMap<String, StorageMetadata>) -> Self {
        Self {
            version: METADATA_VERSION,
            state_dict_metadata,
            storage_data: BTreeMap::new(),
            storage_meta: None,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Every index the schema says must have been written, in key order.
    pub fn expected_indices(&self) -> Vec<MetadataIndex> {
        let mut indices = Vec::new();
        for (fqn, entry) in &self.state_dict_metadata {
            match entry {
                StorageMetadata::Bytes => indices.push(MetadataIndex::new(fqn.clone())),
                StorageMetadata::Tensor(tensor) => {
                    for (i, chunk) in tensor.chunks.iter().enumerate() {
                        indices.push(
                            MetadataIndex::with_offset(fqn.clone(), chunk.offsets.clone())
                                .with_hint(i),
                        );
                    }
                }
            }
        }
        indices
    }

    pub fn storage_info(&self, index: &MetadataIndex) -> Option<&StorageInfo> {
        self.storage_data.get(index)
    }

    /// Finds the tensor entry and saved chunk addressed by `index`.
    pub fn find_chunk(
        &self,
        index: &MetadataIndex,
    ) -> Option<(&TensorStorageMetadata, &ChunkStorageMetadata)> {
        let offset = index.offset.as_ref()?;
        let StorageMetadata::Tensor(tensor) = self.state_dict_metadata.get(&index.fqn)? else {
            return None;
        };

        if let Some(chunk) = index.index.and_then(|i| tensor.chunks.get(i)) {
            if &chunk.offsets == offset {
                return Some((tensor, chunk));
            }
        }
        tensor
            .chunks
            .iter()
            .find(|chunk| &chunk.offsets == offset)
            .map(|chunk| (tensor, chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn sharded_metadata() -> Metadata {
        let mut entries = BTreeMap::new();
        entries.insert(
            "model.weight".to_string(),
            StorageMetadata::Tensor(TensorStorageMetadata {
                properties: TensorProperties { dtype: DType::F32 },
                size: vec![4, 2],
                chunks: vec![
                    ChunkStorageMetadata {
                        offsets: vec![0, 0],
                        sizes: vec![2, 2],
                    },
                    ChunkStorageMetadata {
                        offsets: vec![2, 0],
                        sizes: vec![2, 2],
                    },
                ],
            }),
        );
        entries.insert("optimizer.step".to_string(), StorageMetadata::Bytes);
        Metadata::new(entries)
    }

    #[test]
    fn test_index_equality_ignores_hint() {
        let a = MetadataIndex::with_offset("w", vec![2, 0]);
        let b = MetadataIndex::with_offset("w", vec![2, 0]).with_hint(1);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_index_display() {
        assert_eq!(MetadataIndex::new("step").to_string(), "step");
        assert_eq!(
            MetadataIndex::with_offset("w", vec![2, 0]).to_string(),
            "w@[2, 0]"
        );
    }

    #[test]
    fn test_expected_indices() {
        let metadata = sharded_metadata();
        let indices = metadata.expected_indices();
        assert_eq!(
            indices,
            vec![
                MetadataIndex::with_offset("model.weight", vec![0, 0]),
                MetadataIndex::with_offset("model.weight", vec![2, 0]),
                MetadataIndex::new("optimizer.step"),
            ]
        );
    }

    #[test]
    fn test_find_chunk_with_stale_hint() {
        let metadata = sharded_metadata();
        let index = MetadataIndex::with_offset("model.weight", vec![2, 0]).with_hint(0);
        let (tensor, chunk) = metadata.find_chunk(&index).unwrap();
        assert_eq!(tensor.size, vec![4, 2]);
        assert_eq!(chunk.offsets, vec![2, 0]);

        assert!(metadata.find_chunk(&MetadataIndex::new("optimizer.step")).is_none());
        assert!(metadata
            .find_chunk(&MetadataIndex::with_offset("model.weight", vec![1, 0]))
            .is_none());
    }
}
