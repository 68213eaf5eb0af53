// rust/dcp-core/src/serialization.rs

//! Item encoding between planner data and stored bytes.

use bytes::Bytes;

use crate::error::{CheckpointError, Result};
use crate::metadata::TensorProperties;
use crate::plan::WriteItem;
use crate::planner::ItemData;
use crate::tensor::TensorView;

/// Turns resolved item data into the bytes handed to storage.
pub trait Serializer: Send + Sync {
    fn serialize(&self, item: &WriteItem, data: ItemData) -> Result<Bytes>;
}

/// Reverses a [`Serializer`] for the read path.
pub trait Deserializer: Send + Sync {
    /// Decodes one stored chunk of the given shape.
    fn deserialize_tensor(
        &self,
        data: Bytes,
        properties: &TensorProperties,
        sizes: &[usize],
    ) -> Result<TensorView>;

    fn deserialize_bytes(&self, data: Bytes) -> Result<Bytes> {
        Ok(data)
    }
}

/// Stores tensors as their row-major little-endian projection and byte items
/// verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawSerializer;

impl Serializer for RawSerializer {
    fn serialize(&self, item: &WriteItem, data: ItemData) -> Result<Bytes> {
        match (&item.tensor_data, data) {
            (None, ItemData::Bytes(bytes)) => Ok(bytes),
            (Some(td), ItemData::Tensor(tensor)) => {
                if tensor.dtype() != td.properties.dtype || tensor.sizes() != td.chunk.sizes {
                    return Err(CheckpointError::serialization(format!(
                        "{}: resolved tensor {:?}{:?} does not match planned chunk {:?}{:?}",
                        item.index,
                        tensor.dtype(),
                        tensor.sizes(),
                        td.properties.dtype,
                        td.chunk.sizes
                    )));
                }
                Ok(tensor.to_contiguous_bytes())
            }
            (None, ItemData::Tensor(_)) => Err(CheckpointError::serialization(format!(
                "{}: planned as bytes but resolved to a tensor",
                item.index
            ))),
            (Some(_), ItemData::Bytes(_)) => Err(CheckpointError::serialization(format!(
                "{}: planned as a tensor but resolved to bytes",
                item.index
            ))),
        }
    }
}

impl Deserializer for RawSerializer {
    fn deserialize_tensor(
        &self,
        data: Bytes,
        properties: &TensorProperties,
        sizes: &[usize],
    ) -> Result<TensorView> {
        TensorView::from_bytes(data, properties.dtype, sizes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ChunkStorageMetadata, MetadataIndex};
    use crate::plan::{TensorWriteData, WriteItemType};
    use crate::tensor::DType;

    fn shard_item(sizes: Vec<usize>) -> WriteItem {
        WriteItem {
            index: MetadataIndex::with_offset("w", vec![0, 0]),
            item_type: WriteItemType::Shard,
            tensor_data: Some(TensorWriteData {
                chunk: ChunkStorageMetadata {
                    offsets: vec![0, 0],
                    sizes: sizes.clone(),
                },
                properties: TensorProperties { dtype: DType::F32 },
                size: sizes,
            }),
        }
    }

    #[test]
    fn test_non_contiguous_view_stores_projection() {
        let values: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let cols = TensorView::from_f32(&values, vec![4, 4])
            .unwrap()
            .narrow(1, 1, 2)
            .unwrap();

        let bytes = RawSerializer
            .serialize(&shard_item(vec![4, 2]), ItemData::Tensor(cols))
            .unwrap();
        assert_eq!(bytes.len(), 8 * 4);

        let restored = RawSerializer
            .deserialize_tensor(bytes, &TensorProperties { dtype: DType::F32 }, &[4, 2])
            .unwrap();
        assert_eq!(
            restored.to_f32_vec().unwrap(),
            vec![1.0, 2.0, 5.0, 6.0, 9.0, 10.0, 13.0, 14.0]
        );
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let tensor = TensorView::from_f32(&[1.0, 2.0], vec![2, 1]).unwrap();
        let err = RawSerializer
            .serialize(&shard_item(vec![1, 2]), ItemData::Tensor(tensor))
            .unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let item = WriteItem::bytes("step");
        let tensor = TensorView::from_f32(&[1.0], vec![1]).unwrap();
        assert!(RawSerializer.serialize(&item, ItemData::Tensor(tensor)).is_err());

        let bytes = RawSerializer
            .serialize(&item, ItemData::Bytes(Bytes::from_static(b"42")))
            .unwrap();
        assert_eq!(bytes.as_ref(), b"42");
    }
}
