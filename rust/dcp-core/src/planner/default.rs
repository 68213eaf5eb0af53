// rust/dcp-core/src/planner/default.rs

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use super::{ItemData, LoadPlanner, SavePlanner, StateDict, StateValue};
use crate::error::{CheckpointError, Result};
use crate::metadata::{
    ChunkStorageMetadata, Metadata, MetadataIndex, StorageMetadata, TensorProperties,
    TensorStorageMetadata,
};
use crate::plan::{
    LoadItemType, LoadPlan, ReadItem, SavePlan, TensorWriteData, WriteItem, WriteItemType,
};
use crate::tensor::{chunk_overlap, copy_region, numel, DType, TensorView};

/// Saves a [`StateDict`] one item per value or local shard.
///
/// Items present on several ranks (replicated values) are written once, by
/// the rank with the least data assigned so far.
pub struct DefaultSavePlanner {
    state_dict: StateDict,
}

impl DefaultSavePlanner {
    pub fn new(state_dict: StateDict) -> Self {
        Self { state_dict }
    }

    pub fn state_dict(&self) -> &StateDict {
        &self.state_dict
    }
}

fn tensor_item(
    fqn: &str,
    item_type: WriteItemType,
    offsets: Vec<usize>,
    tensor: &TensorView,
    global_size: Vec<usize>,
) -> WriteItem {
    WriteItem {
        index: MetadataIndex::with_offset(fqn, offsets.clone()),
        item_type,
        tensor_data: Some(TensorWriteData {
            chunk: ChunkStorageMetadata {
                offsets,
                sizes: tensor.sizes().to_vec(),
            },
            properties: TensorProperties {
                dtype: tensor.dtype(),
            },
            size: global_size,
        }),
    }
}

fn check_shard_bounds(fqn: &str, global_size: &[usize], offsets: &[usize], sizes: &[usize]) -> Result<()> {
    let fits = offsets.len() == global_size.len()
        && sizes.len() == global_size.len()
        && offsets
            .iter()
            .zip(sizes)
            .zip(global_size)
            .all(|((o, s), g)| o + s <= *g);
    if fits {
        Ok(())
    } else {
        Err(CheckpointError::checkpoint(format!(
            "{fqn}: region at {offsets:?} of size {sizes:?} does not fit tensor of size {global_size:?}"
        )))
    }
}

// Bytes items have no known size up front; count them as one byte.
fn planned_size(item: &WriteItem) -> usize {
    item.tensor_nbytes().unwrap_or(1)
}

/// Keeps exactly one copy of every index across all plans.
fn dedup_replicated(plans: Vec<SavePlan>) -> Vec<SavePlan> {
    let mut holders: BTreeMap<MetadataIndex, (Vec<usize>, usize)> = BTreeMap::new();
    for (rank, plan) in plans.iter().enumerate() {
        for item in &plan.items {
            let (ranks, _) = holders
                .entry(item.index.clone())
                .or_insert_with(|| (Vec::new(), planned_size(item)));
            if !ranks.contains(&rank) {
                ranks.push(rank);
            }
        }
    }

    let mut load = vec![0usize; plans.len()];
    let mut owner: HashMap<&MetadataIndex, usize> = HashMap::with_capacity(holders.len());
    for (index, (ranks, size)) in &holders {
        if let [rank] = ranks.as_slice() {
            load[*rank] += size;
            owner.insert(index, *rank);
        }
    }
    let mut replicated = 0usize;
    for (index, (ranks, size)) in &holders {
        if ranks.len() < 2 {
            continue;
        }
        if let Some(&rank) = ranks.iter().min_by_key(|&&r| (load[r], r)) {
            load[rank] += size;
            owner.insert(index, rank);
            replicated += 1;
        }
    }
    if replicated > 0 {
        tracing::debug!(replicated, "assigned replicated items to a single rank");
    }

    let mut emitted: HashSet<MetadataIndex> = HashSet::with_capacity(holders.len());
    plans
        .into_iter()
        .enumerate()
        .map(|(rank, mut plan)| {
            let items: Vec<WriteItem> = std::mem::take(&mut plan.items)
                .into_iter()
                .filter(|item| {
                    owner.get(&item.index) == Some(&rank) && emitted.insert(item.index.clone())
                })
                .collect();
            plan.with_items(items)
        })
        .collect()
}

/// Adds `item` to the schema and returns it with its chunk position hint.
fn register(entries: &mut BTreeMap<String, StorageMetadata>, item: WriteItem) -> Result<WriteItem> {
    let fqn = item.index.fqn.clone();
    let Some(td) = item.tensor_data.clone() else {
        if entries.contains_key(&fqn) {
            return Err(CheckpointError::checkpoint(format!(
                "{fqn}: bytes item collides with an existing entry"
            )));
        }
        entries.insert(fqn, StorageMetadata::Bytes);
        return Ok(item);
    };

    let entry = entries.entry(fqn.clone()).or_insert_with(|| {
        StorageMetadata::Tensor(TensorStorageMetadata {
            properties: td.properties,
            size: td.size.clone(),
            chunks: Vec::new(),
        })
    });
    let StorageMetadata::Tensor(tensor) = entry else {
        return Err(CheckpointError::checkpoint(format!(
            "{fqn}: tensor item collides with a bytes entry"
        )));
    };
    if tensor.properties != td.properties || tensor.size != td.size {
        return Err(CheckpointError::checkpoint(format!(
            "{fqn}: shards disagree on dtype or global size ({:?}{:?} vs {:?}{:?})",
            tensor.properties.dtype, tensor.size, td.properties.dtype, td.size
        )));
    }

    let hint = tensor.chunks.len();
    tensor.chunks.push(td.chunk);
    let WriteItem {
        index,
        item_type,
        tensor_data,
    } = item;
    Ok(WriteItem {
        index: index.with_hint(hint),
        item_type,
        tensor_data,
    })
}

impl SavePlanner for DefaultSavePlanner {
    fn create_local_plan(&self) -> Result<SavePlan> {
        let mut items = Vec::new();
        for (fqn, value) in &self.state_dict {
            match value {
                StateValue::Bytes(_) => items.push(WriteItem::bytes(fqn.clone())),
                StateValue::Tensor(tensor) => items.push(tensor_item(
                    fqn,
                    WriteItemType::Tensor,
                    vec![0; tensor.sizes().len()],
                    tensor,
                    tensor.sizes().to_vec(),
                )),
                StateValue::Sharded {
                    global_size,
                    shards,
                } => {
                    for shard in shards {
                        check_shard_bounds(fqn, global_size, &shard.offsets, shard.tensor.sizes())?;
                        items.push(tensor_item(
                            fqn,
                            WriteItemType::Shard,
                            shard.offsets.clone(),
                            &shard.tensor,
                            global_size.clone(),
                        ));
                    }
                }
            }
        }
        Ok(SavePlan::new(items))
    }

    fn create_global_plan(&self, plans: Vec<SavePlan>) -> Result<(Vec<SavePlan>, Metadata)> {
        let mut entries = BTreeMap::new();
        let mut global = Vec::with_capacity(plans.len());
        for mut plan in dedup_replicated(plans) {
            let items = std::mem::take(&mut plan.items)
                .into_iter()
                .map(|item| register(&mut entries, item))
                .collect::<Result<Vec<_>>>()?;
            global.push(plan.with_items(items));
        }
        Ok((global, Metadata::new(entries)))
    }

    fn resolve_data(&self, item: &WriteItem) -> Result<ItemData> {
        let value = self
            .state_dict
            .get(&item.index.fqn)
            .ok_or_else(|| CheckpointError::item_not_found(&item.index))?;
        match value {
            StateValue::Bytes(bytes) => Ok(ItemData::Bytes(bytes.clone())),
            StateValue::Tensor(tensor) => Ok(ItemData::Tensor(tensor.clone())),
            StateValue::Sharded { shards, .. } => shards
                .iter()
                .find(|shard| item.index.offset.as_ref() == Some(&shard.offsets))
                .map(|shard| ItemData::Tensor(shard.tensor.clone()))
                .ok_or_else(|| CheckpointError::item_not_found(&item.index)),
        }
    }
}

/// What a rank wants restored under one name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadTarget {
    Bytes,
    /// A region of a saved tensor, in global coordinates.
    Tensor {
        dtype: DType,
        offsets: Vec<usize>,
        sizes: Vec<usize>,
    },
}

impl LoadTarget {
    /// The whole tensor of shape `sizes`.
    pub fn whole(dtype: DType, sizes: Vec<usize>) -> Self {
        LoadTarget::Tensor {
            dtype,
            offsets: vec![0; sizes.len()],
            sizes,
        }
    }
}

#[derive(Default)]
struct LoadProgress {
    expected: BTreeMap<String, BTreeSet<MetadataIndex>>,
    delivered: BTreeMap<String, BTreeSet<MetadataIndex>>,
    bytes: BTreeMap<String, Bytes>,
    tensors: BTreeMap<String, Vec<u8>>,
}

/// Restores requested values from any saved sharding.
///
/// Each requested tensor region is assembled from every saved chunk it
/// overlaps, so the reading world size need not match the writing one.
pub struct DefaultLoadPlanner {
    targets: BTreeMap<String, LoadTarget>,
    progress: Mutex<LoadProgress>,
}

impl DefaultLoadPlanner {
    pub fn new(targets: BTreeMap<String, LoadTarget>) -> Self {
        Self {
            targets,
            progress: Mutex::new(LoadProgress::default()),
        }
    }

    fn tensor_target(&self, item: &ReadItem) -> Result<(DType, &[usize])> {
        match self.targets.get(&item.dest_index.fqn) {
            Some(LoadTarget::Tensor { dtype, sizes, .. }) => Ok((*dtype, sizes)),
            _ => Err(CheckpointError::item_not_found(&item.dest_index)),
        }
    }

    /// Takes the restored values out of the planner.
    ///
    /// # Errors
    ///
    /// Fails if any planned item was never delivered.
    pub fn take_state_dict(&self) -> Result<StateDict> {
        let mut progress = std::mem::take(&mut *self.progress.lock());
        let mut state_dict = StateDict::new();

        for (fqn, target) in &self.targets {
            let expected = progress.expected.remove(fqn).unwrap_or_default();
            let delivered = progress.delivered.remove(fqn).unwrap_or_default();
            if let Some(missing) = expected.difference(&delivered).next() {
                return Err(CheckpointError::checkpoint(format!(
                    "{missing} was planned for '{fqn}' but never delivered"
                )));
            }

            let value = match target {
                LoadTarget::Bytes => {
                    let bytes = progress.bytes.remove(fqn).ok_or_else(|| {
                        CheckpointError::checkpoint(format!("'{fqn}' was never loaded"))
                    })?;
                    StateValue::Bytes(bytes)
                }
                LoadTarget::Tensor { dtype, sizes, .. } => {
                    let buffer = progress
                        .tensors
                        .remove(fqn)
                        .unwrap_or_else(|| vec![0; numel(sizes) * dtype.element_size()]);
                    StateValue::Tensor(TensorView::from_bytes(
                        Bytes::from(buffer),
                        *dtype,
                        sizes.clone(),
                    )?)
                }
            };
            state_dict.insert(fqn.clone(), value);
        }
        Ok(state_dict)
    }
}

fn plan_tensor_region(
    fqn: &str,
    saved: &TensorStorageMetadata,
    dtype: DType,
    offsets: &[usize],
    sizes: &[usize],
    items: &mut Vec<ReadItem>,
) -> Result<BTreeSet<MetadataIndex>> {
    if saved.properties.dtype != dtype {
        return Err(CheckpointError::checkpoint(format!(
            "{fqn}: requested {dtype:?} but checkpoint holds {:?}",
            saved.properties.dtype
        )));
    }
    check_shard_bounds(fqn, &saved.size, offsets, sizes)?;

    let dest_index = MetadataIndex::with_offset(fqn, offsets.to_vec());
    let mut storage_indices = BTreeSet::new();
    let mut covered = 0usize;
    for (i, chunk) in saved.chunks.iter().enumerate() {
        let Some(overlap) = chunk_overlap(&chunk.offsets, &chunk.sizes, offsets, sizes) else {
            continue;
        };
        covered += numel(&overlap.lengths);
        let storage_index = MetadataIndex::with_offset(fqn, chunk.offsets.clone()).with_hint(i);
        storage_indices.insert(storage_index.clone());
        items.push(ReadItem {
            item_type: LoadItemType::Tensor,
            dest_index: dest_index.clone(),
            dest_offsets: overlap.dest_offsets,
            storage_index,
            storage_offsets: overlap.storage_offsets,
            lengths: overlap.lengths,
        });
    }

    if covered < numel(sizes) {
        return Err(CheckpointError::checkpoint(format!(
            "{fqn}: saved chunks cover {covered} of {} requested elements",
            numel(sizes)
        )));
    }
    Ok(storage_indices)
}

impl LoadPlanner for DefaultLoadPlanner {
    fn create_local_plan(&self, metadata: &Metadata) -> Result<LoadPlan> {
        let mut items = Vec::new();
        let mut expected = BTreeMap::new();

        for (fqn, target) in &self.targets {
            let saved = metadata
                .state_dict_metadata
                .get(fqn)
                .ok_or_else(|| CheckpointError::item_not_found(fqn))?;
            let indices = match (target, saved) {
                (LoadTarget::Bytes, StorageMetadata::Bytes) => {
                    let index = MetadataIndex::new(fqn.clone());
                    items.push(ReadItem::bytes(index.clone(), index.clone()));
                    BTreeSet::from([index])
                }
                (
                    LoadTarget::Tensor {
                        dtype,
                        offsets,
                        sizes,
                    },
                    StorageMetadata::Tensor(tensor),
                ) => plan_tensor_region(fqn, tensor, *dtype, offsets, sizes, &mut items)?,
                _ => {
                    return Err(CheckpointError::checkpoint(format!(
                        "{fqn}: requested kind does not match the saved entry"
                    )))
                }
            };
            expected.insert(fqn.clone(), indices);
        }

        *self.progress.lock() = LoadProgress {
            expected,
            ..LoadProgress::default()
        };
        Ok(LoadPlan::new(items))
    }

    fn load_bytes(&self, item: &ReadItem, data: Bytes) -> Result<()> {
        let fqn = &item.dest_index.fqn;
        if !matches!(self.targets.get(fqn), Some(LoadTarget::Bytes)) {
            return Err(CheckpointError::item_not_found(&item.dest_index));
        }
        let mut progress = self.progress.lock();
        progress.bytes.insert(fqn.clone(), data);
        progress
            .delivered
            .entry(fqn.clone())
            .or_default()
            .insert(item.storage_index.clone());
        Ok(())
    }

    fn resolve_tensor(&self, item: &ReadItem) -> Result<BytesMut> {
        let (dtype, _) = self.tensor_target(item)?;
        Ok(BytesMut::zeroed(numel(&item.lengths) * dtype.element_size()))
    }

    fn commit_tensor(&self, item: &ReadItem, data: Bytes) -> Result<()> {
        let (dtype, sizes) = self.tensor_target(item)?;
        let element_size = dtype.element_size();
        let fqn = &item.dest_index.fqn;

        let mut progress = self.progress.lock();
        let buffer = progress
            .tensors
            .entry(fqn.clone())
            .or_insert_with(|| vec![0; numel(sizes) * element_size]);
        copy_region(
            &data,
            &item.lengths,
            &vec![0; item.lengths.len()],
            buffer,
            sizes,
            &item.dest_offsets,
            &item.lengths,
            element_size,
        )?;
        progress
            .delivered
            .entry(fqn.clone())
            .or_default()
            .insert(item.storage_index.clone());
        Ok(())
    }
}
