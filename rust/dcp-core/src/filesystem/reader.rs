// rust/dcp-core/src/filesystem/reader.rs

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinSet;
use uuid::Uuid;

use super::join_outcome;
use super::layout::{decode_metadata, METADATA_FILE};
use crate::config::ReaderConfig;
use crate::error::{CheckpointError, Result};
use crate::future::PendingIo;
use crate::identity::CheckpointId;
use crate::metadata::{Metadata, StorageInfo, StorageMeta, StorageMetadata};
use crate::plan::{LoadItemType, LoadPlan, PlanStorageData, ReadItem};
use crate::planner::LoadPlanner;
use crate::protocol::{ProtocolState, ProtocolTracker, Role, StorageReader};
use crate::serialization::{Deserializer, RawSerializer};
use crate::storage::{AsyncStorageBackend, ObjectReader};
use crate::tensor::{copy_region, numel};
use crate::transform::compute_xxhash64;

const PROTOCOL: &str = "storage reader";

/// Reads checkpoints committed by [`FileSystemWriter`](super::FileSystemWriter).
pub struct FileSystemReader {
    storage: Arc<dyn AsyncStorageBackend>,
    config: ReaderConfig,
    deserializer: Arc<dyn Deserializer>,
    tracker: ProtocolTracker,
    checkpoint_dir: Option<PathBuf>,
    metadata: Option<Arc<Metadata>>,
    load_id: String,
}

impl FileSystemReader {
    pub fn new(storage: Arc<dyn AsyncStorageBackend>, config: ReaderConfig) -> Self {
        Self {
            storage,
            config,
            deserializer: Arc::new(RawSerializer),
            tracker: ProtocolTracker::new(PROTOCOL),
            checkpoint_dir: None,
            metadata: None,
            load_id: Uuid::new_v4().to_string(),
        }
    }

    /// Creates a reader already bound to `checkpoint_id`.
    pub fn for_checkpoint(
        storage: Arc<dyn AsyncStorageBackend>,
        config: ReaderConfig,
        checkpoint_id: CheckpointId,
    ) -> Result<Self> {
        let mut reader = Self::new(storage, config);
        reader.set_checkpoint_id(checkpoint_id)?;
        Ok(reader)
    }

    #[must_use]
    pub fn with_deserializer(mut self, deserializer: Arc<dyn Deserializer>) -> Self {
        self.deserializer = deserializer;
        self
    }

    pub fn tracker(&self) -> &ProtocolTracker {
        &self.tracker
    }

    fn checkpoint_dir(&self, operation: &str) -> Result<&Path> {
        self.tracker.require_checkpoint_id(operation)?;
        self.checkpoint_dir.as_deref().ok_or_else(|| {
            CheckpointError::invalid_state(operation, self.tracker.state(), "no checkpoint directory")
        })
    }

    fn checkpoint_name(&self) -> String {
        self.tracker
            .checkpoint_id()
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    fn metadata(&self, operation: &str) -> Result<Arc<Metadata>> {
        self.metadata.clone().ok_or_else(|| {
            CheckpointError::invalid_state(
                format!("{PROTOCOL} {operation}"),
                self.tracker.state(),
                "no metadata has been set up",
            )
        })
    }
}

/// Checks that `item` addresses something the checkpoint actually holds.
fn validate_item(metadata: &Metadata, item: &ReadItem) -> Result<()> {
    if metadata.storage_info(&item.storage_index).is_none() {
        return Err(CheckpointError::item_not_found(&item.storage_index));
    }

    match item.item_type {
        LoadItemType::Bytes => match metadata.state_dict_metadata.get(&item.storage_index.fqn) {
            Some(StorageMetadata::Bytes) => Ok(()),
            _ => Err(CheckpointError::checkpoint(format!(
                "{} is read as bytes but was not saved as bytes",
                item.storage_index
            ))),
        },
        LoadItemType::Tensor => {
            let (_, chunk) = metadata
                .find_chunk(&item.storage_index)
                .ok_or_else(|| CheckpointError::item_not_found(&item.storage_index))?;
            let ndim = chunk.sizes.len();
            let fits = item.storage_offsets.len() == ndim
                && item.lengths.len() == ndim
                && item.dest_offsets.len() == ndim
                && (0..ndim).all(|d| item.storage_offsets[d] + item.lengths[d] <= chunk.sizes[d]);
            if fits {
                Ok(())
            } else {
                Err(CheckpointError::checkpoint(format!(
                    "{}: region at {:?} of length {:?} lies outside the saved chunk {:?}",
                    item.storage_index, item.storage_offsets, item.lengths, chunk.sizes
                )))
            }
        }
    }
}

/// Pairs each item with its stored location, ordered by file then offset.
fn locate_items(metadata: &Metadata, items: Vec<ReadItem>) -> Result<Vec<(ReadItem, StorageInfo)>> {
    let mut located = items
        .into_iter()
        .map(|item| {
            let info = metadata
                .storage_info(&item.storage_index)
                .cloned()
                .ok_or_else(|| CheckpointError::item_not_found(&item.storage_index))?;
            Ok((item, info))
        })
        .collect::<Result<Vec<_>>>()?;

    located.sort_by(|(a, ai), (b, bi)| {
        (&ai.relative_path, ai.offset, &a.dest_index, &a.dest_offsets)
            .cmp(&(&bi.relative_path, bi.offset, &b.dest_index, &b.dest_offsets))
            .then_with(|| (&a.storage_offsets, &a.lengths).cmp(&(&b.storage_offsets, &b.lengths)))
    });
    Ok(located)
}

#[async_trait]
impl StorageReader for FileSystemReader {
    fn set_checkpoint_id(&mut self, checkpoint_id: CheckpointId) -> Result<()> {
        let dir = checkpoint_id.resolve_path()?;
        self.checkpoint_dir = Some(dir);
        self.metadata = None;
        self.load_id = Uuid::new_v4().to_string();
        self.tracker.reset(checkpoint_id);
        Ok(())
    }

    async fn read_metadata(&mut self) -> Result<Metadata> {
        self.tracker
            .expect("read metadata", &[ProtocolState::Identified, ProtocolState::MetadataRead])?;
        let path = self.checkpoint_dir("read metadata")?.join(METADATA_FILE);
        let name = self.checkpoint_name();

        if !self.storage.exists(&path).await? {
            return Err(CheckpointError::not_found(name, "no metadata file"));
        }
        let data = self.storage.open_read(&path).await?.read_all().await?;

        let mut metadata = decode_metadata(&data).map_err(|e| {
            tracing::warn!(checkpoint = %name, error = %e, "metadata file is unreadable");
            CheckpointError::not_found(name.clone(), format!("metadata file is unreadable: {e}"))
        })?;

        let meta = metadata.storage_meta.get_or_insert_with(|| StorageMeta {
            checkpoint_id: Some(name.clone()),
            save_id: String::new(),
            load_id: None,
        });
        meta.load_id = Some(self.load_id.clone());
        self.tracker.metadata_read()?;

        tracing::debug!(
            checkpoint = %name,
            entries = metadata.state_dict_metadata.len(),
            items = metadata.storage_data.len(),
            "read checkpoint metadata"
        );
        Ok(metadata)
    }

    fn set_up_storage_reader(&mut self, metadata: Metadata, is_coordinator: bool) -> Result<()> {
        self.tracker.set_up_after_metadata(Role::from_flag(is_coordinator))?;
        self.metadata = Some(Arc::new(metadata));
        Ok(())
    }

    async fn prepare_local_plan(&mut self, plan: LoadPlan) -> Result<LoadPlan> {
        self.tracker.expect("prepare a local plan", &[ProtocolState::SetUp])?;
        let metadata = self.metadata("prepare a local plan")?;
        for item in &plan.items {
            validate_item(&metadata, item)?;
        }
        self.tracker.local_planned()?;
        Ok(plan)
    }

    fn prepare_global_plan(&mut self, plans: Vec<LoadPlan>) -> Result<Vec<LoadPlan>> {
        self.tracker.global_planned()?;
        let metadata = self.metadata("prepare the global plan")?;

        plans
            .into_iter()
            .map(|mut plan| {
                let mut located = locate_items(&metadata, std::mem::take(&mut plan.items))?;
                located.dedup_by(|(a, _), (b, _)| a.same_request(b));

                let mut files: Vec<String> = Vec::new();
                for (_, info) in &located {
                    if files.last() != Some(&info.relative_path) {
                        files.push(info.relative_path.clone());
                    }
                }
                let items = located.into_iter().map(|(item, _)| item).collect();
                Ok(plan
                    .with_items(items)
                    .with_storage_data(PlanStorageData::ReadFiles { files }))
            })
            .collect()
    }

    fn read_data(&mut self, plan: &LoadPlan, planner: Arc<dyn LoadPlanner>) -> Result<PendingIo<()>> {
        let metadata = self.metadata("read data")?;
        let dir = self.checkpoint_dir("read data")?.to_path_buf();
        let located = locate_items(&metadata, plan.items.clone())?;

        let handle = self.tracker.begin_io("read data")?;

        let mut files: Vec<(String, Vec<(ReadItem, StorageInfo)>)> = Vec::new();
        for (item, info) in located {
            match files.last_mut() {
                Some((file, group)) if *file == info.relative_path => group.push((item, info)),
                _ => files.push((info.relative_path.clone(), vec![(item, info)])),
            }
        }

        let ctx = Arc::new(ReadContext {
            storage: Arc::clone(&self.storage),
            deserializer: Arc::clone(&self.deserializer),
            dir,
            metadata,
            verify_checksums: self.config.verify_checksums,
        });
        let concurrency = self.config.thread_count.max(1);

        let task = async move {
            let result = read_files(ctx, files, planner, concurrency).await;
            handle.settle(&result);
            result
        };
        PendingIo::spawn("read data", task).map_err(|e| {
            self.tracker.abort();
            e
        })
    }

    fn storage_meta(&self) -> Option<StorageMeta> {
        let save_id = self
            .metadata
            .as_ref()
            .and_then(|m| m.storage_meta.as_ref())
            .map(|meta| meta.save_id.clone())
            .unwrap_or_default();
        Some(StorageMeta {
            checkpoint_id: self.tracker.checkpoint_id().map(ToString::to_string),
            save_id,
            load_id: Some(self.load_id.clone()),
        })
    }

    fn validate_checkpoint_id(checkpoint_id: &CheckpointId) -> bool {
        checkpoint_id.resolve_path().is_ok()
    }
}

struct ReadContext {
    storage: Arc<dyn AsyncStorageBackend>,
    deserializer: Arc<dyn Deserializer>,
    dir: PathBuf,
    metadata: Arc<Metadata>,
    verify_checksums: bool,
}

async fn read_files(
    ctx: Arc<ReadContext>,
    files: Vec<(String, Vec<(ReadItem, StorageInfo)>)>,
    planner: Arc<dyn LoadPlanner>,
    concurrency: usize,
) -> Result<()> {
    let mut tasks = JoinSet::new();
    let mut outcomes = Vec::new();

    for (file, items) in files {
        if tasks.len() >= concurrency {
            if let Some(joined) = tasks.join_next().await {
                outcomes.push(join_outcome(joined));
            }
        }
        let ctx = Arc::clone(&ctx);
        let planner = Arc::clone(&planner);
        tasks.spawn(async move { read_file(&ctx, &file, items, planner.as_ref()).await });
    }
    while let Some(joined) = tasks.join_next().await {
        outcomes.push(join_outcome(joined));
    }

    let mut first_error = None;
    for outcome in outcomes {
        if let Err(e) = outcome {
            tracing::warn!(error = %e, "data file read failed");
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

async fn read_file(
    ctx: &ReadContext,
    file: &str,
    items: Vec<(ReadItem, StorageInfo)>,
    planner: &dyn LoadPlanner,
) -> Result<()> {
    let mut reader = ctx.storage.open_read(&ctx.dir.join(file)).await.map_err(|e| {
        let names = items.iter().map(|(item, _)| item.dest_index.to_string()).collect();
        CheckpointError::read_failure_with_source(names, format!("failed to open '{file}'"), e)
    })?;

    // Consecutive requests often slice the same stored item.
    let mut cached: Option<(u64, Bytes)> = None;
    for (item, info) in &items {
        let delivered = async {
            let hit = cached
                .as_ref()
                .filter(|(offset, _)| *offset == info.offset)
                .map(|(_, raw)| raw.clone());
            let raw = match hit {
                Some(raw) => raw,
                None => {
                    let raw = read_stored_item(ctx, reader.as_mut(), info).await?;
                    cached = Some((info.offset, raw.clone()));
                    raw
                }
            };
            deliver(ctx, item, raw, planner)
        }
        .await;

        delivered.map_err(|e| {
            CheckpointError::read_failure_with_source(
                vec![item.dest_index.to_string()],
                format!("failed to load from {}", item.storage_index),
                e,
            )
        })?;
    }

    tracing::debug!(file = %file, items = items.len(), "read data file");
    Ok(())
}

async fn read_stored_item(
    ctx: &ReadContext,
    reader: &mut dyn ObjectReader,
    info: &StorageInfo,
) -> Result<Bytes> {
    let length = usize::try_from(info.length)
        .map_err(|_| CheckpointError::checkpoint(format!("item length {} is too large", info.length)))?;
    let encoded = reader.read_range(info.offset, length).await?;
    let raw = info.transform.decode(encoded, info.raw_length)?;

    if ctx.verify_checksums {
        let actual = compute_xxhash64(&raw);
        if actual != info.checksum {
            return Err(CheckpointError::checkpoint(format!(
                "checksum mismatch in '{}' at offset {}: expected {:016x}, got {actual:016x}",
                info.relative_path, info.offset, info.checksum
            )));
        }
    }
    Ok(raw)
}

fn deliver(ctx: &ReadContext, item: &ReadItem, raw: Bytes, planner: &dyn LoadPlanner) -> Result<()> {
    match item.item_type {
        LoadItemType::Bytes => planner.load_bytes(item, ctx.deserializer.deserialize_bytes(raw)?),
        LoadItemType::Tensor => {
            let (tensor, chunk) = ctx
                .metadata
                .find_chunk(&item.storage_index)
                .ok_or_else(|| CheckpointError::item_not_found(&item.storage_index))?;
            let stored = ctx
                .deserializer
                .deserialize_tensor(raw, &tensor.properties, &chunk.sizes)?
                .to_contiguous_bytes();

            let element_size = tensor.properties.dtype.element_size();
            let mut target = planner.resolve_tensor(item)?;
            let expected = numel(&item.lengths) * element_size;
            if target.len() != expected {
                return Err(CheckpointError::checkpoint(format!(
                    "planner returned a {} byte buffer for a {expected} byte region",
                    target.len()
                )));
            }

            copy_region(
                &stored,
                &chunk.sizes,
                &item.storage_offsets,
                &mut target,
                &item.lengths,
                &vec![0; item.lengths.len()],
                &item.lengths,
                element_size,
            )?;
            planner.commit_tensor(item, target.freeze())
        }
    }
}
