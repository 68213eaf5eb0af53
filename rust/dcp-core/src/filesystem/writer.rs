// rust/dcp-core/src/filesystem/writer.rs

//! Save side of the filesystem layout.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use uuid::Uuid;

use super::join_outcome;
use super::layout::{
    attempt_of, data_file_name, data_file_prefix, encode_metadata, is_data_file, is_data_temp_file,
    new_attempt_token, temp_name, METADATA_FILE,
};
use crate::config::WriterConfig;
use crate::error::{CheckpointError, Result};
use crate::future::PendingIo;
use crate::identity::CheckpointId;
use crate::metadata::{Metadata, MetadataIndex, StorageInfo, StorageMeta};
use crate::plan::{PlanStorageData, SavePlan, WriteItem};
use crate::planner::SavePlanner;
use crate::protocol::{ProtocolState, ProtocolTracker, Role, StorageWriter, WriteResult};
use crate::serialization::{RawSerializer, Serializer};
use crate::storage::{AsyncStorageBackend, ObjectWriter};
use crate::transform::{compute_xxhash64, StreamTransform};

const PROTOCOL: &str = "storage writer";

/// Writes checkpoints as a directory of data files plus one metadata file.
///
/// Every rank writes its items into files named after the prefix the
/// coordinator assigned it, so ranks never touch each other's files.
pub struct FileSystemWriter {
    storage: Arc<dyn AsyncStorageBackend>,
    config: WriterConfig,
    serializer: Arc<dyn Serializer>,
    tracker: ProtocolTracker,
    checkpoint_dir: Option<PathBuf>,
    attempt: Option<String>,
    save_id: String,
}

impl FileSystemWriter {
    pub fn new(storage: Arc<dyn AsyncStorageBackend>, config: WriterConfig) -> Self {
        Self {
            storage,
            config,
            serializer: Arc::new(RawSerializer),
            tracker: ProtocolTracker::new(PROTOCOL),
            checkpoint_dir: None,
            attempt: None,
            save_id: Uuid::new_v4().to_string(),
        }
    }

    /// Creates a writer already bound to `checkpoint_id`; the protocol can
    /// then start at `set_up_storage_writer`.
    pub fn for_checkpoint(
        storage: Arc<dyn AsyncStorageBackend>,
        config: WriterConfig,
        checkpoint_id: CheckpointId,
    ) -> Result<Self> {
        let mut writer = Self::new(storage, config);
        writer.set_checkpoint_id(checkpoint_id)?;
        Ok(writer)
    }

    #[must_use]
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
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

    /// Checks that results and metadata describe the same item set, all
    /// written by the current attempt, and returns the location index.
    fn collect_locations(
        &self,
        metadata: &Metadata,
        results: Vec<Vec<WriteResult>>,
    ) -> Result<BTreeMap<MetadataIndex, StorageInfo>> {
        let attempt = self.attempt.as_deref().ok_or_else(|| {
            CheckpointError::invalid_state("finish", self.tracker.state(), "no attempt token")
        })?;

        let mut locations = BTreeMap::new();
        for result in results.into_iter().flatten() {
            if attempt_of(&result.storage_data.relative_path) != Some(attempt) {
                return Err(CheckpointError::checkpoint(format!(
                    "result for {} points at '{}', which does not belong to attempt {attempt}",
                    result.index, result.storage_data.relative_path
                )));
            }
            let index = result.index;
            if locations.insert(index.clone(), result.storage_data).is_some() {
                return Err(CheckpointError::checkpoint(format!(
                    "item {index} was reported written more than once"
                )));
            }
        }

        let expected: BTreeSet<MetadataIndex> = metadata.expected_indices().into_iter().collect();
        if let Some(missing) = expected.iter().find(|index| !locations.contains_key(*index)) {
            return Err(CheckpointError::checkpoint(format!(
                "metadata describes {missing} but no rank wrote it"
            )));
        }
        if let Some(extra) = locations.keys().find(|index| !expected.contains(*index)) {
            return Err(CheckpointError::checkpoint(format!(
                "{extra} was written but is not described by the metadata"
            )));
        }
        Ok(locations)
    }

    /// Publishes `metadata` through a temporary file and a rename.
    async fn commit_metadata(&self, dir: &Path, metadata: &Metadata) -> Result<()> {
        let encoded = encode_metadata(metadata)?;
        let temp_path = dir.join(temp_name(METADATA_FILE));
        let final_path = dir.join(METADATA_FILE);

        let mut writer = self.storage.open_write(&temp_path).await?;
        let published = async {
            writer.write_all_bytes(&encoded).await?;
            writer.finish().await?;
            self.storage.rename(&temp_path, &final_path).await
        }
        .await;

        if let Err(e) = published {
            if let Err(cleanup) = self.storage.delete(&temp_path).await {
                tracing::debug!(error = %cleanup, "temporary metadata file not removed");
            }
            return Err(CheckpointError::partial_commit(
                self.checkpoint_name(),
                "metadata was not published",
                Some(e),
            ));
        }
        Ok(())
    }

    /// Removes data files that the committed metadata no longer references.
    async fn remove_stale_files(&self, dir: &Path, metadata: &Metadata) {
        let referenced: BTreeSet<&str> = metadata
            .storage_data
            .values()
            .map(|info| info.relative_path.as_str())
            .collect();

        let entries = match self.storage.list(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "could not list checkpoint directory for cleanup");
                return;
            }
        };

        for name in entries {
            let stale = (is_data_file(&name) && !referenced.contains(name.as_str()))
                || is_data_temp_file(&name);
            if !stale {
                continue;
            }
            match self.storage.delete(&dir.join(&name)).await {
                Ok(()) => tracing::debug!(file = %name, "removed stale data file"),
                Err(e) => tracing::warn!(file = %name, error = %e, "failed to remove stale data file"),
            }
        }
    }
}

#[async_trait]
impl StorageWriter for FileSystemWriter {
    fn set_checkpoint_id(&mut self, checkpoint_id: CheckpointId) -> Result<()> {
        let dir = checkpoint_id.resolve_path()?;
        self.checkpoint_dir = Some(dir);
        self.attempt = None;
        self.save_id = Uuid::new_v4().to_string();
        self.tracker.reset(checkpoint_id);
        Ok(())
    }

    fn set_up_storage_writer(&mut self, is_coordinator: bool) -> Result<()> {
        self.tracker.set_up(Role::from_flag(is_coordinator))?;
        tracing::debug!(
            checkpoint = %self.checkpoint_name(),
            is_coordinator,
            backend = self.storage.backend_type(),
            "storage writer set up"
        );
        Ok(())
    }

    async fn prepare_local_plan(&mut self, plan: SavePlan) -> Result<SavePlan> {
        self.tracker.expect("prepare a local plan", &[ProtocolState::SetUp])?;
        let dir = self.checkpoint_dir("prepare a local plan")?.to_path_buf();

        if !self.config.overwrite && self.storage.exists(&dir.join(METADATA_FILE)).await? {
            return Err(CheckpointError::checkpoint(format!(
                "a committed checkpoint already exists at '{}' and overwrite is disabled",
                dir.display()
            )));
        }
        self.storage.create_dir_all(&dir).await?;

        self.tracker.local_planned()?;
        Ok(plan)
    }

    fn prepare_global_plan(&mut self, plans: Vec<SavePlan>) -> Result<Vec<SavePlan>> {
        self.tracker.global_planned()?;

        let attempt = new_attempt_token();
        let plans: Vec<SavePlan> = plans
            .into_iter()
            .enumerate()
            .map(|(rank, plan)| {
                plan.with_storage_data(PlanStorageData::WritePrefix {
                    prefix: data_file_prefix(rank, &attempt),
                    attempt: attempt.clone(),
                })
            })
            .collect();

        tracing::info!(
            checkpoint = %self.checkpoint_name(),
            attempt = %attempt,
            ranks = plans.len(),
            "assigned data file prefixes"
        );
        self.attempt = Some(attempt);
        Ok(plans)
    }

    fn write_data(
        &mut self,
        plan: &SavePlan,
        planner: Arc<dyn SavePlanner>,
    ) -> Result<PendingIo<Vec<WriteResult>>> {
        let Some(PlanStorageData::WritePrefix { prefix, attempt }) = &plan.storage_data else {
            return Err(CheckpointError::invalid_state(
                "storage writer write data",
                self.tracker.state(),
                "plan has no data file prefix; it must come from prepare_global_plan",
            ));
        };
        let current = self.attempt.as_deref();
        if let Some(current) = current.filter(|current| *current != attempt.as_str()) {
            return Err(CheckpointError::invalid_state(
                "storage writer write data",
                self.tracker.state(),
                format!("plan belongs to attempt {attempt} but this attempt is {current}"),
            ));
        }
        let dir = self.checkpoint_dir("write data")?.to_path_buf();
        let transform = self.config.transform()?;

        let handle = self.tracker.begin_io("write data")?;
        self.attempt = Some(attempt.clone());

        let files = split_items(
            plan.items.clone(),
            self.config.thread_count,
            self.config.single_file_per_rank,
        );
        let ctx = Arc::new(WriteContext {
            storage: Arc::clone(&self.storage),
            serializer: Arc::clone(&self.serializer),
            dir,
            transform,
        });
        let prefix = prefix.clone();
        let concurrency = self.config.thread_count.max(1);

        let task = async move {
            let result = write_files(ctx, prefix, files, planner, concurrency).await;
            handle.settle(&result);
            result
        };
        PendingIo::spawn("write data", task).map_err(|e| {
            self.tracker.abort();
            e
        })
    }

    async fn finish(&mut self, mut metadata: Metadata, results: Vec<Vec<WriteResult>>) -> Result<()> {
        self.tracker.check_commit()?;
        let dir = self.checkpoint_dir("finish")?.to_path_buf();

        let locations = match self.collect_locations(&metadata, results) {
            Ok(locations) => locations,
            Err(e) => {
                self.tracker.abort();
                return Err(e);
            }
        };
        metadata.storage_data = locations;
        metadata.storage_meta = self.storage_meta();

        if let Err(e) = self.commit_metadata(&dir, &metadata).await {
            self.tracker.abort();
            return Err(e);
        }
        self.tracker.committed();
        tracing::info!(
            checkpoint = %self.checkpoint_name(),
            items = metadata.storage_data.len(),
            "checkpoint committed"
        );

        if self.config.cleanup_stale_files {
            self.remove_stale_files(&dir, &metadata).await;
        }
        Ok(())
    }

    fn storage_meta(&self) -> Option<StorageMeta> {
        Some(StorageMeta {
            checkpoint_id: self.tracker.checkpoint_id().map(ToString::to_string),
            save_id: self.save_id.clone(),
            load_id: None,
        })
    }

    fn validate_checkpoint_id(checkpoint_id: &CheckpointId) -> bool {
        checkpoint_id.resolve_path().is_ok()
    }
}

struct WriteContext {
    storage: Arc<dyn AsyncStorageBackend>,
    serializer: Arc<dyn Serializer>,
    dir: PathBuf,
    transform: StreamTransform,
}

fn item_names(items: &[WriteItem]) -> Vec<String> {
    items.iter().map(|item| item.index.to_string()).collect()
}

/// Groups a rank's items into the files it will write.
///
/// With one file per rank disabled every item gets its own file. Otherwise
/// items are spread over `bins` files: byte items round-robin, then tensors
/// largest first onto the currently smallest file.
pub(crate) fn split_items(items: Vec<WriteItem>, bins: usize, single_file_per_rank: bool) -> Vec<Vec<WriteItem>> {
    if !single_file_per_rank {
        return items.into_iter().map(|item| vec![item]).collect();
    }

    let bins = bins.max(1);
    let mut files: Vec<Vec<WriteItem>> = vec![Vec::new(); bins];
    let mut sizes = vec![0usize; bins];

    let (bytes_items, mut tensor_items): (Vec<_>, Vec<_>) =
        items.into_iter().partition(|item| !item.is_tensor());
    for (i, item) in bytes_items.into_iter().enumerate() {
        files[i % bins].push(item);
    }

    tensor_items.sort_by_key(|item| std::cmp::Reverse(item.tensor_nbytes().unwrap_or(0)));
    for item in tensor_items {
        let target = (0..bins).min_by_key(|&i| (sizes[i], i)).unwrap_or(0);
        sizes[target] += item.tensor_nbytes().unwrap_or(0);
        files[target].push(item);
    }

    files.retain(|file| !file.is_empty());
    files
}

async fn write_files(
    ctx: Arc<WriteContext>,
    prefix: String,
    files: Vec<Vec<WriteItem>>,
    planner: Arc<dyn SavePlanner>,
    concurrency: usize,
) -> Result<Vec<WriteResult>> {
    let mut tasks = JoinSet::new();
    let mut outcomes = Vec::new();

    for (n, items) in files.into_iter().enumerate() {
        if tasks.len() >= concurrency {
            if let Some(joined) = tasks.join_next().await {
                outcomes.push(join_outcome(joined));
            }
        }
        let ctx = Arc::clone(&ctx);
        let planner = Arc::clone(&planner);
        let file_name = data_file_name(&prefix, n);
        tasks.spawn(async move { write_file(&ctx, &file_name, items, planner.as_ref()).await });
    }
    while let Some(joined) = tasks.join_next().await {
        outcomes.push(join_outcome(joined));
    }

    let mut results = Vec::new();
    let mut first_error = None;
    for outcome in outcomes {
        match outcome {
            Ok(written) => results.extend(written),
            Err(e) => {
                tracing::warn!(error = %e, "data file write failed");
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(results),
    }
}

/// Writes one data file. A visible data file is always complete.
async fn write_file(
    ctx: &WriteContext,
    file_name: &str,
    items: Vec<WriteItem>,
    planner: &dyn SavePlanner,
) -> Result<Vec<WriteResult>> {
    let final_path = ctx.dir.join(file_name);
    ensure_unpublished(ctx, &final_path, file_name, &items).await?;
    let atomic = ctx.storage.supports_atomic_rename();
    let write_path = if atomic {
        ctx.dir.join(temp_name(file_name))
    } else {
        final_path.clone()
    };

    let writer = ctx
        .storage
        .open_write(&write_path)
        .await
        .map_err(|e| {
            CheckpointError::write_failure_with_source(item_names(&items), "failed to open data file", e)
        })?;

    let outcome = async {
        let results = write_items(ctx, file_name, writer, &items, planner).await?;
        if atomic {
            ensure_unpublished(ctx, &final_path, file_name, &items).await?;
            ctx.storage.rename(&write_path, &final_path).await.map_err(|e| {
                CheckpointError::write_failure_with_source(
                    item_names(&items),
                    "failed to publish data file",
                    e,
                )
            })?;
        }
        Ok(results)
    }
    .await;

    match outcome {
        Ok(results) => {
            tracing::debug!(file = %file_name, items = results.len(), "wrote data file");
            Ok(results)
        }
        Err(e) => {
            if let Err(cleanup) = ctx.storage.delete(&write_path).await {
                tracing::debug!(file = %file_name, error = %cleanup, "partial data file not removed");
            }
            Err(e)
        }
    }
}

/// Data file names are unique per attempt, so an existing file belongs to
/// another attempt and may be referenced by committed metadata.
async fn ensure_unpublished(
    ctx: &WriteContext,
    final_path: &Path,
    file_name: &str,
    items: &[WriteItem],
) -> Result<()> {
    let exists = ctx.storage.exists(final_path).await.map_err(|e| {
        CheckpointError::write_failure_with_source(item_names(items), "failed to check data file", e)
    })?;
    if exists {
        return Err(CheckpointError::write_failure(
            item_names(items),
            format!("data file '{file_name}' already exists"),
        ));
    }
    Ok(())
}

async fn write_items(
    ctx: &WriteContext,
    file_name: &str,
    mut writer: Box<dyn ObjectWriter>,
    items: &[WriteItem],
    planner: &dyn SavePlanner,
) -> Result<Vec<WriteResult>> {
    let mut results = Vec::with_capacity(items.len());
    for item in items {
        let failed = |message: &str, e: CheckpointError| {
            CheckpointError::write_failure_with_source(vec![item.index.to_string()], message, e)
        };

        let data = planner
            .resolve_data(item)
            .map_err(|e| failed("failed to resolve item data", e))?;
        let raw = ctx
            .serializer
            .serialize(item, data)
            .map_err(|e| failed("failed to serialize item", e))?;
        let size_in_bytes = raw.len() as u64;
        let checksum = compute_xxhash64(&raw);
        let encoded = ctx
            .transform
            .encode(raw)
            .map_err(|e| failed("failed to encode item", e))?;

        let offset = writer.bytes_written();
        writer
            .write_all_bytes(&encoded)
            .await
            .map_err(|e| failed("failed to write item", e))?;

        results.push(WriteResult {
            index: item.index.clone(),
            size_in_bytes,
            storage_data: StorageInfo {
                relative_path: file_name.to_string(),
                offset,
                length: encoded.len() as u64,
                raw_length: size_in_bytes,
                transform: ctx.transform,
                checksum,
            },
        });
    }

    writer.finish().await.map_err(|e| {
        CheckpointError::write_failure_with_source(item_names(items), "failed to persist data file", e)
    })?;
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::filesystem::layout::is_temp_file;
    use crate::metadata::{ChunkStorageMetadata, TensorProperties};
    use crate::plan::{TensorWriteData, WriteItemType};
    use crate::planner::{DefaultSavePlanner, StateDict, StateValue};
    use crate::storage::AsyncLocalStorage;
    use crate::tensor::{DType, TensorView};
    use bytes::Bytes;
    use tempfile::TempDir;

    fn tensor_item(name: &str, elements: usize) -> WriteItem {
        WriteItem {
            index: MetadataIndex::with_offset(name, vec![0]),
            item_type: WriteItemType::Tensor,
            tensor_data: Some(TensorWriteData {
                chunk: ChunkStorageMetadata {
                    offsets: vec![0],
                    sizes: vec![elements],
                },
                properties: TensorProperties { dtype: DType::F32 },
                size: vec![elements],
            }),
        }
    }

    fn writer_in(temp: &TempDir, config: WriterConfig) -> FileSystemWriter {
        let storage = Arc::new(AsyncLocalStorage::with_base_path(temp.path()));
        FileSystemWriter::for_checkpoint(storage, config, CheckpointId::from(temp.path().join("ckpt")))
            .unwrap()
    }

    fn single_rank_state() -> StateDict {
        let mut state = StateDict::new();
        state.insert(
            "w".to_string(),
            StateValue::Tensor(TensorView::from_f32(&[1.0, 2.0, 3.0], vec![3]).unwrap()),
        );
        state.insert("step".to_string(), StateValue::Bytes(Bytes::from_static(b"9")));
        state
    }

    #[test]
    fn test_split_balances_tensors() {
        let items = vec![
            tensor_item("a", 10),
            tensor_item("b", 40),
            WriteItem::bytes("s1"),
            tensor_item("c", 30),
            WriteItem::bytes("s2"),
        ];
        let files = split_items(items, 2, true);
        assert_eq!(files.len(), 2);

        let names: Vec<Vec<String>> = files
            .iter()
            .map(|f| f.iter().map(|i| i.index.fqn.clone()).collect())
            .collect();
        assert_eq!(names[0], vec!["s1", "b"]);
        assert_eq!(names[1], vec!["s2", "c", "a"]);
    }

    #[test]
    fn test_split_one_file_per_item() {
        let items = vec![tensor_item("a", 1), WriteItem::bytes("s")];
        assert_eq!(split_items(items, 8, false).len(), 2);
        assert!(split_items(Vec::new(), 4, true).is_empty());
    }

    #[tokio::test]
    async fn test_single_rank_save_commits_metadata() {
        let temp = TempDir::new().unwrap();
        let mut writer = writer_in(&temp, WriterConfig::default());
        let planner = Arc::new(DefaultSavePlanner::new(single_rank_state()));

        writer.set_up_storage_writer(true).unwrap();
        let local = writer
            .prepare_local_plan(planner.create_local_plan().unwrap())
            .await
            .unwrap();
        let (plans, metadata) = planner.create_global_plan(vec![local]).unwrap();
        let plans = writer.prepare_global_plan(plans).unwrap();
        let results = writer.write_data(&plans[0], planner.clone()).unwrap().await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(writer.tracker().state(), ProtocolState::Complete);

        writer.finish(metadata, vec![results]).await.unwrap();
        assert_eq!(writer.tracker().state(), ProtocolState::Committed);

        let dir = temp.path().join("ckpt");
        assert!(dir.join(METADATA_FILE).exists());
        let names: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| !is_temp_file(n)));
        assert_eq!(names.iter().filter(|n| is_data_file(n)).count(), 1);
    }

    #[tokio::test]
    async fn test_finish_rejects_missing_results() {
        let temp = TempDir::new().unwrap();
        let mut writer = writer_in(&temp, WriterConfig::default());
        let planner = Arc::new(DefaultSavePlanner::new(single_rank_state()));

        writer.set_up_storage_writer(true).unwrap();
        let local = writer
            .prepare_local_plan(planner.create_local_plan().unwrap())
            .await
            .unwrap();
        let (plans, metadata) = planner.create_global_plan(vec![local]).unwrap();
        let plans = writer.prepare_global_plan(plans).unwrap();
        let mut results = writer.write_data(&plans[0], planner.clone()).unwrap().await.unwrap();
        results.pop();

        let err = writer.finish(metadata, vec![results]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Checkpoint);
        assert_eq!(writer.tracker().state(), ProtocolState::Aborted);
        assert!(!temp.path().join("ckpt").join(METADATA_FILE).exists());
    }

    #[tokio::test]
    async fn test_finish_rejects_duplicate_results() {
        let temp = TempDir::new().unwrap();
        let mut writer = writer_in(&temp, WriterConfig::default());
        let planner = Arc::new(DefaultSavePlanner::new(single_rank_state()));

        writer.set_up_storage_writer(true).unwrap();
        let local = writer
            .prepare_local_plan(planner.create_local_plan().unwrap())
            .await
            .unwrap();
        let (plans, metadata) = planner.create_global_plan(vec![local]).unwrap();
        let plans = writer.prepare_global_plan(plans).unwrap();
        let results = writer.write_data(&plans[0], planner.clone()).unwrap().await.unwrap();

        let err = writer
            .finish(metadata, vec![results.clone(), results])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[tokio::test]
    async fn test_overwrite_disabled() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("ckpt");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(METADATA_FILE), b"committed").unwrap();

        let config = WriterConfig {
            overwrite: false,
            ..WriterConfig::default()
        };
        let mut writer = writer_in(&temp, config);
        writer.set_up_storage_writer(false).unwrap();
        let err = writer.prepare_local_plan(SavePlan::default()).await.unwrap_err();
        assert!(err.to_string().contains("overwrite is disabled"));
        assert_eq!(writer.tracker().state(), ProtocolState::SetUp);
    }

    #[tokio::test]
    async fn test_write_without_prefix_is_invalid_state() {
        let temp = TempDir::new().unwrap();
        let mut writer = writer_in(&temp, WriterConfig::default());
        let planner = Arc::new(DefaultSavePlanner::new(single_rank_state()));

        writer.set_up_storage_writer(false).unwrap();
        let local = writer
            .prepare_local_plan(planner.create_local_plan().unwrap())
            .await
            .unwrap();
        let err = writer.write_data(&local, planner).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_stale_data_files_removed() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("ckpt");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("__0_oldattpt_0.distcp"), b"stale").unwrap();
        std::fs::write(dir.join(".__1_oldattpt_0.distcp.tmp"), b"partial").unwrap();
        std::fs::write(dir.join("notes.txt"), b"keep").unwrap();
        std::fs::write(dir.join(".notes.txt.tmp"), b"keep").unwrap();

        let mut writer = writer_in(&temp, WriterConfig::default());
        let planner = Arc::new(DefaultSavePlanner::new(single_rank_state()));
        writer.set_up_storage_writer(true).unwrap();
        let local = writer
            .prepare_local_plan(planner.create_local_plan().unwrap())
            .await
            .unwrap();
        let (plans, metadata) = planner.create_global_plan(vec![local]).unwrap();
        let plans = writer.prepare_global_plan(plans).unwrap();
        let results = writer.write_data(&plans[0], planner.clone()).unwrap().await.unwrap();
        writer.finish(metadata, vec![results]).await.unwrap();

        assert!(!dir.join("__0_oldattpt_0.distcp").exists());
        assert!(!dir.join(".__1_oldattpt_0.distcp.tmp").exists());
        assert!(dir.join("notes.txt").exists());
        assert!(dir.join(".notes.txt.tmp").exists());
    }

    #[tokio::test]
    async fn test_storage_meta_and_checkpoint_validation() {
        let temp = TempDir::new().unwrap();
        let writer = writer_in(&temp, WriterConfig::default());
        let meta = writer.storage_meta().unwrap();
        assert!(meta.checkpoint_id.unwrap().ends_with("ckpt"));
        assert!(meta.load_id.is_none());

        assert!(FileSystemWriter::validate_checkpoint_id(&CheckpointId::from("/tmp/ckpt")));
        assert!(!FileSystemWriter::validate_checkpoint_id(&CheckpointId::from("s3://b/k")));
    }
}
