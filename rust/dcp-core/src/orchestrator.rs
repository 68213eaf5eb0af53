// rust/dcp-core/src/orchestrator.rs

//! In-process driver for multi-rank saves and loads.
//!
//! ## Save flow
//!
//! 1. Every rank sets the checkpoint id and its role (rank 0 coordinates)
//! 2. Every rank builds and storage-prepares its local plan
//! 3. The coordinator builds the global plan and metadata schema
//! 4. Every rank writes its finished plan
//! 5. Once all writes completed, the coordinator commits the metadata
//!
//! A failure in any step aborts the save before the commit, so the previous
//! checkpoint at the same id, if any, stays readable.

use std::sync::Arc;

use crate::error::{CheckpointError, Result};
use crate::future::{join_ranks, PendingIo};
use crate::identity::CheckpointId;
use crate::metadata::Metadata;
use crate::planner::{LoadPlanner, SavePlanner};
use crate::protocol::{StorageReader, StorageWriter, WriteResult};

/// One rank taking part in a save.
pub struct SaveRank {
    pub writer: Box<dyn StorageWriter>,
    pub planner: Arc<dyn SavePlanner>,
}

impl SaveRank {
    pub fn new(writer: impl StorageWriter + 'static, planner: Arc<dyn SavePlanner>) -> Self {
        Self {
            writer: Box::new(writer),
            planner,
        }
    }
}

/// One rank taking part in a load.
pub struct LoadRank {
    pub reader: Box<dyn StorageReader>,
    pub planner: Arc<dyn LoadPlanner>,
}

impl LoadRank {
    pub fn new(reader: impl StorageReader + 'static, planner: Arc<dyn LoadPlanner>) -> Self {
        Self {
            reader: Box::new(reader),
            planner,
        }
    }
}

fn check_plan_count(step: &str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        return Ok(());
    }
    Err(CheckpointError::checkpoint(format!(
        "{step} returned {actual} plans for {expected} ranks"
    )))
}

/// Waits for every started data phase, then reports `error`.
async fn drain<T>(started: Vec<PendingIo<T>>, error: CheckpointError) -> CheckpointError {
    if let Err(other) = join_ranks(started).await {
        tracing::debug!(error = %other, "data phase failed while aborting");
    }
    error
}

/// Saves the state held by `ranks` under `checkpoint_id` and returns the
/// committed schema.
///
/// # Errors
///
/// Returns the first error any rank hit. No metadata is committed unless
/// every rank's write completed.
pub async fn save_state_dict(checkpoint_id: &CheckpointId, ranks: &mut [SaveRank]) -> Result<Metadata> {
    if ranks.is_empty() {
        return Err(CheckpointError::config("a save needs at least one rank"));
    }

    let mut local_plans = Vec::with_capacity(ranks.len());
    for (rank, r) in ranks.iter_mut().enumerate() {
        r.writer.set_checkpoint_id(checkpoint_id.clone())?;
        r.writer.set_up_storage_writer(rank == 0)?;
        let plan = r.planner.create_local_plan()?;
        local_plans.push(r.writer.prepare_local_plan(plan).await?);
    }

    let coordinator = &mut ranks[0];
    let (global_plans, metadata) = coordinator.planner.create_global_plan(local_plans)?;
    let global_plans = coordinator.writer.prepare_global_plan(global_plans)?;
    check_plan_count("global planning", ranks.len(), global_plans.len())?;

    let mut started = Vec::with_capacity(ranks.len());
    for (r, plan) in ranks.iter_mut().zip(global_plans) {
        let pending = r
            .planner
            .finish_plan(plan)
            .and_then(|plan| r.writer.write_data(&plan, Arc::clone(&r.planner)));
        match pending {
            Ok(pending) => started.push(pending),
            Err(e) => return Err(drain(started, e).await),
        }
    }

    let results: Vec<Vec<WriteResult>> = join_ranks(started).await?;
    let items: usize = results.iter().map(Vec::len).sum();
    ranks[0].writer.finish(metadata.clone(), results).await?;

    tracing::info!(
        checkpoint = %checkpoint_id,
        ranks = ranks.len(),
        items,
        "saved state dict"
    );
    Ok(metadata)
}

/// Loads from the checkpoint at `checkpoint_id` into every rank's planner.
///
/// # Errors
///
/// `NotFound` when nothing was committed at `checkpoint_id`; otherwise the
/// first error any rank hit.
pub async fn load_state_dict(checkpoint_id: &CheckpointId, ranks: &mut [LoadRank]) -> Result<()> {
    if ranks.is_empty() {
        return Err(CheckpointError::config("a load needs at least one rank"));
    }

    let mut local_plans = Vec::with_capacity(ranks.len());
    for (rank, r) in ranks.iter_mut().enumerate() {
        r.reader.set_checkpoint_id(checkpoint_id.clone())?;
        let metadata = r.reader.read_metadata().await?;
        let plan = r.planner.create_local_plan(&metadata)?;
        r.reader.set_up_storage_reader(metadata, rank == 0)?;
        local_plans.push(r.reader.prepare_local_plan(plan).await?);
    }

    let coordinator = &mut ranks[0];
    let global_plans = coordinator.planner.create_global_plan(local_plans)?;
    let global_plans = coordinator.reader.prepare_global_plan(global_plans)?;
    check_plan_count("global planning", ranks.len(), global_plans.len())?;

    let mut started = Vec::with_capacity(ranks.len());
    for (r, plan) in ranks.iter_mut().zip(global_plans) {
        let pending = r
            .planner
            .finish_plan(plan)
            .and_then(|plan| r.reader.read_data(&plan, Arc::clone(&r.planner)));
        match pending {
            Ok(pending) => started.push(pending),
            Err(e) => return Err(drain(started, e).await),
        }
    }
    join_ranks(started).await?;

    tracing::info!(checkpoint = %checkpoint_id, ranks = ranks.len(), "loaded state dict");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReaderConfig, WriterConfig};
    use crate::error::ErrorKind;
    use crate::filesystem::{FileSystemReader, FileSystemWriter};
    use crate::planner::{DefaultLoadPlanner, DefaultSavePlanner, LoadTarget, StateDict, StateValue};
    use crate::storage::{AsyncLocalStorage, AsyncStorageBackend};
    use crate::tensor::DType;
    use bytes::Bytes;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn local(temp: &TempDir) -> Arc<dyn AsyncStorageBackend> {
        Arc::new(AsyncLocalStorage::with_base_path(temp.path()))
    }

    #[tokio::test]
    async fn test_empty_world_rejected() {
        let id = CheckpointId::from("ckpt");
        let err = save_state_dict(&id, &mut []).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        let err = load_state_dict(&id, &mut []).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_replicated_value_round_trips_across_world_sizes() {
        let temp = TempDir::new().unwrap();
        let id = CheckpointId::from(temp.path().join("ckpt"));

        let mut save_ranks: Vec<SaveRank> = (0..3)
            .map(|_| {
                let mut state = StateDict::new();
                state.insert("epoch".to_string(), StateValue::Bytes(Bytes::from_static(b"5")));
                SaveRank::new(
                    FileSystemWriter::new(local(&temp), WriterConfig::default()),
                    Arc::new(DefaultSavePlanner::new(state)),
                )
            })
            .collect();
        let metadata = save_state_dict(&id, &mut save_ranks).await.unwrap();
        assert_eq!(metadata.expected_indices().len(), 1);

        let mut targets = BTreeMap::new();
        targets.insert("epoch".to_string(), LoadTarget::Bytes);
        let planner = Arc::new(DefaultLoadPlanner::new(targets));
        let mut load_ranks = vec![LoadRank::new(
            FileSystemReader::new(local(&temp), ReaderConfig::default()),
            planner.clone(),
        )];
        load_state_dict(&id, &mut load_ranks).await.unwrap();

        let state = planner.take_state_dict().unwrap();
        match &state["epoch"] {
            StateValue::Bytes(b) => assert_eq!(b.as_ref(), b"5"),
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_load_before_save_is_not_found() {
        let temp = TempDir::new().unwrap();
        let id = CheckpointId::from(temp.path().join("never"));

        let mut targets = BTreeMap::new();
        targets.insert("w".to_string(), LoadTarget::whole(DType::F32, vec![2]));
        let mut ranks = vec![LoadRank::new(
            FileSystemReader::new(local(&temp), ReaderConfig::default()),
            Arc::new(DefaultLoadPlanner::new(targets)),
        )];
        let err = load_state_dict(&id, &mut ranks).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
