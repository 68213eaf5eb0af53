//! Distributed Checkpoint Tool
//!
//! Inspects committed checkpoints and exercises the save/load protocol with
//! in-process ranks.
//!
//! # Usage
//!
//! ```bash
//! # Print the committed metadata of a checkpoint
//! dcp-tool inspect ./checkpoints/step_100
//!
//! # Save with 4 ranks, reload with 2, and verify the content
//! dcp-tool demo --save-ranks 4 --load-ranks 2
//!
//! # Same, with settings from a configuration file
//! dcp-tool --config dcp.toml demo --dir /tmp/dcp-demo
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dcp_core::metadata::StorageMetadata;
use dcp_core::planner::{LoadTarget, LocalShard, StateValue};
use dcp_core::{
    load_state_dict, save_state_dict, AsyncLocalStorage, AsyncStorageBackend, CheckpointId,
    DType, DcpConfig, DefaultLoadPlanner, DefaultSavePlanner, FileSystemReader, FileSystemWriter,
    LoadRank, SaveRank, StateDict, StorageReader, TensorView,
};

const WEIGHT: &str = "model.weight";
const STEP: &str = "train.step";

/// Distributed checkpoint tool
#[derive(Parser, Debug)]
#[command(name = "dcp-tool")]
#[command(about = "Inspect distributed checkpoints and run save/load round trips")]
struct Args {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the committed metadata of a checkpoint
    Inspect {
        /// Checkpoint id (directory path or file:// uri)
        checkpoint: String,
    },
    /// Save a synthetic sharded tensor and reload it with a different rank count
    Demo {
        /// Checkpoint directory, relative to the storage base path
        #[arg(long, default_value = "demo")]
        dir: String,

        /// Number of ranks that save
        #[arg(long, default_value = "4")]
        save_ranks: usize,

        /// Number of ranks that load
        #[arg(long, default_value = "2")]
        load_ranks: usize,

        /// Rows of the demo tensor, split across ranks
        #[arg(long, default_value = "16")]
        rows: usize,

        /// Columns of the demo tensor
        #[arg(long, default_value = "8")]
        cols: usize,
    },
}

/// Rows `[start, end)` owned by `rank` out of `world`.
fn row_range(rows: usize, rank: usize, world: usize) -> (usize, usize) {
    (rows * rank / world, rows * (rank + 1) / world)
}

fn demo_values(start: usize, end: usize, cols: usize) -> Vec<f32> {
    (start * cols..end * cols).map(|v| v as f32).collect()
}

fn demo_state(rank: usize, world: usize, rows: usize, cols: usize) -> dcp_core::Result<StateDict> {
    let (start, end) = row_range(rows, rank, world);
    let shard = TensorView::from_f32(&demo_values(start, end, cols), vec![end - start, cols])?;

    let mut state = StateDict::new();
    state.insert(
        WEIGHT.to_string(),
        StateValue::Sharded {
            global_size: vec![rows, cols],
            shards: vec![LocalShard {
                offsets: vec![start, 0],
                tensor: shard,
            }],
        },
    );
    // Every rank holds the step; only one copy is written.
    state.insert(STEP.to_string(), StateValue::Bytes(Bytes::from(b"100".to_vec())));
    Ok(state)
}

async fn inspect(config: &DcpConfig, checkpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let storage: Arc<dyn AsyncStorageBackend> = Arc::new(AsyncLocalStorage::new(&config.storage).await?);
    let mut reader =
        FileSystemReader::for_checkpoint(storage, config.reader.clone(), CheckpointId::from(checkpoint))?;
    let metadata = reader.read_metadata().await?;

    println!("checkpoint: {checkpoint}");
    println!("version:    {}", metadata.version);
    println!("created:    {}", metadata.created_at_ms);
    if let Some(meta) = &metadata.storage_meta {
        println!("save id:    {}", meta.save_id);
    }
    println!("entries:");
    for (fqn, entry) in &metadata.state_dict_metadata {
        match entry {
            StorageMetadata::Bytes => println!("  {fqn}: bytes"),
            StorageMetadata::Tensor(tensor) => println!(
                "  {fqn}: {:?} {:?} in {} chunk(s)",
                tensor.properties.dtype,
                tensor.size,
                tensor.chunks.len()
            ),
        }
    }
    println!("items:");
    for (index, info) in &metadata.storage_data {
        println!(
            "  {index} -> {} @ {} ({} bytes, {})",
            info.relative_path,
            info.offset,
            info.length,
            info.transform.as_str()
        );
    }
    Ok(())
}

async fn demo(
    config: &DcpConfig,
    dir: &str,
    save_ranks: usize,
    load_ranks: usize,
    rows: usize,
    cols: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    if save_ranks == 0 || load_ranks == 0 || rows < save_ranks.max(load_ranks) {
        return Err(format!(
            "need at least one rank per side and one row per rank (rows={rows}, save={save_ranks}, load={load_ranks})"
        )
        .into());
    }

    let storage: Arc<dyn AsyncStorageBackend> = Arc::new(AsyncLocalStorage::new(&config.storage).await?);
    let id = CheckpointId::from(dir);

    let mut savers = Vec::with_capacity(save_ranks);
    for rank in 0..save_ranks {
        let state = demo_state(rank, save_ranks, rows, cols)?;
        savers.push(SaveRank::new(
            FileSystemWriter::new(Arc::clone(&storage), config.writer.clone()),
            Arc::new(DefaultSavePlanner::new(state)),
        ));
    }
    let metadata = save_state_dict(&id, &mut savers).await?;
    tracing::info!(
        ranks = save_ranks,
        items = metadata.expected_indices().len(),
        "demo checkpoint saved"
    );

    let mut planners = Vec::with_capacity(load_ranks);
    let mut loaders = Vec::with_capacity(load_ranks);
    for rank in 0..load_ranks {
        let (start, end) = row_range(rows, rank, load_ranks);
        let mut targets = BTreeMap::new();
        targets.insert(
            WEIGHT.to_string(),
            LoadTarget::Tensor {
                dtype: DType::F32,
                offsets: vec![start, 0],
                sizes: vec![end - start, cols],
            },
        );
        targets.insert(STEP.to_string(), LoadTarget::Bytes);

        let planner = Arc::new(DefaultLoadPlanner::new(targets));
        planners.push(Arc::clone(&planner));
        loaders.push(LoadRank::new(
            FileSystemReader::new(Arc::clone(&storage), config.reader.clone()),
            planner,
        ));
    }
    load_state_dict(&id, &mut loaders).await?;

    for (rank, planner) in planners.iter().enumerate() {
        let state = planner.take_state_dict()?;
        let (start, end) = row_range(rows, rank, load_ranks);
        let restored = match state.get(WEIGHT) {
            Some(StateValue::Tensor(tensor)) => tensor.to_f32_vec()?,
            _ => return Err(format!("rank {rank} did not restore {WEIGHT}").into()),
        };
        if restored != demo_values(start, end, cols) {
            return Err(format!("rank {rank} restored wrong values for rows {start}..{end}").into());
        }
        match state.get(STEP) {
            Some(StateValue::Bytes(step)) if step.as_ref() == b"100" => {}
            _ => return Err(format!("rank {rank} did not restore {STEP}").into()),
        }
        tracing::info!(rank, rows = %format!("{start}..{end}"), "verified");
    }

    println!("saved with {save_ranks} rank(s), loaded with {load_ranks} rank(s): ok");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &args.config {
        Some(path) => DcpConfig::from_file(path)?.with_env_overrides(),
        None => DcpConfig::default().with_env_overrides(),
    };
    config.validate()?;

    match args.command {
        Command::Inspect { checkpoint } => inspect(&config, &checkpoint).await,
        Command::Demo {
            dir,
            save_ranks,
            load_ranks,
            rows,
            cols,
        } => demo(&config, &dir, save_ranks, load_ranks, rows, cols).await,
    }
}
