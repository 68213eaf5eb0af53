// rust/dcp-core/src/transform.rs

//! Per-item stream transforms applied between serialization and storage.
//!
//! The transform used for an item is recorded in its storage token, so a
//! reader never needs the writer's configuration to decode it.

use std::hash::Hasher;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use crate::error::{CheckpointError, Result};

/// Compression applied to a single serialized item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamTransform {
    None,
    Lz4,
    Zstd { level: i32 },
}

impl StreamTransform {
    /// Builds a transform from the configured algorithm name and level.
    pub fn from_config(name: &str, level: i32) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "none" => Ok(StreamTransform::None),
            "lz4" => Ok(StreamTransform::Lz4),
            "zstd" => Ok(StreamTransform::Zstd {
                level: level.clamp(1, 22),
            }),
            other => Err(CheckpointError::config(format!(
                "unknown compression algorithm: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamTransform::None => "none",
            StreamTransform::Lz4 => "lz4",
            StreamTransform::Zstd { .. } => "zstd",
        }
    }

    /// Encodes serialized item bytes for storage.
    pub fn encode(&self, data: Bytes) -> Result<Bytes> {
        match self {
            StreamTransform::None => Ok(data),
            StreamTransform::Lz4 => Ok(Bytes::from(lz4_flex::compress_prepend_size(&data))),
            StreamTransform::Zstd { level } => zstd::encode_all(data.as_ref(), *level)
                .map(Bytes::from)
                .map_err(|e| CheckpointError::checkpoint_with_source("zstd compression failed", e)),
        }
    }

    /// Reverses [`encode`](Self::encode).
    ///
    /// `raw_length` is the recorded serialized size; decoding never allocates
    /// more than that, whatever the encoded bytes claim.
    pub fn decode(&self, data: Bytes, raw_length: u64) -> Result<Bytes> {
        let capacity = usize::try_from(raw_length).map_err(|_| {
            CheckpointError::checkpoint(format!("item size {raw_length} is too large"))
        })?;
        let decoded = match self {
            StreamTransform::None => data,
            StreamTransform::Lz4 => {
                if data.len() < 4 {
                    return Err(CheckpointError::checkpoint(
                        "lz4 item is shorter than its size prefix",
                    ));
                }
                let (prefix, body) = data.split_at(4);
                let claimed = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
                if u64::from(claimed) != raw_length {
                    return Err(CheckpointError::checkpoint(format!(
                        "lz4 size prefix {claimed} does not match recorded size {raw_length}"
                    )));
                }
                lz4_flex::decompress(body, capacity)
                    .map(Bytes::from)
                    .map_err(|e| CheckpointError::checkpoint(format!("lz4 decompression failed: {e}")))?
            }
            StreamTransform::Zstd { .. } => zstd::bulk::decompress(data.as_ref(), capacity)
                .map(Bytes::from)
                .map_err(|e| CheckpointError::checkpoint_with_source("zstd decompression failed", e))?,
        };

        if decoded.len() != capacity {
            return Err(CheckpointError::checkpoint(format!(
                "decoded {} bytes but {raw_length} were recorded",
                decoded.len()
            )));
        }
        Ok(decoded)
    }
}

/// Computes XXHash64 checksum of data.
pub fn compute_xxhash64(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}
