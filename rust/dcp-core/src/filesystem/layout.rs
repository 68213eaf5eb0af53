// rust/dcp-core/src/filesystem/layout.rs

//! On-disk layout of a checkpoint directory.
//!
//! ```text
//! <checkpoint>/
//!   .metadata                 committed Metadata (see below)
//!   __{rank}_{attempt}_{n}.distcp
//!                             encoded items of one rank, back to back
//! ```
//!
//! The metadata file is framed as:
//! ```text
//! +------------------+
//! | magic "DCPM"     |  4 bytes
//! | version          |  u32 LE
//! +------------------+
//! | Metadata         |  bincode
//! +------------------+
//! | xxHash64 of body |  u64 LE
//! +------------------+
//! ```
//!
//! Files are first written under a hidden temporary name and renamed into
//! place, so a visible name always refers to a complete file.

use uuid::Uuid;

use crate::error::{CheckpointError, Result};
use crate::metadata::Metadata;
use crate::transform::compute_xxhash64;

pub const METADATA_FILE: &str = ".metadata";
pub const DATA_FILE_SUFFIX: &str = ".distcp";

pub const METADATA_MAGIC: [u8; 4] = *b"DCPM";
pub const ENVELOPE_VERSION: u32 = 1;

const HEADER_LEN: usize = 8;
const TRAILER_LEN: usize = 8;

/// Random token distinguishing one save attempt's data files from another's.
pub fn new_attempt_token() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// Name prefix shared by every data file of `rank` in one attempt.
pub fn data_file_prefix(rank: usize, attempt: &str) -> String {
    format!("__{rank}_{attempt}_")
}

pub fn data_file_name(prefix: &str, n: usize) -> String {
    format!("{prefix}{n}{DATA_FILE_SUFFIX}")
}

/// Returns the attempt token embedded in a data file name.
pub fn attempt_of(file_name: &str) -> Option<&str> {
    let stem = file_name
        .strip_prefix("__")?
        .strip_suffix(DATA_FILE_SUFFIX)?;
    let mut parts = stem.splitn(3, '_');
    let _rank = parts.next()?;
    let attempt = parts.next()?;
    parts.next()?;
    Some(attempt)
}

pub fn is_data_file(file_name: &str) -> bool {
    attempt_of(file_name).is_some()
}

pub fn temp_name(file_name: &str) -> String {
    format!(".{file_name}.tmp")
}

pub fn is_temp_file(file_name: &str) -> bool {
    file_name.starts_with('.') && file_name.ends_with(".tmp")
}

/// True for the temporary name of a data file, never for other hidden files.
pub fn is_data_temp_file(file_name: &str) -> bool {
    file_name
        .strip_prefix('.')
        .and_then(|name| name.strip_suffix(".tmp"))
        .is_some_and(is_data_file)
}

/// Frames `metadata` for storage.
pub fn encode_metadata(metadata: &Metadata) -> Result<Vec<u8>> {
    let body = bincode::serialize(metadata)
        .map_err(|e| CheckpointError::serialization(format!("failed to encode metadata: {e}")))?;

    let mut out = Vec::with_capacity(HEADER_LEN + body.len() + TRAILER_LEN);
    out.extend_from_slice(&METADATA_MAGIC);
    out.extend_from_slice(&ENVELOPE_VERSION.to_le_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(&compute_xxhash64(&body).to_le_bytes());
    Ok(out)
}

/// Unframes and decodes a metadata file.
pub fn decode_metadata(data: &[u8]) -> Result<Metadata> {
    if data.len() < HEADER_LEN + TRAILER_LEN {
        return Err(CheckpointError::serialization(format!(
            "metadata file is truncated ({} bytes)",
            data.len()
        )));
    }
    if data[..4] != METADATA_MAGIC {
        return Err(CheckpointError::serialization("metadata file has bad magic"));
    }

    let mut version = [0u8; 4];
    version.copy_from_slice(&data[4..HEADER_LEN]);
    let version = u32::from_le_bytes(version);
    if version != ENVELOPE_VERSION {
        return Err(CheckpointError::serialization(format!(
            "unsupported metadata version {version}"
        )));
    }

    let (body, trailer) = data[HEADER_LEN..].split_at(data.len() - HEADER_LEN - TRAILER_LEN);
    let mut expected = [0u8; 8];
    expected.copy_from_slice(trailer);
    let expected = u64::from_le_bytes(expected);
    let actual = compute_xxhash64(body);
    if actual != expected {
        return Err(CheckpointError::serialization(format!(
            "metadata checksum mismatch: expected {expected:016x}, got {actual:016x}"
        )));
    }

    bincode::deserialize(body)
        .map_err(|e| CheckpointError::serialization(format!("failed to decode metadata: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MetadataIndex, StorageInfo, StorageMetadata};
    use crate::transform::StreamTransform;
    use std::collections::BTreeMap;

    fn sample_metadata() -> Metadata {
        let mut entries = BTreeMap::new();
        entries.insert("step".to_string(), StorageMetadata::Bytes);
        let mut metadata = Metadata::new(entries);
        metadata.storage_data.insert(
            MetadataIndex::new("step"),
            StorageInfo {
                relative_path: "__0_abcd1234_0.distcp".to_string(),
                offset: 0,
                length: 3,
                raw_length: 3,
                transform: StreamTransform::Zstd { level: 3 },
                checksum: 42,
            },
        );
        metadata
    }

    #[test]
    fn test_envelope_decodes() {
        let metadata = sample_metadata();
        let encoded = encode_metadata(&metadata).unwrap();
        assert_eq!(&encoded[..4], b"DCPM");
        assert_eq!(decode_metadata(&encoded).unwrap(), metadata);
    }

    #[test]
    fn test_truncated_metadata_rejected() {
        let encoded = encode_metadata(&sample_metadata()).unwrap();
        assert!(decode_metadata(&encoded[..encoded.len() - 3]).is_err());
        assert!(decode_metadata(&encoded[..6]).is_err());
    }

    #[test]
    fn test_corrupt_body_rejected() {
        let mut encoded = encode_metadata(&sample_metadata()).unwrap();
        encoded[HEADER_LEN + 2] ^= 0xff;
        let err = decode_metadata(&encoded).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_data_file_names() {
        let prefix = data_file_prefix(3, "deadbeef");
        let name = data_file_name(&prefix, 1);
        assert_eq!(name, "__3_deadbeef_1.distcp");
        assert_eq!(attempt_of(&name), Some("deadbeef"));
        assert!(is_data_file(&name));

        assert!(!is_data_file(METADATA_FILE));
        assert!(!is_data_file("__3_deadbeef.distcp"));
        assert_eq!(temp_name(&name), ".__3_deadbeef_1.distcp.tmp");
        assert!(is_temp_file(&temp_name(METADATA_FILE)));
        assert!(is_data_temp_file(&temp_name(&name)));
        assert!(!is_data_temp_file(&temp_name(METADATA_FILE)));
        assert!(!is_data_temp_file(".editor.swp.tmp"));
    }

    #[test]
    fn test_attempt_tokens_differ() {
        let a = new_attempt_token();
        assert_eq!(a.len(), 8);
        assert!(!a.contains('_'));
        assert_ne!(a, new_attempt_token());
    }
}
