//! State-dict file format and atomic writes

use bytes::{Buf, BufMut, Bytes, BytesMut};
use engine::ClientState;
use runtime_core::{Device, Error, Result, StateDict};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Magic bytes for state-dict files
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"CKPT";

/// State-dict format version
pub const CHECKPOINT_VERSION: u32 = 1;

/// Fixed header bytes before the metadata JSON
const FIXED_HEADER_LEN: usize = 4 + 4 + 8 + 8 + 4;

/// A decoded state-dict file
#[derive(Debug, Clone)]
pub struct StateDictFile {
    pub version: u32,
    pub state: StateDict,
    pub metadata: ClientState,
}

/// Serialize a state dict with its header
///
/// Layout: magic, version (u32), tensor count (u64), body size (u64),
/// metadata length (u32), metadata JSON, bincode body. Integers are
/// little-endian. Tensors are written as host tensors.
pub fn encode_state_dict(state: &StateDict, metadata: &ClientState) -> Result<Bytes> {
    let host: StateDict = state
        .iter()
        .map(|(name, tensor)| (name.clone(), tensor.to(Device::Cpu)))
        .collect();
    let body = bincode::serialize(&host)?;
    let metadata_json = serde_json::to_vec(metadata)?;

    let mut buf = BytesMut::with_capacity(FIXED_HEADER_LEN + metadata_json.len() + body.len());
    buf.put_slice(&CHECKPOINT_MAGIC);
    buf.put_u32_le(CHECKPOINT_VERSION);
    buf.put_u64_le(host.len() as u64);
    buf.put_u64_le(body.len() as u64);
    buf.put_u32_le(metadata_json.len() as u32);
    buf.put_slice(&metadata_json);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Parse bytes produced by [`encode_state_dict`]
pub fn decode_state_dict(mut buf: Bytes, path: &Path) -> Result<StateDictFile> {
    let corrupted = |reason: String| Error::CheckpointCorrupted {
        path: path.display().to_string(),
        reason,
    };

    if buf.remaining() < FIXED_HEADER_LEN {
        return Err(corrupted(format!("truncated header ({} bytes)", buf.remaining())));
    }
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if magic != CHECKPOINT_MAGIC {
        return Err(corrupted("invalid checkpoint magic".to_string()));
    }

    let version = buf.get_u32_le();
    if version != CHECKPOINT_VERSION {
        warn!(
            path = %path.display(),
            expected = CHECKPOINT_VERSION,
            found = version,
            "Checkpoint version mismatch"
        );
    }
    let tensor_count = buf.get_u64_le();
    let body_len = buf.get_u64_le();
    let metadata_len = buf.get_u32_le();

    let payload_len = u64::from(metadata_len)
        .checked_add(body_len)
        .ok_or_else(|| corrupted(format!("body length {} overflows", body_len)))?;
    if buf.remaining() as u64 != payload_len {
        return Err(corrupted(format!(
            "expected {} payload bytes, found {}",
            payload_len,
            buf.remaining()
        )));
    }

    let metadata_bytes = buf.split_to(metadata_len as usize);
    let metadata: ClientState = serde_json::from_slice(&metadata_bytes)
        .map_err(|e| corrupted(format!("invalid metadata: {}", e)))?;
    let state: StateDict =
        bincode::deserialize(&buf).map_err(|e| corrupted(format!("invalid body: {}", e)))?;

    if state.len() as u64 != tensor_count {
        return Err(corrupted(format!(
            "header lists {} tensors, body holds {}",
            tensor_count,
            state.len()
        )));
    }

    Ok(StateDictFile {
        version,
        state,
        metadata,
    })
}

/// Write a state dict to `path` atomically
#[instrument(skip_all, fields(path = %path.display(), tensors = state.len()))]
pub async fn write_state_dict(path: &Path, state: &StateDict, metadata: &ClientState) -> Result<u64> {
    let start = std::time::Instant::now();
    let data = encode_state_dict(state, metadata)?;
    let size = write_atomic(path, &data).await?;

    info!(
        size_bytes = size,
        elapsed_ms = start.elapsed().as_millis(),
        "State dict written"
    );
    Ok(size)
}

/// Read and validate a state-dict file
#[instrument(skip_all, fields(path = %path.display()))]
pub async fn read_state_dict(path: &Path) -> Result<StateDictFile> {
    let data = match fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::CheckpointNotFound {
                path: path.display().to_string(),
            })
        }
        Err(e) => return Err(Error::Io(e)),
    };

    let file = decode_state_dict(Bytes::from(data), path)?;
    debug!(tensors = file.state.len(), "State dict read");
    Ok(file)
}

/// Write `data` through a uniquely named temp file, fsync, then rename
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<u64> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let temp_path = temp_path(path);
    let mut file = File::create(&temp_path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(Error::Storage {
            message: format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                path.display(),
                e
            ),
        });
    }

    Ok(data.len() as u64)
}

fn temp_path(path: &Path) -> PathBuf {
    let temp_name = format!(
        ".{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        Uuid::new_v4()
    );
    path.with_file_name(temp_name)
}
