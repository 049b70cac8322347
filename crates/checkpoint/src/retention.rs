//! Bounded retention for checkpoint directories
//!
//! A save root holds one subdirectory per checkpoint. Before a new checkpoint
//! is written the oldest subdirectories are evicted until both the count and
//! the cumulative size fit the policy.

use chrono::{DateTime, Utc};
use runtime_core::{Error, Result, RetentionConfig};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, instrument};

/// Limits enforced on a checkpoint root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Subdirectories allowed to exist before a new save (the save adds one)
    pub max_checkpoints: usize,

    /// Cumulative bytes allowed across all subdirectories
    pub max_total_bytes: u64,
}

impl RetentionPolicy {
    pub fn new(max_checkpoints: usize, max_total_bytes: u64) -> Self {
        Self {
            max_checkpoints,
            max_total_bytes,
        }
    }

    fn is_exceeded(&self, count: usize, total_bytes: u64) -> bool {
        count >= self.max_checkpoints || total_bytes > self.max_total_bytes
    }
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(config: &RetentionConfig) -> Self {
        Self::new(config.max_checkpoints, config.max_disk_bytes())
    }
}

/// One checkpoint subdirectory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointDirectory {
    pub path: PathBuf,
    pub modified: DateTime<Utc>,

    /// Sum of all file sizes below `path`
    pub total_bytes: u64,
}

/// List the immediate subdirectories of `root`, oldest first
///
/// Ties on modification time are broken by path.
pub async fn scan_checkpoint_dirs(root: &Path) -> Result<Vec<CheckpointDirectory>> {
    let mut dirs = Vec::new();
    let mut entries = match fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
        Err(e) => return Err(Error::Io(e)),
    };

    while let Some(entry) = entries.next_entry().await? {
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(Error::Io(e)),
        };
        if !metadata.is_dir() {
            continue;
        }

        let path = entry.path();
        let total_bytes = directory_size(&path).await?;
        dirs.push(CheckpointDirectory {
            modified: DateTime::<Utc>::from(metadata.modified()?),
            path,
            total_bytes,
        });
    }

    dirs.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
    Ok(dirs)
}

/// Recursive sum of file sizes; entries that vanish mid-walk count as zero
pub async fn directory_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    let mut pending = vec![path.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(Error::Io(e)),
        };
        while let Some(entry) = entries.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::Io(e)),
            };
            if metadata.is_dir() {
                pending.push(entry.path());
            } else {
                total += metadata.len();
            }
        }
    }

    Ok(total)
}

/// Evict the oldest subdirectories of `root` until `policy` holds
///
/// Rescans after every eviction and stops at a fixed point or once the root
/// is empty. A directory that disappears before it can be removed counts as
/// evicted. Returns the evicted paths, oldest first.
#[instrument(skip_all, fields(root = %root.display()))]
pub async fn enforce_retention(root: &Path, policy: &RetentionPolicy) -> Result<Vec<PathBuf>> {
    let mut evicted = Vec::new();

    loop {
        let dirs = scan_checkpoint_dirs(root).await?;
        let total_bytes: u64 = dirs.iter().map(|d| d.total_bytes).sum();
        if !policy.is_exceeded(dirs.len(), total_bytes) {
            break;
        }

        let oldest = match dirs.into_iter().next() {
            Some(oldest) => oldest,
            None => break,
        };

        match fs::remove_dir_all(&oldest.path).await {
            Ok(()) => {
                info!(
                    path = %oldest.path.display(),
                    size_bytes = oldest.total_bytes,
                    total_bytes,
                    "Evicted checkpoint"
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %oldest.path.display(), "Checkpoint already removed, skipping");
            }
            Err(e) => {
                return Err(Error::Storage {
                    message: format!("Failed to remove {}: {}", oldest.path.display(), e),
                })
            }
        }
        evicted.push(oldest.path);
    }

    Ok(evicted)
}
