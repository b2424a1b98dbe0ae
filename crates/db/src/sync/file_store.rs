use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;

use crate::sync::models::Checkpoint;
use crate::sync::repositories::{CheckpointOrigin, CheckpointStore, LoadedCheckpoint};
use paysync_common::error::{PaysyncError, PaysyncResult};

/// Checkpoint kept as a single JSON document on local disk.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn defaults(origin: CheckpointOrigin) -> LoadedCheckpoint {
        LoadedCheckpoint {
            checkpoint: Checkpoint::fresh(Utc::now()),
            origin,
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> LoadedCheckpoint {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "no checkpoint found, using default watermark");
                return Self::defaults(CheckpointOrigin::Missing);
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "checkpoint unreadable, using default watermark");
                return Self::defaults(CheckpointOrigin::Corrupt);
            }
        };

        match serde_json::from_slice::<Checkpoint>(&bytes) {
            Ok(checkpoint) => LoadedCheckpoint {
                checkpoint,
                origin: CheckpointOrigin::Stored,
            },
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "checkpoint corrupt, using default watermark");
                Self::defaults(CheckpointOrigin::Corrupt)
            }
        }
    }

    async fn save(&self, checkpoint: &Checkpoint) -> PaysyncResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                PaysyncError::Checkpoint(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        let bytes = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| PaysyncError::Checkpoint(format!("failed to serialize: {e}")))?;

        // Write-then-rename so a crash never leaves a half-written document.
        let tmp = self.tmp_path();
        fs::write(&tmp, bytes).await.map_err(|e| {
            PaysyncError::Checkpoint(format!("failed to write {}: {e}", tmp.display()))
        })?;
        fs::rename(&tmp, &self.path).await.map_err(|e| {
            PaysyncError::Checkpoint(format!(
                "failed to move {} to {}: {e}",
                tmp.display(),
                self.path.display()
            ))
        })?;

        tracing::debug!(path = %self.path.display(), last_sync = %checkpoint.last_sync, "checkpoint saved");
        Ok(())
    }

    async fn clear(&self) -> PaysyncResult<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PaysyncError::Checkpoint(format!(
                "failed to remove {}: {e}",
                self.path.display()
            ))),
        }
    }
}
