use async_trait::async_trait;

use crate::sync::models::Checkpoint;
use paysync_common::error::PaysyncResult;

/// How a loaded checkpoint was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOrigin {
    /// Read from durable storage.
    Stored,
    /// Nothing persisted yet; defaults applied.
    Missing,
    /// Persisted state could not be read or parsed; defaults applied.
    Corrupt,
}

#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    pub checkpoint: Checkpoint,
    pub origin: CheckpointOrigin,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load persisted state. Never fails: absence or corruption yields the default watermark.
    async fn load(&self) -> LoadedCheckpoint;

    /// Persist `checkpoint` atomically.
    async fn save(&self, checkpoint: &Checkpoint) -> PaysyncResult<()>;

    /// Remove persisted state once a bounded backfill completes.
    async fn clear(&self) -> PaysyncResult<()>;
}
