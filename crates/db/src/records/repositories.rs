use std::collections::HashSet;

use async_trait::async_trait;
use paysync_common::error::PaysyncResult;
use paysync_common::EntityKind;

use crate::records::models::{NormalizedRecord, UpsertOutcome};

#[async_trait]
pub trait RecordRepository: Send + Sync {
    /// Insert or merge a record keyed by its primary id.
    /// Returns `MissingParent` when a referenced row does not exist yet.
    async fn upsert(&self, record: &NormalizedRecord) -> PaysyncResult<UpsertOutcome>;

    /// Insert-if-absent. Returns `true` when a row was created, `false` when the id already existed.
    async fn insert_placeholder(&self, record: &NormalizedRecord) -> PaysyncResult<bool>;

    /// Subset of `ids` already present for `kind`, looked up in one batch.
    async fn existing_ids(&self, kind: EntityKind, ids: &[String]) -> PaysyncResult<HashSet<String>>;

    async fn get(&self, kind: EntityKind, id: &str) -> PaysyncResult<Option<NormalizedRecord>>;

    async fn count(&self, kind: EntityKind) -> PaysyncResult<u64>;
}
