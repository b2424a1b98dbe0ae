use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use paysync_common::error::{PaysyncError, PaysyncResult};
use paysync_common::EntityKind;

use crate::records::models::{NormalizedRecord, UpsertOutcome};
use crate::records::repositories::RecordRepository;

#[derive(Default)]
struct State {
    rows: HashMap<(EntityKind, String), NormalizedRecord>,
    rejected_ids: HashSet<String>,
    orphaned_ids: HashSet<String>,
    unavailable_writes: u32,
    upsert_calls: u64,
}

/// In-process destination with the same merge and foreign-key rules as the
/// Postgres repository. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryRecordRepository {
    state: Arc<Mutex<State>>,
}

impl MemoryRecordRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> PaysyncResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| PaysyncError::Database("memory repository lock poisoned".to_string()))
    }

    /// Every upsert of `id` fails with a non-retryable database error.
    pub fn reject_id(&self, id: &str) {
        if let Ok(mut state) = self.state() {
            state.rejected_ids.insert(id.to_string());
        }
    }

    /// Every upsert of `id` reports a missing parent, even once the parent exists.
    pub fn orphan_id(&self, id: &str) {
        if let Ok(mut state) = self.state() {
            state.orphaned_ids.insert(id.to_string());
        }
    }

    /// The next `count` writes (upserts or placeholder inserts) fail with a transient error.
    pub fn fail_next_writes(&self, count: u32) {
        if let Ok(mut state) = self.state() {
            state.unavailable_writes = count;
        }
    }

    pub fn upsert_calls(&self) -> u64 {
        self.state().map(|s| s.upsert_calls).unwrap_or(0)
    }

    pub fn rows(&self, kind: EntityKind) -> Vec<NormalizedRecord> {
        let Ok(state) = self.state() else {
            return Vec::new();
        };
        let mut rows: Vec<NormalizedRecord> = state
            .rows
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, r)| r.clone())
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    fn check_references(state: &State, record: &NormalizedRecord) -> PaysyncResult<()> {
        for reference in record.kind.references() {
            if let Some(target_id) = record.reference(reference.column) {
                let key = (reference.target, target_id.to_string());
                if !state.rows.contains_key(&key) {
                    return Err(PaysyncError::MissingParent(format!(
                        "{}.{} -> {} {target_id}",
                        record.kind.table(),
                        reference.column,
                        reference.target
                    )));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RecordRepository for MemoryRecordRepository {
    async fn upsert(&self, record: &NormalizedRecord) -> PaysyncResult<UpsertOutcome> {
        let mut state = self.state()?;
        state.upsert_calls += 1;

        if state.unavailable_writes > 0 {
            state.unavailable_writes -= 1;
            return Err(PaysyncError::DatabaseUnavailable(
                "simulated connection reset".to_string(),
            ));
        }
        if state.rejected_ids.contains(&record.id) {
            return Err(PaysyncError::Database(format!(
                "row {} rejected by destination",
                record.id
            )));
        }
        if state.orphaned_ids.contains(&record.id) {
            return Err(PaysyncError::MissingParent(format!(
                "{} {} parent vanished",
                record.kind, record.id
            )));
        }

        let key = (record.kind, record.id.clone());
        let candidate = match state.rows.get(&key) {
            Some(existing) => existing.merged_with(record),
            None => record.clone(),
        };
        Self::check_references(&state, &candidate)?;

        match state.rows.insert(key, candidate.clone()) {
            None => Ok(UpsertOutcome::Inserted),
            Some(previous) if previous == candidate => Ok(UpsertOutcome::Unchanged),
            Some(_) => Ok(UpsertOutcome::Updated),
        }
    }

    async fn insert_placeholder(&self, record: &NormalizedRecord) -> PaysyncResult<bool> {
        let mut state = self.state()?;
        if state.unavailable_writes > 0 {
            state.unavailable_writes -= 1;
            return Err(PaysyncError::DatabaseUnavailable(
                "simulated connection reset".to_string(),
            ));
        }
        let key = (record.kind, record.id.clone());
        if state.rows.contains_key(&key) {
            return Ok(false);
        }
        Self::check_references(&state, record)?;
        state.rows.insert(key, record.clone());
        Ok(true)
    }

    async fn existing_ids(&self, kind: EntityKind, ids: &[String]) -> PaysyncResult<HashSet<String>> {
        let state = self.state()?;
        Ok(ids
            .iter()
            .filter(|id| state.rows.contains_key(&(kind, (*id).clone())))
            .cloned()
            .collect())
    }

    async fn get(&self, kind: EntityKind, id: &str) -> PaysyncResult<Option<NormalizedRecord>> {
        let state = self.state()?;
        Ok(state.rows.get(&(kind, id.to_string())).cloned())
    }

    async fn count(&self, kind: EntityKind) -> PaysyncResult<u64> {
        let state = self.state()?;
        Ok(state.rows.keys().filter(|(k, _)| *k == kind).count() as u64)
    }
}
