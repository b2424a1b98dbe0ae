use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::descriptor::PreparedRecord;
use crate::retry::{Governor, RetryError};
use paysync_common::error::{PaysyncError, PaysyncResult};
use paysync_common::EntityKind;
use paysync_db::records::models::NormalizedRecord;
use paysync_db::records::repositories::RecordRepository;

/// Makes sure referenced parents exist before children are written,
/// creating placeholder rows for the ones that do not.
#[derive(Clone)]
pub struct DependencyResolver<R> {
    repo: R,
    governor: Governor,
}

impl<R> DependencyResolver<R>
where
    R: RecordRepository + Clone,
{
    pub fn new(repo: R, governor: Governor) -> Self {
        Self { repo, governor }
    }

    /// Ensure every id in `parents` exists as a `kind` row. Returns the number
    /// of placeholders created. Existing rows are never touched.
    pub async fn ensure_exists(
        &self,
        kind: EntityKind,
        parents: &[(String, Map<String, Value>)],
    ) -> PaysyncResult<u64> {
        let mut wanted: BTreeMap<&str, Map<String, Value>> = BTreeMap::new();
        for (id, hints) in parents {
            let entry = wanted.entry(id.as_str()).or_default();
            for (key, value) in hints {
                entry.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        if wanted.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = wanted.keys().map(|id| id.to_string()).collect();
        let existing = self
            .governor
            .with_retry("lookup existing ids", || self.repo.existing_ids(kind, &ids))
            .await
            .map_err(RetryError::into_inner)?;

        let mut created = 0;
        for (id, hints) in wanted {
            if existing.contains(id) {
                continue;
            }
            let placeholder = NormalizedRecord::placeholder(kind, id, hints);
            if self.insert_placeholder(placeholder).await? {
                tracing::debug!(kind = %kind, id, "created placeholder");
                created += 1;
            }
        }
        Ok(created)
    }

    /// Resolve every reference on a page, one batch per target kind, parents first.
    pub async fn resolve_page(&self, records: &[PreparedRecord]) -> PaysyncResult<u64> {
        let mut groups: BTreeMap<EntityKind, Vec<(String, Map<String, Value>)>> = BTreeMap::new();
        for prepared in records {
            let record = &prepared.record;
            for reference in record.kind.references() {
                let Some(target_id) = record.reference(reference.column) else {
                    continue;
                };
                let hints = prepared
                    .parent_hints
                    .get(reference.column)
                    .cloned()
                    .unwrap_or_default();
                groups
                    .entry(reference.target)
                    .or_default()
                    .push((target_id.to_string(), hints));
            }
        }

        let mut ordered: Vec<_> = groups.into_iter().collect();
        ordered.sort_by_key(|(kind, _)| (kind.tier(), *kind));

        let mut created = 0;
        for (kind, parents) in ordered {
            created += self.ensure_exists(kind, &parents).await?;
        }
        Ok(created)
    }

    async fn insert_placeholder(&self, placeholder: NormalizedRecord) -> PaysyncResult<bool> {
        let result = self
            .governor
            .with_retry("insert placeholder", || self.repo.insert_placeholder(&placeholder))
            .await;

        match result {
            Ok(inserted) => Ok(inserted),
            // A hinted reference of the placeholder itself is unknown; keep the bare row.
            Err(RetryError::Fatal {
                error: PaysyncError::MissingParent(reason),
                ..
            }) if !placeholder.references.is_empty() => {
                tracing::debug!(
                    kind = %placeholder.kind,
                    id = %placeholder.id,
                    reason = %reason,
                    "dropping placeholder references"
                );
                let bare = NormalizedRecord {
                    references: BTreeMap::new(),
                    ..placeholder
                };
                self.governor
                    .with_retry("insert placeholder", || self.repo.insert_placeholder(&bare))
                    .await
                    .map_err(RetryError::into_inner)
            }
            Err(e) => Err(e.into_inner()),
        }
    }
}
