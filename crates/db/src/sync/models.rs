use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use paysync_common::EntityKind;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Persisted synchronization state. Serialized as
/// `{ lastSync, countsByEntity, lastRun, inProgress }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Watermark: everything created before this instant has been synchronized.
    pub last_sync: DateTime<Utc>,
    #[serde(default)]
    pub counts_by_entity: BTreeMap<EntityKind, u64>,
    #[serde(default)]
    pub last_run: Option<RunSummary>,
    #[serde(default)]
    pub in_progress: Option<InProgressRun>,
}

impl Checkpoint {
    /// Default state when nothing has been persisted: watermark one hour ago.
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            last_sync: now - Duration::hours(1),
            counts_by_entity: BTreeMap::new(),
            last_run: None,
            in_progress: None,
        }
    }

    /// Advance the watermark after a fully drained run. Never moves backward.
    pub fn complete_run(&mut self, summary: RunSummary) {
        if summary.started_at > self.last_sync {
            self.last_sync = summary.started_at;
        }
        for (kind, stats) in &summary.passes {
            *self.counts_by_entity.entry(*kind).or_insert(0) += stats.fetched;
        }
        self.last_run = Some(summary);
        self.in_progress = None;
    }
}

/// A run that started but has not drained every pass yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InProgressRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    #[serde(default)]
    pub backfill: bool,
    #[serde(default)]
    pub passes: BTreeMap<EntityKind, PassProgress>,
}

/// Position of one entity pass inside the run window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassProgress {
    /// Bounds of the leaf window currently being paginated.
    pub leaf_start: DateTime<Utc>,
    pub leaf_end: DateTime<Utc>,
    /// Offset of the next page inside the leaf window.
    pub cursor: u64,
    pub completed: bool,
    /// Records applied so far, carried across resumes.
    #[serde(default)]
    pub stats: PassStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassStats {
    pub fetched: u64,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub skipped: u64,
    pub errors: u64,
    pub placeholders: u64,
}

impl PassStats {
    pub fn add(&mut self, other: &PassStats) {
        self.fetched += other.fetched;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.errors += other.errors;
        self.placeholders += other.placeholders;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Interrupted,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub passes: BTreeMap<EntityKind, PassStats>,
    #[serde(default)]
    pub abort_reason: Option<String>,
}

impl RunSummary {
    pub fn totals(&self) -> PassStats {
        let mut total = PassStats::default();
        for stats in self.passes.values() {
            total.add(stats);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn summary(started_at: DateTime<Utc>, fetched: u64) -> RunSummary {
        RunSummary {
            run_id: Uuid::new_v4(),
            status: RunStatus::Completed,
            started_at,
            finished_at: started_at,
            window_start: started_at - Duration::hours(1),
            window_end: started_at,
            passes: BTreeMap::from([(
                EntityKind::Invoice,
                PassStats {
                    fetched,
                    ..PassStats::default()
                },
            )]),
            abort_reason: None,
        }
    }

    #[test]
    fn fresh_checkpoint_is_one_hour_back() {
        let now = Utc.with_ymd_and_hms(2025, 9, 1, 12, 0, 0).unwrap();
        let cp = Checkpoint::fresh(now);
        assert_eq!(cp.last_sync, Utc.with_ymd_and_hms(2025, 9, 1, 11, 0, 0).unwrap());
        assert!(cp.counts_by_entity.is_empty());
    }

    #[test]
    fn complete_run_never_moves_watermark_backward() {
        let now = Utc.with_ymd_and_hms(2025, 9, 1, 12, 0, 0).unwrap();
        let mut cp = Checkpoint::fresh(now);
        cp.complete_run(summary(now, 240));
        assert_eq!(cp.last_sync, now);
        assert_eq!(cp.counts_by_entity[&EntityKind::Invoice], 240);

        cp.complete_run(summary(now - Duration::days(1), 10));
        assert_eq!(cp.last_sync, now);
        assert_eq!(cp.counts_by_entity[&EntityKind::Invoice], 250);
        assert!(cp.in_progress.is_none());
    }

    #[test]
    fn serializes_with_wire_field_names() {
        let now = Utc.with_ymd_and_hms(2025, 9, 1, 12, 0, 0).unwrap();
        let mut cp = Checkpoint::fresh(now);
        cp.counts_by_entity.insert(EntityKind::PaymentMethod, 3);

        let json = serde_json::to_value(&cp).unwrap();
        assert_eq!(json["lastSync"], "2025-09-01T11:00:00Z");
        assert_eq!(json["countsByEntity"]["payment_method"], 3);
        assert!(json["lastRun"].is_null());
    }

    #[test]
    fn deserializes_minimal_document() {
        let cp: Checkpoint =
            serde_json::from_str(r#"{ "lastSync": "2025-08-01T00:00:00Z" }"#).unwrap();
        assert!(cp.counts_by_entity.is_empty());
        assert!(cp.in_progress.is_none());
    }
}
