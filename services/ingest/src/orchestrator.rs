use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Datelike, Utc};
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::{PageSource, SourceWindow};
use crate::dates;
use crate::descriptor::normalize_record;
use crate::fetcher::{DrainState, FetchPosition, Fetcher};
use crate::resolver::DependencyResolver;
use crate::retry::{ConsecutiveErrors, Governor, RetryPolicy};
use crate::sink::UpsertSink;
use paysync_common::error::{PaysyncError, PaysyncResult};
use paysync_common::EntityKind;
use paysync_config::SyncConfig;
use paysync_db::records::models::UpsertOutcome;
use paysync_db::records::repositories::RecordRepository;
use paysync_db::sync::models::{
    Checkpoint, InProgressRun, PassProgress, PassStats, RunStatus, RunSummary,
};
use paysync_db::sync::repositories::{CheckpointOrigin, CheckpointStore};

#[derive(Debug, thiserror::Error)]
pub enum PassError {
    #[error("{0}")]
    Systemic(String),

    #[error("pass cancelled")]
    Cancelled,
}

/// Runs one synchronization: entity passes in dependency tiers, checkpointing
/// progress so an interrupted run resumes where it stopped.
pub struct Orchestrator<S, R, C> {
    config: SyncConfig,
    fetcher: Fetcher<S>,
    resolver: DependencyResolver<R>,
    sink: UpsertSink<R>,
    store: C,
    backfill: Option<SourceWindow>,
}

impl<S, R, C> Orchestrator<S, R, C>
where
    S: PageSource,
    R: RecordRepository + Clone,
    C: CheckpointStore,
{
    pub fn new(config: SyncConfig, source: Arc<S>, repo: R, store: C) -> PaysyncResult<Self> {
        let backfill = resolve_backfill(&config)?;
        let governor = Governor::new(RetryPolicy::from_config(&config.retry));
        let fetcher = Fetcher::new(source, governor.clone(), &config);
        let resolver = DependencyResolver::new(repo.clone(), governor.clone());
        let sink = UpsertSink::new(repo, resolver.clone(), governor);

        Ok(Self {
            config,
            fetcher,
            resolver,
            sink,
            store,
            backfill,
        })
    }

    pub async fn run(&self, cancel: CancellationToken) -> RunSummary {
        let loaded = self.store.load().await;
        let mut checkpoint = loaded.checkpoint;

        let run = match checkpoint.in_progress.clone() {
            Some(run) => {
                tracing::info!(
                    run_id = %run.run_id,
                    window_start = %run.window_start,
                    window_end = %run.window_end,
                    "resuming unfinished run"
                );
                run
            }
            None => self.new_run(&checkpoint),
        };
        checkpoint.in_progress = Some(run.clone());

        if let Err(e) = self.store.save(&checkpoint).await {
            if loaded.origin == CheckpointOrigin::Corrupt {
                let reason = format!("checkpoint is unreadable and cannot be rewritten: {e}");
                tracing::error!(error = %e, "checkpoint unusable, aborting run");
                return self.summarize(&run, &checkpoint, RunStatus::Aborted, Some(reason));
            }
            tracing::warn!(error = %e, "failed to save checkpoint, continuing");
        }

        tracing::info!(
            run_id = %run.run_id,
            window_start = %run.window_start,
            window_end = %run.window_end,
            backfill = run.backfill,
            entities = ?self.config.entities,
            "sync run started"
        );

        let shared = Mutex::new(checkpoint);
        let abort = cancel.child_token();
        let mut abort_reason: Option<String> = None;
        let mut drained = true;

        for tier in EntityKind::tiers(&self.config.entities) {
            if abort.is_cancelled() {
                drained = false;
                break;
            }

            let passes = tier
                .iter()
                .map(|kind| self.run_pass(*kind, &run, &shared, &abort));
            let results = join_all(passes).await;

            for (kind, result) in tier.iter().zip(results) {
                match result {
                    Ok(stats) => tracing::info!(
                        kind = %kind,
                        fetched = stats.fetched,
                        inserted = stats.inserted,
                        updated = stats.updated,
                        unchanged = stats.unchanged,
                        errors = stats.errors,
                        "pass completed"
                    ),
                    Err(PassError::Cancelled) => {
                        drained = false;
                        tracing::info!(kind = %kind, "pass interrupted");
                    }
                    Err(PassError::Systemic(reason)) => {
                        drained = false;
                        tracing::error!(kind = %kind, reason = %reason, "pass aborted");
                        abort_reason.get_or_insert(reason);
                    }
                }
            }
        }

        let status = match (&abort_reason, drained) {
            (Some(_), _) => RunStatus::Aborted,
            (None, false) => RunStatus::Interrupted,
            (None, true) => RunStatus::Completed,
        };

        let mut checkpoint = shared.lock().await;
        let summary = self.summarize(&run, &checkpoint, status, abort_reason);

        if status == RunStatus::Completed && run.backfill {
            if let Err(e) = self.store.clear().await {
                tracing::warn!(error = %e, "failed to clear checkpoint after backfill");
            }
        } else {
            if status == RunStatus::Completed {
                checkpoint.complete_run(summary.clone());
            } else {
                checkpoint.last_run = Some(summary.clone());
            }
            if let Err(e) = self.store.save(&checkpoint).await {
                tracing::warn!(error = %e, "failed to save final checkpoint");
            }
        }

        let totals = summary.totals();
        tracing::info!(
            run_id = %summary.run_id,
            status = ?summary.status,
            fetched = totals.fetched,
            inserted = totals.inserted,
            updated = totals.updated,
            unchanged = totals.unchanged,
            skipped = totals.skipped,
            errors = totals.errors,
            placeholders = totals.placeholders,
            "sync run finished"
        );
        summary
    }

    fn new_run(&self, checkpoint: &Checkpoint) -> InProgressRun {
        let now = Utc::now();
        let (window, backfill) = match self.backfill {
            Some(window) => (window, true),
            None => (SourceWindow::new(checkpoint.last_sync, now), false),
        };
        InProgressRun {
            run_id: Uuid::new_v4(),
            started_at: now,
            window_start: window.start,
            window_end: window.end,
            backfill,
            passes: BTreeMap::new(),
        }
    }

    async fn run_pass(
        &self,
        kind: EntityKind,
        run: &InProgressRun,
        shared: &Mutex<Checkpoint>,
        abort: &CancellationToken,
    ) -> Result<PassStats, PassError> {
        let previous = run.passes.get(&kind);
        let mut stats = previous.map(|p| p.stats).unwrap_or_default();
        let mut drain = match previous {
            Some(progress) => DrainState::resume(kind, run.window_end, progress),
            None => DrainState::start(kind, SourceWindow::new(run.window_start, run.window_end)),
        };
        if drain.is_done() {
            tracing::debug!(kind = %kind, "pass already drained");
            return Ok(stats);
        }

        tracing::info!(kind = %kind, resumed = previous.is_some(), "pass started");

        let reference_year = run.window_end.year();
        let mut consecutive = ConsecutiveErrors::new(self.config.retry.consecutive_error_threshold);
        let save_interval = self.config.checkpoint_interval_pages.max(1);
        let batch_size = self.config.write_batch_size.max(1);
        let mut pages_since_save: u32 = 0;
        let mut writes_since_pause: usize = 0;

        loop {
            if abort.is_cancelled() {
                return Err(PassError::Cancelled);
            }

            let fetched = tokio::select! {
                _ = abort.cancelled() => return Err(PassError::Cancelled),
                result = self.fetcher.next_page(&mut drain) => result,
            };
            let page = match fetched {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(e) => return Err(systemic(abort, format!("{kind} source failed: {e}"))),
            };

            let mut prepared = Vec::with_capacity(page.records.len());
            for raw in &page.records {
                stats.fetched += 1;
                let normalized = normalize_record(kind, raw, reference_year);
                for diagnostic in &normalized.diagnostics {
                    tracing::warn!(
                        kind = %kind,
                        column = diagnostic.column,
                        raw = %diagnostic.raw,
                        "unrecognized value stored as null"
                    );
                }
                match normalized.prepared {
                    Some(p) => prepared.push(p),
                    None => {
                        stats.skipped += 1;
                        tracing::warn!(kind = %kind, "record without id skipped");
                    }
                }
            }

            match self.resolver.resolve_page(&prepared).await {
                Ok(created) => stats.placeholders += created,
                Err(e) => tracing::warn!(
                    kind = %kind,
                    error = %e,
                    "batch parent resolution failed, resolving per record"
                ),
            }

            for item in &prepared {
                match self.sink.apply(item).await {
                    Ok(applied) => {
                        match applied.outcome {
                            UpsertOutcome::Inserted => stats.inserted += 1,
                            UpsertOutcome::Updated => stats.updated += 1,
                            UpsertOutcome::Unchanged => stats.unchanged += 1,
                        }
                        stats.placeholders += applied.placeholders;
                        consecutive.record_success();
                    }
                    Err(e) => {
                        stats.errors += 1;
                        tracing::warn!(
                            kind = %kind,
                            id = %item.record.id,
                            error = %e,
                            "failed to upsert record"
                        );
                        if let Err(limit) = consecutive.record_failure() {
                            return Err(systemic(abort, format!("{kind}: {limit}")));
                        }
                    }
                }

                writes_since_pause += 1;
                if writes_since_pause >= batch_size {
                    writes_since_pause = 0;
                    if !self.config.batch_pause.is_zero() {
                        tokio::time::sleep(self.config.batch_pause).await;
                    }
                }
            }

            pages_since_save += 1;
            let save = pages_since_save >= save_interval;
            if save {
                pages_since_save = 0;
            }
            self.record_progress(shared, kind, page.position, stats, save)
                .await;
        }

        self.record_progress(shared, kind, drain.position(), stats, true)
            .await;
        Ok(stats)
    }

    async fn record_progress(
        &self,
        shared: &Mutex<Checkpoint>,
        kind: EntityKind,
        position: FetchPosition,
        stats: PassStats,
        save: bool,
    ) {
        let mut checkpoint = shared.lock().await;
        if let Some(run) = checkpoint.in_progress.as_mut() {
            run.passes.insert(
                kind,
                PassProgress {
                    leaf_start: position.leaf_start,
                    leaf_end: position.leaf_end,
                    cursor: position.cursor,
                    completed: position.completed,
                    stats,
                },
            );
        }
        if save {
            if let Err(e) = self.store.save(&checkpoint).await {
                tracing::warn!(kind = %kind, error = %e, "failed to save checkpoint, continuing");
            }
        }
    }

    fn summarize(
        &self,
        run: &InProgressRun,
        checkpoint: &Checkpoint,
        status: RunStatus,
        abort_reason: Option<String>,
    ) -> RunSummary {
        let progress = checkpoint.in_progress.as_ref().map(|r| &r.passes);
        let passes = self
            .config
            .entities
            .iter()
            .map(|kind| {
                let stats = progress
                    .and_then(|p| p.get(kind))
                    .map(|p| p.stats)
                    .unwrap_or_default();
                (*kind, stats)
            })
            .collect();

        RunSummary {
            run_id: run.run_id,
            status,
            started_at: run.started_at,
            finished_at: Utc::now(),
            window_start: run.window_start,
            window_end: run.window_end,
            passes,
            abort_reason,
        }
    }
}

fn systemic(abort: &CancellationToken, reason: String) -> PassError {
    abort.cancel();
    PassError::Systemic(reason)
}

/// Resolve the configured backfill bounds. The end defaults to now.
pub fn resolve_backfill(config: &SyncConfig) -> PaysyncResult<Option<SourceWindow>> {
    let Some(raw_start) = config.backfill_start.as_deref() else {
        return Ok(None);
    };
    let start = dates::normalize_now(Some(raw_start)).ok_or_else(|| {
        PaysyncError::Config(format!("PAYSYNC_BACKFILL_START is not a date: {raw_start}"))
    })?;
    let end = match config.backfill_end.as_deref() {
        Some(raw_end) => dates::normalize_now(Some(raw_end)).ok_or_else(|| {
            PaysyncError::Config(format!("PAYSYNC_BACKFILL_END is not a date: {raw_end}"))
        })?,
        None => Utc::now(),
    };
    if start >= end {
        return Err(PaysyncError::Config(format!(
            "backfill window is empty: {start} >= {end}"
        )));
    }
    Ok(Some(SourceWindow::new(start, end)))
}
