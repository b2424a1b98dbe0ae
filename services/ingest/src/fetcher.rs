use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::client::{PageSource, PaymentClientError, SourceWindow};
use crate::retry::{Governor, RetryError};
use paysync_common::EntityKind;
use paysync_config::SyncConfig;
use paysync_db::sync::models::PassProgress;

/// Where a pass stands inside its run window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPosition {
    pub leaf_start: DateTime<Utc>,
    pub leaf_end: DateTime<Utc>,
    pub cursor: u64,
    pub completed: bool,
}

/// Pagination state of one entity pass. Leaves partition the run window in
/// chronological order, so the current leaf and cursor are enough to resume.
#[derive(Debug, Clone)]
pub struct DrainState {
    kind: EntityKind,
    run_end: DateTime<Utc>,
    leaf: SourceWindow,
    cursor: u64,
    /// The leaf has passed the ceiling check and is being paginated.
    accepted: bool,
    pages_in_leaf: u32,
    pages_total: u64,
    done: bool,
}

impl DrainState {
    pub fn start(kind: EntityKind, window: SourceWindow) -> Self {
        Self {
            kind,
            run_end: window.end,
            leaf: window,
            cursor: 0,
            accepted: false,
            pages_in_leaf: 0,
            pages_total: 0,
            done: window.start >= window.end,
        }
    }

    pub fn resume(kind: EntityKind, run_end: DateTime<Utc>, progress: &PassProgress) -> Self {
        Self {
            kind,
            run_end,
            leaf: SourceWindow::new(progress.leaf_start, progress.leaf_end),
            cursor: progress.cursor,
            accepted: progress.cursor > 0,
            pages_in_leaf: 0,
            pages_total: 0,
            done: progress.completed || progress.leaf_start >= run_end,
        }
    }

    pub fn position(&self) -> FetchPosition {
        FetchPosition {
            leaf_start: self.leaf.start,
            leaf_end: self.leaf.end,
            cursor: self.cursor,
            completed: self.done,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn finish_leaf(&mut self) {
        if self.leaf.end >= self.run_end {
            self.done = true;
            return;
        }
        self.leaf = SourceWindow::new(self.leaf.end, self.run_end);
        self.cursor = 0;
        self.accepted = false;
        self.pages_in_leaf = 0;
    }
}

#[derive(Debug)]
pub struct FetchedPage {
    pub records: Vec<Value>,
    /// Position to persist once `records` have been applied.
    pub position: FetchPosition,
}

/// Draws pages for one kind through the governor, splitting windows whose
/// row count exceeds the source's pagination ceiling.
pub struct Fetcher<S> {
    source: Arc<S>,
    governor: Governor,
    max_pages_per_window: u32,
    pagination_ceiling: u64,
    min_window: chrono::Duration,
    page_pause: Duration,
}

impl<S: PageSource> Fetcher<S> {
    pub fn new(source: Arc<S>, governor: Governor, config: &SyncConfig) -> Self {
        Self {
            source,
            governor,
            max_pages_per_window: config.max_pages_per_window.max(1),
            pagination_ceiling: config.pagination_ceiling,
            min_window: chrono::Duration::minutes(1),
            page_pause: config.page_pause,
        }
    }

    /// Next page of the pass, or `None` once the run window is exhausted.
    pub async fn next_page(
        &self,
        state: &mut DrainState,
    ) -> Result<Option<FetchedPage>, RetryError<PaymentClientError>> {
        loop {
            if state.done {
                return Ok(None);
            }

            if state.pages_total > 0 && !self.page_pause.is_zero() {
                tokio::time::sleep(self.page_pause).await;
            }

            let leaf = state.leaf;
            let cursor = state.cursor;
            let page = self
                .governor
                .with_retry(&format!("fetch {} page", state.kind), || {
                    self.source.fetch_page(state.kind, &leaf, cursor)
                })
                .await?;
            state.pages_total += 1;

            if !state.accepted {
                let total = page.total_items.unwrap_or(0);
                if total > self.pagination_ceiling {
                    if leaf.span() > self.min_window {
                        state.leaf = self.narrow(leaf);
                        tracing::debug!(
                            kind = %state.kind,
                            total_items = total,
                            leaf_start = %state.leaf.start,
                            leaf_end = %state.leaf.end,
                            "window over pagination ceiling, splitting"
                        );
                        continue;
                    }
                    tracing::warn!(
                        kind = %state.kind,
                        total_items = total,
                        ceiling = self.pagination_ceiling,
                        leaf_start = %leaf.start,
                        "minimal window still over pagination ceiling, rows past the ceiling are skipped"
                    );
                }
                state.accepted = true;
            }

            state.pages_in_leaf += 1;
            // The source rejects offsets at or past the ceiling.
            let next = page.next_cursor.filter(|n| *n < self.pagination_ceiling);

            match next {
                Some(n) if !page.records.is_empty() => {
                    if state.pages_in_leaf >= self.max_pages_per_window {
                        tracing::warn!(
                            kind = %state.kind,
                            pages = state.pages_in_leaf,
                            leaf_start = %leaf.start,
                            leaf_end = %leaf.end,
                            "page bound reached, moving to next window"
                        );
                        state.finish_leaf();
                    } else {
                        state.cursor = n;
                    }
                }
                _ => state.finish_leaf(),
            }

            tracing::debug!(
                kind = %state.kind,
                cursor,
                returned = page.records.len(),
                "page drained"
            );

            return Ok(Some(FetchedPage {
                records: page.records,
                position: state.position(),
            }));
        }
    }

    /// First sub-window of `window`: one day when it spans more, otherwise half.
    fn narrow(&self, window: SourceWindow) -> SourceWindow {
        let day = chrono::Duration::days(1);
        let span = window.span();
        let piece = if span > day {
            day
        } else {
            (span / 2).max(self.min_window)
        };
        SourceWindow::new(window.start, (window.start + piece).min(window.end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Page;
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records spread over a window; serves any sub-window by filtering on `at`.
    struct TimelineSource {
        records: Vec<(DateTime<Utc>, Value)>,
        page_size: u64,
        /// Offsets at or past this are refused with a 400.
        max_offset: Option<u64>,
        calls: Mutex<Vec<(SourceWindow, u64)>>,
    }

    impl TimelineSource {
        fn new(records: Vec<(DateTime<Utc>, Value)>, page_size: u64) -> Self {
            Self {
                records,
                page_size,
                max_offset: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn refusing_offsets_from(mut self, limit: u64) -> Self {
            self.max_offset = Some(limit);
            self
        }

        fn calls(&self) -> Vec<(SourceWindow, u64)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageSource for TimelineSource {
        async fn fetch_page(
            &self,
            _kind: EntityKind,
            window: &SourceWindow,
            cursor: u64,
        ) -> Result<Page, PaymentClientError> {
            self.calls.lock().unwrap().push((*window, cursor));
            if let Some(limit) = self.max_offset {
                if cursor >= limit {
                    return Err(PaymentClientError::HttpError {
                        status: reqwest::StatusCode::BAD_REQUEST,
                        body: format!("offset beyond {limit}"),
                    });
                }
            }
            let matching: Vec<Value> = self
                .records
                .iter()
                .filter(|(at, _)| *at >= window.start && *at < window.end)
                .map(|(_, v)| v.clone())
                .collect();
            let total = matching.len() as u64;
            let records: Vec<Value> = matching
                .into_iter()
                .skip(cursor as usize)
                .take(self.page_size as usize)
                .collect();
            let next = cursor + records.len() as u64;
            Ok(Page {
                next_cursor: (records.len() as u64 == self.page_size && next < total).then_some(next),
                records,
                total_items: Some(total),
            })
        }
    }

    fn t(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, day, hour, 0, 0).unwrap()
    }

    fn config(ceiling: u64, max_pages: u32) -> SyncConfig {
        let mut config = crate::orchestrator::tests::test_config();
        config.pagination_ceiling = ceiling;
        config.max_pages_per_window = max_pages;
        config
    }

    fn records(per_day: &[(u32, usize)]) -> Vec<(DateTime<Utc>, Value)> {
        let mut out = Vec::new();
        for (day, count) in per_day {
            for i in 0..*count {
                let at = t(*day, 0) + chrono::Duration::minutes(i as i64);
                out.push((at, json!({ "id": format!("inv_{day}_{i}") })));
            }
        }
        out
    }

    async fn drain_all(fetcher: &Fetcher<TimelineSource>, state: &mut DrainState) -> Vec<Value> {
        let mut all = Vec::new();
        while let Some(page) = fetcher.next_page(state).await.unwrap() {
            all.extend(page.records);
        }
        all
    }

    fn fetcher(source: Arc<TimelineSource>, config: &SyncConfig) -> Fetcher<TimelineSource> {
        Fetcher::new(source, Governor::new(RetryPolicy::test()), config)
    }

    #[tokio::test]
    async fn drains_window_in_pages() {
        let source = Arc::new(TimelineSource::new(records(&[(1, 5)]), 2));
        let fetcher = fetcher(source.clone(), &config(100, 10));
        let mut state = DrainState::start(EntityKind::Invoice, SourceWindow::new(t(1, 0), t(2, 0)));

        let all = drain_all(&fetcher, &mut state).await;
        assert_eq!(all.len(), 5);
        assert!(state.is_done());
        let cursors: Vec<u64> = source.calls().iter().map(|(_, c)| *c).collect();
        assert_eq!(cursors, vec![0, 2, 4]);
    }

    #[tokio::test]
    async fn splits_windows_over_the_ceiling_into_days() {
        let source = Arc::new(TimelineSource::new(records(&[(1, 4), (2, 3), (3, 4)]), 10));
        let fetcher = fetcher(source.clone(), &config(5, 10));
        let mut state = DrainState::start(EntityKind::Invoice, SourceWindow::new(t(1, 0), t(4, 0)));

        let all = drain_all(&fetcher, &mut state).await;
        assert_eq!(all.len(), 11);

        let mut ids: Vec<String> = all.iter().map(|v| v["id"].as_str().unwrap().to_string()).collect();
        ids.dedup();
        assert_eq!(ids.len(), 11);
        assert_eq!(all[0]["id"], "inv_1_0");
        assert_eq!(all[10]["id"], "inv_3_3");
    }

    #[tokio::test]
    async fn minimal_window_over_ceiling_stops_at_ceiling() {
        // Ten records inside the same minute.
        let dense: Vec<_> = (0..10)
            .map(|i| (t(1, 0), json!({ "id": format!("inv_{i}") })))
            .collect();
        let source = Arc::new(TimelineSource::new(dense, 2));
        let fetcher = fetcher(source, &config(4, 10));
        let start = t(1, 0);
        let mut state = DrainState::start(
            EntityKind::Invoice,
            SourceWindow::new(start, start + chrono::Duration::minutes(1)),
        );

        let all = drain_all(&fetcher, &mut state).await;
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn resume_inside_capped_window_stops_at_ceiling() {
        let dense: Vec<_> = (0..10)
            .map(|i| (t(1, 0), json!({ "id": format!("inv_{i}") })))
            .collect();
        let source = Arc::new(TimelineSource::new(dense, 2).refusing_offsets_from(4));
        let fetcher = fetcher(source, &config(4, 10));
        let start = t(1, 0);
        let window = SourceWindow::new(start, start + chrono::Duration::minutes(1));

        let mut first = DrainState::start(EntityKind::Invoice, window);
        let page = fetcher.next_page(&mut first).await.unwrap().unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.position.cursor, 2);

        let progress = PassProgress {
            leaf_start: page.position.leaf_start,
            leaf_end: page.position.leaf_end,
            cursor: page.position.cursor,
            completed: false,
            stats: Default::default(),
        };
        let mut resumed = DrainState::resume(EntityKind::Invoice, window.end, &progress);
        let rest = drain_all(&fetcher, &mut resumed).await;

        let ids: Vec<_> = rest.iter().map(|v| v["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["inv_2", "inv_3"]);
        assert!(resumed.is_done());
    }

    #[tokio::test]
    async fn page_bound_moves_on() {
        let source = Arc::new(TimelineSource::new(records(&[(1, 10)]), 2));
        let fetcher = fetcher(source, &config(100, 2));
        let mut state = DrainState::start(EntityKind::Invoice, SourceWindow::new(t(1, 0), t(2, 0)));

        let all = drain_all(&fetcher, &mut state).await;
        assert_eq!(all.len(), 4);
        assert!(state.is_done());
    }

    #[tokio::test]
    async fn resumes_from_recorded_position() {
        let source = Arc::new(TimelineSource::new(records(&[(1, 5)]), 2));
        let fetcher = fetcher(source.clone(), &config(100, 10));
        let window = SourceWindow::new(t(1, 0), t(2, 0));

        let mut first = DrainState::start(EntityKind::Invoice, window);
        let page = fetcher.next_page(&mut first).await.unwrap().unwrap();
        assert_eq!(page.position.cursor, 2);

        let progress = PassProgress {
            leaf_start: page.position.leaf_start,
            leaf_end: page.position.leaf_end,
            cursor: page.position.cursor,
            completed: false,
            stats: Default::default(),
        };
        let mut resumed = DrainState::resume(EntityKind::Invoice, window.end, &progress);
        let rest = drain_all(&fetcher, &mut resumed).await;

        let ids: Vec<_> = rest.iter().map(|v| v["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["inv_1_2", "inv_1_3", "inv_1_4"]);
    }

    #[tokio::test]
    async fn empty_window_is_done_immediately() {
        let source = Arc::new(TimelineSource::new(Vec::new(), 2));
        let fetcher = fetcher(source.clone(), &config(100, 10));
        let mut state = DrainState::start(EntityKind::Invoice, SourceWindow::new(t(2, 0), t(1, 0)));

        assert!(fetcher.next_page(&mut state).await.unwrap().is_none());
        assert!(source.calls().is_empty());
    }
}
