use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use crate::retry::{FailureClass, Retryable};
use paysync_common::EntityKind;
use paysync_config::{AuthMode, SourceConfig};

/// Half-open creation-time range `[start, end)` requested from the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SourceWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn span(&self) -> chrono::Duration {
        self.end - self.start
    }
}

/// One page of source records.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<Value>,
    /// Offset of the following page, `None` once the window is exhausted.
    pub next_cursor: Option<u64>,
    pub total_items: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum PaymentClientError {
    #[error("HTTP {status}: {body}")]
    HttpError { status: StatusCode, body: String },

    #[error("request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("rate-limited by source (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("failed to decode page: {0}")]
    Decode(String),
}

impl Retryable for PaymentClientError {
    fn classify(&self) -> FailureClass {
        match self {
            Self::RateLimited { retry_after } => FailureClass::RateLimited(*retry_after),
            Self::HttpError { status, .. } if status.is_server_error() => FailureClass::Transient,
            Self::HttpError { status, .. } if *status == StatusCode::REQUEST_TIMEOUT => {
                FailureClass::Transient
            }
            Self::HttpError { .. } => FailureClass::Fatal,
            Self::RequestError(e) => {
                if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
                    FailureClass::Transient
                } else {
                    FailureClass::Fatal
                }
            }
            // Truncated bodies from proxies are worth another attempt.
            Self::Decode(_) => FailureClass::Transient,
        }
    }
}

/// Source of record pages. Implemented over HTTP by [`PaymentClient`] and by
/// scripted sources in tests.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(
        &self,
        kind: EntityKind,
        window: &SourceWindow,
        cursor: u64,
    ) -> Result<Page, PaymentClientError>;
}

#[derive(Debug, Deserialize)]
struct PageBody {
    #[serde(default)]
    items: Option<Vec<Value>>,
    #[serde(default, rename = "totalItems")]
    total_items: Option<u64>,
}

#[derive(Clone)]
pub struct PaymentClient {
    client: Client,
    config: SourceConfig,
}

impl PaymentClient {
    pub fn new(config: SourceConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    /// For testing: create a client pointing at a specific base URL (e.g., wiremock).
    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.config.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn page_size(&self) -> u64 {
        u64::from(self.config.page_size.max(1))
    }
}

#[async_trait]
impl PageSource for PaymentClient {
    /// Single attempt; retries belong to the caller's governor.
    async fn fetch_page(
        &self,
        kind: EntityKind,
        window: &SourceWindow,
        cursor: u64,
    ) -> Result<Page, PaymentClientError> {
        let url = format!("{}/{}", self.config.base_url, kind.endpoint());
        let limit = self.page_size();
        let query = [
            ("limit", limit.to_string()),
            ("start", cursor.to_string()),
            ("startDate", window.start.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("endDate", window.end.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("sortBy", "created_at".to_string()),
            ("sortType", self.config.sort.as_str().to_string()),
        ];

        let request = self.client.get(&url).query(&query);
        let request = match self.config.auth_mode {
            AuthMode::Bearer => request.bearer_auth(&self.config.api_token),
            AuthMode::Basic => {
                request.basic_auth(&self.config.api_user, Some(&self.config.api_token))
            }
        };

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(PaymentClientError::RateLimited { retry_after });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentClientError::HttpError { status, body });
        }

        let text = response.text().await?;
        let body: PageBody =
            serde_json::from_str(&text).map_err(|e| PaymentClientError::Decode(e.to_string()))?;

        let records = body.items.unwrap_or_default();
        let next_cursor = next_cursor(cursor, records.len() as u64, limit, body.total_items);
        tracing::debug!(
            kind = %kind,
            cursor,
            returned = records.len(),
            total_items = ?body.total_items,
            "fetched page"
        );

        Ok(Page {
            records,
            next_cursor,
            total_items: body.total_items,
        })
    }
}

fn next_cursor(cursor: u64, returned: u64, limit: u64, total_items: Option<u64>) -> Option<u64> {
    if returned == 0 || returned < limit {
        return None;
    }
    let next = cursor + returned;
    match total_items {
        Some(total) if next >= total => None,
        _ => Some(next),
    }
}
