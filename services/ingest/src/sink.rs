use crate::descriptor::PreparedRecord;
use crate::resolver::DependencyResolver;
use crate::retry::{Governor, RetryError};
use paysync_common::error::PaysyncError;
use paysync_db::records::models::{NormalizedRecord, UpsertOutcome};
use paysync_db::records::repositories::RecordRepository;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("{kind} {id} still references a missing parent: {reason}")]
    MissingParent {
        kind: String,
        id: String,
        reason: String,
    },

    #[error("failed to resolve parents of {id}: {source}")]
    Resolve {
        id: String,
        #[source]
        source: PaysyncError,
    },

    #[error("{0}")]
    Write(RetryError<PaysyncError>),
}

/// Result of applying one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    pub outcome: UpsertOutcome,
    /// Placeholders created while recovering from a foreign-key violation.
    pub placeholders: u64,
}

/// Idempotent merge-on-primary-key writer.
#[derive(Clone)]
pub struct UpsertSink<R> {
    repo: R,
    resolver: DependencyResolver<R>,
    governor: Governor,
}

impl<R> UpsertSink<R>
where
    R: RecordRepository + Clone,
{
    pub fn new(repo: R, resolver: DependencyResolver<R>, governor: Governor) -> Self {
        Self {
            repo,
            resolver,
            governor,
        }
    }

    /// Merge `prepared` into the destination by primary key. A foreign-key violation triggers one resolver pass for
    /// the record's references and exactly one more write.
    pub async fn apply(&self, prepared: &PreparedRecord) -> Result<Applied, SinkError> {
        let record = &prepared.record;
        match self.write(record).await {
            Ok(outcome) => {
                return Ok(Applied {
                    outcome,
                    placeholders: 0,
                })
            }
            Err(RetryError::Fatal {
                error: PaysyncError::MissingParent(reason),
                ..
            }) => {
                tracing::debug!(
                    kind = %record.kind,
                    id = %record.id,
                    reason = %reason,
                    "foreign key violation, resolving parents"
                );
            }
            Err(e) => return Err(SinkError::Write(e)),
        }

        let placeholders = self
            .resolver
            .resolve_page(std::slice::from_ref(prepared))
            .await
            .map_err(|source| SinkError::Resolve {
                id: record.id.clone(),
                source,
            })?;

        match self.write(record).await {
            Ok(outcome) => Ok(Applied {
                outcome,
                placeholders,
            }),
            Err(RetryError::Fatal {
                error: PaysyncError::MissingParent(reason),
                ..
            }) => Err(SinkError::MissingParent {
                kind: record.kind.to_string(),
                id: record.id.clone(),
                reason,
            }),
            Err(e) => Err(SinkError::Write(e)),
        }
    }

    async fn write(&self, record: &NormalizedRecord) -> Result<UpsertOutcome, RetryError<PaysyncError>> {
        self.governor
            .with_retry("upsert record", || self.repo.upsert(record))
            .await
    }
}
