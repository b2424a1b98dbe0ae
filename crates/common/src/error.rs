use thiserror::Error;

#[derive(Debug, Error)]
pub enum PaysyncError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    /// Transient destination failure (pool timeout, dropped connection).
    #[error("database unavailable: {0}")]
    DatabaseUnavailable(String),

    /// A row referenced another row that is not in the destination yet.
    #[error("missing parent row: {0}")]
    MissingParent(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

impl PaysyncError {
    pub fn is_missing_parent(&self) -> bool {
        matches!(self, Self::MissingParent(_))
    }
}

pub type PaysyncResult<T> = Result<T, PaysyncError>;
