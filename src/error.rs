use thiserror::Error;

use crate::migration::MigrationError;
use crate::query_builder::BuildError;
use crate::worker::WireError;

#[derive(Debug, Error)]
pub enum SqlAccessError {
    #[error(transparent)]
    SqliteError(#[from] rusqlite::Error),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("Wire encoding error: {0}")]
    Encoding(String),

    #[error("Database busy after {attempts} attempts")]
    Busy { attempts: usize },

    #[error("Worker crashed: {0}")]
    WorkerCrashed(String),

    #[error("Worker error: {0}")]
    Worker(WireError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Parameter conversion error: {0}")]
    ParameterError(String),

    #[error("SQL execution error: {0}")]
    ExecutionError(String),

    #[error("Other database error: {0}")]
    Other(String),
}

impl SqlAccessError {
    /// True when the engine reported `SQLITE_BUSY`/`SQLITE_LOCKED`, either locally or through a
    /// worker.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Busy { .. } => true,
            Self::SqliteError(err) => is_busy_error(err),
            Self::Worker(wire) => wire.is_busy(),
            _ => false,
        }
    }

    /// A copy of this error for callers that share one failed operation.
    ///
    /// Busy and crash errors keep their variant; everything else is flattened to its message.
    #[must_use]
    pub fn shared(&self) -> SqlAccessError {
        match self {
            Self::Busy { attempts } => Self::Busy {
                attempts: *attempts,
            },
            Self::WorkerCrashed(msg) => Self::WorkerCrashed(msg.clone()),
            Self::Worker(wire) => Self::Worker(wire.clone()),
            Self::Build(err) => Self::Build(err.clone()),
            Self::Encoding(msg) => Self::Encoding(msg.clone()),
            other => Self::ExecutionError(other.to_string()),
        }
    }
}

pub(crate) fn is_busy_error(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}
