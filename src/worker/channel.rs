use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::SqlAccessError;
use crate::results::ResultSet;
use crate::types::RowValues;

/// Request sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMessage {
    pub sql: String,
    pub params: Vec<RowValues>,
}

impl WorkerMessage {
    #[must_use]
    pub fn new(sql: impl Into<String>, params: Vec<RowValues>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Payload of a successful reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerData {
    Rows {
        rows: Vec<Vec<RowValues>>,
        columns: Vec<String>,
    },
    Affected(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        })
    }
}

/// A mutation of `table`, emitted by the worker that executed it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: String,
}

impl ChangeEvent {
    #[must_use]
    pub fn new(kind: ChangeKind, table: impl Into<String>) -> Self {
        Self {
            kind,
            table: table.into(),
        }
    }
}

/// Error data returned by a worker. Plain data, so it survives the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
    /// Driver error code name, e.g. `DatabaseBusy` or `ConstraintViolation`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default)]
    pub attempts: usize,
}

impl WireError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            sql: None,
            attempts: 1,
        }
    }

    /// Driver error without the statement text; the caller attaches the SQL when allowed.
    pub(crate) fn from_sqlite(err: &rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(failure, _) => Self {
                code: Some(format!("{:?}", failure.code)),
                ..Self::new(err.to_string())
            },
            rusqlite::Error::SqlInputError {
                error, msg, offset, ..
            } => Self {
                code: Some(format!("{:?}", error.code)),
                ..Self::new(format!("{msg} at offset {offset}"))
            },
            _ => Self::new(err.to_string()),
        }
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self.code.as_deref(), Some("DatabaseBusy" | "DatabaseLocked"))
    }

    /// Reconstitute a crate error on the caller side.
    #[must_use]
    pub fn into_error(self) -> SqlAccessError {
        if self.is_busy() {
            SqlAccessError::Busy {
                attempts: self.attempts,
            }
        } else {
            SqlAccessError::Worker(self)
        }
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(sql) = &self.sql {
            write!(f, " (sql: {sql})")?;
        }
        Ok(())
    }
}

/// Reply to a [`WorkerMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkerResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<WorkerData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<ChangeEvent>,
}

impl WorkerResult {
    #[must_use]
    pub fn failed(error: WireError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    /// Turn the reply into a result set and its change event, or the reconstituted error.
    ///
    /// # Errors
    /// Returns the worker's error converted by [`WireError::into_error`].
    pub fn into_outcome(self) -> Result<(ResultSet, Option<ChangeEvent>), SqlAccessError> {
        if let Some(error) = self.error {
            return Err(error.into_error());
        }
        let result_set = match self.data {
            Some(WorkerData::Rows { rows, columns }) => ResultSet::from_wire(rows, columns),
            Some(WorkerData::Affected(n)) => ResultSet::affected(n),
            None => ResultSet::default(),
        };
        Ok((result_set, self.change))
    }
}

pub(crate) type Reply<T> = oneshot::Sender<Result<T, SqlAccessError>>;

pub(crate) enum Command {
    Execute {
        message: WorkerMessage,
        respond_to: oneshot::Sender<WorkerResult>,
    },
    /// Request and reply travel through the worker's shared frame buffer.
    Framed { respond_to: Reply<()> },
    ExecuteBatch { sql: String, respond_to: Reply<()> },
    Begin { respond_to: Reply<()> },
    Commit { respond_to: Reply<()> },
    Rollback { respond_to: Reply<()> },
    /// Exit without replying, as a crashing worker would.
    Crash {
        _respond_to: oneshot::Sender<WorkerResult>,
    },
    Shutdown,
}
