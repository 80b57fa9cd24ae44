// ⚠️ Error taxonomy for the migration pipeline
//
// ValidationError  -> bad input record, recorded per item, never aborts a batch
// StoreError       -> persistence failure, transient ones retried per batch
// CreationError    -> either of the above, for one record
// BusError         -> event publication failure
// MigrationError   -> job-level failure surfaced to callers

use thiserror::Error;

/// A source record failed field validation.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        ValidationError {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn missing(field: &str) -> Self {
        Self::new(field, "is required")
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// The store could not be reached or the unit of work was aborted.
    /// The whole batch is discarded and retried.
    #[error("entity store unavailable: {0}")]
    Unavailable(String),

    /// A record for the same owner and old id already exists.
    #[error("record already exists as {existing_id}")]
    Duplicate { existing_id: String },

    /// The store refused this one record; other records are unaffected.
    #[error("record rejected by store: {0}")]
    Rejected(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
}

impl StoreError {
    /// Transient failures retry the batch; everything else is per record.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                rusqlite::ErrorCode::DatabaseBusy
                | rusqlite::ErrorCode::DatabaseLocked
                | rusqlite::ErrorCode::CannotOpen
                | rusqlite::ErrorCode::SystemIoFailure
                | rusqlite::ErrorCode::DiskFull => StoreError::Unavailable(err.to_string()),
                _ => StoreError::Rejected(err.to_string()),
            },
            _ => StoreError::Rejected(err.to_string()),
        }
    }
}

/// Why a single record could not be created.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CreationError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BusError {
    #[error("no subscribers on topic {0}")]
    NoSubscribers(String),

    #[error("event bus closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("job {0} not found")]
    UnknownJob(String),

    #[error("mapping request has no owner")]
    MissingOwner,

    #[error("job {job_id} could not proceed: {reason}")]
    JobFailed { job_id: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("worker task failed: {0}")]
    Worker(String),
}
