use sea_orm::error::DbErr;
use thiserror::Error;

/// Error type shared by all services.
///
/// `Conflict` marks lock/serialization failures a caller may retry (see
/// `db::retry_on_conflict`); everything else is surfaced as-is. A failed
/// operation never leaves partial state behind: every mutating path runs in
/// a transaction that rolls back on error.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Irreversible state: {0}")]
    IrreversibleState(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ServiceError {
    /// Wraps a database error, classifying lock waits and serialization
    /// failures as retryable conflicts.
    pub fn db_error(err: DbErr) -> Self {
        let text = err.to_string().to_lowercase();
        if text.contains("deadlock")
            || text.contains("could not serialize")
            || text.contains("lock timeout")
            || text.contains("database is locked")
        {
            ServiceError::Conflict(err.to_string())
        } else {
            ServiceError::DatabaseError(err)
        }
    }

    /// Whether the caller layer may retry the whole operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Conflict(_))
    }
}
