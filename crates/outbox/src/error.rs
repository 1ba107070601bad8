use thiserror::Error;

use crate::AggregateId;

/// Errors that can occur when interacting with the outbox.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// The record was saved with a version that does not follow the stored one.
    #[error(
        "Version conflict for aggregate {aggregate_id}: expected stored version {expected}, found {actual}"
    )]
    VersionConflict {
        aggregate_id: AggregateId,
        expected: i64,
        actual: i64,
    },

    /// A write inside the unit of work failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for outbox operations.
pub type Result<T> = std::result::Result<T, OutboxError>;
