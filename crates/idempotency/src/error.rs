use thiserror::Error;

use crate::IdempotencyKey;

/// Errors that can occur when interacting with the idempotency store.
#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// The key was already used for a request with different content.
    #[error("Idempotency key '{key}' was reused for a different request")]
    KeyConflict { key: IdempotencyKey },

    /// The supplied key is not acceptable.
    #[error("Invalid idempotency key: {0}")]
    InvalidKey(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl IdempotencyError {
    /// Returns true if the caller made an invalid request rather than the
    /// system failing.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            IdempotencyError::KeyConflict { .. } | IdempotencyError::InvalidKey(_)
        )
    }
}

/// Result type for idempotency store operations.
pub type Result<T> = std::result::Result<T, IdempotencyError>;
