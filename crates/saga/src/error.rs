//! Saga error types.

use common::SagaId;
use thiserror::Error;

use crate::state::SagaState;

/// Errors that can occur during saga operations.
///
/// A failing step or compensation is not an error of the orchestrator: it is
/// recorded on the instance and reported in the
/// [`SagaReport`](crate::SagaReport).
#[derive(Debug, Error)]
pub enum SagaError {
    /// No saga instance with this ID exists.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// No definition is registered for the saga type.
    #[error("Unknown saga type: {0}")]
    UnknownSagaType(String),

    /// The persisted step list does not match the registered definition.
    #[error("Saga {saga_id} does not match definition '{saga_type}': {reason}")]
    DefinitionMismatch {
        saga_id: SagaId,
        saga_type: String,
        reason: String,
    },

    /// Another orchestrator saved the instance first.
    #[error("Concurrency conflict for saga {saga_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        saga_id: SagaId,
        expected: i64,
        actual: i64,
    },

    /// Saga is in an invalid state for the requested operation.
    #[error("Saga {saga_id} is {state}")]
    InvalidState { saga_id: SagaId, state: SagaState },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
