//! Failure classification and executor error types.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classifies an operation error as retryable or not.
///
/// Transient failures (timeouts, 5xx-equivalents) are retried by the
/// executor. Non-transient failures (validation, 4xx-equivalents) propagate
/// immediately without consuming retry budget.
pub trait Classify {
    /// Returns true if retrying the operation may succeed.
    fn is_transient(&self) -> bool;
}

/// The classified outcome kinds an executor can fail with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    CircuitOpen,
    RetriesExhausted,
    NonTransient,
}

impl FailureKind {
    /// Returns the kind name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::CircuitOpen => "CircuitOpen",
            FailureKind::RetriesExhausted => "RetriesExhausted",
            FailureKind::NonTransient => "NonTransient",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The error produced by a single attempt.
#[derive(Debug, Error)]
pub enum AttemptError<E> {
    /// The attempt did not finish within the per-call timeout.
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    /// The operation itself returned an error.
    #[error("{0}")]
    Operation(E),
}

impl<E> AttemptError<E> {
    /// Returns the operation error, if the attempt did not time out.
    pub fn into_operation(self) -> Option<E> {
        match self {
            AttemptError::Operation(e) => Some(e),
            AttemptError::Timeout(_) => None,
        }
    }
}

/// A classified failure returned by [`PolicyExecutor::execute`](crate::PolicyExecutor::execute).
#[derive(Debug, Error)]
pub enum Failure<E> {
    /// The breaker rejected the call; the operation was not invoked.
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    /// Every attempt failed with a transient error.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: AttemptError<E> },

    /// The operation failed with an error that must not be retried.
    #[error("non-transient failure: {0}")]
    NonTransient(E),
}

impl<E> Failure<E> {
    /// Returns the failure kind.
    pub fn kind(&self) -> FailureKind {
        match self {
            Failure::CircuitOpen { .. } => FailureKind::CircuitOpen,
            Failure::RetriesExhausted { .. } => FailureKind::RetriesExhausted,
            Failure::NonTransient(_) => FailureKind::NonTransient,
        }
    }

    /// Returns the last operation error, if there was one.
    pub fn into_source(self) -> Option<E> {
        match self {
            Failure::CircuitOpen { .. } => None,
            Failure::RetriesExhausted { last, .. } => last.into_operation(),
            Failure::NonTransient(e) => Some(e),
        }
    }
}

/// From the caller's point of view an open circuit or exhausted retries are
/// worth trying again later; a non-transient failure is not.
impl<E> Classify for Failure<E> {
    fn is_transient(&self) -> bool {
        !matches!(self, Failure::NonTransient(_))
    }
}

/// Errors raised when a policy configuration is invalid.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("max_attempts must be at least 1")]
    InvalidMaxAttempts,

    #[error("multiplier must be >= 1.0, got {0}")]
    InvalidMultiplier(f64),

    #[error("jitter_fraction must be within [0.0, 1.0], got {0}")]
    InvalidJitter(f64),

    #[error("failure_rate_threshold must be within (0.0, 1.0], got {0}")]
    InvalidFailureRate(f64),

    #[error("sliding window must hold at least minimum_number_of_calls ({minimum}) calls, got {window}")]
    InvalidWindow { window: usize, minimum: usize },

    #[error("permitted_calls_in_half_open_state must be at least 1")]
    InvalidHalfOpenCalls,
}
