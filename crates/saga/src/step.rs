//! Step contract and the context shared between steps.

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use thiserror::Error;

/// Error reported by a step's forward or compensating action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StepError {
    pub message: String,
}

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        StepError::new(format!("context serialization failed: {err}"))
    }
}

/// JSON data carried across the steps of one saga instance.
///
/// Values written by a forward action are persisted with the instance, so
/// later steps and compensations see them after a resume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SagaContext(Map<String, Value>);

impl SagaContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value under `key`, replacing any previous one.
    pub fn insert<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<(), StepError> {
        self.0.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Builder-style [`insert`](Self::insert) for constructing initial contexts.
    pub fn with<T: Serialize>(mut self, key: impl Into<String>, value: &T) -> Result<Self, StepError> {
        self.insert(key, value)?;
        Ok(self)
    }

    /// Reads the value under `key`, if present.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StepError> {
        self.0
            .get(key)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(StepError::from)
    }

    /// Reads the value under `key`, failing if it is missing.
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T, StepError> {
        self.get(key)?
            .ok_or_else(|| StepError::new(format!("missing context value '{key}'")))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// One local transaction of a saga together with its compensating action.
///
/// Both actions may be invoked more than once for the same instance (a crash
/// between running an action and persisting its outcome replays it), so
/// implementations must be idempotent.
#[async_trait]
pub trait SagaStep: Send + Sync {
    /// Stable step name, persisted in the step records.
    fn name(&self) -> &str;

    /// Runs the forward action. Data needed by later steps or by the
    /// compensation goes into `ctx`.
    async fn execute(&self, ctx: &mut SagaContext) -> Result<(), StepError>;

    /// Undoes a completed forward action.
    async fn compensate(&self, ctx: &SagaContext) -> Result<(), StepError>;
}
