use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AggregateId, OutboxError};

/// The current state of an aggregate, owned by the service that wrote it.
///
/// `version` starts at 1 and increases by one on every save. A save whose
/// version does not directly follow the stored one is rejected as a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainRecord {
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub version: i64,
    pub state: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl DomainRecord {
    /// Creates the first version of a record.
    pub fn new(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        state: serde_json::Value,
    ) -> Self {
        Self {
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            version: 1,
            state,
            updated_at: Utc::now(),
        }
    }

    /// Returns the next version of this record carrying `state`.
    pub fn next(&self, state: serde_json::Value) -> Self {
        Self {
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type.clone(),
            version: self.version + 1,
            state,
            updated_at: Utc::now(),
        }
    }

    /// Deserializes the state into `T`.
    pub fn state_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, OutboxError> {
        Ok(serde_json::from_value(self.state.clone())?)
    }

    /// The stored version this save expects to replace (0 for a new record).
    pub(crate) fn expected_stored_version(&self) -> i64 {
        self.version - 1
    }
}
