use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{IdempotencyKey, IdempotencyRecord, RequestFingerprint, Result, StoredResponse};

/// Outcome of [`IdempotencyStore::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// No record exists; execute the operation and commit its result.
    Miss,
    /// A matching record exists; serve its response verbatim.
    Hit(IdempotencyRecord),
}

/// Outcome of [`IdempotencyStore::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// This call stored the record.
    Committed(IdempotencyRecord),
    /// Another call stored a record for the key first. Carries the winner's
    /// record, which every caller must serve.
    AlreadyCommitted(IdempotencyRecord),
}

impl CommitOutcome {
    /// Returns the record that is now stored for the key.
    pub fn record(&self) -> &IdempotencyRecord {
        match self {
            CommitOutcome::Committed(record) | CommitOutcome::AlreadyCommitted(record) => record,
        }
    }

    pub fn into_record(self) -> IdempotencyRecord {
        match self {
            CommitOutcome::Committed(record) | CommitOutcome::AlreadyCommitted(record) => record,
        }
    }
}

/// Durable mapping from idempotency key to the first response produced for it.
///
/// Implementations must be shared across every service instance, since a retry
/// can land on a different process than the original request.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Looks up the key.
    ///
    /// Returns `Miss` if nothing is stored, `Hit` if the stored fingerprint
    /// matches, and fails with `KeyConflict` if it does not.
    async fn check(
        &self,
        key: &IdempotencyKey,
        fingerprint: &RequestFingerprint,
    ) -> Result<CheckOutcome>;

    /// Stores the response for the key unless a record already exists.
    ///
    /// Atomic per key: among concurrent commits exactly one wins. Losers get
    /// `AlreadyCommitted` with the winner's record, or `KeyConflict` if the
    /// winner's fingerprint differs.
    async fn commit(
        &self,
        key: &IdempotencyKey,
        fingerprint: &RequestFingerprint,
        response: StoredResponse,
    ) -> Result<CommitOutcome>;

    /// Returns the stored record for the key, if any.
    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>>;

    /// Deletes records stored before `cutoff`. Returns the number removed.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
impl<T: IdempotencyStore + ?Sized> IdempotencyStore for Arc<T> {
    async fn check(
        &self,
        key: &IdempotencyKey,
        fingerprint: &RequestFingerprint,
    ) -> Result<CheckOutcome> {
        (**self).check(key, fingerprint).await
    }

    async fn commit(
        &self,
        key: &IdempotencyKey,
        fingerprint: &RequestFingerprint,
        response: StoredResponse,
    ) -> Result<CommitOutcome> {
        (**self).commit(key, fingerprint, response).await
    }

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        (**self).get(key).await
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        (**self).purge_older_than(cutoff).await
    }
}

/// Resolves a found record against the requested fingerprint.
pub(crate) fn check_existing(
    key: &IdempotencyKey,
    fingerprint: &RequestFingerprint,
    existing: Option<IdempotencyRecord>,
) -> Result<CheckOutcome> {
    match existing {
        None => Ok(CheckOutcome::Miss),
        Some(record) if record.matches(fingerprint) => {
            metrics::counter!("idempotency_hits_total").increment(1);
            Ok(CheckOutcome::Hit(record))
        }
        Some(_) => Err(conflict(key)),
    }
}

pub(crate) fn conflict(key: &IdempotencyKey) -> crate::IdempotencyError {
    metrics::counter!("idempotency_conflicts_total").increment(1);
    tracing::warn!(key = %key, "idempotency key reused with a different fingerprint");
    crate::IdempotencyError::KeyConflict { key: key.clone() }
}
