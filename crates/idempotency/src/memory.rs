use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::store::{check_existing, conflict};
use crate::{
    CheckOutcome, CommitOutcome, IdempotencyKey, IdempotencyRecord, IdempotencyStore,
    RequestFingerprint, Result, StoredResponse,
};

/// In-memory idempotency store for tests and single-process deployments.
#[derive(Clone, Default)]
pub struct InMemoryIdempotencyStore {
    records: Arc<RwLock<HashMap<IdempotencyKey, IdempotencyRecord>>>,
}

impl InMemoryIdempotencyStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored records.
    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn check(
        &self,
        key: &IdempotencyKey,
        fingerprint: &RequestFingerprint,
    ) -> Result<CheckOutcome> {
        let existing = self.records.read().await.get(key).cloned();
        check_existing(key, fingerprint, existing)
    }

    async fn commit(
        &self,
        key: &IdempotencyKey,
        fingerprint: &RequestFingerprint,
        response: StoredResponse,
    ) -> Result<CommitOutcome> {
        let mut records = self.records.write().await;
        match records.entry(key.clone()) {
            Entry::Vacant(slot) => {
                let record = IdempotencyRecord {
                    key: key.clone(),
                    fingerprint: fingerprint.clone(),
                    response,
                    stored_at: Utc::now(),
                };
                slot.insert(record.clone());
                Ok(CommitOutcome::Committed(record))
            }
            Entry::Occupied(existing) if existing.get().matches(fingerprint) => {
                tracing::debug!(key = %key, "commit lost to an earlier one");
                Ok(CommitOutcome::AlreadyCommitted(existing.get().clone()))
            }
            Entry::Occupied(_) => Err(conflict(key)),
        }
    }

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| record.stored_at >= cutoff);
        Ok((before - records.len()) as u64)
    }
}
