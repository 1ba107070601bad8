use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{AggregateId, DomainRecord, NewOutboxEntry, OutboxEntry, OutboxEntryId, Result};

/// A local transaction grouping domain record writes with outbox appends.
///
/// Nothing written through a unit of work is visible until [`commit`]
/// succeeds. Dropping an uncommitted unit discards every write.
///
/// [`commit`]: UnitOfWork::commit
#[async_trait]
pub trait UnitOfWork: Send {
    /// Writes a domain record.
    ///
    /// The record's version must directly follow the stored version (or be
    /// 1 for a new record); otherwise the save fails with
    /// [`OutboxError::VersionConflict`](crate::OutboxError::VersionConflict).
    async fn save_record(&mut self, record: DomainRecord) -> Result<()>;

    /// Appends a pending outbox entry. A failed append fails the whole unit.
    async fn append(&mut self, entry: NewOutboxEntry) -> Result<OutboxEntryId>;

    /// Makes every write of this unit visible atomically.
    async fn commit(self) -> Result<()>;

    /// Discards every write of this unit.
    async fn rollback(self) -> Result<()>;
}

/// Storage for domain records and their outbox entries.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    type UnitOfWork: UnitOfWork;

    /// Starts a unit of work.
    async fn begin(&self) -> Result<Self::UnitOfWork>;

    /// Loads the current version of a domain record.
    async fn load_record(&self, aggregate_id: AggregateId) -> Result<Option<DomainRecord>>;

    /// Claims up to `batch_size` pending entries for `owner` until the lease
    /// expires.
    ///
    /// Entries are returned in `(created_at, sequence)` order. An entry is
    /// skipped while an older pending entry of the same aggregate is leased to
    /// another pass, so one aggregate is never published by two passes at
    /// once.
    async fn claim_pending(
        &self,
        owner: &str,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxEntry>>;

    /// Marks entries leased to `owner` as sent. Returns how many were marked.
    async fn mark_sent(&self, owner: &str, ids: &[OutboxEntryId]) -> Result<u64>;

    /// Releases the lease on a failed entry, counting the attempt.
    async fn record_failure(&self, owner: &str, id: OutboxEntryId, error: &str) -> Result<()>;

    /// Releases leases without counting an attempt.
    async fn release(&self, owner: &str, ids: &[OutboxEntryId]) -> Result<()>;

    /// Deletes sent entries whose `sent_at` is before `older_than`.
    /// Pending entries are never purged.
    async fn purge_sent(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Number of entries still pending.
    async fn pending_count(&self) -> Result<u64>;

    /// All entries of an aggregate in delivery order.
    async fn entries_for_aggregate(&self, aggregate_id: AggregateId) -> Result<Vec<OutboxEntry>>;
}

/// Converts a lease length to a chrono duration, capped at ten years.
pub(crate) fn lease_delta(lease: Duration) -> chrono::Duration {
    chrono::Duration::from_std(lease)
        .unwrap_or_else(|_| chrono::Duration::days(3650))
        .min(chrono::Duration::days(3650))
}
