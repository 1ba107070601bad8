use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::store::lease_delta;
use crate::{
    AggregateId, DomainRecord, NewOutboxEntry, OutboxEntry, OutboxEntryId, OutboxError,
    OutboxStatus, OutboxStore, Result, UnitOfWork,
};

type OrderKey = (DateTime<Utc>, i64);

#[derive(Default)]
struct State {
    records: HashMap<AggregateId, DomainRecord>,
    entries: BTreeMap<OrderKey, OutboxEntry>,
    index: HashMap<OutboxEntryId, OrderKey>,
    next_sequence: i64,
}

impl State {
    fn entry_mut(&mut self, id: OutboxEntryId) -> Option<&mut OutboxEntry> {
        let key = self.index.get(&id)?;
        self.entries.get_mut(key)
    }

    fn stored_version(&self, aggregate_id: AggregateId) -> i64 {
        self.records
            .get(&aggregate_id)
            .map(|r| r.version)
            .unwrap_or(0)
    }
}

#[derive(Default)]
struct Faults {
    fail_next_append: AtomicBool,
    fail_next_commit: AtomicBool,
}

/// In-memory outbox store for tests and single-process deployments.
///
/// Units of work buffer their writes and apply them under one write lock on
/// commit.
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    state: Arc<RwLock<State>>,
    faults: Arc<Faults>,
}

impl InMemoryOutboxStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `append` fail with a storage error.
    pub fn fail_next_append(&self) {
        self.faults.fail_next_append.store(true, Ordering::SeqCst);
    }

    /// Makes the next `commit` fail with a storage error.
    pub fn fail_next_commit(&self) {
        self.faults.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Returns every entry in delivery order.
    pub async fn entries(&self) -> Vec<OutboxEntry> {
        self.state.read().await.entries.values().cloned().collect()
    }

    /// Returns the number of stored domain records.
    pub async fn record_count(&self) -> usize {
        self.state.read().await.records.len()
    }
}

/// Unit of work over an [`InMemoryOutboxStore`].
pub struct InMemoryUnitOfWork {
    store: InMemoryOutboxStore,
    records: HashMap<AggregateId, DomainRecord>,
    base_versions: HashMap<AggregateId, i64>,
    entries: Vec<NewOutboxEntry>,
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn save_record(&mut self, record: DomainRecord) -> Result<()> {
        let aggregate_id = record.aggregate_id;
        let current = match self.records.get(&aggregate_id) {
            Some(staged) => staged.version,
            None => self.store.state.read().await.stored_version(aggregate_id),
        };

        if record.expected_stored_version() != current {
            return Err(OutboxError::VersionConflict {
                aggregate_id,
                expected: record.expected_stored_version(),
                actual: current,
            });
        }

        self.base_versions.entry(aggregate_id).or_insert(current);
        self.records.insert(aggregate_id, record);
        Ok(())
    }

    async fn append(&mut self, entry: NewOutboxEntry) -> Result<OutboxEntryId> {
        if self.store.faults.fail_next_append.swap(false, Ordering::SeqCst) {
            return Err(OutboxError::Storage("injected append failure".to_string()));
        }
        let id = entry.id;
        self.entries.push(entry);
        Ok(id)
    }

    async fn commit(self) -> Result<()> {
        if self.store.faults.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(OutboxError::Storage("injected commit failure".to_string()));
        }

        let mut state = self.store.state.write().await;

        for (aggregate_id, base) in &self.base_versions {
            let actual = state.stored_version(*aggregate_id);
            if actual != *base {
                return Err(OutboxError::VersionConflict {
                    aggregate_id: *aggregate_id,
                    expected: *base,
                    actual,
                });
            }
        }

        state.records.extend(self.records);

        let appended = self.entries.len();
        for new_entry in self.entries {
            state.next_sequence += 1;
            let entry = OutboxEntry::from_new(new_entry, state.next_sequence);
            let key = entry.order_key();
            state.index.insert(entry.id, key);
            state.entries.insert(key, entry);
        }

        metrics::counter!("outbox_entries_appended_total").increment(appended as u64);
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    type UnitOfWork = InMemoryUnitOfWork;

    async fn begin(&self) -> Result<InMemoryUnitOfWork> {
        Ok(InMemoryUnitOfWork {
            store: self.clone(),
            records: HashMap::new(),
            base_versions: HashMap::new(),
            entries: Vec::new(),
        })
    }

    async fn load_record(&self, aggregate_id: AggregateId) -> Result<Option<DomainRecord>> {
        Ok(self.state.read().await.records.get(&aggregate_id).cloned())
    }

    async fn claim_pending(
        &self,
        owner: &str,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxEntry>> {
        let now = Utc::now();
        let lease_until = now + lease_delta(lease);
        let mut state = self.state.write().await;

        let mut blocked = HashSet::new();
        let mut claimed = Vec::new();
        for entry in state.entries.values_mut() {
            if claimed.len() >= batch_size {
                break;
            }
            if entry.status != OutboxStatus::Pending {
                continue;
            }
            if entry.is_leased_at(now) {
                blocked.insert(entry.aggregate_id);
                continue;
            }
            if blocked.contains(&entry.aggregate_id) {
                continue;
            }
            entry.lease_owner = Some(owner.to_string());
            entry.lease_until = Some(lease_until);
            claimed.push(entry.clone());
        }

        Ok(claimed)
    }

    async fn mark_sent(&self, owner: &str, ids: &[OutboxEntryId]) -> Result<u64> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let mut marked = 0;
        for id in ids {
            if let Some(entry) = state.entry_mut(*id)
                && entry.status == OutboxStatus::Pending
                && entry.lease_owner.as_deref() == Some(owner)
            {
                entry.status = OutboxStatus::Sent;
                entry.sent_at = Some(now);
                entry.lease_owner = None;
                entry.lease_until = None;
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn record_failure(&self, owner: &str, id: OutboxEntryId, error: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(entry) = state.entry_mut(id)
            && entry.lease_owner.as_deref() == Some(owner)
        {
            entry.attempts += 1;
            entry.last_error = Some(error.to_string());
            entry.lease_owner = None;
            entry.lease_until = None;
        }
        Ok(())
    }

    async fn release(&self, owner: &str, ids: &[OutboxEntryId]) -> Result<()> {
        let mut state = self.state.write().await;
        for id in ids {
            if let Some(entry) = state.entry_mut(*id)
                && entry.lease_owner.as_deref() == Some(owner)
            {
                entry.lease_owner = None;
                entry.lease_until = None;
            }
        }
        Ok(())
    }

    async fn purge_sent(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let expired: Vec<(OrderKey, OutboxEntryId)> = state
            .entries
            .iter()
            .filter(|(_, e)| {
                e.status == OutboxStatus::Sent && e.sent_at.is_some_and(|at| at < older_than)
            })
            .map(|(key, e)| (*key, e.id))
            .collect();

        for (key, id) in &expired {
            state.entries.remove(key);
            state.index.remove(id);
        }
        Ok(expired.len() as u64)
    }

    async fn pending_count(&self) -> Result<u64> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .values()
            .filter(|e| e.status == OutboxStatus::Pending)
            .count() as u64)
    }

    async fn entries_for_aggregate(&self, aggregate_id: AggregateId) -> Result<Vec<OutboxEntry>> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .values()
            .filter(|e| e.aggregate_id == aggregate_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(30);

    fn placed(aggregate_id: AggregateId, n: u32) -> NewOutboxEntry {
        NewOutboxEntry::new(
            aggregate_id,
            "Order",
            "OrderPlaced",
            serde_json::json!({ "n": n }),
        )
    }

    async fn commit_entries(store: &InMemoryOutboxStore, entries: Vec<NewOutboxEntry>) {
        let mut uow = store.begin().await.unwrap();
        for entry in entries {
            uow.append(entry).await.unwrap();
        }
        uow.commit().await.unwrap();
    }

    #[tokio::test]
    async fn commit_makes_record_and_entry_visible() {
        let store = InMemoryOutboxStore::new();
        let id = AggregateId::new();

        let mut uow = store.begin().await.unwrap();
        uow.save_record(DomainRecord::new(id, "Order", serde_json::json!({})))
            .await
            .unwrap();
        uow.append(placed(id, 1)).await.unwrap();
        assert_eq!(store.pending_count().await.unwrap(), 0);

        uow.commit().await.unwrap();
        assert!(store.load_record(id).await.unwrap().is_some());
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dropped_unit_leaves_nothing() {
        let store = InMemoryOutboxStore::new();
        let id = AggregateId::new();
        {
            let mut uow = store.begin().await.unwrap();
            uow.save_record(DomainRecord::new(id, "Order", serde_json::json!({})))
                .await
                .unwrap();
            uow.append(placed(id, 1)).await.unwrap();
        }
        assert_eq!(store.record_count().await, 0);
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let store = InMemoryOutboxStore::new();
        let id = AggregateId::new();
        let first = DomainRecord::new(id, "Order", serde_json::json!({"v": 1}));

        let mut uow = store.begin().await.unwrap();
        uow.save_record(first.clone()).await.unwrap();
        uow.commit().await.unwrap();

        let mut uow = store.begin().await.unwrap();
        let result = uow.save_record(first.clone()).await;
        assert!(matches!(
            result,
            Err(OutboxError::VersionConflict {
                expected: 0,
                actual: 1,
                ..
            })
        ));

        let mut uow = store.begin().await.unwrap();
        uow.save_record(first.next(serde_json::json!({"v": 2})))
            .await
            .unwrap();
        uow.commit().await.unwrap();
        assert_eq!(store.load_record(id).await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn concurrent_units_on_same_record_conflict_at_commit() {
        let store = InMemoryOutboxStore::new();
        let id = AggregateId::new();
        let first = DomainRecord::new(id, "Order", serde_json::json!({}));

        let mut a = store.begin().await.unwrap();
        let mut b = store.begin().await.unwrap();
        a.save_record(first.clone()).await.unwrap();
        b.save_record(first).await.unwrap();

        a.commit().await.unwrap();
        assert!(matches!(
            b.commit().await,
            Err(OutboxError::VersionConflict { .. })
        ));
    }

    #[tokio::test]
    async fn claim_orders_by_creation_and_leases_entries() {
        let store = InMemoryOutboxStore::new();
        let id = AggregateId::new();
        let t0 = Utc::now();
        commit_entries(
            &store,
            vec![
                placed(id, 2).with_created_at(t0 + chrono::Duration::milliseconds(5)),
                placed(id, 1).with_created_at(t0),
            ],
        )
        .await;

        let claimed = store.claim_pending("relay-a", 10, LEASE).await.unwrap();
        let order: Vec<_> = claimed.iter().map(|e| e.payload["n"].clone()).collect();
        assert_eq!(order, vec![serde_json::json!(1), serde_json::json!(2)]);

        let again = store.claim_pending("relay-b", 10, LEASE).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn later_entries_wait_for_leased_older_entry() {
        let store = InMemoryOutboxStore::new();
        let a = AggregateId::new();
        let b = AggregateId::new();
        commit_entries(&store, vec![placed(a, 1)]).await;

        let first = store.claim_pending("relay-a", 10, LEASE).await.unwrap();
        assert_eq!(first.len(), 1);

        commit_entries(&store, vec![placed(a, 2), placed(b, 1)]).await;
        let second = store.claim_pending("relay-b", 10, LEASE).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].aggregate_id, b);
    }

    #[tokio::test]
    async fn expired_lease_is_claimable_again() {
        let store = InMemoryOutboxStore::new();
        commit_entries(&store, vec![placed(AggregateId::new(), 1)]).await;

        let first = store
            .claim_pending("crashed", 10, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = store.claim_pending("relay-b", 10, LEASE).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].lease_owner.as_deref(), Some("relay-b"));
    }

    #[tokio::test]
    async fn failure_counts_attempt_and_releases() {
        let store = InMemoryOutboxStore::new();
        let id = AggregateId::new();
        commit_entries(&store, vec![placed(id, 1)]).await;
        let claimed = store.claim_pending("relay", 10, LEASE).await.unwrap();

        store
            .record_failure("relay", claimed[0].id, "broker down")
            .await
            .unwrap();

        let entries = store.entries_for_aggregate(id).await.unwrap();
        assert_eq!(entries[0].attempts, 1);
        assert_eq!(entries[0].last_error.as_deref(), Some("broker down"));
        assert!(entries[0].lease_owner.is_none());
        assert_eq!(entries[0].status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn mark_sent_requires_lease_ownership() {
        let store = InMemoryOutboxStore::new();
        commit_entries(&store, vec![placed(AggregateId::new(), 1)]).await;
        let claimed = store.claim_pending("relay-a", 10, LEASE).await.unwrap();

        assert_eq!(store.mark_sent("relay-b", &[claimed[0].id]).await.unwrap(), 0);
        assert_eq!(store.mark_sent("relay-a", &[claimed[0].id]).await.unwrap(), 1);
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn purge_only_removes_old_sent_entries() {
        let store = InMemoryOutboxStore::new();
        let id = AggregateId::new();
        commit_entries(&store, vec![placed(id, 1), placed(id, 2)]).await;
        let claimed = store.claim_pending("relay", 1, LEASE).await.unwrap();
        store.mark_sent("relay", &[claimed[0].id]).await.unwrap();

        let purged = store
            .purge_sent(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);

        let remaining = store.entries().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].status, OutboxStatus::Pending);
    }
}
