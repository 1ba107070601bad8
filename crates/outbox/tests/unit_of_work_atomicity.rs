//! A record change and its outbox entry are visible together or not at all.

use outbox::{
    AggregateId, DomainRecord, InMemoryOutboxStore, NewOutboxEntry, OutboxError, OutboxStore,
    UnitOfWork,
};

fn order_record(id: AggregateId) -> DomainRecord {
    DomainRecord::new(id, "Order", serde_json::json!({"status": "placed"}))
}

fn order_placed(id: AggregateId) -> NewOutboxEntry {
    NewOutboxEntry::new(id, "Order", "OrderPlaced", serde_json::json!({"order_id": id}))
}

#[tokio::test]
async fn failed_append_aborts_whole_unit() {
    let store = InMemoryOutboxStore::new();
    let id = AggregateId::new();
    store.fail_next_append();

    let result = async {
        let mut uow = store.begin().await?;
        uow.save_record(order_record(id)).await?;
        uow.append(order_placed(id)).await?;
        uow.commit().await
    }
    .await;

    assert!(matches!(result, Err(OutboxError::Storage(_))));
    assert!(store.load_record(id).await.unwrap().is_none());
    assert!(store.entries_for_aggregate(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_commit_leaves_no_record_and_no_entry() {
    let store = InMemoryOutboxStore::new();
    let id = AggregateId::new();
    store.fail_next_commit();

    let mut uow = store.begin().await.unwrap();
    uow.save_record(order_record(id)).await.unwrap();
    uow.append(order_placed(id)).await.unwrap();
    assert!(uow.commit().await.is_err());

    assert!(store.load_record(id).await.unwrap().is_none());
    assert_eq!(store.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn rollback_discards_writes() {
    let store = InMemoryOutboxStore::new();
    let id = AggregateId::new();

    let mut uow = store.begin().await.unwrap();
    uow.save_record(order_record(id)).await.unwrap();
    uow.append(order_placed(id)).await.unwrap();
    uow.rollback().await.unwrap();

    assert_eq!(store.record_count().await, 0);
    assert_eq!(store.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn entry_exists_iff_unit_committed() {
    let store = InMemoryOutboxStore::new();
    let mut committed = Vec::new();
    let mut aborted = Vec::new();

    for i in 0..20 {
        let id = AggregateId::new();
        if i % 3 == 0 {
            store.fail_next_append();
        }
        let result = async {
            let mut uow = store.begin().await?;
            uow.save_record(order_record(id)).await?;
            uow.append(order_placed(id)).await?;
            uow.commit().await
        }
        .await;

        match result {
            Ok(()) => committed.push(id),
            Err(_) => aborted.push(id),
        }
    }

    for id in &committed {
        assert!(store.load_record(*id).await.unwrap().is_some());
        assert_eq!(store.entries_for_aggregate(*id).await.unwrap().len(), 1);
    }
    for id in &aborted {
        assert!(store.load_record(*id).await.unwrap().is_none());
        assert!(store.entries_for_aggregate(*id).await.unwrap().is_empty());
    }
    assert_eq!(aborted.len(), 7);
}
