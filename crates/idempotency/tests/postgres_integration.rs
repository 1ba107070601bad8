//! PostgreSQL integration tests
//!
//! Run with:
//!
//! ```bash
//! cargo test -p idempotency --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use idempotency::{
    CheckOutcome, CommitOutcome, IdempotencyError, IdempotencyKey, IdempotencyStore,
    PostgresIdempotencyStore, RequestFingerprint, StoredResponse,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/002_create_idempotency_records.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_store() -> PostgresIdempotencyStore {
    let info = get_container_info().await;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE idempotency_records")
        .execute(&pool)
        .await
        .unwrap();

    PostgresIdempotencyStore::new(pool)
}

fn key(s: &str) -> IdempotencyKey {
    IdempotencyKey::new(s).unwrap()
}

#[tokio::test]
#[serial]
async fn commit_then_check_round_trips_status_and_body() {
    let store = get_test_store().await;
    let fp = RequestFingerprint::of("POST", "/orders", b"{}");
    let response = StoredResponse::new(201, vec![0, 159, 146, 150]);

    store.commit(&key("abc"), &fp, response.clone()).await.unwrap();

    match store.check(&key("abc"), &fp).await.unwrap() {
        CheckOutcome::Hit(record) => assert_eq!(record.response, response),
        CheckOutcome::Miss => panic!("expected a hit"),
    }
}

#[tokio::test]
#[serial]
async fn mismatched_fingerprint_is_a_conflict() {
    let store = get_test_store().await;
    store
        .commit(
            &key("abc"),
            &RequestFingerprint::new("a"),
            StoredResponse::new(201, Vec::new()),
        )
        .await
        .unwrap();

    let check = store.check(&key("abc"), &RequestFingerprint::new("b")).await;
    assert!(matches!(check, Err(IdempotencyError::KeyConflict { .. })));

    let commit = store
        .commit(
            &key("abc"),
            &RequestFingerprint::new("b"),
            StoredResponse::new(201, Vec::new()),
        )
        .await;
    assert!(matches!(commit, Err(IdempotencyError::KeyConflict { .. })));
}

#[tokio::test]
#[serial]
async fn caller_supplied_fingerprint_of_any_length_is_stored() {
    let store = get_test_store().await;
    let fp = RequestFingerprint::new("f".repeat(512));
    let response = StoredResponse::new(200, b"ok".to_vec());

    store.commit(&key("long-fp"), &fp, response.clone()).await.unwrap();

    match store.check(&key("long-fp"), &fp).await.unwrap() {
        CheckOutcome::Hit(record) => {
            assert_eq!(record.fingerprint, fp);
            assert_eq!(record.response, response);
        }
        CheckOutcome::Miss => panic!("expected a hit"),
    }
}

#[tokio::test]
#[serial]
async fn concurrent_commits_have_one_winner() {
    let store = Arc::new(get_test_store().await);
    let fp = RequestFingerprint::new("fp");

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = Arc::clone(&store);
        let fp = fp.clone();
        handles.push(tokio::spawn(async move {
            store
                .commit(&key("race"), &fp, StoredResponse::new(200, format!("{i}").into_bytes()))
                .await
                .unwrap()
        }));
    }

    let mut committed = 0;
    let mut bodies = Vec::new();
    for handle in handles {
        let outcome = handle.await.unwrap();
        if matches!(outcome, CommitOutcome::Committed(_)) {
            committed += 1;
        }
        bodies.push(outcome.into_record().response.body);
    }
    bodies.dedup();

    assert_eq!(committed, 1);
    assert_eq!(bodies.len(), 1);
}

#[tokio::test]
#[serial]
async fn purge_removes_expired_records() {
    let store = get_test_store().await;
    let fp = RequestFingerprint::new("fp");
    store
        .commit(&key("old"), &fp, StoredResponse::new(200, Vec::new()))
        .await
        .unwrap();

    let removed = store
        .purge_older_than(Utc::now() + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(store.get(&key("old")).await.unwrap().is_none());
}
