use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AggregateId, DomainRecord, NewOutboxEntry, OutboxEntry, OutboxEntryId, OutboxError,
    OutboxStatus, OutboxStore, Result, UnitOfWork,
};

/// Advisory lock key serialising claim passes across relay instances.
const CLAIM_LOCK_KEY: i64 = 0x6f75_7462_6f78;

const ENTRY_COLUMNS: &str = "id, sequence, aggregate_id, aggregate_type, event_type, payload, \
     headers, status, attempts, last_error, lease_owner, lease_until, created_at, sent_at";

/// PostgreSQL-backed outbox store.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Creates a new PostgreSQL outbox store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_entry(row: PgRow) -> Result<OutboxEntry> {
        let headers_json: serde_json::Value = row.try_get("headers")?;
        let headers: BTreeMap<String, String> = serde_json::from_value(headers_json)?;
        let status: String = row.try_get("status")?;

        Ok(OutboxEntry {
            id: OutboxEntryId::from_uuid(row.try_get::<Uuid, _>("id")?),
            sequence: row.try_get("sequence")?,
            aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            headers,
            status: OutboxStatus::parse(&status)
                .ok_or_else(|| OutboxError::Storage(format!("unknown outbox status {status}")))?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            lease_owner: row.try_get("lease_owner")?,
            lease_until: row.try_get("lease_until")?,
            created_at: row.try_get("created_at")?,
            sent_at: row.try_get("sent_at")?,
        })
    }

    fn row_to_record(row: PgRow) -> Result<DomainRecord> {
        Ok(DomainRecord {
            aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            version: row.try_get("version")?,
            state: row.try_get("state")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn uuids(ids: &[OutboxEntryId]) -> Vec<Uuid> {
        ids.iter().map(OutboxEntryId::as_uuid).collect()
    }
}

/// Unit of work over a PostgreSQL transaction.
///
/// Dropping it without committing rolls the transaction back.
pub struct PostgresUnitOfWork {
    tx: Transaction<'static, Postgres>,
    appended: u64,
}

#[async_trait]
impl UnitOfWork for PostgresUnitOfWork {
    async fn save_record(&mut self, record: DomainRecord) -> Result<()> {
        let expected = record.expected_stored_version();

        let affected = if expected == 0 {
            sqlx::query(
                r#"
                INSERT INTO domain_records (aggregate_id, aggregate_type, version, state, updated_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (aggregate_id) DO NOTHING
                "#,
            )
            .bind(record.aggregate_id.as_uuid())
            .bind(&record.aggregate_type)
            .bind(record.version)
            .bind(&record.state)
            .bind(record.updated_at)
            .execute(&mut *self.tx)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                r#"
                UPDATE domain_records
                SET version = $3, state = $4, updated_at = $5
                WHERE aggregate_id = $1 AND version = $2
                "#,
            )
            .bind(record.aggregate_id.as_uuid())
            .bind(expected)
            .bind(record.version)
            .bind(&record.state)
            .bind(record.updated_at)
            .execute(&mut *self.tx)
            .await?
            .rows_affected()
        };

        if affected == 0 {
            let actual: Option<i64> =
                sqlx::query_scalar("SELECT version FROM domain_records WHERE aggregate_id = $1")
                    .bind(record.aggregate_id.as_uuid())
                    .fetch_optional(&mut *self.tx)
                    .await?;
            return Err(OutboxError::VersionConflict {
                aggregate_id: record.aggregate_id,
                expected,
                actual: actual.unwrap_or(0),
            });
        }
        Ok(())
    }

    async fn append(&mut self, entry: NewOutboxEntry) -> Result<OutboxEntryId> {
        let headers = serde_json::to_value(&entry.headers)?;
        sqlx::query(
            r#"
            INSERT INTO outbox_entries (id, aggregate_id, aggregate_type, event_type, payload, headers, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'PENDING', $7)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.aggregate_id.as_uuid())
        .bind(&entry.aggregate_type)
        .bind(&entry.event_type)
        .bind(&entry.payload)
        .bind(headers)
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await?;

        self.appended += 1;
        Ok(entry.id)
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        metrics::counter!("outbox_entries_appended_total").increment(self.appended);
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    type UnitOfWork = PostgresUnitOfWork;

    async fn begin(&self) -> Result<PostgresUnitOfWork> {
        Ok(PostgresUnitOfWork {
            tx: self.pool.begin().await?,
            appended: 0,
        })
    }

    async fn load_record(&self, aggregate_id: AggregateId) -> Result<Option<DomainRecord>> {
        let row = sqlx::query(
            r#"
            SELECT aggregate_id, aggregate_type, version, state, updated_at
            FROM domain_records
            WHERE aggregate_id = $1
            "#,
        )
        .bind(aggregate_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }

    async fn claim_pending(
        &self,
        owner: &str,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxEntry>> {
        let mut tx = self.pool.begin().await?;

        // Held until commit; concurrent passes see each other's leases.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(CLAIM_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let sql = format!(
            r#"
            WITH candidates AS (
                SELECT e.sequence AS claim_sequence
                FROM outbox_entries e
                WHERE e.status = 'PENDING'
                  AND (e.lease_until IS NULL OR e.lease_until <= NOW())
                  AND NOT EXISTS (
                      SELECT 1 FROM outbox_entries o
                      WHERE o.aggregate_id = e.aggregate_id
                        AND o.status = 'PENDING'
                        AND o.lease_until > NOW()
                        AND (o.created_at, o.sequence) < (e.created_at, e.sequence)
                  )
                ORDER BY e.created_at, e.sequence
                LIMIT $1
                FOR UPDATE OF e SKIP LOCKED
            )
            UPDATE outbox_entries
            SET lease_owner = $2,
                lease_until = NOW() + make_interval(secs => $3)
            FROM candidates
            WHERE outbox_entries.sequence = candidates.claim_sequence
            RETURNING {ENTRY_COLUMNS}
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
            .bind(owner)
            .bind(lease.as_secs_f64())
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;

        let mut entries = rows
            .into_iter()
            .map(Self::row_to_entry)
            .collect::<Result<Vec<_>>>()?;
        entries.sort_by_key(OutboxEntry::order_key);
        Ok(entries)
    }

    async fn mark_sent(&self, owner: &str, ids: &[OutboxEntryId]) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_entries
            SET status = 'SENT', sent_at = NOW(), lease_owner = NULL, lease_until = NULL
            WHERE id = ANY($1) AND lease_owner = $2 AND status = 'PENDING'
            "#,
        )
        .bind(Self::uuids(ids))
        .bind(owner)
        .execute(&self.pool)
        .await?;

        let marked = result.rows_affected();
        if marked < ids.len() as u64 {
            tracing::warn!(
                owner,
                expected = ids.len(),
                marked,
                "lease lost before marking sent; entries will be republished"
            );
        }
        Ok(marked)
    }

    async fn record_failure(&self, owner: &str, id: OutboxEntryId, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_entries
            SET attempts = attempts + 1, last_error = $3, lease_owner = NULL, lease_until = NULL
            WHERE id = $1 AND lease_owner = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(owner)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release(&self, owner: &str, ids: &[OutboxEntryId]) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_entries
            SET lease_owner = NULL, lease_until = NULL
            WHERE id = ANY($1) AND lease_owner = $2
            "#,
        )
        .bind(Self::uuids(ids))
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_sent(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM outbox_entries WHERE status = 'SENT' AND sent_at < $1")
                .bind(older_than)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn pending_count(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM outbox_entries WHERE status = 'PENDING'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn entries_for_aggregate(&self, aggregate_id: AggregateId) -> Result<Vec<OutboxEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM outbox_entries WHERE aggregate_id = $1 \
             ORDER BY created_at, sequence"
        );
        let rows = sqlx::query(&sql)
            .bind(aggregate_id.as_uuid())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_entry).collect()
    }
}
