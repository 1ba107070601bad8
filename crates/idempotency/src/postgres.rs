use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::store::{check_existing, conflict};
use crate::{
    CheckOutcome, CommitOutcome, IdempotencyError, IdempotencyKey, IdempotencyRecord,
    IdempotencyStore, RequestFingerprint, Result, StoredResponse,
};

/// PostgreSQL-backed idempotency store.
///
/// The primary key on `idempotency_records.key` is the uniqueness constraint
/// that makes concurrent commits for one key resolve to a single winner.
#[derive(Clone)]
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    /// Creates a new PostgreSQL idempotency store.
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

    fn row_to_record(row: PgRow) -> Result<IdempotencyRecord> {
        let key: String = row.try_get("key")?;
        let status: i32 = row.try_get("status_code")?;

        Ok(IdempotencyRecord {
            key: IdempotencyKey::new(key)?,
            fingerprint: RequestFingerprint::new(row.try_get::<String, _>("fingerprint")?),
            response: StoredResponse {
                status: u16::try_from(status).map_err(|_| {
                    IdempotencyError::Database(sqlx::Error::Decode(
                        format!("status code out of range: {status}").into(),
                    ))
                })?,
                body: row.try_get("body")?,
            },
            stored_at: row.try_get::<DateTime<Utc>, _>("stored_at")?,
        })
    }

    async fn fetch(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT key, fingerprint, status_code, body, stored_at
            FROM idempotency_records
            WHERE key = $1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn check(
        &self,
        key: &IdempotencyKey,
        fingerprint: &RequestFingerprint,
    ) -> Result<CheckOutcome> {
        let existing = self.fetch(key).await?;
        check_existing(key, fingerprint, existing)
    }

    async fn commit(
        &self,
        key: &IdempotencyKey,
        fingerprint: &RequestFingerprint,
        response: StoredResponse,
    ) -> Result<CommitOutcome> {
        let stored_at = Utc::now();
        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_records (key, fingerprint, status_code, body, stored_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key.as_str())
        .bind(fingerprint.as_str())
        .bind(i32::from(response.status))
        .bind(&response.body)
        .bind(stored_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(CommitOutcome::Committed(IdempotencyRecord {
                key: key.clone(),
                fingerprint: fingerprint.clone(),
                response,
                stored_at,
            }));
        }

        // Lost the race; the winner's row is committed and visible now.
        let winner = self.fetch(key).await?.ok_or_else(|| {
            IdempotencyError::Database(sqlx::Error::RowNotFound)
        })?;
        if winner.matches(fingerprint) {
            tracing::debug!(key = %key, "commit lost to an earlier one");
            Ok(CommitOutcome::AlreadyCommitted(winner))
        } else {
            Err(conflict(key))
        }
    }

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        self.fetch(key).await
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM idempotency_records WHERE stored_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
