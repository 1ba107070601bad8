//! Saga instance persistence.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use common::SagaId;
use sqlx::{PgPool, Row, postgres::PgRow};
use tokio::sync::RwLock;

use crate::error::{Result, SagaError};
use crate::instance::SagaInstance;
use crate::state::SagaState;

/// Durable storage for saga instances with optimistic concurrency.
#[async_trait]
pub trait SagaRepository: Send + Sync {
    /// Persists the instance if the stored version still equals
    /// `instance.version` (0 for a new instance), then bumps
    /// `instance.version`.
    ///
    /// Fails with [`SagaError::ConcurrencyConflict`] otherwise.
    async fn save(&self, instance: &mut SagaInstance) -> Result<()>;

    async fn get(&self, id: SagaId) -> Result<Option<SagaInstance>>;

    /// Non-terminal instances, oldest first.
    async fn list_active(&self) -> Result<Vec<SagaInstance>>;

    /// Failed instances with at least one failed compensation.
    async fn list_needing_reconciliation(&self) -> Result<Vec<SagaInstance>>;

    /// Marks an instance for abortion. Returns false if it already finished.
    ///
    /// The mark is stored beside the instance and does not change its version.
    async fn request_abort(&self, id: SagaId) -> Result<bool>;

    async fn is_abort_requested(&self, id: SagaId) -> Result<bool>;
}

#[derive(Default)]
struct InMemoryState {
    instances: HashMap<SagaId, SagaInstance>,
    abort_requested: HashSet<SagaId>,
}

/// In-memory saga repository for tests and single-process deployments.
#[derive(Clone, Default)]
pub struct InMemorySagaRepository {
    state: Arc<RwLock<InMemoryState>>,
}

impl InMemorySagaRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.instances.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SagaRepository for InMemorySagaRepository {
    async fn save(&self, instance: &mut SagaInstance) -> Result<()> {
        let mut state = self.state.write().await;
        let actual = state
            .instances
            .get(&instance.id)
            .map(|stored| stored.version)
            .unwrap_or(0);

        if actual != instance.version {
            return Err(SagaError::ConcurrencyConflict {
                saga_id: instance.id,
                expected: instance.version,
                actual,
            });
        }

        instance.version += 1;
        state.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get(&self, id: SagaId) -> Result<Option<SagaInstance>> {
        Ok(self.state.read().await.instances.get(&id).cloned())
    }

    async fn list_active(&self) -> Result<Vec<SagaInstance>> {
        let state = self.state.read().await;
        let mut active: Vec<_> = state
            .instances
            .values()
            .filter(|s| !s.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|s| s.created_at);
        Ok(active)
    }

    async fn list_needing_reconciliation(&self) -> Result<Vec<SagaInstance>> {
        let state = self.state.read().await;
        let mut failed: Vec<_> = state
            .instances
            .values()
            .filter(|s| s.state == SagaState::Failed && s.needs_reconciliation())
            .cloned()
            .collect();
        failed.sort_by_key(|s| s.created_at);
        Ok(failed)
    }

    async fn request_abort(&self, id: SagaId) -> Result<bool> {
        let mut state = self.state.write().await;
        let terminal = match state.instances.get(&id) {
            Some(instance) => instance.is_terminal(),
            None => return Err(SagaError::NotFound(id)),
        };
        if terminal {
            return Ok(false);
        }
        state.abort_requested.insert(id);
        Ok(true)
    }

    async fn is_abort_requested(&self, id: SagaId) -> Result<bool> {
        Ok(self.state.read().await.abort_requested.contains(&id))
    }
}

/// PostgreSQL-backed saga repository.
///
/// The instance is stored as a JSONB snapshot; `state`, `version` and the
/// timestamps are mirrored into columns for querying.
#[derive(Clone)]
pub struct PostgresSagaRepository {
    pool: PgPool,
}

impl PostgresSagaRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_instance(row: PgRow) -> Result<SagaInstance> {
        let snapshot: serde_json::Value = row.try_get("instance")?;
        let mut instance: SagaInstance = serde_json::from_value(snapshot)?;
        instance.version = row.try_get("version")?;
        Ok(instance)
    }

    async fn current_version(&self, id: SagaId) -> Result<i64> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM saga_instances WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        Ok(version.unwrap_or(0))
    }
}

#[async_trait]
impl SagaRepository for PostgresSagaRepository {
    async fn save(&self, instance: &mut SagaInstance) -> Result<()> {
        let expected = instance.version;
        let mut snapshot = instance.clone();
        snapshot.version = expected + 1;
        let json = serde_json::to_value(&snapshot)?;

        let affected = if expected == 0 {
            sqlx::query(
                r#"
                INSERT INTO saga_instances
                    (id, saga_type, state, instance, version, created_at, updated_at, archived_at)
                VALUES ($1, $2, $3, $4, 1, $5, $6, $7)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(snapshot.id.as_uuid())
            .bind(&snapshot.saga_type)
            .bind(snapshot.state.as_str())
            .bind(json)
            .bind(snapshot.created_at)
            .bind(snapshot.updated_at)
            .bind(snapshot.archived_at)
            .execute(&self.pool)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                r#"
                UPDATE saga_instances
                SET state = $3, instance = $4, version = $2 + 1, updated_at = $5, archived_at = $6
                WHERE id = $1 AND version = $2
                "#,
            )
            .bind(snapshot.id.as_uuid())
            .bind(expected)
            .bind(snapshot.state.as_str())
            .bind(json)
            .bind(snapshot.updated_at)
            .bind(snapshot.archived_at)
            .execute(&self.pool)
            .await?
            .rows_affected()
        };

        if affected == 0 {
            return Err(SagaError::ConcurrencyConflict {
                saga_id: instance.id,
                expected,
                actual: self.current_version(instance.id).await?,
            });
        }

        instance.version = snapshot.version;
        Ok(())
    }

    async fn get(&self, id: SagaId) -> Result<Option<SagaInstance>> {
        let row = sqlx::query("SELECT instance, version FROM saga_instances WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_instance).transpose()
    }

    async fn list_active(&self) -> Result<Vec<SagaInstance>> {
        let rows = sqlx::query(
            r#"
            SELECT instance, version FROM saga_instances
            WHERE archived_at IS NULL
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_instance).collect()
    }

    async fn list_needing_reconciliation(&self) -> Result<Vec<SagaInstance>> {
        let rows = sqlx::query(
            r#"
            SELECT instance, version FROM saga_instances
            WHERE state = 'FAILED'
              AND jsonb_array_length(instance -> 'compensation_failures') > 0
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_instance).collect()
    }

    async fn request_abort(&self, id: SagaId) -> Result<bool> {
        let archived: Option<Option<chrono::DateTime<chrono::Utc>>> = sqlx::query_scalar(
            r#"
            UPDATE saga_instances
            SET abort_requested = (archived_at IS NULL)
            WHERE id = $1
            RETURNING archived_at
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        match archived {
            None => Err(SagaError::NotFound(id)),
            Some(archived_at) => Ok(archived_at.is_none()),
        }
    }

    async fn is_abort_requested(&self, id: SagaId) -> Result<bool> {
        let requested: Option<bool> =
            sqlx::query_scalar("SELECT abort_requested FROM saga_instances WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        Ok(requested.unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::SagaContext;

    fn instance() -> SagaInstance {
        SagaInstance::new("Test", ["a", "b"], SagaContext::new())
    }

    #[tokio::test]
    async fn test_save_bumps_version() {
        let repo = InMemorySagaRepository::new();
        let mut saga = instance();

        repo.save(&mut saga).await.unwrap();
        assert_eq!(saga.version, 1);

        saga.mark_done(0);
        repo.save(&mut saga).await.unwrap();
        assert_eq!(saga.version, 2);

        let stored = repo.get(saga.id).await.unwrap().unwrap();
        assert_eq!(stored, saga);
    }

    #[tokio::test]
    async fn test_stale_save_conflicts() {
        let repo = InMemorySagaRepository::new();
        let mut saga = instance();
        repo.save(&mut saga).await.unwrap();

        let mut stale = saga.clone();
        saga.mark_done(0);
        repo.save(&mut saga).await.unwrap();

        stale.mark_done(1);
        let err = repo.save(&mut stale).await.unwrap_err();
        assert!(matches!(
            err,
            SagaError::ConcurrencyConflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_insert_conflicts() {
        let repo = InMemorySagaRepository::new();
        let mut saga = instance();
        let mut copy = saga.clone();

        repo.save(&mut saga).await.unwrap();
        assert!(repo.save(&mut copy).await.is_err());
    }

    #[tokio::test]
    async fn test_list_active_excludes_terminal() {
        let repo = InMemorySagaRepository::new();
        let mut running = instance();
        let mut done = instance();
        done.complete();

        repo.save(&mut running).await.unwrap();
        repo.save(&mut done).await.unwrap();

        let active = repo.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, running.id);
    }

    #[tokio::test]
    async fn test_abort_flag_does_not_change_version() {
        let repo = InMemorySagaRepository::new();
        let mut saga = instance();
        repo.save(&mut saga).await.unwrap();

        assert!(!repo.is_abort_requested(saga.id).await.unwrap());
        assert!(repo.request_abort(saga.id).await.unwrap());
        assert!(repo.is_abort_requested(saga.id).await.unwrap());
        assert_eq!(repo.get(saga.id).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_abort_of_finished_or_unknown_saga() {
        let repo = InMemorySagaRepository::new();
        let mut saga = instance();
        saga.complete();
        repo.save(&mut saga).await.unwrap();

        assert!(!repo.request_abort(saga.id).await.unwrap());
        assert!(matches!(
            repo.request_abort(SagaId::new()).await,
            Err(SagaError::NotFound(_))
        ));
    }
}
