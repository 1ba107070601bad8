//! Saga inspection and control endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use saga::{SagaInstance, SagaReport};
use serde::Serialize;

use super::parse_saga_id;
use crate::error::ApiError;
use crate::{AppState, Backend};

#[derive(Serialize)]
pub struct AbortResponse {
    pub saga_id: String,
    pub abort_requested: bool,
}

/// GET /sagas/:id: the persisted saga instance.
#[tracing::instrument(skip(state))]
pub async fn get<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    Path(id): Path<String>,
) -> Result<Json<SagaInstance>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    let saga = state
        .sagas
        .get(saga_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Saga {id} not found")))?;
    Ok(Json(saga))
}

/// POST /sagas/:id/abort: ask a running saga to compensate.
#[tracing::instrument(skip(state))]
pub async fn abort<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    Path(id): Path<String>,
) -> Result<Json<AbortResponse>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    let abort_requested = state.sagas.request_abort(saga_id).await?;
    Ok(Json(AbortResponse {
        saga_id: saga_id.to_string(),
        abort_requested,
    }))
}

/// POST /sagas/:id/resume: continue an unfinished saga.
#[tracing::instrument(skip(state))]
pub async fn resume<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    Path(id): Path<String>,
) -> Result<Json<SagaReport>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    Ok(Json(state.sagas.resume(saga_id).await?))
}

/// GET /sagas/reconciliation: failed sagas with compensations left undone.
pub async fn reconciliation<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
) -> Result<Json<Vec<SagaReport>>, ApiError> {
    Ok(Json(state.sagas.needing_reconciliation().await?))
}
