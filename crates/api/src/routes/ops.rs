//! Operational status endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use outbox::OutboxStore;
use resilience::CircuitBreakerState;
use serde::Serialize;

use crate::error::ApiError;
use crate::{AppState, Backend};

#[derive(Serialize)]
pub struct OutboxStatusResponse {
    pub pending: u64,
}

/// GET /outbox/status: number of entries the relay has not delivered yet.
pub async fn outbox_status<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
) -> Result<Json<OutboxStatusResponse>, ApiError> {
    let pending = state.orders.store().pending_count().await?;
    Ok(Json(OutboxStatusResponse { pending }))
}

/// GET /circuit-breakers: snapshot of every named breaker.
pub async fn circuit_breakers<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
) -> Json<Vec<CircuitBreakerState>> {
    Json(state.breakers.snapshots())
}
