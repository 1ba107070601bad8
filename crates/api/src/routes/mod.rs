//! HTTP route handlers.

pub mod health;
pub mod metrics;
pub mod ops;
pub mod orders;
pub mod sagas;

use axum::http::HeaderMap;
use common::{AggregateId, SagaId};
use idempotency::IdempotencyKey;

use crate::error::ApiError;

/// Header carrying the client's idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Header set on responses served from the idempotency store.
pub const IDEMPOTENT_REPLAYED_HEADER: &str = "idempotent-replayed";

/// Reads the optional idempotency key. An absent header disables
/// deduplication; a malformed one is rejected.
pub(crate) fn idempotency_key(headers: &HeaderMap) -> Result<Option<IdempotencyKey>, ApiError> {
    let Some(value) = headers.get(IDEMPOTENCY_KEY_HEADER) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| ApiError::BadRequest("Idempotency-Key must be visible ASCII".to_string()))?;
    Ok(Some(IdempotencyKey::new(value)?))
}

pub(crate) fn parse_order_id(id: &str) -> Result<AggregateId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid order id: {e}")))
}

pub(crate) fn parse_saga_id(id: &str) -> Result<SagaId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid saga id: {e}")))
}
