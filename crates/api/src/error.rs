//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use idempotency::{HandlerError, IdempotencyError};
use outbox::OutboxError;
use saga::SagaError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// The resource is not in a state that allows the request.
    Conflict(String),
    /// Idempotency key misuse or store failure.
    Idempotency(IdempotencyError),
    /// Domain record or outbox failure.
    Outbox(OutboxError),
    /// Saga orchestration failure.
    Saga(SagaError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Idempotency(err) => idempotency_error_to_response(err),
            ApiError::Outbox(err) => outbox_error_to_response(err),
            ApiError::Saga(err) => saga_error_to_response(err),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        if status.is_server_error() {
            tracing::error!(error = %message, "internal server error");
        }

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn idempotency_error_to_response(err: IdempotencyError) -> (StatusCode, String) {
    match &err {
        IdempotencyError::KeyConflict { .. } => (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
        IdempotencyError::InvalidKey(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn outbox_error_to_response(err: OutboxError) -> (StatusCode, String) {
    match &err {
        OutboxError::VersionConflict { .. } => (StatusCode::CONFLICT, err.to_string()),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    match &err {
        SagaError::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        SagaError::InvalidState { .. } | SagaError::ConcurrencyConflict { .. } => {
            (StatusCode::CONFLICT, err.to_string())
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

impl From<IdempotencyError> for ApiError {
    fn from(err: IdempotencyError) -> Self {
        ApiError::Idempotency(err)
    }
}

impl From<OutboxError> for ApiError {
    fn from(err: OutboxError) -> Self {
        ApiError::Outbox(err)
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

impl From<HandlerError<ApiError>> for ApiError {
    fn from(err: HandlerError<ApiError>) -> Self {
        match err {
            HandlerError::Idempotency(e) => ApiError::Idempotency(e),
            HandlerError::Operation(e) => e,
        }
    }
}
