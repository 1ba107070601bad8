//! The check → execute → commit protocol around a request handler.

use std::future::Future;

use thiserror::Error;

use crate::{
    CheckOutcome, CommitOutcome, IdempotencyError, IdempotencyKey, IdempotencyStore,
    RequestFingerprint, StoredResponse,
};

/// A response produced or replayed by [`IdempotentHandler::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandledResponse {
    pub response: StoredResponse,
    /// True when the response came from the store rather than this execution.
    pub replayed: bool,
}

/// Error returned by [`IdempotentHandler::run`].
#[derive(Debug, Error)]
pub enum HandlerError<E> {
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),

    #[error("{0}")]
    Operation(E),
}

/// Wraps operations so repeated submissions with the same key produce one
/// effect and one observed response.
#[derive(Debug, Clone)]
pub struct IdempotentHandler<S> {
    store: S,
}

impl<S: IdempotencyStore> IdempotentHandler<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs `operation` at most once per key.
    ///
    /// Without a key the operation simply runs; no deduplication is attempted.
    /// Only successful operations are committed, so a failed request can be
    /// retried with the same key.
    #[tracing::instrument(skip_all, fields(key = key.map(|k| k.as_str())))]
    pub async fn run<F, Fut, E>(
        &self,
        key: Option<&IdempotencyKey>,
        fingerprint: &RequestFingerprint,
        operation: F,
    ) -> Result<HandledResponse, HandlerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<StoredResponse, E>>,
    {
        let Some(key) = key else {
            let response = operation().await.map_err(HandlerError::Operation)?;
            return Ok(HandledResponse {
                response,
                replayed: false,
            });
        };

        if let CheckOutcome::Hit(record) = self.store.check(key, fingerprint).await? {
            tracing::info!(status = record.response.status, "replaying stored response");
            return Ok(HandledResponse {
                response: record.response,
                replayed: true,
            });
        }

        let response = operation().await.map_err(HandlerError::Operation)?;

        match self.store.commit(key, fingerprint, response).await? {
            CommitOutcome::Committed(record) => Ok(HandledResponse {
                response: record.response,
                replayed: false,
            }),
            CommitOutcome::AlreadyCommitted(record) => {
                tracing::info!("concurrent retry committed first, serving its response");
                Ok(HandledResponse {
                    response: record.response,
                    replayed: true,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::InMemoryIdempotencyStore;

    fn handler() -> IdempotentHandler<InMemoryIdempotencyStore> {
        IdempotentHandler::new(InMemoryIdempotencyStore::new())
    }

    #[tokio::test]
    async fn duplicate_key_replays_first_response() {
        let handler = handler();
        let key = IdempotencyKey::new("abc").unwrap();
        let fp = RequestFingerprint::of("POST", "/orders", b"{}");
        let executions = AtomicU32::new(0);

        let run = || async {
            let n = executions.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(StoredResponse::new(201, format!("order-{n}").into_bytes()))
        };

        let first = handler.run(Some(&key), &fp, run).await.unwrap();
        let second = handler.run(Some(&key), &fp, run).await.unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.response, second.response);
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_key_runs_every_time() {
        let handler = handler();
        let fp = RequestFingerprint::new("fp");
        let executions = AtomicU32::new(0);

        for _ in 0..3 {
            handler
                .run(None, &fp, || async {
                    executions.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(StoredResponse::new(200, Vec::new()))
                })
                .await
                .unwrap();
        }

        assert_eq!(executions.load(Ordering::SeqCst), 3);
        assert_eq!(handler.store().record_count().await, 0);
    }

    #[tokio::test]
    async fn failed_operation_is_not_cached() {
        let handler = handler();
        let key = IdempotencyKey::new("retry-me").unwrap();
        let fp = RequestFingerprint::new("fp");

        let failed = handler
            .run(Some(&key), &fp, || async { Err::<StoredResponse, _>("boom") })
            .await;
        assert!(matches!(failed, Err(HandlerError::Operation("boom"))));

        let ok = handler
            .run(Some(&key), &fp, || async {
                Ok::<_, &str>(StoredResponse::new(200, b"ok".to_vec()))
            })
            .await
            .unwrap();
        assert!(!ok.replayed);
    }

    #[tokio::test]
    async fn reused_key_with_new_content_is_rejected() {
        let handler = handler();
        let key = IdempotencyKey::new("abc").unwrap();
        handler
            .run(Some(&key), &RequestFingerprint::new("a"), || async {
                Ok::<_, String>(StoredResponse::new(201, Vec::new()))
            })
            .await
            .unwrap();

        let result = handler
            .run(Some(&key), &RequestFingerprint::new("b"), || async {
                Ok::<_, String>(StoredResponse::new(201, Vec::new()))
            })
            .await;

        assert!(matches!(
            result,
            Err(HandlerError::Idempotency(IdempotencyError::KeyConflict { .. }))
        ));
    }
}
