use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use resilience::Classify;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::{AggregateId, OutboxMessage};

/// Errors reported by a message transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The broker could not be reached or did not acknowledge in time.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// The broker refused the message; resending it will not help.
    #[error("message rejected: {0}")]
    Rejected(String),
}

impl Classify for TransportError {
    fn is_transient(&self) -> bool {
        matches!(self, TransportError::Unavailable(_))
    }
}

/// The message broker as seen by the relay.
///
/// `publish` returns only after the broker acknowledged durable receipt.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publishes one message, keyed by its partition key.
    async fn publish(&self, message: &OutboxMessage) -> Result<(), TransportError>;

    /// Publishes messages as one unit.
    ///
    /// The default publishes sequentially and is not atomic; transports with
    /// a transactional producer override it.
    async fn publish_batch(&self, messages: &[OutboxMessage]) -> Result<(), TransportError> {
        for message in messages {
            self.publish(message).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn publish(&self, message: &OutboxMessage) -> Result<(), TransportError> {
        (**self).publish(message).await
    }

    async fn publish_batch(&self, messages: &[OutboxMessage]) -> Result<(), TransportError> {
        (**self).publish_batch(messages).await
    }
}

/// In-memory transport that records published messages.
///
/// Failures can be injected to exercise the relay's retry and ordering
/// behaviour. `publish_batch` is atomic.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    published: Arc<Mutex<Vec<OutboxMessage>>>,
    transient_failures: Arc<AtomicU32>,
    unavailable_aggregates: Arc<Mutex<HashSet<AggregateId>>>,
    rejected_event_types: Arc<Mutex<HashSet<String>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `n` publish calls with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Fails every publish for `aggregate_id` until [`heal`](Self::heal) is called.
    pub async fn make_unavailable_for(&self, aggregate_id: AggregateId) {
        self.unavailable_aggregates.lock().await.insert(aggregate_id);
    }

    /// Rejects every message of `event_type` with a non-transient error.
    pub async fn reject_event_type(&self, event_type: impl Into<String>) {
        self.rejected_event_types
            .lock()
            .await
            .insert(event_type.into());
    }

    /// Clears all injected failures.
    pub async fn heal(&self) {
        self.transient_failures.store(0, Ordering::SeqCst);
        self.unavailable_aggregates.lock().await.clear();
        self.rejected_event_types.lock().await.clear();
    }

    /// Returns every message published so far, in publish order.
    pub async fn published(&self) -> Vec<OutboxMessage> {
        self.published.lock().await.clone()
    }

    /// Returns the messages published for one aggregate, in publish order.
    pub async fn published_for(&self, aggregate_id: AggregateId) -> Vec<OutboxMessage> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|m| m.aggregate_id == aggregate_id)
            .cloned()
            .collect()
    }

    async fn check(&self, message: &OutboxMessage) -> Result<(), TransportError> {
        let injected = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(TransportError::Unavailable("injected failure".to_string()));
        }
        if self
            .unavailable_aggregates
            .lock()
            .await
            .contains(&message.aggregate_id)
        {
            return Err(TransportError::Unavailable(format!(
                "partition {} unavailable",
                message.partition_key
            )));
        }
        if self
            .rejected_event_types
            .lock()
            .await
            .contains(&message.event_type)
        {
            return Err(TransportError::Rejected(format!(
                "event type {} not accepted",
                message.event_type
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, message: &OutboxMessage) -> Result<(), TransportError> {
        self.check(message).await?;
        self.published.lock().await.push(message.clone());
        Ok(())
    }

    async fn publish_batch(&self, messages: &[OutboxMessage]) -> Result<(), TransportError> {
        for message in messages {
            self.check(message).await?;
        }
        self.published.lock().await.extend(messages.iter().cloned());
        Ok(())
    }
}
