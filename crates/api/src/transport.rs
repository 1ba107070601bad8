//! Transport used by the API binary's relay.

use async_trait::async_trait;
use outbox::{OutboxMessage, Transport, TransportError};

/// Publishes outbox messages as structured log events.
///
/// Stands in for a broker client: every message is acknowledged once the
/// log line is written, keyed by its partition key.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn publish(&self, message: &OutboxMessage) -> Result<(), TransportError> {
        tracing::info!(
            message_id = %message.message_id,
            partition_key = %message.partition_key,
            event_type = %message.event_type,
            dedup_key = %message.dedup_key(),
            payload = %message.payload,
            "event published"
        );
        metrics::counter!("events_published_total", "event_type" => message.event_type.clone())
            .increment(1);
        Ok(())
    }
}
