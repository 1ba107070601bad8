use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AggregateId, OutboxEntryId};

/// Delivery status of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Sent,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Sent => "SENT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OutboxStatus::Pending),
            "SENT" => Some(OutboxStatus::Sent),
            _ => None,
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An event to append inside a unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOutboxEntry {
    pub id: OutboxEntryId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub headers: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl NewOutboxEntry {
    /// Creates an entry with a fresh id, stamped with the current time.
    pub fn new(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: OutboxEntryId::new(),
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
            payload,
            headers: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Creates an entry whose payload is serialized from `payload`.
    pub fn from_payload<T: Serialize>(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            aggregate_id,
            aggregate_type,
            event_type,
            serde_json::to_value(payload)?,
        ))
    }

    /// Adds a header carried to the transport with the message.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// A stored outbox entry with its relay bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: OutboxEntryId,
    /// Store-assigned tie-breaker for entries sharing a `created_at`.
    pub sequence: i64,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub headers: BTreeMap<String, String>,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    pub(crate) fn from_new(entry: NewOutboxEntry, sequence: i64) -> Self {
        Self {
            id: entry.id,
            sequence,
            aggregate_id: entry.aggregate_id,
            aggregate_type: entry.aggregate_type,
            event_type: entry.event_type,
            payload: entry.payload,
            headers: entry.headers,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            lease_owner: None,
            lease_until: None,
            created_at: entry.created_at,
            sent_at: None,
        }
    }

    /// Delivery order key: creation time, then store sequence.
    pub fn order_key(&self) -> (DateTime<Utc>, i64) {
        (self.created_at, self.sequence)
    }

    /// Returns true if some relay pass holds an unexpired lease on the entry.
    pub fn is_leased_at(&self, now: DateTime<Utc>) -> bool {
        self.lease_until.is_some_and(|until| until > now)
    }

    /// Builds the message handed to the transport.
    pub fn to_message(&self) -> OutboxMessage {
        OutboxMessage {
            message_id: self.id,
            partition_key: self.aggregate_id.to_string(),
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.aggregate_id,
            event_type: self.event_type.clone(),
            payload: self.payload.clone(),
            headers: self.headers.clone(),
            created_at: self.created_at,
        }
    }
}

/// A message as published to the transport.
///
/// Delivery is at-least-once, so consumers deduplicate on `message_id` or on
/// [`OutboxMessage::dedup_key`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub message_id: OutboxEntryId,
    /// Messages sharing a partition key must be consumed in order.
    pub partition_key: String,
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub headers: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl OutboxMessage {
    /// `aggregateId:eventType:createdAt`, stable across re-publishes.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.aggregate_id,
            self.event_type,
            self.created_at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_round_trip() {
        for status in [OutboxStatus::Pending, OutboxStatus::Sent] {
            assert_eq!(OutboxStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OutboxStatus::parse("LOST"), None);
        assert_eq!(
            serde_json::to_string(&OutboxStatus::Pending).unwrap(),
            "\"PENDING\""
        );
    }

    #[test]
    fn message_is_partitioned_by_aggregate() {
        let aggregate_id = AggregateId::new();
        let entry = OutboxEntry::from_new(
            NewOutboxEntry::new(aggregate_id, "Order", "OrderPlaced", serde_json::json!({}))
                .with_header("trace_id", "t-1"),
            7,
        );

        let message = entry.to_message();
        assert_eq!(message.partition_key, aggregate_id.to_string());
        assert_eq!(message.message_id, entry.id);
        assert_eq!(message.headers.get("trace_id").map(String::as_str), Some("t-1"));
    }

    #[test]
    fn dedup_key_is_stable_for_same_entry() {
        let created_at = DateTime::parse_from_rfc3339("2024-05-01T10:00:00.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        let aggregate_id = AggregateId::new();
        let entry = OutboxEntry::from_new(
            NewOutboxEntry::new(aggregate_id, "Order", "OrderPlaced", serde_json::json!({}))
                .with_created_at(created_at),
            1,
        );

        let key = entry.to_message().dedup_key();
        assert_eq!(key, entry.to_message().dedup_key());
        assert_eq!(
            key,
            format!("{aggregate_id}:OrderPlaced:2024-05-01T10:00:00.123456Z")
        );
    }

    #[test]
    fn lease_expiry() {
        let mut entry = OutboxEntry::from_new(
            NewOutboxEntry::new(AggregateId::new(), "Order", "OrderPlaced", serde_json::json!({})),
            1,
        );
        let now = Utc::now();
        assert!(!entry.is_leased_at(now));

        entry.lease_until = Some(now + chrono::Duration::seconds(5));
        assert!(entry.is_leased_at(now));
        assert!(!entry.is_leased_at(now + chrono::Duration::seconds(6)));
    }
}
