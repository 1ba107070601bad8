//! Transactional outbox.
//!
//! A domain record change and the event describing it are written in one
//! [`UnitOfWork`]: either both become visible or neither does. The
//! [`OutboxRelay`] later claims pending entries under a lease and publishes
//! them through a [`Transport`], guarded by a resilience policy. Delivery is
//! at-least-once; entries of one aggregate are published in creation order.

pub mod entry;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod relay;
pub mod store;
pub mod transport;

pub use common::{AggregateId, OutboxEntryId};
pub use entry::{NewOutboxEntry, OutboxEntry, OutboxMessage, OutboxStatus};
pub use error::{OutboxError, Result};
pub use memory::InMemoryOutboxStore;
pub use postgres::PostgresOutboxStore;
pub use record::DomainRecord;
pub use relay::{DeliveryMode, OutboxRelay, RelayConfig, RelayHandle, RelayReport};
pub use store::{OutboxStore, UnitOfWork};
pub use transport::{InMemoryTransport, Transport, TransportError};
