//! Shared types used across the consistency runtime crates.

pub mod ids;

pub use ids::{AggregateId, IdParseError, OutboxEntryId, SagaId};
