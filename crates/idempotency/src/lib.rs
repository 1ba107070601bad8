//! Idempotency store for client requests.
//!
//! A client attaches an idempotency key to a request. The first successful
//! processing stores the response under that key together with a fingerprint
//! of the request content. Retries with the same key and fingerprint are
//! served the stored response verbatim; a retry whose fingerprint differs is a
//! [`IdempotencyError::KeyConflict`].

pub mod error;
pub mod handler;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod store;

pub use error::{IdempotencyError, Result};
pub use handler::{HandledResponse, HandlerError, IdempotentHandler};
pub use memory::InMemoryIdempotencyStore;
pub use postgres::PostgresIdempotencyStore;
pub use record::{IdempotencyKey, IdempotencyRecord, RequestFingerprint, StoredResponse};
pub use store::{CheckOutcome, CommitOutcome, IdempotencyStore};
