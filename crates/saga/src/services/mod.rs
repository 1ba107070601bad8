//! External services called by the order fulfillment saga, with in-memory
//! doubles.
//!
//! The doubles are idempotent per order: repeating a forward call for the
//! same order returns the original result, and undoing something already
//! undone succeeds. A resumed saga may replay either action.

pub mod inventory;
pub mod payment;
pub mod shipping;

use std::sync::{Mutex, MutexGuard, PoisonError};

use resilience::Classify;
use thiserror::Error;

pub use inventory::{
    InMemoryInventoryService, InventoryService, ReservationItem, ReservationResult,
};
pub use payment::{InMemoryPaymentService, PaymentResult, PaymentService};
pub use shipping::{InMemoryShippingService, ShipmentResult, ShippingService};

/// Errors returned by the fulfillment services.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The service could not be reached; the call may succeed later.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The service refused the request.
    #[error("request declined: {0}")]
    Declined(String),
}

impl Classify for ServiceError {
    fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Unavailable(_))
    }
}

/// Locks a double's state. A panic in another test thread must not hide the
/// state from the assertions that follow.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
