//! Shipping service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::AggregateId;

use super::{ServiceError, lock};

/// Result of a successful shipment creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipmentResult {
    /// The tracking number assigned by the shipping service.
    pub tracking_number: String,
}

/// Trait for shipping operations.
#[async_trait]
pub trait ShippingService: Send + Sync {
    /// Creates a shipment for an order, or returns the existing one.
    async fn create_shipment(&self, order_id: AggregateId) -> Result<ShipmentResult, ServiceError>;

    /// Cancels a shipment. Cancelling an unknown shipment succeeds.
    async fn cancel_shipment(&self, tracking_number: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryShippingState {
    shipments: HashMap<String, AggregateId>,
    next_id: u32,
    fail_on_create: bool,
    fail_on_cancel: bool,
}

/// In-memory shipping service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryShippingService {
    state: Arc<Mutex<InMemoryShippingState>>,
}

impl InMemoryShippingService {
    /// Creates a new in-memory shipping service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declines every create_shipment call while set.
    pub fn set_fail_on_create(&self, fail: bool) {
        lock(&self.state).fail_on_create = fail;
    }

    /// Fails every cancel_shipment call while set.
    pub fn set_fail_on_cancel(&self, fail: bool) {
        lock(&self.state).fail_on_cancel = fail;
    }

    /// Returns the number of active shipments.
    pub fn shipment_count(&self) -> usize {
        lock(&self.state).shipments.len()
    }

    /// Returns true if a shipment exists with the given tracking number.
    pub fn has_shipment(&self, tracking_number: &str) -> bool {
        lock(&self.state).shipments.contains_key(tracking_number)
    }
}

#[async_trait]
impl ShippingService for InMemoryShippingService {
    async fn create_shipment(&self, order_id: AggregateId) -> Result<ShipmentResult, ServiceError> {
        let mut state = lock(&self.state);

        if state.fail_on_create {
            return Err(ServiceError::Declined(
                "No carrier serves the destination".to_string(),
            ));
        }

        if let Some((tracking_number, _)) = state.shipments.iter().find(|(_, o)| **o == order_id) {
            return Ok(ShipmentResult {
                tracking_number: tracking_number.clone(),
            });
        }

        state.next_id += 1;
        let tracking_number = format!("TRACK-{:04}", state.next_id);
        state.shipments.insert(tracking_number.clone(), order_id);

        Ok(ShipmentResult { tracking_number })
    }

    async fn cancel_shipment(&self, tracking_number: &str) -> Result<(), ServiceError> {
        let mut state = lock(&self.state);
        if state.fail_on_cancel {
            return Err(ServiceError::Declined(format!(
                "shipment {tracking_number} already dispatched"
            )));
        }
        state.shipments.remove(tracking_number);
        Ok(())
    }
}
