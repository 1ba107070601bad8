//! Inventory service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::AggregateId;
use serde::{Deserialize, Serialize};

use super::{ServiceError, lock};

/// Result of a successful inventory reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationResult {
    /// The reservation ID assigned by the inventory service.
    pub reservation_id: String,
}

/// An item to reserve in inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationItem {
    pub sku: String,
    pub quantity: u32,
}

/// Trait for inventory management operations.
#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Reserves stock for an order. Repeated calls for the same order return
    /// the existing reservation.
    async fn reserve(
        &self,
        order_id: AggregateId,
        items: &[ReservationItem],
    ) -> Result<ReservationResult, ServiceError>;

    /// Releases a reservation. Releasing an unknown reservation succeeds.
    async fn release(&self, reservation_id: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryInventoryState {
    reservations: HashMap<String, (AggregateId, Vec<ReservationItem>)>,
    by_order: HashMap<AggregateId, String>,
    next_id: u32,
    reserve_calls: u32,
    fail_on_reserve: bool,
    fail_on_release: bool,
    unavailable_calls: u32,
}

/// In-memory inventory service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<Mutex<InMemoryInventoryState>>,
}

impl InMemoryInventoryService {
    /// Creates a new in-memory inventory service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declines every reserve call while set.
    pub fn set_fail_on_reserve(&self, fail: bool) {
        lock(&self.state).fail_on_reserve = fail;
    }

    /// Fails every release call while set.
    pub fn set_fail_on_release(&self, fail: bool) {
        lock(&self.state).fail_on_release = fail;
    }

    /// Makes the next `calls` requests fail as unavailable.
    pub fn set_unavailable_for(&self, calls: u32) {
        lock(&self.state).unavailable_calls = calls;
    }

    /// Returns the number of active reservations.
    pub fn reservation_count(&self) -> usize {
        lock(&self.state).reservations.len()
    }

    /// Returns true if a reservation exists with the given ID.
    pub fn has_reservation(&self, reservation_id: &str) -> bool {
        lock(&self.state).reservations.contains_key(reservation_id)
    }

    /// Number of reserve calls that reached the service.
    pub fn reserve_calls(&self) -> u32 {
        lock(&self.state).reserve_calls
    }
}

fn take_unavailable(calls: &mut u32) -> Result<(), ServiceError> {
    if *calls > 0 {
        *calls -= 1;
        return Err(ServiceError::Unavailable("inventory".to_string()));
    }
    Ok(())
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn reserve(
        &self,
        order_id: AggregateId,
        items: &[ReservationItem],
    ) -> Result<ReservationResult, ServiceError> {
        let mut state = lock(&self.state);
        state.reserve_calls += 1;
        take_unavailable(&mut state.unavailable_calls)?;

        if state.fail_on_reserve {
            return Err(ServiceError::Declined("Insufficient stock".to_string()));
        }

        if let Some(existing) = state.by_order.get(&order_id)
            && state.reservations.contains_key(existing)
        {
            return Ok(ReservationResult {
                reservation_id: existing.clone(),
            });
        }

        state.next_id += 1;
        let reservation_id = format!("RES-{:04}", state.next_id);
        state
            .reservations
            .insert(reservation_id.clone(), (order_id, items.to_vec()));
        state.by_order.insert(order_id, reservation_id.clone());

        Ok(ReservationResult { reservation_id })
    }

    async fn release(&self, reservation_id: &str) -> Result<(), ServiceError> {
        let mut state = lock(&self.state);
        take_unavailable(&mut state.unavailable_calls)?;

        if state.fail_on_release {
            return Err(ServiceError::Declined(format!(
                "reservation {reservation_id} is locked"
            )));
        }
        state.reservations.remove(reservation_id);
        Ok(())
    }
}
