//! Saga orchestration with persisted state and compensating actions.
//!
//! A saga is an ordered list of [`SagaStep`]s registered as a
//! [`SagaDefinition`]. The [`SagaOrchestrator`] runs the steps one by one,
//! saving a [`SagaInstance`] after every transition. When a step fails, or an
//! abort is requested, the steps that already completed are compensated in
//! reverse order. Failed compensations are recorded and reported rather than
//! stopping the sweep.
//!
//! The [`order_fulfillment`] module provides a reference saga:
//! 1. Reserve inventory
//! 2. Process payment
//! 3. Create shipment

pub mod definition;
pub mod error;
pub mod instance;
pub mod orchestrator;
pub mod order_fulfillment;
pub mod repository;
pub mod services;
pub mod state;
pub mod step;

pub use common::SagaId;
pub use definition::SagaDefinition;
pub use error::{Result, SagaError};
pub use instance::{CompensationFailure, SagaInstance, StepRecord};
pub use orchestrator::{ABORT_REASON, SagaOrchestrator, SagaReport};
pub use order_fulfillment::FulfillmentRequest;
pub use repository::{InMemorySagaRepository, PostgresSagaRepository, SagaRepository};
pub use services::{
    InMemoryInventoryService, InMemoryPaymentService, InMemoryShippingService, InventoryService,
    PaymentResult, PaymentService, ReservationItem, ReservationResult, ServiceError,
    ShipmentResult, ShippingService,
};
pub use state::{SagaState, StepStatus};
pub use step::{SagaContext, SagaStep, StepError};
