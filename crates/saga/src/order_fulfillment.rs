//! Reference saga: reserve inventory, charge payment, create shipment.
//!
//! Each step calls its service through a [`PolicyExecutor`] guarded by a
//! breaker named after the service, so an unavailable service is retried and
//! eventually fails fast instead of tying up every saga.

use async_trait::async_trait;
use common::AggregateId;
use resilience::{CircuitBreakerRegistry, Failure, PolicyExecutor, ResiliencePolicy};
use serde::{Deserialize, Serialize};

use crate::definition::SagaDefinition;
use crate::services::{
    InventoryService, PaymentService, ReservationItem, ServiceError, ShippingService,
};
use crate::step::{SagaContext, SagaStep, StepError};

/// The saga type identifier for order fulfillment.
pub const SAGA_TYPE: &str = "OrderFulfillment";

/// Step name: Reserve inventory for the order.
pub const STEP_RESERVE_INVENTORY: &str = "reserve_inventory";

/// Step name: Process payment for the order.
pub const STEP_PROCESS_PAYMENT: &str = "process_payment";

/// Step name: Create shipment for the order.
pub const STEP_CREATE_SHIPMENT: &str = "create_shipment";

pub const CONTEXT_REQUEST: &str = "request";
pub const CONTEXT_RESERVATION_ID: &str = "reservation_id";
pub const CONTEXT_PAYMENT_ID: &str = "payment_id";
pub const CONTEXT_TRACKING_NUMBER: &str = "tracking_number";

/// Input of an order fulfillment saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentRequest {
    pub order_id: AggregateId,
    pub customer_id: String,
    pub amount_cents: u64,
    pub items: Vec<ReservationItem>,
}

impl FulfillmentRequest {
    /// Builds the initial saga context for this request.
    pub fn into_context(self) -> Result<SagaContext, StepError> {
        SagaContext::new().with(CONTEXT_REQUEST, &self)
    }
}

fn step_error(failure: Failure<ServiceError>) -> StepError {
    StepError::new(failure.to_string())
}

pub struct ReserveInventoryStep<I> {
    inventory: I,
    executor: PolicyExecutor,
}

impl<I: InventoryService> ReserveInventoryStep<I> {
    pub fn new(inventory: I, executor: PolicyExecutor) -> Self {
        Self {
            inventory,
            executor,
        }
    }
}

#[async_trait]
impl<I: InventoryService> SagaStep for ReserveInventoryStep<I> {
    fn name(&self) -> &str {
        STEP_RESERVE_INVENTORY
    }

    async fn execute(&self, ctx: &mut SagaContext) -> Result<(), StepError> {
        let request: FulfillmentRequest = ctx.require(CONTEXT_REQUEST)?;
        let reservation = self
            .executor
            .execute(|| self.inventory.reserve(request.order_id, &request.items))
            .await
            .map_err(step_error)?;

        ctx.insert(CONTEXT_RESERVATION_ID, &reservation.reservation_id)
    }

    async fn compensate(&self, ctx: &SagaContext) -> Result<(), StepError> {
        let Some(reservation_id) = ctx.get::<String>(CONTEXT_RESERVATION_ID)? else {
            return Ok(());
        };
        self.executor
            .execute(|| self.inventory.release(&reservation_id))
            .await
            .map_err(step_error)
    }
}

pub struct ProcessPaymentStep<P> {
    payment: P,
    executor: PolicyExecutor,
}

impl<P: PaymentService> ProcessPaymentStep<P> {
    pub fn new(payment: P, executor: PolicyExecutor) -> Self {
        Self { payment, executor }
    }
}

#[async_trait]
impl<P: PaymentService> SagaStep for ProcessPaymentStep<P> {
    fn name(&self) -> &str {
        STEP_PROCESS_PAYMENT
    }

    async fn execute(&self, ctx: &mut SagaContext) -> Result<(), StepError> {
        let request: FulfillmentRequest = ctx.require(CONTEXT_REQUEST)?;
        let payment = self
            .executor
            .execute(|| {
                self.payment
                    .charge(request.order_id, &request.customer_id, request.amount_cents)
            })
            .await
            .map_err(step_error)?;

        ctx.insert(CONTEXT_PAYMENT_ID, &payment.payment_id)
    }

    async fn compensate(&self, ctx: &SagaContext) -> Result<(), StepError> {
        let Some(payment_id) = ctx.get::<String>(CONTEXT_PAYMENT_ID)? else {
            return Ok(());
        };
        self.executor
            .execute(|| self.payment.refund(&payment_id))
            .await
            .map_err(step_error)
    }
}

pub struct CreateShipmentStep<S> {
    shipping: S,
    executor: PolicyExecutor,
}

impl<S: ShippingService> CreateShipmentStep<S> {
    pub fn new(shipping: S, executor: PolicyExecutor) -> Self {
        Self { shipping, executor }
    }
}

#[async_trait]
impl<S: ShippingService> SagaStep for CreateShipmentStep<S> {
    fn name(&self) -> &str {
        STEP_CREATE_SHIPMENT
    }

    async fn execute(&self, ctx: &mut SagaContext) -> Result<(), StepError> {
        let request: FulfillmentRequest = ctx.require(CONTEXT_REQUEST)?;
        let shipment = self
            .executor
            .execute(|| self.shipping.create_shipment(request.order_id))
            .await
            .map_err(step_error)?;

        ctx.insert(CONTEXT_TRACKING_NUMBER, &shipment.tracking_number)
    }

    async fn compensate(&self, ctx: &SagaContext) -> Result<(), StepError> {
        let Some(tracking_number) = ctx.get::<String>(CONTEXT_TRACKING_NUMBER)? else {
            return Ok(());
        };
        self.executor
            .execute(|| self.shipping.cancel_shipment(&tracking_number))
            .await
            .map_err(step_error)
    }
}

/// Builds the order fulfillment definition.
///
/// Each service gets the registry's breaker named `inventory`, `payment` or
/// `shipping` and the given retry policy.
pub fn definition<I, P, S>(
    inventory: I,
    payment: P,
    shipping: S,
    registry: &CircuitBreakerRegistry,
    policy: ResiliencePolicy,
) -> SagaDefinition
where
    I: InventoryService + 'static,
    P: PaymentService + 'static,
    S: ShippingService + 'static,
{
    let executor = |name: &str| PolicyExecutor::from_registry(registry, name, policy.clone());

    SagaDefinition::new(SAGA_TYPE)
        .step(ReserveInventoryStep::new(inventory, executor("inventory")))
        .step(ProcessPaymentStep::new(payment, executor("payment")))
        .step(CreateShipmentStep::new(shipping, executor("shipping")))
}
