//! Order records written together with their outbox events.

use common::{AggregateId, SagaId};
use outbox::{DomainRecord, NewOutboxEntry, OutboxStore, UnitOfWork};
use saga::{FulfillmentRequest, ReservationItem, SagaReport};
use serde::{Deserialize, Serialize};

pub const AGGREGATE_TYPE: &str = "Order";

pub const EVENT_ORDER_CREATED: &str = "OrderCreated";
pub const EVENT_FULFILLMENT_STARTED: &str = "OrderFulfillmentStarted";
pub const EVENT_ORDER_FULFILLED: &str = "OrderFulfilled";
pub const EVENT_ORDER_CANCELLED: &str = "OrderCancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Created,
    Fulfilling,
    Fulfilled,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub sku: String,
    pub quantity: u32,
    pub unit_price_cents: u64,
}

/// The order state stored in the domain record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub customer_id: String,
    pub items: Vec<OrderItem>,
    pub status: OrderStatus,
    pub saga_id: Option<SagaId>,
    pub tracking_number: Option<String>,
}

impl Order {
    pub fn new(customer_id: impl Into<String>, items: Vec<OrderItem>) -> Self {
        Self {
            customer_id: customer_id.into(),
            items,
            status: OrderStatus::Created,
            saga_id: None,
            tracking_number: None,
        }
    }

    /// The order total, or `None` if it does not fit in a `u64`.
    pub fn checked_total_cents(&self) -> Option<u64> {
        self.items.iter().try_fold(0u64, |total, item| {
            item.unit_price_cents
                .checked_mul(u64::from(item.quantity))
                .and_then(|line| total.checked_add(line))
        })
    }

    /// The order total. Saturates instead of wrapping; orders accepted over
    /// HTTP are checked with [`Order::checked_total_cents`] first.
    pub fn total_cents(&self) -> u64 {
        self.checked_total_cents().unwrap_or(u64::MAX)
    }

    /// The input of the fulfillment saga for this order.
    pub fn fulfillment_request(&self, order_id: AggregateId) -> FulfillmentRequest {
        FulfillmentRequest {
            order_id,
            customer_id: self.customer_id.clone(),
            amount_cents: self.total_cents(),
            items: self
                .items
                .iter()
                .map(|i| ReservationItem {
                    sku: i.sku.clone(),
                    quantity: i.quantity,
                })
                .collect(),
        }
    }
}

/// Loads and mutates orders. Every mutation appends exactly one outbox
/// entry in the same unit of work as the record write.
#[derive(Clone)]
pub struct OrderService<O> {
    store: O,
}

impl<O: OutboxStore> OrderService<O> {
    pub fn new(store: O) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &O {
        &self.store
    }

    /// Creates a new order and its `OrderCreated` event.
    #[tracing::instrument(skip(self, order), fields(customer_id = %order.customer_id))]
    pub async fn create(&self, order: Order) -> outbox::Result<(AggregateId, DomainRecord)> {
        let order_id = AggregateId::new();
        let record = DomainRecord::new(order_id, AGGREGATE_TYPE, serde_json::to_value(&order)?);
        let payload = serde_json::json!({
            "order_id": order_id,
            "customer_id": order.customer_id,
            "items": order.items,
            "total_cents": order.total_cents(),
        });

        self.write(record.clone(), EVENT_ORDER_CREATED, payload)
            .await?;
        tracing::info!(%order_id, "order created");
        Ok((order_id, record))
    }

    pub async fn get(&self, order_id: AggregateId) -> outbox::Result<Option<(DomainRecord, Order)>> {
        let Some(record) = self.store.load_record(order_id).await? else {
            return Ok(None);
        };
        let order = record.state_as()?;
        Ok(Some((record, order)))
    }

    /// Moves a created order to fulfilling. A concurrent transition of the
    /// same order fails with a version conflict.
    pub async fn start_fulfillment(
        &self,
        record: &DomainRecord,
        mut order: Order,
    ) -> outbox::Result<(DomainRecord, Order)> {
        order.status = OrderStatus::Fulfilling;
        let next = record.next(serde_json::to_value(&order)?);
        let payload = serde_json::json!({ "order_id": record.aggregate_id });

        self.write(next.clone(), EVENT_FULFILLMENT_STARTED, payload)
            .await?;
        Ok((next, order))
    }

    /// Records the outcome of the fulfillment saga.
    pub async fn finish_fulfillment(
        &self,
        record: &DomainRecord,
        mut order: Order,
        report: &SagaReport,
        tracking_number: Option<String>,
    ) -> outbox::Result<Order> {
        order.saga_id = Some(report.saga_id);
        let (event_type, payload) = if report.is_completed() {
            order.status = OrderStatus::Fulfilled;
            order.tracking_number = tracking_number;
            (
                EVENT_ORDER_FULFILLED,
                serde_json::json!({
                    "order_id": record.aggregate_id,
                    "saga_id": report.saga_id,
                    "tracking_number": order.tracking_number,
                }),
            )
        } else {
            order.status = OrderStatus::Cancelled;
            (
                EVENT_ORDER_CANCELLED,
                serde_json::json!({
                    "order_id": record.aggregate_id,
                    "saga_id": report.saga_id,
                    "reason": report.failure_reason,
                }),
            )
        };

        let next = record.next(serde_json::to_value(&order)?);
        self.write(next, event_type, payload).await?;
        tracing::info!(order_id = %record.aggregate_id, status = ?order.status, "order fulfillment finished");
        Ok(order)
    }

    async fn write(
        &self,
        record: DomainRecord,
        event_type: &str,
        payload: serde_json::Value,
    ) -> outbox::Result<()> {
        let entry = NewOutboxEntry::new(record.aggregate_id, AGGREGATE_TYPE, event_type, payload);
        let mut uow = self.store.begin().await?;
        uow.save_record(record).await?;
        uow.append(entry).await?;
        uow.commit().await
    }
}
