//! Payment service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::AggregateId;

use super::{ServiceError, lock};

/// Result of a successful payment charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentResult {
    /// The payment ID assigned by the payment service.
    pub payment_id: String,
}

/// Trait for payment processing operations.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Charges a customer for an order. Repeated calls for the same order
    /// return the existing payment.
    async fn charge(
        &self,
        order_id: AggregateId,
        customer_id: &str,
        amount_cents: u64,
    ) -> Result<PaymentResult, ServiceError>;

    /// Refunds a payment. Refunding twice succeeds.
    async fn refund(&self, payment_id: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Clone)]
struct Payment {
    order_id: AggregateId,
    amount_cents: u64,
    refunded: bool,
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    payments: HashMap<String, Payment>,
    next_id: u32,
    fail_on_charge: bool,
    fail_on_refund: bool,
    unavailable_calls: u32,
}

/// In-memory payment service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<Mutex<InMemoryPaymentState>>,
}

impl InMemoryPaymentService {
    /// Creates a new in-memory payment service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declines every charge while set.
    pub fn set_fail_on_charge(&self, fail: bool) {
        lock(&self.state).fail_on_charge = fail;
    }

    /// Fails every refund while set.
    pub fn set_fail_on_refund(&self, fail: bool) {
        lock(&self.state).fail_on_refund = fail;
    }

    /// Makes the next `calls` requests fail as unavailable.
    pub fn set_unavailable_for(&self, calls: u32) {
        lock(&self.state).unavailable_calls = calls;
    }

    /// Returns the number of payments that have not been refunded.
    pub fn payment_count(&self) -> usize {
        lock(&self.state)
            .payments
            .values()
            .filter(|p| !p.refunded)
            .count()
    }

    /// Returns true if an unrefunded payment exists with the given ID.
    pub fn has_payment(&self, payment_id: &str) -> bool {
        lock(&self.state)
            .payments
            .get(payment_id)
            .is_some_and(|p| !p.refunded)
    }

    /// Total charged and not refunded.
    pub fn captured_cents(&self) -> u64 {
        lock(&self.state)
            .payments
            .values()
            .filter(|p| !p.refunded)
            .map(|p| p.amount_cents)
            .sum()
    }
}

#[async_trait]
impl PaymentService for InMemoryPaymentService {
    async fn charge(
        &self,
        order_id: AggregateId,
        customer_id: &str,
        amount_cents: u64,
    ) -> Result<PaymentResult, ServiceError> {
        let mut state = lock(&self.state);
        if state.unavailable_calls > 0 {
            state.unavailable_calls -= 1;
            return Err(ServiceError::Unavailable("payment".to_string()));
        }

        if state.fail_on_charge {
            return Err(ServiceError::Declined(format!(
                "Payment declined for customer {customer_id}"
            )));
        }

        if let Some((id, _)) = state
            .payments
            .iter()
            .find(|(_, p)| p.order_id == order_id && !p.refunded)
        {
            return Ok(PaymentResult {
                payment_id: id.clone(),
            });
        }

        state.next_id += 1;
        let payment_id = format!("PAY-{:04}", state.next_id);
        state.payments.insert(
            payment_id.clone(),
            Payment {
                order_id,
                amount_cents,
                refunded: false,
            },
        );

        Ok(PaymentResult { payment_id })
    }

    async fn refund(&self, payment_id: &str) -> Result<(), ServiceError> {
        let mut state = lock(&self.state);
        if state.unavailable_calls > 0 {
            state.unavailable_calls -= 1;
            return Err(ServiceError::Unavailable("payment".to_string()));
        }

        if state.fail_on_refund {
            return Err(ServiceError::Declined(format!(
                "refund of {payment_id} rejected"
            )));
        }
        if let Some(payment) = state.payments.get_mut(payment_id) {
            payment.refunded = true;
        }
        Ok(())
    }
}
