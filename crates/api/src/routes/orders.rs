//! Order creation, lookup and fulfillment endpoints.
//!
//! Mutating endpoints honor the `Idempotency-Key` header: a retried request
//! with the same key and body replays the first response without repeating
//! its effects.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use common::AggregateId;
use idempotency::{HandledResponse, RequestFingerprint, StoredResponse};
use saga::SagaReport;
use saga::order_fulfillment::{CONTEXT_TRACKING_NUMBER, SAGA_TYPE};
use serde::{Deserialize, Serialize};

use super::{IDEMPOTENT_REPLAYED_HEADER, idempotency_key, parse_order_id};
use crate::error::ApiError;
use crate::order::{Order, OrderItem, OrderStatus};
use crate::{AppState, Backend};

// -- Request types --

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub customer_id: String,
    pub items: Vec<OrderItemRequest>,
}

#[derive(Debug, Deserialize)]
pub struct OrderItemRequest {
    pub sku: String,
    pub quantity: u32,
    pub unit_price_cents: u64,
}

// -- Response types --

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub id: String,
    pub customer_id: String,
    pub status: OrderStatus,
    pub items: Vec<OrderItem>,
    pub total_cents: u64,
    pub version: i64,
    pub saga_id: Option<String>,
    pub tracking_number: Option<String>,
}

impl OrderResponse {
    fn new(id: AggregateId, version: i64, order: Order) -> Self {
        Self {
            id: id.to_string(),
            total_cents: order.total_cents(),
            customer_id: order.customer_id,
            status: order.status,
            items: order.items,
            version,
            saga_id: order.saga_id.map(|s| s.to_string()),
            tracking_number: order.tracking_number,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FulfillResponse {
    pub order_id: String,
    pub status: OrderStatus,
    pub tracking_number: Option<String>,
    pub saga: SagaReport,
}

// -- Handlers --

/// POST /orders: create an order and its `OrderCreated` event.
#[tracing::instrument(skip_all)]
pub async fn create<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let key = idempotency_key(&headers)?;
    let fingerprint = RequestFingerprint::of("POST", "/orders", &body);

    let handled = state
        .idempotency
        .run(key.as_ref(), &fingerprint, || async {
            let req: CreateOrderRequest = serde_json::from_slice(&body)
                .map_err(|e| ApiError::BadRequest(format!("Invalid order: {e}")))?;
            let order = validate(req)?;

            let (order_id, record) = state.orders.create(order.clone()).await?;
            let response = OrderResponse::new(order_id, record.version, order);
            StoredResponse::json(StatusCode::CREATED.as_u16(), &response)
                .map_err(|e| ApiError::Internal(e.to_string()))
        })
        .await?;

    Ok(into_response(handled))
}

/// GET /orders/:id: the current state of an order.
#[tracing::instrument(skip(state))]
pub async fn get<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    Path(id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let (record, order) = state
        .orders
        .get(order_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Order {id} not found")))?;

    Ok(Json(OrderResponse::new(order_id, record.version, order)))
}

/// POST /orders/:id/fulfill: run the fulfillment saga for a created order.
///
/// The order moves to FULFILLING before the saga starts, so a concurrent
/// fulfill of the same order fails with 409 instead of running a second saga.
#[tracing::instrument(skip(state, headers))]
pub async fn fulfill<B: Backend>(
    State(state): State<Arc<AppState<B>>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let order_id = parse_order_id(&id)?;
    let key = idempotency_key(&headers)?;
    let fingerprint = RequestFingerprint::of("POST", &format!("/orders/{order_id}/fulfill"), b"");

    let handled = state
        .idempotency
        .run(key.as_ref(), &fingerprint, || async {
            let (record, order) = state
                .orders
                .get(order_id)
                .await?
                .ok_or_else(|| ApiError::NotFound(format!("Order {order_id} not found")))?;
            if order.status != OrderStatus::Created {
                return Err(ApiError::Conflict(format!(
                    "Order {order_id} cannot be fulfilled in status {:?}",
                    order.status
                )));
            }

            let request = order.fulfillment_request(order_id);
            let (record, order) = state.orders.start_fulfillment(&record, order).await?;

            let context = request
                .into_context()
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            let report = state.sagas.start(SAGA_TYPE, context).await?;

            let tracking_number = match state.sagas.get(report.saga_id).await? {
                Some(saga) => saga
                    .context
                    .get::<String>(CONTEXT_TRACKING_NUMBER)
                    .map_err(|e| ApiError::Internal(e.to_string()))?,
                None => None,
            };

            let order = state
                .orders
                .finish_fulfillment(&record, order, &report, tracking_number)
                .await?;

            let response = FulfillResponse {
                order_id: order_id.to_string(),
                status: order.status,
                tracking_number: order.tracking_number,
                saga: report,
            };
            StoredResponse::json(StatusCode::OK.as_u16(), &response)
                .map_err(|e| ApiError::Internal(e.to_string()))
        })
        .await?;

    Ok(into_response(handled))
}

fn validate(req: CreateOrderRequest) -> Result<Order, ApiError> {
    if req.customer_id.trim().is_empty() {
        return Err(ApiError::BadRequest("customer_id must not be empty".into()));
    }
    if req.items.is_empty() {
        return Err(ApiError::BadRequest("an order needs at least one item".into()));
    }
    if let Some(item) = req.items.iter().find(|i| i.quantity == 0) {
        return Err(ApiError::BadRequest(format!(
            "quantity of {} must be positive",
            item.sku
        )));
    }

    let items = req
        .items
        .into_iter()
        .map(|i| OrderItem {
            sku: i.sku,
            quantity: i.quantity,
            unit_price_cents: i.unit_price_cents,
        })
        .collect();
    let order = Order::new(req.customer_id, items);
    if order.checked_total_cents().is_none() {
        return Err(ApiError::BadRequest("order total is too large".into()));
    }
    Ok(order)
}

/// Returns a stored response byte for byte, flagging replays.
fn into_response(handled: HandledResponse) -> Response {
    let status =
        StatusCode::from_u16(handled.response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        handled.response.body,
    )
        .into_response();
    if handled.replayed {
        response
            .headers_mut()
            .insert(IDEMPOTENT_REPLAYED_HEADER, HeaderValue::from_static("true"));
    }
    response
}
