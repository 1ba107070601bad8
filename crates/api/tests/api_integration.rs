//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};

use api::config::Config;
use api::{AppState, InMemoryBackend};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use common::AggregateId;
use metrics_exporter_prometheus::PrometheusHandle;
use outbox::OutboxStore;
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn setup() -> (axum::Router, Arc<AppState<InMemoryBackend>>) {
    let state = api::create_default_state(&Config::default()).unwrap();
    let app = api::create_app(state.clone(), get_metrics_handle());
    (app, state)
}

fn order_body() -> serde_json::Value {
    serde_json::json!({
        "customer_id": "CUST-001",
        "items": [
            { "sku": "SKU-001", "quantity": 2, "unit_price_cents": 1000 },
            { "sku": "SKU-002", "quantity": 1, "unit_price_cents": 2500 }
        ]
    })
}

fn post(uri: &str, key: Option<&str>, body: &serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("Idempotency-Key", key);
    }
    builder
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn json(response: Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

async fn create_order(app: &axum::Router) -> String {
    let response = app
        .clone()
        .oneshot(post("/orders", None, &order_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    json(response).await["id"].as_str().unwrap().to_string()
}

async fn event_types(state: &AppState<InMemoryBackend>, order_id: &str) -> Vec<String> {
    let id: AggregateId = order_id.parse().unwrap();
    state
        .orders
        .store()
        .entries_for_aggregate(id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

#[tokio::test]
async fn test_health_check() {
    let (app, _) = setup();

    let response = app.oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["status"], "ok");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, _) = setup();

    let response = app.oneshot(get("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_create_order() {
    let (app, state) = setup();

    let response = app
        .oneshot(post("/orders", None, &order_body()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json(response).await;
    assert_eq!(body["status"], "CREATED");
    assert_eq!(body["total_cents"], 4500);
    assert_eq!(body["version"], 1);

    let id = body["id"].as_str().unwrap();
    assert_eq!(event_types(&state, id).await, vec!["OrderCreated"]);
}

#[tokio::test]
async fn test_create_order_validation() {
    let (app, _) = setup();

    let empty = serde_json::json!({ "customer_id": "CUST-001", "items": [] });
    let response = app
        .clone()
        .oneshot(post("/orders", None, &empty))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let zero = serde_json::json!({
        "customer_id": "CUST-001",
        "items": [{ "sku": "SKU-001", "quantity": 0, "unit_price_cents": 100 }]
    });
    let response = app.oneshot(post("/orders", None, &zero)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_order_total_overflow_is_rejected() {
    let (app, state) = setup();

    let oversized = serde_json::json!({
        "customer_id": "CUST-001",
        "items": [
            { "sku": "SKU-001", "quantity": 2, "unit_price_cents": u64::MAX }
        ]
    });
    let response = app
        .clone()
        .oneshot(post("/orders", None, &oversized))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let summed = serde_json::json!({
        "customer_id": "CUST-001",
        "items": [
            { "sku": "SKU-001", "quantity": 1, "unit_price_cents": u64::MAX },
            { "sku": "SKU-002", "quantity": 1, "unit_price_cents": 1 }
        ]
    });
    let response = app.oneshot(post("/orders", None, &summed)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(state.orders.store().pending_count().await.unwrap(), 0);
}

#[test]
fn test_unusable_resilience_config_is_rejected_at_startup() {
    let unreachable_minimum = Config {
        breaker_window: 4,
        breaker_min_calls: 10,
        ..Config::default()
    };
    assert!(api::create_default_state(&unreachable_minimum).is_err());

    let no_attempts = Config {
        retry_max_attempts: 0,
        ..Config::default()
    };
    assert!(api::create_default_state(&no_attempts).is_err());
}

#[tokio::test]
async fn test_idempotent_retry_replays_first_response() {
    let (app, state) = setup();

    let first = app
        .clone()
        .oneshot(post("/orders", Some("order-key-1"), &order_body()))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    assert!(first.headers().get("idempotent-replayed").is_none());
    let first_body = body_bytes(first).await;

    let second = app
        .oneshot(post("/orders", Some("order-key-1"), &order_body()))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CREATED);
    assert_eq!(second.headers()["idempotent-replayed"], "true");
    let second_body = body_bytes(second).await;

    assert_eq!(first_body, second_body);
    assert_eq!(state.orders.store().pending_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_reused_key_with_different_body_is_rejected() {
    let (app, state) = setup();

    let response = app
        .clone()
        .oneshot(post("/orders", Some("order-key-2"), &order_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let other = serde_json::json!({
        "customer_id": "CUST-002",
        "items": [{ "sku": "SKU-009", "quantity": 1, "unit_price_cents": 100 }]
    });
    let response = app
        .oneshot(post("/orders", Some("order-key-2"), &other))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(json(response).await["error"].is_string());
    assert_eq!(state.orders.store().pending_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_requests_without_key_are_not_deduplicated() {
    let (app, state) = setup();

    let first = create_order(&app).await;
    let second = create_order(&app).await;

    assert_ne!(first, second);
    assert_eq!(state.orders.store().pending_count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_invalid_idempotency_key_is_bad_request() {
    let (app, _) = setup();
    let long_key = "k".repeat(1000);

    let response = app
        .oneshot(post("/orders", Some(&long_key), &order_body()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_order() {
    let (app, _) = setup();
    let id = create_order(&app).await;

    let response = app.clone().oneshot(get(&format!("/orders/{id}"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["id"], id.as_str());
    assert_eq!(body["customer_id"], "CUST-001");
    assert_eq!(body["items"].as_array().unwrap().len(), 2);

    let missing = format!("/orders/{}", AggregateId::new());
    let response = app.clone().oneshot(get(&missing)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app.oneshot(get("/orders/not-a-uuid")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_fulfill_happy_path() {
    let (app, state) = setup();
    let id = create_order(&app).await;

    let response = app
        .clone()
        .oneshot(post(&format!("/orders/{id}/fulfill"), None, &serde_json::json!({})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["status"], "FULFILLED");
    assert_eq!(body["saga"]["state"], "COMPLETED");
    assert!(body["tracking_number"].as_str().unwrap().starts_with("TRACK-"));

    let order = json(app.oneshot(get(&format!("/orders/{id}"))).await.unwrap()).await;
    assert_eq!(order["status"], "FULFILLED");
    assert_eq!(order["saga_id"], body["saga"]["saga_id"]);

    assert_eq!(
        event_types(&state, &id).await,
        vec!["OrderCreated", "OrderFulfillmentStarted", "OrderFulfilled"]
    );
    assert_eq!(state.services.payment.captured_cents(), 4500);
}

#[tokio::test]
async fn test_fulfill_with_declined_payment_cancels_order() {
    let (app, state) = setup();
    state.services.payment.set_fail_on_charge(true);
    let id = create_order(&app).await;

    let response = app
        .oneshot(post(&format!("/orders/{id}/fulfill"), None, &serde_json::json!({})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["status"], "CANCELLED");
    assert_eq!(body["saga"]["state"], "FAILED");
    assert_eq!(body["saga"]["compensated_steps"][0], "reserve_inventory");

    assert_eq!(state.services.inventory.reservation_count(), 0);
    assert_eq!(
        event_types(&state, &id).await.last().map(String::as_str),
        Some("OrderCancelled")
    );
}

#[tokio::test]
async fn test_second_fulfill_conflicts() {
    let (app, state) = setup();
    let id = create_order(&app).await;
    let uri = format!("/orders/{id}/fulfill");

    let first = app
        .clone()
        .oneshot(post(&uri, None, &serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .oneshot(post(&uri, None, &serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
    assert_eq!(state.services.shipping.shipment_count(), 1);
}

#[tokio::test]
async fn test_fulfill_retry_with_same_key_replays() {
    let (app, state) = setup();
    let id = create_order(&app).await;
    let uri = format!("/orders/{id}/fulfill");

    let first = app
        .clone()
        .oneshot(post(&uri, Some("fulfill-1"), &serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .oneshot(post(&uri, Some("fulfill-1"), &serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers()["idempotent-replayed"], "true");
    assert_eq!(state.services.payment.payment_count(), 1);
}

#[tokio::test]
async fn test_saga_endpoints() {
    let (app, _) = setup();
    let id = create_order(&app).await;

    let fulfilled = json(
        app.clone()
            .oneshot(post(&format!("/orders/{id}/fulfill"), None, &serde_json::json!({})))
            .await
            .unwrap(),
    )
    .await;
    let saga_id = fulfilled["saga"]["saga_id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(get(&format!("/sagas/{saga_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let saga = json(response).await;
    assert_eq!(saga["state"], "COMPLETED");
    assert_eq!(saga["steps"].as_array().unwrap().len(), 3);

    // A finished saga cannot be aborted.
    let response = app
        .clone()
        .oneshot(post(&format!("/sagas/{saga_id}/abort"), None, &serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["abort_requested"], false);

    let response = app
        .clone()
        .oneshot(post(&format!("/sagas/{saga_id}/resume"), None, &serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["state"], "COMPLETED");

    let unknown = format!("/sagas/{}", saga::SagaId::new());
    let response = app.clone().oneshot(get(&unknown)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app.oneshot(get("/sagas/reconciliation")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(json(response).await.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_refund_is_listed_for_reconciliation() {
    let (app, state) = setup();
    state.services.shipping.set_fail_on_create(true);
    state.services.payment.set_fail_on_refund(true);
    let id = create_order(&app).await;

    let response = app
        .clone()
        .oneshot(post(&format!("/orders/{id}/fulfill"), None, &serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(json(response).await["status"], "CANCELLED");

    let pending = json(app.oneshot(get("/sagas/reconciliation")).await.unwrap()).await;
    let pending = pending.as_array().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["compensation_failures"][0]["step"], "process_payment");
}

#[tokio::test]
async fn test_outbox_status_and_circuit_breakers() {
    let (app, _) = setup();
    create_order(&app).await;
    create_order(&app).await;

    let response = app.clone().oneshot(get("/outbox/status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["pending"], 2);

    let response = app.oneshot(get("/circuit-breakers")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let breakers = json(response).await;
    let names: Vec<&str> = breakers
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|b| b["name"].as_str())
        .collect();
    assert!(names.contains(&"payment"));
}
