//! HTTP host for the consistency runtime.
//!
//! Provides REST endpoints for idempotent order creation, saga-driven
//! fulfillment and operational status, with structured logging (tracing)
//! and Prometheus metrics.

pub mod config;
pub mod error;
pub mod maintenance;
pub mod order;
pub mod routes;
pub mod transport;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use idempotency::{
    IdempotencyStore, IdempotentHandler, InMemoryIdempotencyStore, PostgresIdempotencyStore,
};
use metrics_exporter_prometheus::PrometheusHandle;
use outbox::{InMemoryOutboxStore, OutboxStore, PostgresOutboxStore};
use resilience::{CircuitBreakerRegistry, ConfigError};
use saga::{
    InMemoryInventoryService, InMemoryPaymentService, InMemorySagaRepository,
    InMemoryShippingService, PostgresSagaRepository, SagaOrchestrator, SagaRepository,
    order_fulfillment,
};
use sqlx::PgPool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use order::OrderService;

/// The storage implementations one deployment runs on.
pub trait Backend: Send + Sync + 'static {
    type Outbox: OutboxStore + Clone + 'static;
    type Idempotency: IdempotencyStore + Clone + 'static;
    type Sagas: SagaRepository + Clone + 'static;
}

/// Process-local stores for tests and single-instance runs.
pub struct InMemoryBackend;

impl Backend for InMemoryBackend {
    type Outbox = InMemoryOutboxStore;
    type Idempotency = InMemoryIdempotencyStore;
    type Sagas = InMemorySagaRepository;
}

/// PostgreSQL stores shared by every instance.
pub struct PostgresBackend;

impl Backend for PostgresBackend {
    type Outbox = PostgresOutboxStore;
    type Idempotency = PostgresIdempotencyStore;
    type Sagas = PostgresSagaRepository;
}

/// The in-memory fulfillment services the reference saga calls.
#[derive(Clone, Default)]
pub struct FulfillmentServices {
    pub inventory: InMemoryInventoryService,
    pub payment: InMemoryPaymentService,
    pub shipping: InMemoryShippingService,
}

/// Shared application state accessible from all handlers.
pub struct AppState<B: Backend> {
    pub orders: OrderService<B::Outbox>,
    pub idempotency: IdempotentHandler<B::Idempotency>,
    pub sagas: SagaOrchestrator<B::Sagas>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub services: FulfillmentServices,
}

impl<B: Backend> AppState<B> {
    /// Wires the stores and the fulfillment saga. Fails if the retry or
    /// breaker settings in `config` are unusable.
    pub fn new(
        outbox: B::Outbox,
        idempotency: B::Idempotency,
        sagas: B::Sagas,
        config: &Config,
    ) -> Result<Self, ConfigError> {
        let policy = config.resilience_policy();
        policy.validate()?;
        let breakers = Arc::new(CircuitBreakerRegistry::try_new(config.breaker_config())?);
        let services = FulfillmentServices::default();
        let definition = order_fulfillment::definition(
            services.inventory.clone(),
            services.payment.clone(),
            services.shipping.clone(),
            &breakers,
            policy,
        );

        Ok(Self {
            orders: OrderService::new(outbox),
            idempotency: IdempotentHandler::new(idempotency),
            sagas: SagaOrchestrator::new(sagas).register(definition),
            breakers,
            services,
        })
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<B: Backend>(state: Arc<AppState<B>>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/orders", post(routes::orders::create::<B>))
        .route("/orders/{id}", get(routes::orders::get::<B>))
        .route("/orders/{id}/fulfill", post(routes::orders::fulfill::<B>))
        .route("/sagas/reconciliation", get(routes::sagas::reconciliation::<B>))
        .route("/sagas/{id}", get(routes::sagas::get::<B>))
        .route("/sagas/{id}/abort", post(routes::sagas::abort::<B>))
        .route("/sagas/{id}/resume", post(routes::sagas::resume::<B>))
        .route("/outbox/status", get(routes::ops::outbox_status::<B>))
        .route("/circuit-breakers", get(routes::ops::circuit_breakers::<B>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates application state over in-memory stores.
pub fn create_default_state(
    config: &Config,
) -> Result<Arc<AppState<InMemoryBackend>>, ConfigError> {
    AppState::new(
        InMemoryOutboxStore::new(),
        InMemoryIdempotencyStore::new(),
        InMemorySagaRepository::new(),
        config,
    )
    .map(Arc::new)
}

/// Creates application state over PostgreSQL. Migrations must already have run.
pub fn create_postgres_state(
    pool: PgPool,
    config: &Config,
) -> Result<Arc<AppState<PostgresBackend>>, ConfigError> {
    AppState::new(
        PostgresOutboxStore::new(pool.clone()),
        PostgresIdempotencyStore::new(pool.clone()),
        PostgresSagaRepository::new(pool),
        config,
    )
    .map(Arc::new)
}
