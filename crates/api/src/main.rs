//! API server entry point.

use std::sync::Arc;
use std::time::Duration;

use api::config::Config;
use api::maintenance::spawn_idempotency_purge;
use api::transport::LogTransport;
use api::{AppState, Backend};
use metrics_exporter_prometheus::PrometheusHandle;
use outbox::{OutboxRelay, PostgresOutboxStore};
use resilience::PolicyExecutor;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const PURGE_EVERY: Duration = Duration::from_secs(60);

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

/// Recovers unfinished sagas, starts the background workers and serves HTTP
/// until a shutdown signal arrives.
async fn run<B: Backend>(state: Arc<AppState<B>>, config: Config, metrics_handle: PrometheusHandle) {
    match state.sagas.resume_all().await {
        Ok(reports) => tracing::info!(count = reports.len(), "recovered unfinished sagas"),
        Err(e) => tracing::error!(error = %e, "saga recovery failed"),
    }

    let relay = OutboxRelay::new(
        state.orders.store().clone(),
        LogTransport,
        PolicyExecutor::from_registry(&state.breakers, "outbox-relay", config.resilience_policy()),
        config.relay_config(),
    )
    .spawn();
    let purge = spawn_idempotency_purge(
        state.idempotency.store().clone(),
        config.idempotency_retention,
        PURGE_EVERY,
    );

    let app = api::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    relay.shutdown().await;
    purge.shutdown().await;
    tracing::info!("server shut down gracefully");
}

#[tokio::main]
async fn main() {
    let config = Config::from_env().expect("invalid configuration");

    // 1. Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Pick the storage backend
    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await
                .expect("failed to connect to PostgreSQL");
            PostgresOutboxStore::new(pool.clone())
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL storage");
            let state = api::create_postgres_state(pool, &config).expect("invalid configuration");
            run(state, config, metrics_handle).await;
        }
        None => {
            tracing::info!("DATABASE_URL not set, using in-memory storage");
            let state = api::create_default_state(&config).expect("invalid configuration");
            run(state, config, metrics_handle).await;
        }
    }
}
