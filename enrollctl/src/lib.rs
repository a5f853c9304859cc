//! # enrollctl: capacity-constrained class enrollment
//!
//! `enrollctl` reserves seats in classes with a hard capacity, collects payment for each
//! reservation through an external provider, and reconciles the provider's notifications back
//! into enrollment state.
//!
//! ## Overview
//!
//! A student asks for a seat. The service increments the class occupancy with an optimistic,
//! version-guarded update, records a pending enrollment, and creates a payment intent at the
//! provider, all in one database transaction. The student is redirected to the provider's
//! checkout. When the provider reports the payment as approved, the enrollment is confirmed.
//! Confirmed enrollments can be cancelled, which gives the seat back.
//!
//! Occupancy never exceeds capacity, under any interleaving of concurrent reservations. A
//! student holds at most one active enrollment per class. Notifications are idempotent: replays
//! and the created/updated pair for one payment confirm an enrollment at most once.
//!
//! ## Architecture
//!
//! - [`engine`]: the coordinators (reservation, webhook reconciliation, cancellation) and the
//!   background tasks (expiry sweeper, discrepancy repair)
//! - [`store`]: the storage seam, with a PostgreSQL backend and an in-memory backend
//! - [`payment_providers`]: MercadoPago over HTTP, and a dummy provider for local use
//! - [`api`]: the axum handlers
//! - [`config`]: YAML and environment configuration via figment
//! - [`telemetry`]: tracing subscriber and optional OTLP export
//!
//! ## Seat accounting
//!
//! Taking a seat always happens inside the reservation transaction, so a seat is never held
//! without its enrollment and payment intent. Giving a seat back happens after the enrollment
//! has left the active set. If that second write fails, the enrollment change stands and the
//! missing release is recorded as a discrepancy, which the repair task retries.

pub mod api;
pub mod config;
pub mod engine;
pub mod errors;
pub mod models;
pub mod payment_providers;
pub mod store;
pub mod telemetry;
#[cfg(test)]
pub mod test_utils;
pub mod types;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use bon::Builder;
pub use config::Config;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info};

use engine::Engine;
use payment_providers::PaymentProvider;
use store::Store;
use store::postgres::PostgresStore;

pub use types::{ClassId, EnrollmentId, UserId};

/// Install the process-wide rustls crypto provider. Safe to call more than once.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Get the enrollctl database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// State shared by all request handlers.
///
/// ```ignore
/// let state = AppState::builder()
///     .engine(engine)
///     .provider(provider)
///     .maybe_metrics(handle)
///     .build();
/// ```
#[derive(Builder)]
pub struct AppState<S> {
    pub engine: Arc<Engine<S>>,
    /// Used to authenticate and parse incoming webhooks.
    pub provider: Arc<dyn PaymentProvider>,
    /// Present when Prometheus metrics are enabled.
    pub metrics: Option<PrometheusHandle>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            provider: self.provider.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

pub fn build_router<S: Store>(state: AppState<S>) -> Router {
    use api::handlers::{discrepancies, enrollments, webhooks};

    let mut router = Router::new()
        .route("/api/v1/enrollments", post(enrollments::create_enrollment::<S>))
        .route("/api/v1/enrollments/{id}", get(enrollments::get_enrollment::<S>))
        .route("/api/v1/enrollments/{id}/cancel", post(enrollments::cancel_enrollment::<S>))
        .route("/webhooks/payments", post(webhooks::payment_webhook::<S>))
        .route("/internal/discrepancies", get(discrepancies::list_discrepancies::<S>))
        .route("/internal/discrepancies/repair", post(discrepancies::repair_discrepancies::<S>))
        .route("/internal/discrepancies/{id}/resolve", post(discrepancies::resolve_discrepancy::<S>))
        .route("/healthz", get(|| async { "OK" }));

    if let Some(handle) = state.metrics.clone() {
        router = router.route("/internal/metrics", get(move || std::future::ready(handle.render())));
    }

    router.with_state(state).layer(
        ServiceBuilder::new().layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        ),
    )
}

/// Background tasks running alongside the HTTP server: the expiry sweeper
/// (when a pending ttl is configured) and the discrepancy repair loop.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: CancellationToken,
}

impl BackgroundServices {
    /// Signal all tasks to stop and wait for them.
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();
        for result in futures::future::join_all(self.background_tasks).await {
            if let Err(e) = result {
                tracing::error!("Background task panicked: {}", e);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.background_tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.background_tasks.is_empty()
    }
}

pub fn setup_background_services<S: Store>(
    engine: Arc<Engine<S>>,
    config: &Config,
    shutdown_token: CancellationToken,
) -> BackgroundServices {
    let mut background_tasks = Vec::new();

    if engine.expiry.is_some() {
        let engine = engine.clone();
        let interval = config.expiry.sweep_interval;
        let shutdown = shutdown_token.clone();
        background_tasks.push(tokio::spawn(async move {
            if let Some(sweeper) = &engine.expiry {
                info!("Starting expiry sweeper (every {:?})", interval);
                sweeper.run(interval, shutdown).await;
            }
        }));
    } else {
        info!("No pending ttl configured: pending enrollments never expire");
    }

    if config.repair.enabled {
        let interval = config.repair.interval;
        let shutdown = shutdown_token.clone();
        background_tasks.push(tokio::spawn(async move {
            info!("Starting discrepancy repair (every {:?})", interval);
            engine.repair.run(interval, shutdown).await;
        }));
    }

    BackgroundServices {
        background_tasks,
        shutdown_token,
    }
}

async fn setup_database(config: &Config) -> anyhow::Result<PgPool> {
    let pool_settings = &config.database.pool;
    let pool = PgPoolOptions::new()
        .max_connections(pool_settings.max_connections)
        .min_connections(pool_settings.min_connections)
        .acquire_timeout(std::time::Duration::from_secs(pool_settings.acquire_timeout_secs))
        .idle_timeout(std::time::Duration::from_secs(pool_settings.idle_timeout_secs))
        .max_lifetime(std::time::Duration::from_secs(pool_settings.max_lifetime_secs))
        .connect(&config.database.url)
        .await?;
    migrator().run(&pool).await?;
    Ok(pool)
}

/// The assembled service.
///
/// 1. **Create**: [`Application::new`] connects to the database, runs migrations, builds the
///    payment provider and starts background services
/// 2. **Serve**: [`Application::serve`] binds the listener and handles requests until the
///    shutdown future resolves, then stops background services and closes the pool
pub struct Application {
    router: Router,
    config: Config,
    pool: PgPool,
    bg_services: BackgroundServices,
}

impl Application {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting enrollctl with configuration: {:#?}", config);

        let pool = setup_database(&config).await?;
        let provider = payment_providers::create_provider(config.payment.clone())?;

        let metrics = if config.enable_metrics {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;
            Some(handle)
        } else {
            None
        };

        let store = Arc::new(PostgresStore::new(pool.clone()));
        let engine = Arc::new(Engine::new(store, provider.clone(), &config));
        let bg_services = setup_background_services(engine.clone(), &config, CancellationToken::new());

        let state = AppState::builder()
            .engine(engine)
            .provider(provider)
            .maybe_metrics(metrics)
            .build();

        Ok(Self {
            router: build_router(state),
            config,
            pool,
            bg_services,
        })
    }

    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "enrollctl listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router).with_graceful_shutdown(shutdown).await?;

        self.bg_services.shutdown().await;

        info!("Closing database connections...");
        self.pool.close().await;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}
