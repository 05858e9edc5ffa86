//! # Server Configuration
//!
//! This module contains the server setup and configuration for the
//! Scrapeflow API: shared state, the route table, middleware layers and
//! graceful shutdown with worker draining.

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::AppConfig;
use crate::handlers;
use crate::supervisor::Supervisor;
use crate::telemetry;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Arc<DatabaseConnection>,
    pub supervisor: Arc<Supervisor>,
}

impl AppState {
    /// Builds the shared state, wiring the supervisor to the same store
    /// the handlers use.
    pub fn new(config: Arc<AppConfig>, db: Arc<DatabaseConnection>) -> Self {
        let supervisor = Arc::new(Supervisor::new(config.clone(), db.clone()));
        Self {
            config,
            db,
            supervisor,
        }
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route(
            "/api/jobs",
            post(handlers::jobs::start_job).get(handlers::jobs::list_jobs),
        )
        .route("/api/jobs/{id}", get(handlers::jobs::get_job))
        .route("/api/jobs/{id}/stop", post(handlers::jobs::stop_job))
        .route(
            "/api/jobs/{id}/status",
            post(handlers::callbacks::status_callback),
        )
        .route(
            "/api/jobs/{id}/progress",
            post(handlers::callbacks::progress_callback),
        )
        .route(
            "/api/jobs/{id}/logs",
            post(handlers::callbacks::log_callback),
        )
        .route("/api/products", get(handlers::products::list_products))
        .layer(axum::middleware::from_fn(telemetry::trace_context_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

/// Starts the server with the given configuration
pub async fn run_server(
    config: AppConfig,
    db: DatabaseConnection,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = AppState::new(Arc::new(config), Arc::new(db));
    let supervisor = state.supervisor.clone();
    let profile = state.config.profile.clone();

    // Resolve the configured bind address
    let addr = state
        .config
        .bind_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;

    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on: {}", addr);
    println!("Running in profile: {}", profile);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(supervisor))
        .await?;

    Ok(())
}

/// Resolves when a termination signal arrives, then drains the workers.
async fn shutdown_signal(supervisor: Arc<Supervisor>) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => tracing::error!(error = %err, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining workers");
    supervisor.shutdown().await;
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::health,
        crate::handlers::jobs::start_job,
        crate::handlers::jobs::list_jobs,
        crate::handlers::jobs::get_job,
        crate::handlers::jobs::stop_job,
        crate::handlers::callbacks::status_callback,
        crate::handlers::callbacks::progress_callback,
        crate::handlers::callbacks::log_callback,
        crate::handlers::products::list_products,
    ),
    components(
        schemas(
            crate::error::ApiError,
            crate::models::ServiceInfo,
            crate::models::job::JobStatus,
            crate::models::job::ProgressSnapshot,
            crate::models::job::ResultsSummary,
            crate::handlers::HealthStatus,
            crate::handlers::jobs::StartJobRequest,
            crate::handlers::jobs::StartJobResponse,
            crate::handlers::jobs::StopJobResponse,
            crate::handlers::jobs::JobRecord,
            crate::handlers::callbacks::StatusCallback,
            crate::handlers::callbacks::ProgressCallback,
            crate::handlers::callbacks::LogCallback,
            crate::handlers::callbacks::CallbackAck,
            crate::handlers::products::ProductRecord,
            crate::handlers::products::ProductsResponse,
        )
    ),
    info(
        title = "Scrapeflow API",
        description = "Job lifecycle and result ingestion engine for out-of-process scrape workers",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
