use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use ledger_rest_queue::{
    app_state::AppState,
    bootstrap,
    config::AppConfig,
    routes,
    runtime::Runtime,
    services::events,
};

#[tokio::main]
async fn main() {
    // Configuration errors are fatal: the process never serves traffic.
    let settings = AppConfig::from_env()
        .and_then(AppConfig::validate)
        .expect("Failed to load configuration from environment");

    bootstrap::init_tracing(settings.log_format);
    tracing::info!("Initializing ledger-rest-queue server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    events::describe_metrics();

    let queue = bootstrap::connect_queue(&settings)
        .await
        .expect("Failed to initialize job queue");
    let ledgers = Arc::new(bootstrap::ledger_registry(&settings.ledger));

    // Worker and scheduler run in-process next to the API
    let runtime = Runtime::start(
        queue.clone(),
        ledgers.clone(),
        settings.worker.clone(),
        settings.scheduler.clone(),
    );

    let state = AppState::new(queue, ledgers, settings.api_keys.clone());

    let app = routes::router(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(1024 * 1024)); // 1 MB limit

    tracing::info!("Starting ledger-rest-queue on {}", settings.bind_addr);

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", settings.bind_addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(bootstrap::shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "Server error");
    }

    runtime.shutdown().await;
}
