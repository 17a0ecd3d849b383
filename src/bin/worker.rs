use ledger_rest_queue::{bootstrap, config::AppConfig, runtime::Runtime, services::events};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let settings = AppConfig::from_env()
        .and_then(AppConfig::validate)
        .expect("Failed to load configuration");

    bootstrap::init_tracing(settings.log_format);
    tracing::info!("Starting ledger submit worker");

    // No HTTP API here, so metrics get their own scrape listener
    PrometheusBuilder::new()
        .with_http_listener(settings.worker_metrics_addr)
        .install()
        .expect("Failed to install Prometheus metrics exporter");
    events::describe_metrics();

    let queue = bootstrap::connect_queue(&settings)
        .await
        .expect("Failed to initialize job queue");
    let ledgers = Arc::new(bootstrap::ledger_registry(&settings.ledger));

    let runtime = Runtime::start(
        queue,
        ledgers,
        settings.worker.clone(),
        settings.scheduler.clone(),
    );

    tracing::info!("Worker ready, processing jobs until shutdown");
    bootstrap::shutdown_signal().await;
    runtime.shutdown().await;
}
