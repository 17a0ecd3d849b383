//! Process setup shared by the API server and the worker binary.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::config::{LedgerSettings, LogFormat, QueueBackendKind, Settings};
use crate::db::{BackendError, MemoryBackend, QueueBackend, RedisBackend};
use crate::services::gateway::GatewayLedger;
use crate::services::ledger::LedgerRegistry;
use crate::services::queue::Queue;

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` filter.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

pub async fn connect_queue(settings: &Settings) -> Result<Arc<Queue>, BackendError> {
    let backend: Arc<dyn QueueBackend> = match settings.queue_backend {
        QueueBackendKind::Redis => {
            tracing::info!(queue = %settings.queue.name, "Connecting to Redis job queue");
            Arc::new(RedisBackend::connect(&settings.redis_url, &settings.queue.name).await?)
        }
        QueueBackendKind::Memory => {
            tracing::warn!("Using in-memory job queue; jobs are lost on restart");
            Arc::new(MemoryBackend::new())
        }
    };
    backend.ping().await?;
    Ok(Arc::new(Queue::new(backend, settings.queue.clone())))
}

/// One gateway client per configured tenant.
pub fn ledger_registry(settings: &LedgerSettings) -> LedgerRegistry {
    let mut registry = LedgerRegistry::new();
    for (tenant_id, url) in &settings.gateways {
        tracing::info!(tenant_id = %tenant_id, gateway = %url, "Registering ledger gateway");
        registry.insert(
            tenant_id.clone(),
            Arc::new(GatewayLedger::new(
                url.clone(),
                settings.channel.clone(),
                settings.contract.clone(),
                settings.timeouts,
                settings.exactly_once,
            )),
        );
    }
    registry
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}
