use std::collections::BTreeMap;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::models::job::JobState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
    /// Queue-wide job counts per state, when the queue answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<BTreeMap<String, u64>>,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub queue: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

/// GET /live - process is up.
pub async fn liveness() -> &'static str {
    "OK"
}

/// GET /health - readiness, including queue backend connectivity.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();

    let queue_check = match state.queue.ping().await {
        Ok(_) => ComponentHealth {
            status: "ok".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(e) => {
            tracing::warn!(error = %e, "Queue health check failed");
            ComponentHealth {
                status: "error".to_string(),
                latency_ms: None,
            }
        }
    };

    let healthy = queue_check.status == "ok";
    let jobs = if healthy {
        state
            .queue
            .counts(&JobState::ALL)
            .await
            .ok()
            .map(|counts| counts.into_iter().map(|(s, n)| (s.to_string(), n)).collect())
    } else {
        None
    };

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if healthy { "ok" } else { "unavailable" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks { queue: queue_check },
        jobs,
    };

    (status_code, Json(response))
}
