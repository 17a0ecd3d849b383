use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::app_state::AppState;
use crate::services::ledger::LedgerError;
use crate::services::queue::QueueError;

pub mod auth;
pub mod health;
pub mod jobs;
pub mod metrics;
pub mod transactions;

/// API routes plus health probes. `/metrics` is mounted separately by the
/// binary since it carries its own state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/live", get(health::liveness))
        .route("/health", get(health::health_check))
        .route("/api/transactions", post(transactions::submit_transaction))
        .route(
            "/api/transactions/{transaction_id}/status",
            get(transactions::transaction_status),
        )
        .route("/api/evaluate", post(transactions::evaluate_transaction))
        .route("/api/jobs", get(jobs::list_jobs))
        .route("/api/jobs/{job_id}", get(jobs::get_job))
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Missing or invalid API key")]
    Unauthorized,

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Job {0} not found")]
    JobNotFound(String),

    #[error("No ledger binding for tenant {0}")]
    NoLedger(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Job queue unavailable: {0}")]
    Queue(QueueError),
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound(id) => ApiError::JobNotFound(id),
            other => ApiError::Queue(other),
        }
    }
}

impl From<garde::Report> for ApiError {
    fn from(report: garde::Report) -> Self {
        ApiError::Validation(report.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: u16,
    pub reason: String,
    pub message: String,
    pub timestamp: String,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::JobNotFound(_) | ApiError::NoLedger(_) => StatusCode::NOT_FOUND,
            ApiError::Ledger(LedgerError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Ledger(LedgerError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Ledger(LedgerError::InvalidInvocation(_) | LedgerError::AlreadyApplied(_)) => {
                StatusCode::CONFLICT
            }
            ApiError::Ledger(LedgerError::Rejected(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Ledger(LedgerError::Unknown(_)) => StatusCode::BAD_GATEWAY,
            ApiError::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = ErrorBody {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        };
        (status, Json(body)).into_response()
    }
}
