use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;

use crate::app_state::AppState;
use crate::models::job::JobData;
use crate::models::transaction::{
    EvaluateRequest, EvaluateResponse, SubmitRequest, SubmitResponse, TransactionStatus,
};
use crate::routes::auth::Tenant;
use crate::routes::ApiError;

/// POST /api/transactions - queue a transaction; the outcome is polled via
/// the jobs endpoints.
pub async fn submit_transaction(
    State(state): State<AppState>,
    Tenant(tenant_id): Tenant,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::Validation(e.body_text()))?;
    request.validate()?;
    if state.ledgers.resolve(&tenant_id).is_none() {
        return Err(ApiError::NoLedger(tenant_id));
    }

    let data = JobData::new(
        tenant_id.as_str(),
        request.operation_name,
        request.is_write,
        request.arguments,
    )
    .map_err(|e| ApiError::Validation(e.to_string()))?;
    let job_id = state.queue.enqueue(data).await?;

    tracing::info!(job_id = %job_id, tenant_id = %tenant_id, "Transaction queued");
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id })))
}

/// POST /api/evaluate - read-only query answered directly by the ledger.
pub async fn evaluate_transaction(
    State(state): State<AppState>,
    Tenant(tenant_id): Tenant,
    payload: Result<Json<EvaluateRequest>, JsonRejection>,
) -> Result<Json<EvaluateResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::Validation(e.body_text()))?;
    request.validate()?;

    let ledger = state
        .ledgers
        .resolve(&tenant_id)
        .ok_or_else(|| ApiError::NoLedger(tenant_id.clone()))?;
    let payload = ledger
        .evaluate(&request.operation_name, &request.arguments)
        .await?;

    Ok(Json(EvaluateResponse {
        payload: String::from_utf8_lossy(&payload).into_owned(),
    }))
}

/// GET /api/transactions/{transaction_id}/status - commit status of a past
/// invocation.
pub async fn transaction_status(
    State(state): State<AppState>,
    Tenant(tenant_id): Tenant,
    Path(transaction_id): Path<String>,
) -> Result<Json<TransactionStatus>, ApiError> {
    let ledger = state
        .ledgers
        .resolve(&tenant_id)
        .ok_or_else(|| ApiError::NoLedger(tenant_id.clone()))?;
    Ok(Json(ledger.transaction_status(&transaction_id).await?))
}
