use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::models::job::JobId;

fn default_is_write() -> bool {
    true
}

/// Request to queue a ledger transaction.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    #[garde(length(min = 1, max = 200))]
    pub operation_name: String,

    #[garde(length(max = 64), inner(length(max = 8192)))]
    #[serde(default)]
    pub arguments: Vec<String>,

    /// `false` queues a read-only evaluation instead of a submit.
    #[garde(skip)]
    #[serde(default = "default_is_write")]
    pub is_write: bool,
}

/// Request to evaluate a transaction synchronously.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateRequest {
    #[garde(length(min = 1, max = 200))]
    pub operation_name: String,

    #[garde(length(max = 64), inner(length(max = 8192)))]
    #[serde(default)]
    pub arguments: Vec<String>,
}

/// Response after queueing a transaction.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: JobId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EvaluateResponse {
    pub payload: String,
}

/// Commit status of a previously submitted invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStatus {
    pub transaction_id: String,
    pub validation_code: String,
    pub valid: bool,
}
