use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::transaction::TransactionStatus;
use crate::services::ledger::{Invocation, Ledger, LedgerError};

/// Deadlines for each remote call made through the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayTimeouts {
    pub evaluate: Duration,
    pub endorse: Duration,
    pub submit: Duration,
    pub commit_status: Duration,
}

impl GatewayTimeouts {
    /// Upper bound for a whole submit round trip (endorse, submit, commit).
    fn submit_round_trip(&self) -> Duration {
        self.endorse + self.submit + self.commit_status
    }
}

/// Client for a tenant's ledger gateway, which holds the tenant identity and
/// performs endorsement, ordering and commit on the tenant's behalf.
pub struct GatewayLedger {
    http: Client,
    base_url: String,
    channel: String,
    contract: String,
    timeouts: GatewayTimeouts,
    exactly_once: bool,
}

/// Checkpoint handed back to the queue so a retry can reuse the invocation.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Checkpoint {
    invocation_id: String,
    operation: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBody<'a> {
    invocation_id: &'a str,
    operation: &'a str,
    arguments: &'a [String],
    endorse_timeout_ms: u64,
    submit_timeout_ms: u64,
    commit_status_timeout_ms: u64,
}

#[derive(Serialize)]
struct EvaluateBody<'a> {
    operation: &'a str,
    arguments: &'a [String],
}

#[derive(Deserialize)]
struct PayloadResponse {
    /// Base64-encoded contract result.
    #[serde(default)]
    payload: String,
}

#[derive(Debug, Default, Deserialize)]
struct GatewayErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl GatewayLedger {
    pub fn new(
        base_url: impl Into<String>,
        channel: impl Into<String>,
        contract: impl Into<String>,
        timeouts: GatewayTimeouts,
        exactly_once: bool,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            channel: channel.into(),
            contract: contract.into(),
            timeouts,
            exactly_once,
        }
    }

    fn contract_url(&self, action: &str) -> String {
        format!(
            "{}/channels/{}/contracts/{}/{}",
            self.base_url, self.channel, self.contract, action
        )
    }

    async fn payload(&self, response: reqwest::Response) -> Result<Vec<u8>, LedgerError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.json::<GatewayErrorBody>().await.unwrap_or_default();
            return Err(error_for_status(status, body));
        }
        let body: PayloadResponse = response.json().await.map_err(transport_error)?;
        base64::engine::general_purpose::STANDARD
            .decode(body.payload)
            .map_err(|e| LedgerError::Unknown(format!("undecodable payload: {}", e)))
    }
}

#[async_trait]
impl Ledger for GatewayLedger {
    fn begin(&self, operation: &str, _args: &[String]) -> Result<Invocation, LedgerError> {
        let checkpoint = Checkpoint {
            invocation_id: Uuid::new_v4().simple().to_string(),
            operation: operation.to_string(),
        };
        let bytes = serde_json::to_vec(&checkpoint)
            .map_err(|e| LedgerError::Unknown(format!("cannot encode checkpoint: {}", e)))?;
        Ok(Invocation {
            id: checkpoint.invocation_id,
            checkpoint: bytes,
        })
    }

    fn resume(&self, checkpoint: &[u8]) -> Result<Invocation, LedgerError> {
        let decoded: Checkpoint = serde_json::from_slice(checkpoint)
            .map_err(|e| LedgerError::InvalidInvocation(format!("unreadable checkpoint: {}", e)))?;
        Ok(Invocation {
            id: decoded.invocation_id,
            checkpoint: checkpoint.to_vec(),
        })
    }

    async fn submit(
        &self,
        invocation: &Invocation,
        operation: &str,
        args: &[String],
    ) -> Result<Vec<u8>, LedgerError> {
        let body = SubmitBody {
            invocation_id: &invocation.id,
            operation,
            arguments: args,
            endorse_timeout_ms: self.timeouts.endorse.as_millis() as u64,
            submit_timeout_ms: self.timeouts.submit.as_millis() as u64,
            commit_status_timeout_ms: self.timeouts.commit_status.as_millis() as u64,
        };
        let response = self
            .http
            .post(self.contract_url("submit"))
            .timeout(self.timeouts.submit_round_trip())
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        self.payload(response).await
    }

    async fn evaluate(&self, operation: &str, args: &[String]) -> Result<Vec<u8>, LedgerError> {
        let response = self
            .http
            .post(self.contract_url("evaluate"))
            .timeout(self.timeouts.evaluate)
            .json(&EvaluateBody {
                operation,
                arguments: args,
            })
            .send()
            .await
            .map_err(transport_error)?;
        self.payload(response).await
    }

    async fn transaction_status(&self, invocation_id: &str) -> Result<TransactionStatus, LedgerError> {
        let url = format!(
            "{}/channels/{}/transactions/{}",
            self.base_url, self.channel, invocation_id
        );
        let response = self
            .http
            .get(url)
            .timeout(self.timeouts.evaluate)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.json::<GatewayErrorBody>().await.unwrap_or_default();
            return Err(error_for_status(status, body));
        }
        response.json().await.map_err(transport_error)
    }

    fn exactly_once(&self) -> bool {
        self.exactly_once
    }
}

fn transport_error(err: reqwest::Error) -> LedgerError {
    if err.is_timeout() {
        LedgerError::Timeout(err.to_string())
    } else if err.is_connect() {
        LedgerError::Unavailable(err.to_string())
    } else {
        LedgerError::Unknown(err.to_string())
    }
}

/// Map a gateway error response onto the ledger error tags.
fn error_for_status(status: StatusCode, body: GatewayErrorBody) -> LedgerError {
    let message = body
        .message
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("gateway error").to_string());

    match body.code.as_deref() {
        Some("MVCC_READ_CONFLICT" | "PHANTOM_READ_CONFLICT" | "EXPIRED_PROPOSAL") => {
            return LedgerError::InvalidInvocation(message)
        }
        Some("DUPLICATE_TXID") => return LedgerError::AlreadyApplied(message),
        _ => {}
    }

    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => LedgerError::Timeout(message),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => LedgerError::Unavailable(message),
        StatusCode::CONFLICT | StatusCode::GONE => LedgerError::InvalidInvocation(message),
        StatusCode::BAD_REQUEST
        | StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::NOT_FOUND
        | StatusCode::UNPROCESSABLE_ENTITY => LedgerError::Rejected(message),
        _ => LedgerError::Unknown(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> GatewayLedger {
        GatewayLedger::new(
            "http://gateway:8080/",
            "mychannel",
            "basic",
            GatewayTimeouts {
                evaluate: Duration::from_secs(5),
                endorse: Duration::from_secs(15),
                submit: Duration::from_secs(5),
                commit_status: Duration::from_secs(60),
            },
            true,
        )
    }

    fn body(code: Option<&str>) -> GatewayErrorBody {
        GatewayErrorBody {
            code: code.map(str::to_string),
            message: Some("boom".to_string()),
        }
    }

    #[test]
    fn test_contract_url_trims_trailing_slash() {
        assert_eq!(
            ledger().contract_url("submit"),
            "http://gateway:8080/channels/mychannel/contracts/basic/submit"
        );
    }

    #[test]
    fn test_begin_then_resume_keeps_invocation_id() {
        let ledger = ledger();
        let fresh = ledger.begin("Transfer", &[]).unwrap();
        let resumed = ledger.resume(&fresh.checkpoint).unwrap();
        assert_eq!(resumed.id, fresh.id);
        assert_ne!(ledger.begin("Transfer", &[]).unwrap().id, fresh.id);
    }

    #[test]
    fn test_corrupt_checkpoint_invalidates_invocation() {
        assert!(matches!(
            ledger().resume(b"not json"),
            Err(LedgerError::InvalidInvocation(_))
        ));
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            error_for_status(StatusCode::GATEWAY_TIMEOUT, body(None)),
            LedgerError::Timeout(_)
        ));
        assert!(matches!(
            error_for_status(StatusCode::SERVICE_UNAVAILABLE, body(None)),
            LedgerError::Unavailable(_)
        ));
        assert!(matches!(
            error_for_status(StatusCode::CONFLICT, body(None)),
            LedgerError::InvalidInvocation(_)
        ));
        assert!(matches!(
            error_for_status(StatusCode::NOT_FOUND, body(None)),
            LedgerError::Rejected(_)
        ));
        assert!(matches!(
            error_for_status(StatusCode::INTERNAL_SERVER_ERROR, body(None)),
            LedgerError::Unknown(_)
        ));
    }

    #[test]
    fn test_error_codes_take_precedence_over_status() {
        assert!(matches!(
            error_for_status(StatusCode::INTERNAL_SERVER_ERROR, body(Some("MVCC_READ_CONFLICT"))),
            LedgerError::InvalidInvocation(_)
        ));
        assert!(matches!(
            error_for_status(StatusCode::CONFLICT, body(Some("DUPLICATE_TXID"))),
            LedgerError::AlreadyApplied(_)
        ));
    }

    #[test]
    fn test_message_falls_back_to_reason_phrase() {
        let err = error_for_status(StatusCode::BAD_GATEWAY, GatewayErrorBody::default());
        assert_eq!(err, LedgerError::Unavailable("Bad Gateway".to_string()));
    }
}
