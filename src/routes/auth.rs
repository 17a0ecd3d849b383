use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::app_state::AppState;
use crate::routes::ApiError;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Tenant resolved from the `X-Api-Key` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant(pub String);

impl FromRequestParts<AppState> for Tenant {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let key = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;

        match state.api_keys.get(key) {
            Some(tenant_id) => Ok(Tenant(tenant_id.clone())),
            None => {
                tracing::warn!("Rejected request with unknown API key");
                Err(ApiError::Unauthorized)
            }
        }
    }
}
