use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::app_state::AppState;
use crate::models::job::{JobState, JobSummary};
use crate::routes::auth::Tenant;
use crate::routes::ApiError;

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    /// Comma-separated job states, e.g. `completed,failed`.
    pub state: Option<String>,
}

fn parse_states(raw: Option<&str>) -> Result<Vec<JobState>, ApiError> {
    raw.map(|states| {
        states
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                JobState::from_str(s).map_err(|_| ApiError::Validation(format!("unknown job state '{}'", s)))
            })
            .collect::<Result<Vec<_>, _>>()
    })
    .unwrap_or_else(|| Ok(Vec::new()))
}

/// GET /api/jobs - the caller's jobs across all (or the requested) states.
pub async fn list_jobs(
    State(state): State<AppState>,
    Tenant(tenant_id): Tenant,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobSummary>>, ApiError> {
    let states = parse_states(query.state.as_deref())?;
    Ok(Json(state.jobs.get_all_jobs(&tenant_id, &states).await?))
}

/// GET /api/jobs/{job_id}
pub async fn get_job(
    State(state): State<AppState>,
    Tenant(tenant_id): Tenant,
    Path(job_id): Path<String>,
) -> Result<Json<JobSummary>, ApiError> {
    Ok(Json(state.jobs.get_job(&tenant_id, &job_id).await?))
}
