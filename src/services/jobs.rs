use std::sync::Arc;

use crate::models::job::{JobState, JobSummary};
use crate::services::queue::{Queue, QueueError};

/// Tenant-scoped read model over the queue.
#[derive(Clone)]
pub struct JobQueryService {
    queue: Arc<Queue>,
}

impl JobQueryService {
    pub fn new(queue: Arc<Queue>) -> Self {
        Self { queue }
    }

    /// Every job owned by `tenant_id`, optionally limited to `states`.
    pub async fn get_all_jobs(
        &self,
        tenant_id: &str,
        states: &[JobState],
    ) -> Result<Vec<JobSummary>, QueueError> {
        let jobs = self.queue.list_jobs(tenant_id, states).await?;
        Ok(jobs.iter().map(JobSummary::from).collect())
    }

    /// One job, or `QueueError::NotFound` when it is missing or owned by
    /// another tenant.
    pub async fn get_job(&self, tenant_id: &str, job_id: &str) -> Result<JobSummary, QueueError> {
        let job = self.queue.get_job(tenant_id, job_id).await?;
        Ok(JobSummary::from(&job))
    }
}
