use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use strum::Display;

use crate::db::{BackendError, QueueBackend};
use crate::models::job::{Job, JobData, JobId, JobResult, JobState};
use crate::services::classifier::RetryAction;
use crate::services::events::{JobEvent, JobEvents};

const STALLED_LIMIT_MESSAGE: &str = "job stalled more than allowable limit";

#[derive(Debug, Clone, Copy, Deserialize, Display, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BackoffType {
    /// Same delay before every retry.
    Fixed,
    /// Delay doubles with every failed attempt.
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub kind: BackoffType,
    pub delay: Duration,
}

impl BackoffPolicy {
    /// Delay before the retry that follows failed attempt number
    /// `attempts_made` (1-based).
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match self.kind {
            BackoffType::Fixed => self.delay,
            BackoffType::Exponential => {
                let factor = 2u32.saturating_pow(attempts_made.saturating_sub(1));
                self.delay.saturating_mul(factor)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub name: String,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Completed jobs kept before the oldest are evicted.
    pub max_completed: usize,
    pub max_failed: usize,
    /// How long a claimed job may go without a lock renewal before it is
    /// considered stalled.
    pub stall_timeout: Duration,
    pub max_stalled_count: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: "submit".to_string(),
            max_attempts: 5,
            backoff: BackoffPolicy {
                kind: BackoffType::Fixed,
                delay: Duration::from_millis(3000),
            },
            max_completed: 1000,
            max_failed: 1000,
            stall_timeout: Duration::from_secs(30),
            max_stalled_count: 1,
        }
    }
}

/// Persisted job queue for one topic. Owns the job state machine; the
/// backend only provides atomic primitives.
pub struct Queue {
    backend: Arc<dyn QueueBackend>,
    settings: QueueSettings,
    events: JobEvents,
    closed: AtomicBool,
}

impl Queue {
    pub fn new(backend: Arc<dyn QueueBackend>, settings: QueueSettings) -> Self {
        Self {
            backend,
            settings,
            events: JobEvents::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn events(&self) -> &JobEvents {
        &self.events
    }

    /// Persist a new job in `waiting` and return its id.
    pub async fn enqueue(&self, data: JobData) -> Result<JobId, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        let job = Job::new(data);
        self.backend.save(&job).await?;
        self.backend.push_waiting(&job.id).await?;

        self.events.emit(JobEvent::Enqueued {
            job_id: job.id.clone(),
            tenant_id: job.data.tenant_id.clone(),
            name: job.name.clone(),
        });
        Ok(job.id)
    }

    /// Fetch a job owned by `tenant_id`. Jobs of other tenants are reported
    /// as missing.
    pub async fn get_job(&self, tenant_id: &str, id: &str) -> Result<Job, QueueError> {
        match self.backend.load(id).await? {
            Some(job) if job.belongs_to(tenant_id) => Ok(job),
            _ => Err(QueueError::NotFound(id.to_string())),
        }
    }

    /// Jobs owned by `tenant_id` in any of `states` (every state when empty).
    pub async fn list_jobs(&self, tenant_id: &str, states: &[JobState]) -> Result<Vec<Job>, QueueError> {
        let states = if states.is_empty() { &JobState::ALL[..] } else { states };
        let mut seen = HashSet::new();
        let mut jobs = Vec::new();
        for state in states {
            for id in self.backend.ids(*state).await? {
                if !seen.insert(id.clone()) {
                    continue;
                }
                if let Some(job) = self.backend.load(&id).await? {
                    if job.belongs_to(tenant_id) {
                        jobs.push(job);
                    }
                }
            }
        }
        Ok(jobs)
    }

    /// Queue-wide job counts per state.
    pub async fn counts(&self, states: &[JobState]) -> Result<HashMap<JobState, u64>, QueueError> {
        let mut counts = HashMap::new();
        for state in states {
            counts.insert(*state, self.backend.count(*state).await?);
        }
        Ok(counts)
    }

    /// Claim the next waiting job, moving it to `active` under a lock that
    /// expires after the stall timeout unless renewed.
    pub async fn claim(&self) -> Result<Option<Job>, QueueError> {
        if self.is_closed() {
            return Ok(None);
        }
        loop {
            let Some(id) = self.backend.claim(self.lock_deadline()).await? else {
                return Ok(None);
            };
            let mut job = match self.backend.load(&id).await? {
                Some(job) if !job.state.is_terminal() => job,
                _ => {
                    // Evicted or already finished by an earlier delivery.
                    tracing::warn!(job_id = %id, "Dropping stale queue entry");
                    self.backend.release(&id).await?;
                    continue;
                }
            };
            job.state = JobState::Active;
            job.processed_at = Some(Utc::now());
            job.ready_at = None;
            self.backend.save(&job).await?;
            return Ok(Some(job));
        }
    }

    /// Renew the lock of an active job. Returns false once the lock is gone.
    pub async fn extend_lock(&self, id: &str) -> Result<bool, QueueError> {
        Ok(self.backend.renew_lock(id, self.lock_deadline()).await?)
    }

    /// Write back data changed by the worker (invocation bookkeeping) before
    /// the attempt runs. Fails with `LockLost` once the job has been taken
    /// away from the caller, leaving the recovered record untouched.
    pub async fn update_data(&self, job: &Job) -> Result<(), QueueError> {
        if !self.backend.renew_lock(&job.id, self.lock_deadline()).await? {
            return Err(QueueError::LockLost(job.id.clone()));
        }
        self.backend.save(job).await?;
        Ok(())
    }

    /// Record a successful attempt and store the job as completed.
    pub async fn complete(&self, mut job: Job, result: JobResult) -> Result<Job, QueueError> {
        self.release(&job).await?;
        job.attempts_made += 1;
        job.state = JobState::Completed;
        job.result = Some(result);
        self.store_terminal(&mut job).await?;

        self.events.emit(JobEvent::Completed {
            job_id: job.id.clone(),
            attempts: job.attempts_made,
            elapsed_ms: elapsed_ms(&job),
        });
        Ok(job)
    }

    /// Fail a job permanently, whatever attempts remain.
    pub async fn fail(&self, mut job: Job, error: &str) -> Result<Job, QueueError> {
        self.release(&job).await?;
        job.attempts_made += 1;
        self.fail_released(job, error).await
    }

    /// Record a retryable failure. The job is parked in `delayed` for the
    /// backoff period, or fails when the attempt limit is reached.
    pub async fn retry(&self, mut job: Job, action: RetryAction, error: &str) -> Result<Job, QueueError> {
        self.release(&job).await?;
        job.attempts_made += 1;
        if job.attempts_made >= self.settings.max_attempts {
            return self.fail_released(job, error).await;
        }

        let delay = self.settings.backoff.delay_for(job.attempts_made);
        let ready_at = now_ms().saturating_add(delay.as_millis() as i64);
        job.state = JobState::Delayed;
        job.ready_at = DateTime::from_timestamp_millis(ready_at);
        self.backend.save(&job).await?;
        self.backend.schedule(&job.id, ready_at).await?;

        self.events.emit(JobEvent::Retrying {
            job_id: job.id.clone(),
            attempts: job.attempts_made,
            action,
            delay_ms: delay.as_millis() as u64,
            error: error.to_string(),
        });
        Ok(job)
    }

    /// Move delayed jobs whose backoff has elapsed back to `waiting`.
    pub async fn promote_due(&self) -> Result<usize, QueueError> {
        let mut promoted = 0;
        for id in self.backend.take_due(now_ms()).await? {
            let Some(mut job) = self.backend.load(&id).await? else {
                continue;
            };
            job.state = JobState::Waiting;
            job.ready_at = None;
            self.backend.save(&job).await?;
            self.backend.push_waiting(&job.id).await?;
            promoted += 1;
        }
        Ok(promoted)
    }

    /// Return jobs whose lock expired to `waiting`. A job stalled more than
    /// `max_stalled_count` times fails instead.
    pub async fn recover_stalled(&self) -> Result<usize, QueueError> {
        let mut recovered = 0;
        for id in self.backend.take_stalled(now_ms()).await? {
            let Some(mut job) = self.backend.load(&id).await? else {
                continue;
            };
            if job.state.is_terminal() {
                continue;
            }
            job.stalled_count += 1;
            tracing::warn!(
                job_id = %job.id,
                stalled_count = job.stalled_count,
                "Job lock expired, worker presumed dead"
            );
            self.events.emit(JobEvent::Stalled {
                job_id: job.id.clone(),
                stalled_count: job.stalled_count,
            });

            if job.stalled_count > self.settings.max_stalled_count {
                self.fail_released(job, STALLED_LIMIT_MESSAGE).await?;
            } else {
                job.state = JobState::Waiting;
                self.backend.save(&job).await?;
                self.backend.push_waiting(&job.id).await?;
            }
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Round trip to the backend, for health checks.
    pub async fn ping(&self) -> Result<(), QueueError> {
        Ok(self.backend.ping().await?)
    }

    /// Stop handing out jobs and accepting new ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Whether [`Queue::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn release(&self, job: &Job) -> Result<(), QueueError> {
        if self.backend.release(&job.id).await? {
            Ok(())
        } else {
            Err(QueueError::LockLost(job.id.clone()))
        }
    }

    async fn fail_released(&self, mut job: Job, error: &str) -> Result<Job, QueueError> {
        job.state = JobState::Failed;
        job.result = Some(JobResult::failure(error));
        self.store_terminal(&mut job).await?;

        self.events.emit(JobEvent::Failed {
            job_id: job.id.clone(),
            attempts: job.attempts_made,
            error: error.to_string(),
        });
        Ok(job)
    }

    async fn store_terminal(&self, job: &mut Job) -> Result<Vec<JobId>, QueueError> {
        let finished_at = Utc::now();
        job.finished_at = Some(finished_at);
        job.ready_at = None;
        self.backend.save(job).await?;

        let keep = match job.state {
            JobState::Failed => self.settings.max_failed,
            _ => self.settings.max_completed,
        };
        let evicted = self
            .backend
            .finish(job.state, &job.id, finished_at.timestamp_millis(), keep)
            .await?;
        if !evicted.is_empty() {
            tracing::debug!(state = %job.state, evicted = evicted.len(), "Evicted old jobs");
        }
        Ok(evicted)
    }

    fn lock_deadline(&self) -> i64 {
        now_ms().saturating_add(self.settings.stall_timeout.as_millis() as i64)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn elapsed_ms(job: &Job) -> u64 {
    job.processed_at
        .map(|started| (Utc::now() - started).num_milliseconds().max(0) as u64)
        .unwrap_or_default()
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Job {0} not found")]
    NotFound(JobId),

    /// The job was recovered as stalled and handed to another worker.
    #[error("Lock for job {0} was lost")]
    LockLost(JobId),

    #[error("Queue is closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryBackend;

    fn queue_with(settings: QueueSettings) -> Queue {
        Queue::new(Arc::new(MemoryBackend::new()), settings)
    }

    fn data(tenant: &str) -> JobData {
        JobData::new(tenant, "CreateAsset", true, vec!["asset1".to_string()]).unwrap()
    }

    #[test]
    fn test_fixed_backoff_is_constant() {
        let policy = BackoffPolicy {
            kind: BackoffType::Fixed,
            delay: Duration::from_millis(3000),
        };
        for attempt in 1..=4 {
            assert_eq!(policy.delay_for(attempt), Duration::from_millis(3000));
        }
    }

    #[test]
    fn test_exponential_backoff_doubles() {
        let policy = BackoffPolicy {
            kind: BackoffType::Exponential,
            delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert!(policy.delay_for(200) >= policy.delay_for(100));
    }

    #[tokio::test]
    async fn test_reads_are_tenant_scoped() {
        let queue = queue_with(QueueSettings::default());
        let id = queue.enqueue(data("Org1MSP")).await.unwrap();
        queue.enqueue(data("Org2MSP")).await.unwrap();

        assert_eq!(queue.get_job("Org1MSP", &id).await.unwrap().id, id);
        assert!(matches!(
            queue.get_job("Org2MSP", &id).await,
            Err(QueueError::NotFound(_))
        ));
        assert!(matches!(
            queue.get_job("Org1MSP", "missing").await,
            Err(QueueError::NotFound(_))
        ));

        let listed = queue.list_jobs("Org1MSP", &[]).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert!(queue
            .list_jobs("Org1MSP", &[JobState::Completed])
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_claim_complete_cycle() {
        let queue = queue_with(QueueSettings::default());
        let id = queue.enqueue(data("Org1MSP")).await.unwrap();

        let job = queue.claim().await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.state, JobState::Active);
        assert!(queue.claim().await.unwrap().is_none());

        let done = queue.complete(job, JobResult::success("{}")).await.unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.attempts_made, 1);

        let counts = queue.counts(&JobState::ALL).await.unwrap();
        assert_eq!(counts[&JobState::Completed], 1);
        assert_eq!(counts[&JobState::Active], 0);
        assert!(queue.get_job("Org1MSP", &id).await.unwrap().finished_at.is_some());
    }

    #[tokio::test]
    async fn test_retry_delays_until_attempts_exhausted() {
        let queue = queue_with(QueueSettings {
            max_attempts: 2,
            backoff: BackoffPolicy {
                kind: BackoffType::Fixed,
                delay: Duration::ZERO,
            },
            ..QueueSettings::default()
        });
        queue.enqueue(data("Org1MSP")).await.unwrap();

        let job = queue.claim().await.unwrap().unwrap();
        let job = queue
            .retry(job, RetryAction::SameInvocation, "timeout")
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert!(job.result.is_none());

        assert_eq!(queue.promote_due().await.unwrap(), 1);
        let job = queue.claim().await.unwrap().unwrap();
        let job = queue
            .retry(job, RetryAction::SameInvocation, "timeout again")
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_made, 2);
        assert_eq!(
            job.result.unwrap().error_message.as_deref(),
            Some("timeout again")
        );
    }

    #[tokio::test]
    async fn test_finishing_after_lock_loss_is_rejected() {
        let queue = queue_with(QueueSettings {
            stall_timeout: Duration::from_millis(1),
            ..QueueSettings::default()
        });
        queue.enqueue(data("Org1MSP")).await.unwrap();
        let job = queue.claim().await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(queue.recover_stalled().await.unwrap(), 1);
        assert!(!queue.extend_lock(&job.id).await.unwrap());
        assert!(matches!(
            queue.complete(job, JobResult::success("late")).await,
            Err(QueueError::LockLost(_))
        ));

        let redelivered = queue.claim().await.unwrap().unwrap();
        assert_eq!(redelivered.stalled_count, 1);
        assert_eq!(redelivered.attempts_made, 0);
    }

    #[tokio::test]
    async fn test_update_after_lock_loss_keeps_recovered_record() {
        let queue = queue_with(QueueSettings {
            stall_timeout: Duration::from_millis(1),
            ..QueueSettings::default()
        });
        let id = queue.enqueue(data("Org1MSP")).await.unwrap();
        let mut job = queue.claim().await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(queue.recover_stalled().await.unwrap(), 1);

        job.data.record_invocation("inv-1", b"inv-1".to_vec());
        assert!(matches!(
            queue.update_data(&job).await,
            Err(QueueError::LockLost(_))
        ));

        let stored = queue.get_job("Org1MSP", &id).await.unwrap();
        assert_eq!(stored.state, JobState::Waiting);
        assert_eq!(stored.stalled_count, 1);
        assert!(stored.data.invocation_ids.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_stalls_fail_the_job() {
        let queue = queue_with(QueueSettings {
            stall_timeout: Duration::from_millis(1),
            max_stalled_count: 0,
            ..QueueSettings::default()
        });
        let id = queue.enqueue(data("Org1MSP")).await.unwrap();
        queue.claim().await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        queue.recover_stalled().await.unwrap();
        let job = queue.get_job("Org1MSP", &id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(
            job.result.unwrap().error_message.as_deref(),
            Some(STALLED_LIMIT_MESSAGE)
        );
    }

    #[tokio::test]
    async fn test_retention_cap_evicts_oldest() {
        let queue = queue_with(QueueSettings {
            max_completed: 2,
            ..QueueSettings::default()
        });
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = queue.enqueue(data("Org1MSP")).await.unwrap();
            let job = queue.claim().await.unwrap().unwrap();
            queue.complete(job, JobResult::success("ok")).await.unwrap();
            ids.push(id);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert!(matches!(
            queue.get_job("Org1MSP", &ids[0]).await,
            Err(QueueError::NotFound(_))
        ));
        assert!(queue.get_job("Org1MSP", &ids[2]).await.is_ok());
        assert_eq!(queue.counts(&[JobState::Completed]).await.unwrap()[&JobState::Completed], 2);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_enqueue_and_claim() {
        let queue = queue_with(QueueSettings::default());
        queue.enqueue(data("Org1MSP")).await.unwrap();
        queue.close();
        assert!(matches!(queue.enqueue(data("Org1MSP")).await, Err(QueueError::Closed)));
        assert!(queue.claim().await.unwrap().is_none());
    }
}
