use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};
use tracing::Instrument;

use crate::models::job::{Job, JobResult, JobState};
use crate::services::classifier::{classify, RetryAction};
use crate::services::events::JobEvent;
use crate::services::ledger::{Ledger, LedgerError, LedgerRegistry};
use crate::services::queue::{Queue, QueueError};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Jobs executed at the same time by this process.
    pub concurrency: usize,
    /// Sleep between claims when the queue is empty.
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight jobs.
    pub drain_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_millis(1000),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Pulls jobs from the queue and executes them against the tenant's ledger,
/// at most `concurrency` at a time.
pub struct Worker {
    executor: Arc<Executor>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(queue: Arc<Queue>, ledgers: Arc<LedgerRegistry>, settings: WorkerSettings) -> Self {
        Self {
            executor: Arc::new(Executor { queue, ledgers }),
            settings,
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Claim loop. Returns once `shutdown` fires and in-flight jobs have
    /// drained (or the drain timeout passed).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let slots = Arc::new(Semaphore::new(self.settings.concurrency));
        let mut in_flight = JoinSet::new();
        let queue = self.executor.queue.clone();

        tracing::info!(concurrency = self.settings.concurrency, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            match queue.claim().await {
                Ok(Some(job)) => {
                    let executor = self.executor.clone();
                    in_flight.spawn(async move {
                        executor.process(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tracing::trace!("No jobs available, sleeping");
                    idle(self.settings.poll_interval, &mut shutdown).await;
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(error = %e, "Error claiming job, will retry");
                    queue.events().emit(JobEvent::WorkerError {
                        message: e.to_string(),
                    });
                    idle(self.settings.poll_interval, &mut shutdown).await;
                }
            }

            while let Some(finished) = in_flight.try_join_next() {
                self.report_task(finished);
            }
        }

        tracing::info!(in_flight = in_flight.len(), "Worker stopping, draining in-flight jobs");
        let drained = timeout(self.settings.drain_timeout, async {
            while let Some(finished) = in_flight.join_next().await {
                self.report_task(finished);
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                remaining = in_flight.len(),
                "Drain timed out, abandoning in-flight jobs to stall recovery"
            );
            in_flight.abort_all();
        }
        tracing::info!("Worker stopped");
    }

    fn report_task(&self, finished: Result<(), JoinError>) {
        if let Err(e) = finished {
            if e.is_panic() {
                tracing::error!(error = %e, "Job task panicked");
                self.executor.queue.events().emit(JobEvent::WorkerError {
                    message: e.to_string(),
                });
            }
        }
    }
}

async fn idle(period: Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = sleep(period) => {}
        _ = shutdown.changed() => {}
    }
}

enum AttemptError {
    Ledger(LedgerError),
    Queue(QueueError),
}

impl From<LedgerError> for AttemptError {
    fn from(err: LedgerError) -> Self {
        AttemptError::Ledger(err)
    }
}

impl From<QueueError> for AttemptError {
    fn from(err: QueueError) -> Self {
        AttemptError::Queue(err)
    }
}

/// Executes one claimed job and reports the outcome to the queue.
struct Executor {
    queue: Arc<Queue>,
    ledgers: Arc<LedgerRegistry>,
}

impl Executor {
    async fn process(&self, job: Job) {
        let span = tracing::info_span!(
            "job",
            job_id = %job.id,
            attempt = job.attempts_made + 1,
            tenant_id = %job.data.tenant_id,
        );
        async move {
            tracing::info!(name = %job.name, is_write = job.data.is_write, "Processing job");
            let job_id = job.id.clone();

            match self.keep_locked(&job_id, self.execute(job)).await {
                Ok(job) => match job.state {
                    JobState::Completed => tracing::info!("Job completed successfully"),
                    JobState::Delayed => tracing::info!(
                        attempts = job.attempts_made,
                        ready_at = ?job.ready_at,
                        "Job scheduled for retry"
                    ),
                    _ => tracing::warn!(
                        attempts = job.attempts_made,
                        error = job.result.as_ref().and_then(|r| r.error_message.as_deref()),
                        "Job failed"
                    ),
                },
                Err(QueueError::LockLost(_)) => {
                    tracing::warn!("Job lock lost, outcome dropped in favour of re-delivery");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to record job outcome");
                    self.queue.events().emit(JobEvent::WorkerError {
                        message: e.to_string(),
                    });
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Drive `work` while renewing the job lock at half the stall timeout.
    async fn keep_locked<F: Future>(&self, job_id: &str, work: F) -> F::Output {
        let period = (self.queue.settings().stall_timeout / 2).max(Duration::from_millis(1));
        let mut renew = tokio::time::interval(period);
        renew.tick().await;
        tokio::pin!(work);
        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = renew.tick() => match self.queue.extend_lock(job_id).await {
                    Ok(true) => {}
                    Ok(false) => tracing::warn!("Job lock no longer held"),
                    Err(e) => tracing::warn!(error = %e, "Failed to renew job lock"),
                },
            }
        }
    }

    async fn execute(&self, mut job: Job) -> Result<Job, QueueError> {
        let Some(ledger) = self.ledgers.resolve(&job.data.tenant_id) else {
            let message = format!("no ledger binding for tenant {}", job.data.tenant_id);
            tracing::error!("{}", message);
            return self.queue.fail(job, &message).await;
        };

        let outcome = if job.data.is_write {
            self.submit(ledger.as_ref(), &mut job).await
        } else {
            ledger
                .evaluate(&job.data.operation_name, &job.data.arguments)
                .await
                .map_err(AttemptError::from)
        };

        let err = match outcome {
            Ok(payload) => {
                let payload = String::from_utf8_lossy(&payload).into_owned();
                return self.queue.complete(job, JobResult::success(payload)).await;
            }
            Err(AttemptError::Queue(e)) => return Err(e),
            Err(AttemptError::Ledger(err)) => err,
        };

        // Re-running a read is always safe.
        let exactly_once = ledger.exactly_once() || !job.data.is_write;
        let action = classify(&err, exactly_once);
        tracing::warn!(error = %err, retry_action = %action, "Ledger call failed");

        if !action.is_retry() {
            return self.queue.fail(job, &err.to_string()).await;
        }
        if action == RetryAction::NewInvocation {
            job.data.clear_saved_state();
        }
        self.queue.retry(job, action, &err.to_string()).await
    }

    /// Submit a write, resuming the saved invocation when there is one. The
    /// invocation is written back to the queue before the ledger sees it.
    ///
    /// A resumed invocation the ledger reports as already applied is settled
    /// from its commit status: a valid commit completes the job with that
    /// status as payload, an invalidated one asks for a new invocation.
    async fn submit(&self, ledger: &dyn Ledger, job: &mut Job) -> Result<Vec<u8>, AttemptError> {
        let (invocation, resumed) = match job.data.saved_state.as_deref() {
            Some(checkpoint) => (ledger.resume(checkpoint)?, true),
            None => (ledger.begin(&job.data.operation_name, &job.data.arguments)?, false),
        };
        job.data
            .record_invocation(&invocation.id, invocation.checkpoint.clone());
        self.queue.update_data(job).await?;

        tracing::debug!(invocation_id = %invocation.id, resumed, "Submitting transaction");
        match ledger
            .submit(&invocation, &job.data.operation_name, &job.data.arguments)
            .await
        {
            Err(LedgerError::AlreadyApplied(reason)) if resumed => {
                tracing::info!(
                    invocation_id = %invocation.id,
                    %reason,
                    "Invocation already applied, checking commit status"
                );
                settle_applied(ledger, &invocation.id).await
            }
            outcome => Ok(outcome?),
        }
    }
}

async fn settle_applied(ledger: &dyn Ledger, invocation_id: &str) -> Result<Vec<u8>, AttemptError> {
    let status = ledger.transaction_status(invocation_id).await?;
    if !status.valid {
        return Err(LedgerError::InvalidInvocation(format!(
            "invocation {} committed as {}",
            invocation_id, status.validation_code
        ))
        .into());
    }
    serde_json::to_vec(&status)
        .map_err(|e| LedgerError::Unknown(format!("cannot encode commit status: {}", e)).into())
}
