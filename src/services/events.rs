use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::models::job::JobId;
use crate::services::classifier::RetryAction;

const EVENT_CAPACITY: usize = 1024;

/// Job lifecycle notification published by the queue and worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Enqueued {
        job_id: JobId,
        tenant_id: String,
        name: String,
    },
    Completed {
        job_id: JobId,
        attempts: u32,
        elapsed_ms: u64,
    },
    Retrying {
        job_id: JobId,
        attempts: u32,
        action: RetryAction,
        delay_ms: u64,
        error: String,
    },
    Failed {
        job_id: JobId,
        attempts: u32,
        error: String,
    },
    Stalled {
        job_id: JobId,
        stalled_count: u32,
    },
    WorkerError {
        message: String,
    },
}

/// Broadcast channel for [`JobEvent`]s. Publishing never blocks and never
/// fails; events are dropped when nobody listens.
#[derive(Clone)]
pub struct JobEvents {
    tx: broadcast::Sender<JobEvent>,
}

impl Default for JobEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl JobEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: JobEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

/// Register metric descriptions exported on `/metrics`.
pub fn describe_metrics() {
    metrics::describe_counter!("ledger_jobs_enqueued_total", "Total jobs enqueued");
    metrics::describe_counter!("ledger_jobs_completed_total", "Total jobs completed");
    metrics::describe_counter!("ledger_jobs_failed_total", "Total jobs that ended failed");
    metrics::describe_counter!(
        "ledger_jobs_retried_total",
        "Total failed attempts scheduled for retry"
    );
    metrics::describe_counter!(
        "ledger_jobs_stalled_total",
        "Total jobs recovered from a stalled worker"
    );
    metrics::describe_counter!("ledger_worker_errors_total", "Worker-level faults");
    metrics::describe_histogram!(
        "ledger_job_attempt_seconds",
        "Time from claim to the outcome of an attempt"
    );
    metrics::describe_gauge!("ledger_queue_jobs", "Jobs currently held per queue state");
}

/// Consume events into metrics and structured logs until `shutdown` fires.
/// Events still buffered at shutdown are drained first.
pub fn spawn_sink(
    mut rx: broadcast::Receiver<JobEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(event) => record(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event sink lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    while let Ok(event) = rx.try_recv() {
                        record(&event);
                    }
                    break;
                }
            }
        }
        tracing::debug!("Event sink stopped");
    })
}

fn record(event: &JobEvent) {
    match event {
        JobEvent::Enqueued { job_id, tenant_id, name } => {
            metrics::counter!("ledger_jobs_enqueued_total").increment(1);
            tracing::debug!(job_id = %job_id, tenant_id = %tenant_id, name = %name, "Job enqueued");
        }
        JobEvent::Completed {
            job_id,
            attempts,
            elapsed_ms,
        } => {
            metrics::counter!("ledger_jobs_completed_total").increment(1);
            metrics::histogram!("ledger_job_attempt_seconds").record(*elapsed_ms as f64 / 1000.0);
            tracing::debug!(job_id = %job_id, attempts, "Job completed");
        }
        JobEvent::Retrying {
            job_id,
            action,
            delay_ms,
            ..
        } => {
            metrics::counter!("ledger_jobs_retried_total", "retry_action" => action.to_string())
                .increment(1);
            tracing::debug!(job_id = %job_id, retry_action = %action, delay_ms, "Job retry scheduled");
        }
        JobEvent::Failed { job_id, attempts, .. } => {
            metrics::counter!("ledger_jobs_failed_total").increment(1);
            tracing::debug!(job_id = %job_id, attempts, "Job failed");
        }
        JobEvent::Stalled {
            job_id,
            stalled_count,
        } => {
            metrics::counter!("ledger_jobs_stalled_total").increment(1);
            tracing::debug!(job_id = %job_id, stalled_count, "Job stalled");
        }
        JobEvent::WorkerError { message } => {
            metrics::counter!("ledger_worker_errors_total").increment(1);
            tracing::debug!(error = %message, "Worker error");
        }
    }
}
