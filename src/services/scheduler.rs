//! Periodic queue maintenance.
//!
//! Delayed jobs only return to `waiting` and stalled jobs only get re-delivered
//! while some process runs a scheduler against the queue. Disabling it in one
//! deployment is fine as long as another process sharing the queue keeps it on;
//! with none running, retries silently stop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::models::job::JobState;
use crate::services::queue::Queue;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub poll_interval: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_millis(1000),
        }
    }
}

pub struct Scheduler {
    queue: Arc<Queue>,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(queue: Arc<Queue>, settings: &SchedulerSettings) -> Self {
        Self {
            queue,
            poll_interval: settings.poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(poll_interval_ms = self.poll_interval.as_millis() as u64, "Scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("Scheduler stopped");
    }

    /// One maintenance pass: promote due jobs, recover stalled ones, refresh
    /// queue gauges. Errors are logged and retried on the next tick.
    pub async fn tick(&self) {
        match self.queue.promote_due().await {
            Ok(0) => {}
            Ok(promoted) => tracing::debug!(promoted, "Promoted delayed jobs"),
            Err(e) => tracing::error!(error = %e, "Failed to promote delayed jobs"),
        }

        match self.queue.recover_stalled().await {
            Ok(0) => {}
            Ok(recovered) => tracing::warn!(recovered, "Recovered stalled jobs"),
            Err(e) => tracing::error!(error = %e, "Failed to recover stalled jobs"),
        }

        match self.queue.counts(&JobState::ALL).await {
            Ok(counts) => {
                for (state, count) in counts {
                    metrics::gauge!("ledger_queue_jobs", "state" => state.to_string()).set(count as f64);
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to read queue counts"),
        }
    }
}
