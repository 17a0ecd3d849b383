//! Background machinery around the queue: event sink, worker and scheduler,
//! started together and torn down in a fixed order.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::services::events;
use crate::services::ledger::LedgerRegistry;
use crate::services::queue::Queue;
use crate::services::scheduler::{Scheduler, SchedulerSettings};
use crate::services::worker::{Worker, WorkerSettings};

struct Stoppable {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Stoppable {
    fn spawn(start: impl FnOnce(watch::Receiver<bool>) -> JoinHandle<()>) -> Self {
        let (stop, rx) = watch::channel(false);
        Self {
            stop,
            handle: start(rx),
        }
    }

    async fn stop(self, name: &str) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            tracing::error!(component = name, error = %e, "Background task ended abnormally");
        }
    }
}

pub struct Runtime {
    queue: Arc<Queue>,
    sink: Stoppable,
    worker: Stoppable,
    scheduler: Option<Stoppable>,
}

impl Runtime {
    pub fn start(
        queue: Arc<Queue>,
        ledgers: Arc<LedgerRegistry>,
        worker: WorkerSettings,
        scheduler: SchedulerSettings,
    ) -> Self {
        let sink = {
            let rx = queue.events().subscribe();
            Stoppable::spawn(|stop| events::spawn_sink(rx, stop))
        };

        let worker = {
            let worker = Worker::new(queue.clone(), ledgers, worker);
            Stoppable::spawn(|stop| worker.spawn(stop))
        };

        let scheduler = if scheduler.enabled {
            let scheduler = Scheduler::new(queue.clone(), &scheduler);
            Some(Stoppable::spawn(|stop| scheduler.spawn(stop)))
        } else {
            tracing::warn!(
                "Scheduler disabled: delayed retries and stalled jobs only move if another \
                 process runs the scheduler on this queue"
            );
            None
        };

        Self {
            queue,
            sink,
            worker,
            scheduler,
        }
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Stop the scheduler, drain the worker, close the queue, then flush the
    /// event sink.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down queue runtime");
        if let Some(scheduler) = self.scheduler {
            scheduler.stop("scheduler").await;
        }
        self.worker.stop("worker").await;
        self.queue.close();
        self.sink.stop("event_sink").await;
        tracing::info!("Queue runtime stopped");
    }
}
