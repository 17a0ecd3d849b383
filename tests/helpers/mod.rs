//! Shared harness for the queue and API integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;

use ledger_rest_queue::db::MemoryBackend;
use ledger_rest_queue::models::job::{Job, JobState};
use ledger_rest_queue::models::transaction::TransactionStatus;
use ledger_rest_queue::runtime::Runtime;
use ledger_rest_queue::services::ledger::{Invocation, Ledger, LedgerError, LedgerRegistry};
use ledger_rest_queue::services::queue::{BackoffPolicy, BackoffType, Queue, QueueSettings};
use ledger_rest_queue::services::scheduler::SchedulerSettings;
use ledger_rest_queue::services::worker::WorkerSettings;

pub const TENANT: &str = "Org1MSP";
pub const OTHER_TENANT: &str = "Org2MSP";

/// One observed submit or evaluate call.
#[derive(Debug, Clone)]
pub struct Call {
    pub invocation_id: Option<String>,
    pub operation: String,
    pub args: Vec<String>,
    pub at: Instant,
}

/// Ledger double that replays a script of outcomes, one per call, and answers
/// with `default` once the script runs out.
pub struct ScriptedLedger {
    script: Mutex<VecDeque<Result<Vec<u8>, LedgerError>>>,
    default: Result<Vec<u8>, LedgerError>,
    exactly_once: bool,
    latency: Duration,
    validation_code: String,
    panics_left: AtomicUsize,
    calls: Mutex<Vec<Call>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedLedger {
    pub fn succeeding(payload: &str) -> Self {
        Self::new(Vec::new(), Ok(payload.as_bytes().to_vec()))
    }

    pub fn failing(error: LedgerError) -> Self {
        Self::new(Vec::new(), Err(error))
    }

    pub fn new(script: Vec<Result<Vec<u8>, LedgerError>>, default: Result<Vec<u8>, LedgerError>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            default,
            exactly_once: true,
            latency: Duration::ZERO,
            validation_code: "VALID".to_string(),
            panics_left: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with_exactly_once(mut self, exactly_once: bool) -> Self {
        self.exactly_once = exactly_once;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Commit status reported for submitted invocations.
    pub fn with_validation_code(mut self, code: &str) -> Self {
        self.validation_code = code.to_string();
        self
    }

    /// Panic inside the first `count` calls instead of answering.
    pub fn panicking_first(self, count: usize) -> Self {
        self.panics_left.store(count, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Highest number of calls observed in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn answer(&self, invocation_id: Option<&str>, operation: &str, args: &[String]) -> Result<Vec<u8>, LedgerError> {
        self.calls.lock().unwrap().push(Call {
            invocation_id: invocation_id.map(str::to_string),
            operation: operation.to_string(),
            args: args.to_vec(),
            at: Instant::now(),
        });
        let panic_now = self
            .panics_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if panic_now {
            panic!("ledger client crashed during {operation}");
        }
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        self.running.fetch_sub(1, Ordering::SeqCst);
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait]
impl Ledger for ScriptedLedger {
    fn begin(&self, _operation: &str, _args: &[String]) -> Result<Invocation, LedgerError> {
        let id = Uuid::new_v4().simple().to_string();
        Ok(Invocation {
            checkpoint: id.as_bytes().to_vec(),
            id,
        })
    }

    fn resume(&self, checkpoint: &[u8]) -> Result<Invocation, LedgerError> {
        let id = String::from_utf8(checkpoint.to_vec())
            .map_err(|e| LedgerError::InvalidInvocation(e.to_string()))?;
        Ok(Invocation {
            id,
            checkpoint: checkpoint.to_vec(),
        })
    }

    async fn submit(&self, invocation: &Invocation, operation: &str, args: &[String]) -> Result<Vec<u8>, LedgerError> {
        self.answer(Some(&invocation.id), operation, args).await
    }

    async fn evaluate(&self, operation: &str, args: &[String]) -> Result<Vec<u8>, LedgerError> {
        self.answer(None, operation, args).await
    }

    async fn transaction_status(&self, invocation_id: &str) -> Result<TransactionStatus, LedgerError> {
        let known = self
            .calls
            .lock()
            .unwrap()
            .iter()
            .any(|call| call.invocation_id.as_deref() == Some(invocation_id));
        if !known {
            return Err(LedgerError::Rejected(format!("transaction {invocation_id} not found")));
        }
        Ok(TransactionStatus {
            transaction_id: invocation_id.to_string(),
            validation_code: self.validation_code.clone(),
            valid: self.validation_code == "VALID",
        })
    }

    fn exactly_once(&self) -> bool {
        self.exactly_once
    }
}

/// Queue settings tuned for tests: short stall timeout, millisecond backoff.
pub fn fast_settings() -> QueueSettings {
    QueueSettings {
        name: format!("test-{}", Uuid::new_v4().simple()),
        backoff: BackoffPolicy {
            kind: BackoffType::Fixed,
            delay: Duration::from_millis(5),
        },
        stall_timeout: Duration::from_millis(200),
        ..QueueSettings::default()
    }
}

pub fn memory_queue(settings: QueueSettings) -> Arc<Queue> {
    Arc::new(Queue::new(Arc::new(MemoryBackend::new()), settings))
}

pub fn registry(ledger: Arc<ScriptedLedger>) -> Arc<LedgerRegistry> {
    Arc::new(LedgerRegistry::new().with(TENANT, ledger))
}

pub fn worker_settings(concurrency: usize) -> WorkerSettings {
    WorkerSettings {
        concurrency,
        poll_interval: Duration::from_millis(5),
        drain_timeout: Duration::from_secs(2),
    }
}

pub fn scheduler_settings() -> SchedulerSettings {
    SchedulerSettings {
        enabled: true,
        poll_interval: Duration::from_millis(5),
    }
}

/// Worker and scheduler running against `queue`.
pub fn start_runtime(queue: Arc<Queue>, ledgers: Arc<LedgerRegistry>, concurrency: usize) -> Runtime {
    Runtime::start(queue, ledgers, worker_settings(concurrency), scheduler_settings())
}

/// Poll until the job reaches a terminal state.
pub async fn wait_for_terminal(queue: &Queue, tenant_id: &str, job_id: &str) -> Job {
    wait_for(queue, tenant_id, job_id, |job| job.state.is_terminal()).await
}

pub async fn wait_for(queue: &Queue, tenant_id: &str, job_id: &str, done: impl Fn(&Job) -> bool) -> Job {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let job = queue.get_job(tenant_id, job_id).await.expect("job exists");
        if done(&job) {
            return job;
        }
        assert!(
            Instant::now() < deadline,
            "job {job_id} stuck in {:?} after {} attempts",
            job.state,
            job.attempts_made
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn api_keys() -> HashMap<String, String> {
    HashMap::from([
        ("key-org1".to_string(), TENANT.to_string()),
        ("key-org2".to_string(), OTHER_TENANT.to_string()),
    ])
}

pub fn is_state(state: JobState) -> impl Fn(&Job) -> bool {
    move |job| job.state == state
}
