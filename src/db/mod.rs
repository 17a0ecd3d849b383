//! Durable storage behind the job queue.
//!
//! Each backend method is atomic on its own; the queue composes them into the
//! job state machine. Timestamps are unix milliseconds.

use async_trait::async_trait;

use crate::models::job::{Job, JobId, JobState};

pub mod memory_store;
pub mod redis_store;

pub use memory_store::MemoryBackend;
pub use redis_store::RedisBackend;

#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Insert or overwrite a job record.
    async fn save(&self, job: &Job) -> Result<(), BackendError>;

    async fn load(&self, id: &str) -> Result<Option<Job>, BackendError>;

    /// Append to the tail of the waiting list.
    async fn push_waiting(&self, id: &str) -> Result<(), BackendError>;

    /// Move the oldest waiting id into the active set, locked until
    /// `lock_until`.
    async fn claim(&self, lock_until: i64) -> Result<Option<JobId>, BackendError>;

    /// Extend an active lock. Returns false if the id is no longer active.
    async fn renew_lock(&self, id: &str, lock_until: i64) -> Result<bool, BackendError>;

    /// Remove an id from the active set. Returns false if it was not there,
    /// which means the lock was lost to stall recovery.
    async fn release(&self, id: &str) -> Result<bool, BackendError>;

    /// Park an id in the delayed set until `ready_at`.
    async fn schedule(&self, id: &str, ready_at: i64) -> Result<(), BackendError>;

    /// Remove and return delayed ids whose time is `<= now`.
    async fn take_due(&self, now: i64) -> Result<Vec<JobId>, BackendError>;

    /// Remove and return active ids whose lock expired before `now`.
    async fn take_stalled(&self, now: i64) -> Result<Vec<JobId>, BackendError>;

    /// Record a terminal job and trim its set to the newest `keep` entries.
    /// Returns the evicted ids.
    async fn finish(
        &self,
        state: JobState,
        id: &str,
        finished_at: i64,
        keep: usize,
    ) -> Result<Vec<JobId>, BackendError>;

    /// Ids currently held in the set for `state`, oldest first.
    async fn ids(&self, state: JobState) -> Result<Vec<JobId>, BackendError>;

    async fn count(&self, state: JobState) -> Result<u64, BackendError>;

    async fn ping(&self) -> Result<(), BackendError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
