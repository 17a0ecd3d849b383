use std::collections::{BTreeSet, HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{BackendError, QueueBackend};
use crate::models::job::{Job, JobId, JobState};

/// Sorted set keyed by (score, id), mirroring a Redis ZSET.
#[derive(Default)]
struct ScoredSet {
    scores: HashMap<JobId, i64>,
    ordered: BTreeSet<(i64, JobId)>,
}

impl ScoredSet {
    fn insert(&mut self, id: &str, score: i64) {
        if let Some(old) = self.scores.insert(id.to_string(), score) {
            self.ordered.remove(&(old, id.to_string()));
        }
        self.ordered.insert((score, id.to_string()));
    }

    fn remove(&mut self, id: &str) -> bool {
        match self.scores.remove(id) {
            Some(score) => {
                self.ordered.remove(&(score, id.to_string()));
                true
            }
            None => false,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.scores.contains_key(id)
    }

    fn take_upto(&mut self, max: i64) -> Vec<JobId> {
        let due: Vec<JobId> = self
            .ordered
            .iter()
            .take_while(|(score, _)| *score <= max)
            .map(|(_, id)| id.clone())
            .collect();
        for id in &due {
            self.remove(id);
        }
        due
    }

    /// Drop the lowest-scored entries until `keep` remain.
    fn trim(&mut self, keep: usize) -> Vec<JobId> {
        let excess = self.ordered.len().saturating_sub(keep);
        let evicted: Vec<JobId> = self
            .ordered
            .iter()
            .take(excess)
            .map(|(_, id)| id.clone())
            .collect();
        for id in &evicted {
            self.remove(id);
        }
        evicted
    }

    fn ids(&self) -> Vec<JobId> {
        self.ordered.iter().map(|(_, id)| id.clone()).collect()
    }

    fn len(&self) -> usize {
        self.ordered.len()
    }
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    waiting: VecDeque<JobId>,
    active: ScoredSet,
    delayed: ScoredSet,
    completed: ScoredSet,
    failed: ScoredSet,
}

impl Inner {
    fn scored(&mut self, state: JobState) -> Option<&mut ScoredSet> {
        match state {
            JobState::Waiting => None,
            JobState::Active => Some(&mut self.active),
            JobState::Delayed => Some(&mut self.delayed),
            JobState::Completed => Some(&mut self.completed),
            JobState::Failed => Some(&mut self.failed),
        }
    }
}

/// In-process backend for development and tests. Not crash tolerant and not
/// shared across processes.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn save(&self, job: &Job) -> Result<(), BackendError> {
        self.inner.lock().await.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Job>, BackendError> {
        Ok(self.inner.lock().await.jobs.get(id).cloned())
    }

    async fn push_waiting(&self, id: &str) -> Result<(), BackendError> {
        self.inner.lock().await.waiting.push_back(id.to_string());
        Ok(())
    }

    async fn claim(&self, lock_until: i64) -> Result<Option<JobId>, BackendError> {
        let mut inner = self.inner.lock().await;
        let id = inner.waiting.pop_front();
        if let Some(id) = &id {
            inner.active.insert(id, lock_until);
        }
        Ok(id)
    }

    async fn renew_lock(&self, id: &str, lock_until: i64) -> Result<bool, BackendError> {
        let mut inner = self.inner.lock().await;
        if !inner.active.contains(id) {
            return Ok(false);
        }
        inner.active.insert(id, lock_until);
        Ok(true)
    }

    async fn release(&self, id: &str) -> Result<bool, BackendError> {
        Ok(self.inner.lock().await.active.remove(id))
    }

    async fn schedule(&self, id: &str, ready_at: i64) -> Result<(), BackendError> {
        self.inner.lock().await.delayed.insert(id, ready_at);
        Ok(())
    }

    async fn take_due(&self, now: i64) -> Result<Vec<JobId>, BackendError> {
        Ok(self.inner.lock().await.delayed.take_upto(now))
    }

    async fn take_stalled(&self, now: i64) -> Result<Vec<JobId>, BackendError> {
        // Locks expiring exactly at `now` are still held.
        Ok(self.inner.lock().await.active.take_upto(now - 1))
    }

    async fn finish(
        &self,
        state: JobState,
        id: &str,
        finished_at: i64,
        keep: usize,
    ) -> Result<Vec<JobId>, BackendError> {
        let mut inner = self.inner.lock().await;
        let evicted = match inner.scored(state) {
            Some(set) => {
                set.insert(id, finished_at);
                set.trim(keep)
            }
            None => Vec::new(),
        };
        for evicted_id in &evicted {
            inner.jobs.remove(evicted_id);
        }
        Ok(evicted)
    }

    async fn ids(&self, state: JobState) -> Result<Vec<JobId>, BackendError> {
        let mut inner = self.inner.lock().await;
        if state == JobState::Waiting {
            return Ok(inner.waiting.iter().cloned().collect());
        }
        Ok(inner.scored(state).map(|set| set.ids()).unwrap_or_default())
    }

    async fn count(&self, state: JobState) -> Result<u64, BackendError> {
        let mut inner = self.inner.lock().await;
        if state == JobState::Waiting {
            return Ok(inner.waiting.len() as u64);
        }
        Ok(inner.scored(state).map(|set| set.len()).unwrap_or_default() as u64)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }
}
