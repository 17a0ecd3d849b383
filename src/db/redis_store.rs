use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};

use super::{BackendError, QueueBackend};
use crate::models::job::{Job, JobId, JobState};

/// Pop the oldest waiting id and lock it in the active set.
const CLAIM_SCRIPT: &str = r#"
local id = redis.call('RPOP', KEYS[1])
if id then
  redis.call('ZADD', KEYS[2], ARGV[1], id)
end
return id
"#;

/// Remove and return members scored up to ARGV[1].
const TAKE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1000)
if #ids > 0 then
  redis.call('ZREM', KEYS[1], unpack(ids))
end
return ids
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[2]) then
  redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
  return 1
end
return 0
"#;

/// Add a finished id and evict the oldest entries (and their records) beyond
/// the retention cap.
const FINISH_SCRIPT: &str = r#"
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
local excess = redis.call('ZCARD', KEYS[1]) - tonumber(ARGV[3])
local evicted = {}
if excess > 0 then
  evicted = redis.call('ZRANGE', KEYS[1], 0, excess - 1)
  redis.call('ZREMRANGEBYRANK', KEYS[1], 0, excess - 1)
  for _, id in ipairs(evicted) do
    redis.call('DEL', ARGV[4] .. id)
  end
end
return evicted
"#;

/// Redis-backed queue store shared by every API and worker process.
pub struct RedisBackend {
    conn: MultiplexedConnection,
    prefix: String,
    claim_script: Script,
    take_script: Script,
    renew_script: Script,
    finish_script: Script,
}

impl RedisBackend {
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, BackendError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            prefix: format!("ledger_queue:{}", queue_name),
            claim_script: Script::new(CLAIM_SCRIPT),
            take_script: Script::new(TAKE_SCRIPT),
            renew_script: Script::new(RENEW_SCRIPT),
            finish_script: Script::new(FINISH_SCRIPT),
        })
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn state_key(&self, state: JobState) -> String {
        format!("{}:{}", self.prefix, state)
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn save(&self, job: &Job) -> Result<(), BackendError> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(self.job_key(&job.id), payload).await?;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Job>, BackendError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(self.job_key(id)).await?;
        match payload {
            Some(p) => Ok(Some(serde_json::from_str(&p)?)),
            None => Ok(None),
        }
    }

    async fn push_waiting(&self, id: &str) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(self.state_key(JobState::Waiting), id)
            .await?;
        Ok(())
    }

    async fn claim(&self, lock_until: i64) -> Result<Option<JobId>, BackendError> {
        let mut conn = self.conn.clone();
        let id: Option<String> = self
            .claim_script
            .key(self.state_key(JobState::Waiting))
            .key(self.state_key(JobState::Active))
            .arg(lock_until)
            .invoke_async(&mut conn)
            .await?;
        Ok(id)
    }

    async fn renew_lock(&self, id: &str, lock_until: i64) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let renewed: i32 = self
            .renew_script
            .key(self.state_key(JobState::Active))
            .arg(lock_until)
            .arg(id)
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release(&self, id: &str) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.zrem(self.state_key(JobState::Active), id).await?;
        Ok(removed > 0)
    }

    async fn schedule(&self, id: &str, ready_at: i64) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(self.state_key(JobState::Delayed), id, ready_at)
            .await?;
        Ok(())
    }

    async fn take_due(&self, now: i64) -> Result<Vec<JobId>, BackendError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = self
            .take_script
            .key(self.state_key(JobState::Delayed))
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        Ok(ids)
    }

    async fn take_stalled(&self, now: i64) -> Result<Vec<JobId>, BackendError> {
        let mut conn = self.conn.clone();
        // Exclusive bound: a lock expiring exactly now is still held.
        let ids: Vec<String> = self
            .take_script
            .key(self.state_key(JobState::Active))
            .arg(format!("({}", now))
            .invoke_async(&mut conn)
            .await?;
        Ok(ids)
    }

    async fn finish(
        &self,
        state: JobState,
        id: &str,
        finished_at: i64,
        keep: usize,
    ) -> Result<Vec<JobId>, BackendError> {
        let mut conn = self.conn.clone();
        let evicted: Vec<String> = self
            .finish_script
            .key(self.state_key(state))
            .arg(id)
            .arg(finished_at)
            .arg(keep)
            .arg(format!("{}:job:", self.prefix))
            .invoke_async(&mut conn)
            .await?;
        Ok(evicted)
    }

    async fn ids(&self, state: JobState) -> Result<Vec<JobId>, BackendError> {
        let mut conn = self.conn.clone();
        let key = self.state_key(state);
        if state == JobState::Waiting {
            // LPUSH puts the newest at the head.
            let mut ids: Vec<String> = conn.lrange(key, 0, -1).await?;
            ids.reverse();
            return Ok(ids);
        }
        let ids: Vec<String> = conn.zrange(key, 0, -1).await?;
        Ok(ids)
    }

    async fn count(&self, state: JobState) -> Result<u64, BackendError> {
        let mut conn = self.conn.clone();
        let key = self.state_key(state);
        let count: u64 = if state == JobState::Waiting {
            conn.llen(key).await?
        } else {
            conn.zcard(key).await?
        };
        Ok(count)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}
