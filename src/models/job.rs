use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Opaque job identifier assigned by the queue at enqueue time.
pub type JobId = String;

/// Lifecycle state of a queued job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Waiting,
        JobState::Delayed,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Input of a submit job. Set at enqueue; only the worker touches the
/// invocation bookkeeping between attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
#[serde(rename_all = "camelCase")]
pub struct JobData {
    #[garde(length(min = 1))]
    pub tenant_id: String,

    #[garde(length(min = 1))]
    pub operation_name: String,

    #[garde(skip)]
    pub is_write: bool,

    #[garde(skip)]
    #[serde(default)]
    pub arguments: Vec<String>,

    /// Append-only history of invocation ids used across attempts.
    #[garde(skip)]
    #[serde(default)]
    pub invocation_ids: Vec<String>,

    #[garde(skip)]
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    pub saved_state: Option<Vec<u8>>,
}

impl JobData {
    pub fn new(
        tenant_id: impl Into<String>,
        operation_name: impl Into<String>,
        is_write: bool,
        arguments: Vec<String>,
    ) -> Result<Self, JobDataError> {
        let data = Self {
            tenant_id: tenant_id.into(),
            operation_name: operation_name.into(),
            is_write,
            arguments,
            invocation_ids: Vec::new(),
            saved_state: None,
        };
        data.validate()?;
        Ok(data)
    }

    /// Record the invocation about to be attempted. The id is appended only
    /// when it differs from the most recent one, so resumed invocations do not
    /// duplicate history.
    pub fn record_invocation(&mut self, invocation_id: &str, checkpoint: Vec<u8>) {
        if self.invocation_ids.last().map(String::as_str) != Some(invocation_id) {
            self.invocation_ids.push(invocation_id.to_string());
        }
        self.saved_state = Some(checkpoint);
    }

    /// Drop the checkpoint so the next attempt starts a fresh invocation.
    pub fn clear_saved_state(&mut self) {
        self.saved_state = None;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobDataError {
    #[error("Invalid job data: {0}")]
    Invalid(#[from] garde::Report),
}

/// Outcome of a job, written once on the terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl JobResult {
    pub fn success(payload: impl Into<String>) -> Self {
        Self {
            payload: Some(payload.into()),
            error_message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            payload: None,
            error_message: Some(message.into()),
        }
    }
}

/// A queue-owned unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub state: JobState,
    pub attempts_made: u32,
    /// Times the job was recovered from a dead worker. Not an attempt.
    #[serde(default)]
    pub stalled_count: u32,
    pub data: JobData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// When a delayed job becomes eligible for promotion to waiting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(data: JobData) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: data.operation_name.clone(),
            state: JobState::Waiting,
            attempts_made: 0,
            stalled_count: 0,
            data,
            result: None,
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
            ready_at: None,
        }
    }

    pub fn belongs_to(&self, tenant_id: &str) -> bool {
        self.data.tenant_id == tenant_id
    }
}

/// Read-side view of a job handed to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: JobId,
    pub name: String,
    pub state: JobState,
    pub attempts: u32,
    pub invocation_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            name: job.name.clone(),
            state: job.state,
            attempts: job.attempts_made,
            invocation_ids: job.data.invocation_ids.clone(),
            result: if job.state.is_terminal() {
                job.result.clone()
            } else {
                None
            },
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|e| STANDARD.decode(e).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer() -> JobData {
        JobData::new(
            "Org1MSP",
            "Transfer",
            true,
            vec!["alice".into(), "bob".into(), "10".into()],
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_empty_tenant_and_operation() {
        assert!(JobData::new("", "Transfer", true, vec![]).is_err());
        assert!(JobData::new("Org1MSP", "", true, vec![]).is_err());
        assert!(JobData::new("Org1MSP", "Transfer", true, vec![]).is_ok());
    }

    #[test]
    fn test_new_job_is_waiting_and_named_after_operation() {
        let job = Job::new(transfer());
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.name, "Transfer");
        assert_eq!(job.attempts_made, 0);
        assert!(job.result.is_none());
        assert!(job.belongs_to("Org1MSP"));
        assert!(!job.belongs_to("Org2MSP"));
    }

    #[test]
    fn test_invocation_history_is_append_only() {
        let mut data = transfer();
        data.record_invocation("tx-1", b"state-1".to_vec());
        data.record_invocation("tx-1", b"state-1b".to_vec());
        assert_eq!(data.invocation_ids, vec!["tx-1"]);
        assert_eq!(data.saved_state.as_deref(), Some(&b"state-1b"[..]));

        data.clear_saved_state();
        assert!(data.saved_state.is_none());
        data.record_invocation("tx-2", b"state-2".to_vec());
        assert_eq!(data.invocation_ids, vec!["tx-1", "tx-2"]);
    }

    #[test]
    fn test_saved_state_survives_json() {
        let mut job = Job::new(transfer());
        job.data.record_invocation("tx-1", vec![0, 159, 146, 150]);
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"savedState\":\"AJ+Slg==\""));
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn test_summary_hides_result_until_terminal() {
        let mut job = Job::new(transfer());
        job.result = Some(JobResult::success("ok"));
        job.state = JobState::Active;
        assert!(JobSummary::from(&job).result.is_none());

        job.state = JobState::Completed;
        let summary = JobSummary::from(&job);
        assert_eq!(summary.result, Some(JobResult::success("ok")));
        assert_eq!(summary.state.to_string(), "completed");
    }

    #[test]
    fn test_state_parses_from_lowercase() {
        assert_eq!("delayed".parse::<JobState>().unwrap(), JobState::Delayed);
        assert!("paused".parse::<JobState>().is_err());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Waiting.is_terminal());
    }
}
