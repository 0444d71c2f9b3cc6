use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: Value,
    pub status: JobStatus,

    pub attempts: i32,
    pub max_attempts: i32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Fresh Pending record for an accepted enqueue.
    pub fn pending(new: NewJob) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type: new.job_type,
            payload: new.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: new.max_attempts.max(1),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub payload: Value,
    pub max_attempts: i32,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            max_attempts: 1,
        }
    }

    pub fn max_attempts(mut self, n: i32) -> Self {
        self.max_attempts = n;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Retrying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Only these states may be handed out by the queue.
    pub fn is_dequeueable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Retrying)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Retrying, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Retrying)
                // recovery of jobs orphaned by a crashed worker
                | (Processing, Retrying)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown job status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "retrying" => Ok(JobStatus::Retrying),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Outcome of the latest execution attempt of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl JobResult {
    pub fn completed(job_id: Uuid, result: Value) -> Self {
        Self {
            job_id,
            status: JobStatus::Completed,
            result: Some(result),
            error: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(job_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            job_id,
            status: JobStatus::Failed,
            result: None,
            error: Some(error.into()),
            completed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_round_trips_through_str() {
        for st in JobStatus::ALL {
            assert_eq!(st.as_str().parse::<JobStatus>().unwrap(), st);
        }
        assert!("dlq".parse::<JobStatus>().is_err());
    }

    #[test]
    fn state_machine_edges() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Failed.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Failed.can_transition_to(Processing));
    }

    #[test]
    fn result_constructors_keep_fields_exclusive() {
        let id = Uuid::new_v4();
        let ok = JobResult::completed(id, json!("5 words"));
        assert_eq!(ok.status, JobStatus::Completed);
        assert!(ok.error.is_none());

        let err = JobResult::failed(id, "boom");
        assert_eq!(err.status, JobStatus::Failed);
        assert!(err.result.is_none());
        assert_eq!(err.error.as_deref(), Some("boom"));
    }

    #[test]
    fn pending_job_clamps_max_attempts() {
        let job = Job::pending(NewJob::new("echo", json!({})).max_attempts(0));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.max_attempts, 1);
        assert_eq!(job.attempts, 0);
    }
}
