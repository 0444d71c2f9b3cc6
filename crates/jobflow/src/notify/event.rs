use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::jobs::model::JobStatus;

pub const JOB_STATUS_EVENT: &str = "job_status";

/// Message pushed to subscribers on every committed status transition.
///
/// Serialises as
/// `{"type":"job_status","job_id":"…","status":"completed","result":…}`;
/// `result` and `error` are omitted when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusEvent {
    pub fn new(job_id: Uuid, status: JobStatus) -> Self {
        Self {
            kind: JOB_STATUS_EVENT.to_string(),
            job_id,
            status,
            result: None,
            error: None,
        }
    }

    pub fn with_result(mut self, result: Option<Value>) -> Self {
        self.result = result;
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }
}
