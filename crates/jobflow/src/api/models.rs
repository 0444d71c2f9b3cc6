use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::jobs::model::JobStatus;
use crate::notify::broadcaster::BroadcastStats;

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub job_type: String,
    #[serde(default)]
    pub payload: Value,
    pub max_attempts: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct RandomTextQuery {
    pub length: Option<u32>,
}

/// Body of `202 Accepted` for a job that has not finished yet.
#[derive(Debug, Serialize, Deserialize)]
pub struct PendingResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub job_id: Option<Uuid>,
}

/// Frame a websocket client sends to manage its subscriptions.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe(Uuid),
    Unsubscribe(Uuid),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct StatusCount {
    pub status: JobStatus,
    pub count: i64,
}

#[derive(Debug, Serialize)]
pub struct QueueDepth {
    pub job_type: String,
    pub depth: usize,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub now_utc: chrono::DateTime<chrono::Utc>,
    pub jobs: Vec<StatusCount>,
    pub queues: Vec<QueueDepth>,
    pub connections: usize,
    pub subscriptions: usize,
    pub broadcast: BroadcastStats,
}
