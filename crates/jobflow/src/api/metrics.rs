use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;

use crate::api::models::{MetricsResponse, QueueDepth, StatusCount};
use crate::api::ApiState;
use crate::jobs::model::JobStatus;

pub async fn metrics(
    State(state): State<ApiState>,
) -> Result<Json<MetricsResponse>, (StatusCode, String)> {
    let d = &state.dispatcher;

    let counts = d.status_counts().await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("internal error: {e}"),
        )
    })?;

    // every status is reported, zero included
    let jobs = JobStatus::ALL
        .iter()
        .map(|status| StatusCount {
            status: *status,
            count: counts
                .iter()
                .find(|(s, _)| s == status)
                .map(|(_, n)| *n)
                .unwrap_or(0),
        })
        .collect();

    let queues = d
        .queue_depths()
        .into_iter()
        .map(|(job_type, depth)| QueueDepth { job_type, depth })
        .collect();

    Ok(Json(MetricsResponse {
        now_utc: Utc::now(),
        jobs,
        queues,
        connections: d.registry().connection_count(),
        subscriptions: d.registry().subscription_count(),
        broadcast: d.broadcast_stats(),
    }))
}
