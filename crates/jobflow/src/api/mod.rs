use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::jobs::model::NewJob;
use crate::jobs::queue::{EnqueueError, ResultLookup};

pub mod metrics;
pub mod models;
pub mod ws;

use models::{EnqueueRequest, EnqueueResponse, ErrorBody, PendingResponse, RandomTextQuery};

pub const RANDOM_TEXT_JOB: &str = "random_text";
pub const WEBHOOK_JOB: &str = "process_webhook";

const DEFAULT_TEXT_LENGTH: u32 = 100;
const MAX_TEXT_LENGTH: u32 = 1000;

#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Dispatcher,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/jobs", post(enqueue_job))
        .route("/api/jobs/:id", get(get_job))
        .route("/api/random-text", get(random_text))
        .route("/api/webhooks/:source", post(receive_webhook))
        .route("/api/ws", get(ws::ws_handler))
        .route("/metrics", get(metrics::metrics))
        .route("/health", get(health))
        .with_state(state)
}

fn enqueue_err(e: EnqueueError) -> (StatusCode, String) {
    match e {
        EnqueueError::InvalidType | EnqueueError::UnknownType(_) => {
            (StatusCode::BAD_REQUEST, e.to_string())
        }
        EnqueueError::PayloadTooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()),
        EnqueueError::Store(_) => {
            tracing::error!(error = %e, "enqueue failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("internal error: {e}"),
            )
        }
    }
}

pub async fn enqueue_job(
    State(state): State<ApiState>,
    Json(body): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, (StatusCode, String)> {
    let EnqueueRequest {
        job_type,
        payload,
        max_attempts,
    } = body;

    let max_attempts = max_attempts.unwrap_or(state.dispatcher.config().default_max_attempts);
    if max_attempts <= 0 {
        return Err((StatusCode::BAD_REQUEST, "max_attempts must be > 0".into()));
    }

    let job_id = state
        .dispatcher
        .enqueue_with(NewJob::new(job_type, payload).max_attempts(max_attempts))
        .await
        .map_err(enqueue_err)?;

    Ok(Json(EnqueueResponse { job_id }))
}

pub async fn random_text(
    State(state): State<ApiState>,
    Query(q): Query<RandomTextQuery>,
) -> Result<Json<EnqueueResponse>, (StatusCode, String)> {
    let length = q.length.unwrap_or(DEFAULT_TEXT_LENGTH);
    if !(1..=MAX_TEXT_LENGTH).contains(&length) {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("length must be between 1 and {MAX_TEXT_LENGTH}"),
        ));
    }

    let job_id = state
        .dispatcher
        .enqueue(RANDOM_TEXT_JOB, json!({ "length": length }))
        .await
        .map_err(enqueue_err)?;

    Ok(Json(EnqueueResponse { job_id }))
}

pub async fn receive_webhook(
    State(state): State<ApiState>,
    Path(source): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<EnqueueResponse>, (StatusCode, String)> {
    let event = body
        .get("event")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            headers
                .get("x-webhook-event")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "unknown".to_string());

    tracing::info!(source = %source, event = %event, "webhook received");

    let job_id = state
        .dispatcher
        .enqueue(
            WEBHOOK_JOB,
            json!({ "source": source, "event": event, "payload": body }),
        )
        .await
        .map_err(enqueue_err)?;

    Ok(Json(EnqueueResponse { job_id }))
}

pub async fn get_job(Path(id): Path<Uuid>, State(state): State<ApiState>) -> Response {
    match state.dispatcher.get_result(id).await {
        Ok(ResultLookup::Ready(result)) => (StatusCode::OK, Json(result)).into_response(),
        Ok(ResultLookup::Pending(status)) => (
            StatusCode::ACCEPTED,
            Json(PendingResponse { job_id: id, status }),
        )
            .into_response(),
        Ok(ResultLookup::NotFound) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: "job not found".into(),
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                error: format!("internal error: {e}"),
            }),
        )
            .into_response(),
    }
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
