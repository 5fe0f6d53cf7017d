//! Queue admin and detection-trigger endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::models::{Anomaly, DetectionJob, EnqueueRequest, JobStatus, QueueStats};
use crate::orchestrator::Orchestrator;
use crate::queue::DetectionQueue;
use crate::sse::{EventName, SseHub};

#[derive(Clone)]
pub struct ApiState {
    pub queue: Arc<DetectionQueue>,
    pub orchestrator: Arc<Orchestrator>,
    pub hub: Arc<SseHub>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/queue-stats", get(queue_stats))
        .route("/api/queue-jobs", get(queue_jobs))
        .route("/api/queue-retry/:job_id", post(queue_retry))
        .route("/api/detections/run", post(run_detection))
        .with_state(state)
}

async fn queue_stats(State(state): State<ApiState>) -> Result<Json<QueueStats>, StatusCode> {
    state
        .queue
        .stats()
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[derive(Debug, Deserialize)]
struct JobsQuery {
    status: Option<String>,
    limit: Option<u64>,
}

#[derive(Debug, Serialize)]
struct JobsResponse {
    jobs: Vec<DetectionJob>,
    count: usize,
}

async fn queue_jobs(
    Query(params): Query<JobsQuery>,
    State(state): State<ApiState>,
) -> Result<Json<JobsResponse>, StatusCode> {
    let status = match params.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(JobStatus::parse(raw).ok_or(StatusCode::BAD_REQUEST)?),
    };
    let limit = params.limit.unwrap_or(50).min(50);

    let jobs = state
        .queue
        .jobs(status, limit)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(JobsResponse {
        count: jobs.len(),
        jobs,
    }))
}

async fn queue_retry(
    Path(job_id): Path<String>,
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let retried = state
        .queue
        .retry(&job_id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    if !retried {
        return Err(StatusCode::NOT_FOUND);
    }
    info!(job = %job_id, "job manually requeued");
    Ok(Json(json!({"retried": true, "job_id": job_id})))
}

#[derive(Debug, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
enum RunResponse {
    Queued { job: DetectionJob, duplicate: bool },
    Inline { findings: Vec<Anomaly> },
}

/// Trigger a detection run. With a healthy queue the request is enqueued;
/// when the backing store is unreachable the pipeline runs inline against
/// this request and returns findings directly.
async fn run_detection(
    State(state): State<ApiState>,
    Json(request): Json<EnqueueRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if request.user_id.is_empty() || request.sync_id.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    if state.queue.healthy() {
        let outcome = state
            .queue
            .enqueue(&request)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        let duplicate = outcome.is_duplicate();
        let job = outcome.job().clone();

        if !duplicate {
            state
                .hub
                .send_event(
                    &request.user_id,
                    EventName::Notifications,
                    json!({
                        "lifecycle": "queued",
                        "sync_id": request.sync_id,
                        "job_id": job.id,
                        "priority": job.priority,
                    }),
                    None,
                )
                .await;
        }

        let response = RunResponse::Queued { job, duplicate };
        return serde_json::to_value(response)
            .map(Json)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR);
    }

    warn!(
        user = %request.user_id,
        sync = %request.sync_id,
        "queue unhealthy, falling back to inline detection"
    );
    let findings = state
        .orchestrator
        .run_inline(&request.user_id, &request.sync_id)
        .await
        .map_err(|e| match e {
            crate::error::DetectionError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        })?;

    serde_json::to_value(RunResponse::Inline { findings })
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

pub async fn health_check() -> &'static str {
    "⚙️ Recoup detection engine operational"
}
