//! Admin HTTP handlers for the queue runtime.
//!
//! This module provides reusable Axum handlers for:
//! - Dashboard and health rollups (`/dashboard`, `/health`)
//! - Queue listing and per-queue metrics/jobs
//! - Bulk retry, clean, pause and resume
//! - Prometheus metrics (`/metrics`)
//!
//! Responses use a `{success, data}` envelope; unknown queues return 404
//! and operational errors 500.

use crate::config::BrokerKind;
use crate::error::QueueError;
use crate::job::JobState;
use crate::monitor::QueueMonitor;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

type AdminState = Arc<QueueMonitor>;
type AdminError = (StatusCode, Json<Value>);

fn envelope<T: serde::Serialize>(data: T) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

fn error_response(err: QueueError) -> AdminError {
    let status = match err {
        QueueError::QueueNotFound(_) | QueueError::JobNotFound(_) => StatusCode::NOT_FOUND,
        QueueError::Config(_) | QueueError::NotSupported(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({ "success": false, "error": err.to_string() })),
    )
}

fn parse_broker(broker: &str) -> Result<BrokerKind, AdminError> {
    broker.parse().map_err(|_| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "error": format!("unknown broker '{}'", broker) })),
        )
    })
}

/// `GET /dashboard` - aggregated summary across all queues.
pub async fn dashboard_handler(State(state): State<AdminState>) -> Json<Value> {
    envelope(state.dashboard().await)
}

/// `GET /health` - health rollup.
///
/// Degraded and unhealthy systems still answer 200; the status lives in the
/// body so probes and dashboards can distinguish them.
pub async fn health_handler(State(state): State<AdminState>) -> Json<Value> {
    let status = state.health().await;
    Json(json!({ "success": true, "data": { "status": status } }))
}

/// `GET /ready` - liveness/readiness probe.
pub async fn ready_handler() -> Json<Value> {
    Json(json!({ "status": "ready" }))
}

/// `GET /queues` - registered queue keys.
pub async fn queues_handler(State(state): State<AdminState>) -> Json<Value> {
    let keys: Vec<Value> = state
        .factory()
        .keys()
        .await
        .into_iter()
        .map(|(broker, name)| json!({ "broker": broker, "name": name }))
        .collect();
    envelope(keys)
}

/// `GET /queues/{broker}/{name}/metrics` - single queue metrics.
pub async fn queue_metrics_handler(
    State(state): State<AdminState>,
    Path((broker, name)): Path<(String, String)>,
) -> Result<Json<Value>, AdminError> {
    let broker = parse_broker(&broker)?;
    state
        .queue_metrics(broker, &name)
        .await
        .map(envelope)
        .map_err(error_response)
}

/// Query parameters for the job listing endpoint.
#[derive(Debug, Deserialize)]
pub struct JobsParams {
    /// Comma-separated states (default: all states).
    pub states: Option<String>,
    /// Maximum jobs to return (default 50, capped at 500).
    #[serde(default = "default_jobs_limit")]
    pub limit: usize,
}

fn default_jobs_limit() -> usize {
    50
}

/// `GET /queues/{broker}/{name}/jobs?states=failed,waiting&limit=10`
pub async fn queue_jobs_handler(
    State(state): State<AdminState>,
    Path((broker, name)): Path<(String, String)>,
    Query(params): Query<JobsParams>,
) -> Result<Json<Value>, AdminError> {
    let broker = parse_broker(&broker)?;

    let states: Vec<JobState> = match &params.states {
        Some(raw) => {
            let mut states = Vec::new();
            for part in raw.split(',').filter(|p| !p.is_empty()) {
                let state: JobState = part.trim().parse().map_err(error_response)?;
                states.push(state);
            }
            states
        }
        None => vec![
            JobState::Waiting,
            JobState::Delayed,
            JobState::Active,
            JobState::Completed,
            JobState::Failed,
        ],
    };

    let limit = params.limit.min(500);
    state
        .queue_jobs(broker, &name, &states, limit)
        .await
        .map(envelope)
        .map_err(error_response)
}

/// Body for the bulk retry endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct RetryParams {
    pub limit: Option<usize>,
}

/// `POST /queues/{broker}/{name}/retry` - retry failed jobs.
pub async fn retry_handler(
    State(state): State<AdminState>,
    Path((broker, name)): Path<(String, String)>,
    params: Option<Json<RetryParams>>,
) -> Result<Json<Value>, AdminError> {
    let broker = parse_broker(&broker)?;
    let limit = params.and_then(|Json(p)| p.limit);
    state
        .retry_failed(broker, &name, limit)
        .await
        .map(envelope)
        .map_err(error_response)
}

/// Body for the clean endpoint.
#[derive(Debug, Deserialize)]
pub struct CleanParams {
    /// Grace period in milliseconds.
    #[serde(default)]
    pub grace: u64,
    /// Restrict to one terminal state.
    pub status: Option<String>,
}

/// `POST /queues/{broker}/{name}/clean` - remove old terminal jobs.
pub async fn clean_handler(
    State(state): State<AdminState>,
    Path((broker, name)): Path<(String, String)>,
    Json(params): Json<CleanParams>,
) -> Result<Json<Value>, AdminError> {
    let broker = parse_broker(&broker)?;
    let status = match params.status.as_deref() {
        Some(raw) => Some(raw.parse::<JobState>().map_err(error_response)?),
        None => None,
    };

    state
        .clean_jobs(broker, &name, params.grace, status)
        .await
        .map(|removed| envelope(json!({ "removed": removed })))
        .map_err(error_response)
}

/// `POST /queues/{broker}/{name}/pause`
pub async fn pause_handler(
    State(state): State<AdminState>,
    Path((broker, name)): Path<(String, String)>,
) -> Result<Json<Value>, AdminError> {
    let broker = parse_broker(&broker)?;
    state
        .pause(broker, &name)
        .await
        .map(|()| envelope(json!({ "paused": true })))
        .map_err(error_response)
}

/// `POST /queues/{broker}/{name}/resume`
pub async fn resume_handler(
    State(state): State<AdminState>,
    Path((broker, name)): Path<(String, String)>,
) -> Result<Json<Value>, AdminError> {
    let broker = parse_broker(&broker)?;
    state
        .resume(broker, &name)
        .await
        .map(|()| envelope(json!({ "paused": false })))
        .map_err(error_response)
}

/// `GET /metrics` - Prometheus text exposition.
pub async fn prometheus_handler(State(state): State<AdminState>) -> impl IntoResponse {
    match state.prometheus() {
        Some(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            output,
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Build the admin router.
///
/// Routes:
/// - `GET /dashboard`, `GET /health`, `GET /ready`, `GET /queues`
/// - `GET /queues/{broker}/{name}/metrics`
/// - `GET /queues/{broker}/{name}/jobs`
/// - `POST /queues/{broker}/{name}/retry|clean|pause|resume`
/// - `GET /metrics`
pub fn admin_router(monitor: Arc<QueueMonitor>) -> Router {
    Router::new()
        .route("/dashboard", get(dashboard_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/queues", get(queues_handler))
        .route("/queues/{broker}/{name}/metrics", get(queue_metrics_handler))
        .route("/queues/{broker}/{name}/jobs", get(queue_jobs_handler))
        .route("/queues/{broker}/{name}/retry", post(retry_handler))
        .route("/queues/{broker}/{name}/clean", post(clean_handler))
        .route("/queues/{broker}/{name}/pause", post(pause_handler))
        .route("/queues/{broker}/{name}/resume", post(resume_handler))
        .route("/metrics", get(prometheus_handler))
        .with_state(monitor)
}
