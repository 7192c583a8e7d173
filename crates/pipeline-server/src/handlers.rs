//! HTTP request handlers.

use axum::{
    extract::{Path, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use pipeline_core::{PipelineInput, PipelineRequest, PipelineResult};
use pipeline_orchestrator::{JobId, JobQueue, JobStatus};
use pipeline_resilience::{AbortController, CircuitSnapshot, HealthReport, HealthVerdict};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::{
    error::ApiError,
    extractors::{
        Caller, CorrelationIdHeader, IdempotencyKey, JsonBody, RequestIdHeader,
        CORRELATION_ID_HEADER, REQUEST_ID_HEADER,
    },
    state::AppState,
};

/// Health check response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Version
    pub version: String,
    /// Uptime in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
}

/// Liveness endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: Some(state.uptime_seconds()),
    })
}

/// Aggregated upstream health
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamHealthResponse {
    /// Worst verdict across upstreams, lower-cased
    pub status: &'static str,
    /// Per-upstream reports
    pub upstreams: Vec<HealthReport>,
}

fn aggregate(reports: &[HealthReport]) -> HealthVerdict {
    if reports.iter().any(|r| r.verdict == HealthVerdict::Unhealthy) {
        HealthVerdict::Unhealthy
    } else if reports.iter().any(|r| r.verdict == HealthVerdict::Degraded) {
        HealthVerdict::Degraded
    } else {
        HealthVerdict::Healthy
    }
}

/// Probe every upstream concurrently
#[instrument(skip(state))]
pub async fn upstream_health(State(state): State<AppState>) -> Response {
    let upstreams = state.orchestrator.stages().health_check().await;
    let verdict = aggregate(&upstreams);
    let (code, status) = match verdict {
        HealthVerdict::Healthy => (StatusCode::OK, "healthy"),
        HealthVerdict::Degraded => (StatusCode::OK, "degraded"),
        HealthVerdict::Unhealthy => (StatusCode::SERVICE_UNAVAILABLE, "unhealthy"),
    };
    debug!(status, upstreams = upstreams.len(), "Upstream health probed");
    (code, Json(UpstreamHealthResponse { status, upstreams })).into_response()
}

/// Metrics endpoint (Prometheus format)
pub async fn metrics_endpoint(State(state): State<AppState>) -> Result<Response, ApiError> {
    let body = state
        .metrics
        .gather()
        .map_err(|e| ApiError::internal(format!("Failed to encode metrics: {e}")))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response())
}

/// Breaker snapshots
pub async fn list_circuits(State(state): State<AppState>) -> Json<Vec<CircuitSnapshot>> {
    Json(state.breakers.snapshots())
}

/// Force a breaker closed
#[instrument(skip(state))]
pub async fn reset_circuit(
    State(state): State<AppState>,
    Path(target): Path<String>,
) -> Result<Json<CircuitSnapshot>, ApiError> {
    if !state.breakers.reset(&target) {
        return Err(ApiError::not_found(format!("Unknown circuit: {target}")));
    }
    info!(upstream = %target, "Circuit reset by operator");
    state
        .breakers
        .existing(&target)
        .map(|breaker| Json(breaker.snapshot()))
        .ok_or_else(|| ApiError::not_found(format!("Unknown circuit: {target}")))
}

/// Aborts the in-flight run when the handler future is dropped
struct AbortOnDrop(AbortController);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn build_request(
    input: PipelineInput,
    caller: Caller,
    request_id: RequestIdHeader,
    correlation_id: CorrelationIdHeader,
    idempotency_key: IdempotencyKey,
) -> Result<PipelineRequest, ApiError> {
    if input.patient_id.trim().is_empty() {
        return Err(ApiError::bad_request("patientId must not be empty"));
    }
    let mut builder = PipelineRequest::builder(input, caller.0)
        .request_id(request_id.0)
        .correlation_id(correlation_id.0);
    if let Some(key) = idempotency_key.0 {
        builder = builder.idempotency_key(key);
    }
    Ok(builder.build())
}

fn with_id_headers(result: PipelineResult) -> Response {
    let mut response = Json(&result).into_response();
    let headers = response.headers_mut();
    for (name, value) in [
        (REQUEST_ID_HEADER, result.request_id.as_str()),
        (CORRELATION_ID_HEADER, result.correlation_id.as_str()),
    ] {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
    response
}

/// Run the pipeline synchronously
///
/// The run happens on its own task. If the client disconnects, the handler
/// future is dropped and the run is aborted.
#[instrument(skip_all, fields(request_id = %request_id.0))]
pub async fn run_pipeline(
    State(state): State<AppState>,
    request_id: RequestIdHeader,
    correlation_id: CorrelationIdHeader,
    idempotency_key: IdempotencyKey,
    caller: Caller,
    JsonBody(input): JsonBody<PipelineInput>,
) -> Result<Response, ApiError> {
    let request = build_request(input, caller, request_id, correlation_id, idempotency_key)?;

    let controller = AbortController::new();
    let signal = controller.signal();
    let _guard = AbortOnDrop(controller);

    let orchestrator = state.orchestrator.clone();
    let result = tokio::spawn(async move { orchestrator.run_with_abort(request, &signal).await })
        .await
        .map_err(|e| {
            warn!(error = %e, "Pipeline task ended abnormally");
            ApiError::internal("Pipeline task ended abnormally")
        })??;

    Ok(with_id_headers(result))
}

fn job_queue(state: &AppState) -> Result<&Arc<dyn JobQueue>, ApiError> {
    state
        .jobs
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("Job queue is not enabled"))
}

/// Accepted job
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAccepted {
    /// Job id
    pub job_id: JobId,
    /// Request id the job will run under
    pub request_id: String,
}

/// Queue a pipeline run
#[instrument(skip_all, fields(request_id = %request_id.0))]
pub async fn submit_job(
    State(state): State<AppState>,
    request_id: RequestIdHeader,
    correlation_id: CorrelationIdHeader,
    idempotency_key: IdempotencyKey,
    caller: Caller,
    JsonBody(input): JsonBody<PipelineInput>,
) -> Result<Response, ApiError> {
    let queue = job_queue(&state)?;
    let request = build_request(input, caller, request_id, correlation_id, idempotency_key)?;
    let request_id = request.request_id.to_string();

    let job_id = queue.enqueue(request).await?;
    info!(job_id = %job_id, "Job queued");
    Ok((
        StatusCode::ACCEPTED,
        Json(JobAccepted { job_id, request_id }),
    )
        .into_response())
}

/// Job state
pub async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobStatus>, ApiError> {
    let queue = job_queue(&state)?;
    queue
        .status(&JobId::from(id.as_str()))
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Unknown job: {id}")))
}
