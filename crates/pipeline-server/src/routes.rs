//! Route definitions.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::{handlers, state::AppState};

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    let request_timeout = state.request_timeout;
    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health_check))
        .route("/health/upstreams", get(handlers::upstream_health))
        // Metrics endpoint
        .route("/metrics", get(handlers::metrics_endpoint))
        .nest("/v1", api_routes())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Pipeline, job and circuit routes
fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/pipeline/run", post(handlers::run_pipeline))
        .route("/jobs", post(handlers::submit_job))
        .route("/jobs/:job_id", get(handlers::job_status))
        .route("/circuits", get(handlers::list_circuits))
        .route("/circuits/:target/reset", post(handlers::reset_circuit))
}
