//! Shared handler state.

use pipeline_orchestrator::{JobQueue, PipelineOrchestrator};
use pipeline_resilience::CircuitBreakerRegistry;
use pipeline_telemetry::PipelineMetrics;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// State shared by every handler
#[derive(Clone)]
pub struct AppState {
    /// Pipeline orchestrator
    pub orchestrator: PipelineOrchestrator,
    /// Breakers for every upstream target
    pub breakers: Arc<CircuitBreakerRegistry>,
    /// Prometheus metrics
    pub metrics: PipelineMetrics,
    /// Background job queue, when enabled
    pub jobs: Option<Arc<dyn JobQueue>>,
    /// Whole-request deadline
    pub request_timeout: Duration,
    /// Process start
    pub started_at: Instant,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("breakers", &self.breakers.len())
            .field("jobs", &self.jobs.is_some())
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Start building state around `orchestrator`
    pub fn builder(orchestrator: PipelineOrchestrator) -> AppStateBuilder {
        AppStateBuilder {
            orchestrator,
            breakers: None,
            metrics: None,
            jobs: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Seconds since start
    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Builder for [`AppState`]
pub struct AppStateBuilder {
    orchestrator: PipelineOrchestrator,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    metrics: Option<PipelineMetrics>,
    jobs: Option<Arc<dyn JobQueue>>,
    request_timeout: Duration,
}

impl AppStateBuilder {
    /// Whole-request deadline; a run still in flight when it passes is aborted
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Breaker registry shared with the stage clients
    #[must_use]
    pub fn breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Metrics registry
    #[must_use]
    pub fn metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Enable the job endpoints
    #[must_use]
    pub fn jobs(mut self, jobs: Arc<dyn JobQueue>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Build the state
    pub fn build(self) -> Result<AppState, pipeline_telemetry::TelemetryError> {
        let metrics = match self.metrics {
            Some(m) => m,
            None => PipelineMetrics::new()?,
        };
        Ok(AppState {
            orchestrator: self.orchestrator,
            breakers: self.breakers.unwrap_or_default(),
            metrics,
            jobs: self.jobs,
            request_timeout: self.request_timeout,
            started_at: Instant::now(),
        })
    }
}
