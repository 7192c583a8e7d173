//! Prometheus metrics for the pipeline.
//!
//! Metrics live in an explicit [`prometheus::Registry`] owned by
//! [`PipelineMetrics`], so several instances can coexist in tests.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

use pipeline_resilience::{CircuitBreakerListener, CircuitEvent, CircuitEventKind};

use crate::tracing_setup::TelemetryError;

/// All pipeline metrics
#[derive(Clone)]
pub struct PipelineMetrics {
    registry: Registry,
    /// Breaker-observed call outcomes (by target, outcome)
    pub upstream_calls: IntCounterVec,
    /// Circuit state per target (0 closed, 1 open, 2 half-open)
    pub circuit_state: IntGaugeVec,
    /// Stage duration (by stage, outcome)
    pub stage_duration: HistogramVec,
    /// Degraded stages (by target)
    pub degraded_total: IntCounterVec,
    /// Orchestrator invocations (by outcome)
    pub requests_total: IntCounterVec,
}

impl std::fmt::Debug for PipelineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineMetrics").finish_non_exhaustive()
    }
}

impl PipelineMetrics {
    /// Create and register all metrics in a fresh registry
    ///
    /// # Errors
    /// Returns an error if a metric cannot be created or registered
    pub fn new() -> Result<Self, TelemetryError> {
        let registry = Registry::new();

        let upstream_calls = IntCounterVec::new(
            Opts::new(
                "pipeline_upstream_calls_total",
                "Upstream call outcomes observed by circuit breakers",
            ),
            &["target", "outcome"],
        )?;
        let circuit_state = IntGaugeVec::new(
            Opts::new(
                "pipeline_circuit_state",
                "Circuit breaker state (0 closed, 1 open, 2 half-open)",
            ),
            &["target"],
        )?;
        let stage_duration = HistogramVec::new(
            HistogramOpts::new("pipeline_stage_duration_seconds", "Pipeline stage duration")
                .buckets(vec![
                    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0,
                    30.0,
                ]),
            &["stage", "outcome"],
        )?;
        let degraded_total = IntCounterVec::new(
            Opts::new(
                "pipeline_degraded_total",
                "Stages completed in degraded mode",
            ),
            &["target"],
        )?;
        let requests_total = IntCounterVec::new(
            Opts::new("pipeline_requests_total", "Pipeline invocations"),
            &["outcome"],
        )?;

        registry.register(Box::new(upstream_calls.clone()))?;
        registry.register(Box::new(circuit_state.clone()))?;
        registry.register(Box::new(stage_duration.clone()))?;
        registry.register(Box::new(degraded_total.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;

        Ok(Self {
            registry,
            upstream_calls,
            circuit_state,
            stage_duration,
            degraded_total,
            requests_total,
        })
    }

    /// Record a stage duration
    pub fn observe_stage(&self, stage: &str, outcome: &str, duration: Duration) {
        self.stage_duration
            .with_label_values(&[stage, outcome])
            .observe(duration.as_secs_f64());
    }

    /// Count a degraded target
    pub fn record_degraded(&self, target: &str) {
        self.degraded_total.with_label_values(&[target]).inc();
    }

    /// Count an invocation outcome
    pub fn record_request(&self, outcome: &str) {
        self.requests_total.with_label_values(&[outcome]).inc();
    }

    /// Render in the Prometheus text format
    ///
    /// # Errors
    /// Returns an error if encoding fails
    pub fn gather(&self) -> Result<String, TelemetryError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }

    /// Breaker listener feeding these metrics
    #[must_use]
    pub fn listener(&self) -> Arc<MetricsListener> {
        Arc::new(MetricsListener {
            metrics: self.clone(),
        })
    }
}

/// Circuit breaker listener that updates [`PipelineMetrics`]
#[derive(Debug, Clone)]
pub struct MetricsListener {
    metrics: PipelineMetrics,
}

impl CircuitBreakerListener for MetricsListener {
    fn on_event(&self, event: &CircuitEvent) {
        let target = event.target.as_str();
        match event.kind {
            CircuitEventKind::StateChange { to, .. } => {
                self.metrics
                    .circuit_state
                    .with_label_values(&[target])
                    .set(to.as_gauge());
            }
            CircuitEventKind::Success => self.count(target, "success"),
            CircuitEventKind::Failure => self.count(target, "failure"),
            CircuitEventKind::Rejected => self.count(target, "rejected"),
            CircuitEventKind::Fallback => self.count(target, "fallback"),
        }
    }
}

impl MetricsListener {
    fn count(&self, target: &str, outcome: &str) {
        self.metrics
            .upstream_calls
            .with_label_values(&[target, outcome])
            .inc();
    }
}
