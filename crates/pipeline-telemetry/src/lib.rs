//! # Pipeline Telemetry
//!
//! Observability for the clinical pipeline.
//!
//! This crate provides:
//! - Structured logging and OpenTelemetry tracing setup
//! - Prometheus metrics, including a circuit breaker listener
//! - PHI access auditing with a bounded in-memory buffer

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod metrics;
pub mod tracing_setup;

// Re-export main types
pub use audit::{
    AuditActor, AuditError, AuditEvent, AuditEventBuilder, AuditEventType, AuditLogConfig,
    AuditLogger, AuditOutcome, AuditResource, AuditSink,
};
pub use metrics::{MetricsListener, PipelineMetrics};
pub use tracing_setup::{init_tracing, shutdown_tracing, TelemetryError, TracingConfig};
