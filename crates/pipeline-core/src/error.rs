//! Errors that propagate out of the orchestrator.
//!
//! Stage-level upstream failures never appear here: they are converted into
//! degraded-service markers on the result. Only authorization, infrastructure
//! and caller-initiated cancellation reach the caller.

use thiserror::Error;

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors returned by a pipeline invocation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// The caller is not entitled to the referenced patient or visit
    #[error("Unauthorized: {reason}")]
    Unauthorized {
        /// Why access was refused
        reason: String,
    },

    /// A collaborator the request cannot complete without is unreachable
    #[error("Infrastructure failure in {component}: {message}")]
    Infrastructure {
        /// Failing collaborator (cache, idempotency store, audit, authorization)
        component: String,
        /// Error detail
        message: String,
    },

    /// The caller aborted the request before it completed
    #[error("Request aborted by caller")]
    Aborted,
}

impl PipelineError {
    /// Create an unauthorized error
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }

    /// Create an infrastructure error
    pub fn infrastructure(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Infrastructure {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Whether the caller may safely retry the whole request
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Infrastructure { .. })
    }

    /// HTTP status code this error maps to
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthorized { .. } => 403,
            Self::Infrastructure { .. } => 503,
            Self::Aborted => 499,
        }
    }

    /// Stable machine-readable error type
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "unauthorized",
            Self::Infrastructure { .. } => "infrastructure_error",
            Self::Aborted => "aborted",
        }
    }
}
