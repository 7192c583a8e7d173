//! Failure taxonomy for upstream calls.

use std::time::Duration;
use thiserror::Error;

/// Result type for upstream calls
pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Connection-level failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    /// Connection refused by the peer
    ConnectionRefused,
    /// Connection reset mid-flight
    ConnectionReset,
    /// Socket-level timeout (connect or read)
    TimedOut,
    /// Host name could not be resolved
    UnresolvedHost,
    /// Any other connection-level failure
    Other,
}

impl std::fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionRefused => write!(f, "connection refused"),
            Self::ConnectionReset => write!(f, "connection reset"),
            Self::TimedOut => write!(f, "timed out"),
            Self::UnresolvedHost => write!(f, "unresolved host"),
            Self::Other => write!(f, "transport failure"),
        }
    }
}

/// Errors surfaced by the resilient client
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    /// Connection-level failure
    #[error("Transport error calling {target} ({kind}): {message}")]
    Transport {
        /// Upstream target name
        target: String,
        /// Failure class
        kind: TransportFailure,
        /// Error detail
        message: String,
    },

    /// The attempt exceeded its timeout
    #[error("Request to {target} timed out after {timeout:?}")]
    Timeout {
        /// Upstream target name
        target: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// The upstream answered with a non-2xx status
    #[error("Upstream {target} returned status {status}")]
    Status {
        /// Upstream target name
        target: String,
        /// HTTP status code
        status: u16,
        /// Parsed body, if it was JSON
        body: Option<serde_json::Value>,
    },

    /// The upstream answered 2xx but the body could not be parsed
    #[error("Malformed response from {target}: {message}")]
    MalformedResponse {
        /// Upstream target name
        target: String,
        /// Parse error detail
        message: String,
    },

    /// The request failed business validation before being sent
    #[error("Invalid request for {target}: {message}")]
    Validation {
        /// Upstream target name
        target: String,
        /// Validation detail
        message: String,
    },

    /// Circuit is open; the call was rejected without being attempted
    #[error("Circuit breaker open for {target}")]
    CircuitOpen {
        /// Upstream target name
        target: String,
    },

    /// Circuit is half-open and every probe slot is taken
    #[error("Circuit breaker half-open for {target}, probe slots exhausted")]
    HalfOpenSaturated {
        /// Upstream target name
        target: String,
    },

    /// The caller aborted the call
    #[error("Call to {target} aborted")]
    Aborted {
        /// Upstream target name
        target: String,
    },
}

impl UpstreamError {
    /// Create a transport error
    pub fn transport(
        target: impl Into<String>,
        kind: TransportFailure,
        message: impl Into<String>,
    ) -> Self {
        Self::Transport {
            target: target.into(),
            kind,
            message: message.into(),
        }
    }

    /// Create a status error
    pub fn status(target: impl Into<String>, status: u16, body: Option<serde_json::Value>) -> Self {
        Self::Status {
            target: target.into(),
            status,
            body,
        }
    }

    /// Create a malformed-response error
    pub fn malformed(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Create an aborted error
    pub fn aborted(target: impl Into<String>) -> Self {
        Self::Aborted {
            target: target.into(),
        }
    }

    /// Whether a fresh attempt could succeed.
    ///
    /// Connection failures, timeouts, 5xx and 429 are retryable. Everything
    /// else, including circuit rejections and caller aborts, is not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::MalformedResponse { .. }
            | Self::Validation { .. }
            | Self::CircuitOpen { .. }
            | Self::HalfOpenSaturated { .. }
            | Self::Aborted { .. } => false,
        }
    }

    /// Whether the breaker should count this as an upstream failure
    #[must_use]
    pub fn counts_as_failure(&self) -> bool {
        !matches!(
            self,
            Self::CircuitOpen { .. }
                | Self::HalfOpenSaturated { .. }
                | Self::Aborted { .. }
                | Self::Validation { .. }
        )
    }

    /// Whether the caller aborted
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// Whether the call was rejected by the circuit breaker
    #[must_use]
    pub fn is_circuit_rejection(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::HalfOpenSaturated { .. })
    }

    /// HTTP status for status errors
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Upstream target the error belongs to
    #[must_use]
    pub fn target(&self) -> &str {
        match self {
            Self::Transport { target, .. }
            | Self::Timeout { target, .. }
            | Self::Status { target, .. }
            | Self::MalformedResponse { target, .. }
            | Self::Validation { target, .. }
            | Self::CircuitOpen { target }
            | Self::HalfOpenSaturated { target }
            | Self::Aborted { target } => target,
        }
    }

    /// Short label used for metrics
    #[must_use]
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Timeout { .. } => "timeout",
            Self::Status { .. } => "status",
            Self::MalformedResponse { .. } => "malformed",
            Self::Validation { .. } => "validation",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::HalfOpenSaturated { .. } => "half_open_saturated",
            Self::Aborted { .. } => "aborted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_and_timeout_retryable() {
        for kind in [
            TransportFailure::ConnectionRefused,
            TransportFailure::ConnectionReset,
            TransportFailure::TimedOut,
            TransportFailure::UnresolvedHost,
        ] {
            assert!(UpstreamError::transport("t", kind, "boom").is_retryable());
        }
        let timeout = UpstreamError::Timeout {
            target: "t".into(),
            timeout: Duration::from_secs(30),
        };
        assert!(timeout.is_retryable());
    }

    #[test]
    fn test_status_classification() {
        assert!(UpstreamError::status("t", 500, None).is_retryable());
        assert!(UpstreamError::status("t", 503, None).is_retryable());
        assert!(UpstreamError::status("t", 429, None).is_retryable());
        assert!(!UpstreamError::status("t", 400, None).is_retryable());
        assert!(!UpstreamError::status("t", 404, None).is_retryable());
        assert!(!UpstreamError::status("t", 422, None).is_retryable());
    }

    #[test]
    fn test_terminal_errors_not_retryable() {
        assert!(!UpstreamError::malformed("t", "eof").is_retryable());
        assert!(!UpstreamError::validation("t", "empty").is_retryable());
        assert!(!UpstreamError::CircuitOpen { target: "t".into() }.is_retryable());
        assert!(!UpstreamError::aborted("t").is_retryable());
    }

    #[test]
    fn test_breaker_accounting() {
        assert!(UpstreamError::status("t", 500, None).counts_as_failure());
        assert!(UpstreamError::malformed("t", "x").counts_as_failure());
        assert!(!UpstreamError::aborted("t").counts_as_failure());
        assert!(!UpstreamError::CircuitOpen { target: "t".into() }.counts_as_failure());
    }
}
