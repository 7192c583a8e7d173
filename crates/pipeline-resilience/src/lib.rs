//! # Pipeline Resilience
//!
//! Resilience patterns for calls to unreliable upstream services:
//! - Circuit breaker per upstream target, with an explicit registry
//! - Retry policy with exponential backoff and jitter
//! - Caller-driven abort signals
//! - A resilient HTTP client composing breaker, retry and timeouts
//! - Key-value stores with an atomic claim primitive

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod abort;
pub mod circuit_breaker;
pub mod client;
pub mod error;
pub mod registry;
pub mod retry;
pub mod store;
pub mod transport;

// Re-export main types
pub use abort::{AbortController, AbortSignal};
pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerListener,
    CircuitEvent, CircuitEventKind, CircuitSnapshot, CircuitState, Execution, Permit,
    TracingListener,
};
pub use client::{
    CallOptions, HealthReport, HealthVerdict, ResilientClient, TargetConfig, UpstreamResponse,
    CORRELATION_ID_HEADER, REQUEST_ID_HEADER,
};
pub use error::{TransportFailure, UpstreamError, UpstreamResult};
pub use registry::CircuitBreakerRegistry;
pub use retry::{RetryAttempt, RetryConfig, RetryPolicy, RetryPolicyBuilder};
pub use store::{
    get_json, set_json, set_json_if_absent, KeyValueStore, MemoryStore, StoreError, StoreResult,
};
pub use transport::{HttpTransport, Method, Transport, TransportRequest, TransportResponse};
