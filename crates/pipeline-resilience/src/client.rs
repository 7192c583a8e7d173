//! Resilient upstream client.
//!
//! Every call goes through the same path:
//! 1. The target's circuit breaker admits (or rejects) the attempt
//! 2. Request and correlation ids are attached as headers
//! 3. The attempt is bounded by its timeout and raced against the abort signal
//! 4. The outcome is recorded on the breaker
//! 5. The retry policy decides whether to try again
//!
//! The breaker is consulted before every attempt, so a circuit that opens
//! mid-retry ends the loop with a non-retryable circuit-open error.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use pipeline_core::RequestId;

use crate::abort::AbortSignal;
use crate::circuit_breaker::{Admission, CircuitBreaker, CircuitState};
use crate::error::{UpstreamError, UpstreamResult};
use crate::registry::CircuitBreakerRegistry;
use crate::retry::{RetryConfig, RetryPolicy};
use crate::transport::{Method, Transport, TransportRequest, TransportResponse};

/// Header carrying the per-call request id
pub const REQUEST_ID_HEADER: &str = "x-request-id";
/// Header carrying the cross-service correlation id
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const SLOW_HEALTH_THRESHOLD: Duration = Duration::from_secs(1);

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Upstream target configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Target name; also the circuit breaker key
    pub name: String,
    /// Base URL, e.g. `http://extraction:8080`
    pub base_url: String,
    /// Default per-attempt timeout
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Retry policy
    #[serde(default)]
    pub retry: RetryConfig,
}

impl TargetConfig {
    /// Create a target with default timeout and retry
    #[must_use]
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            timeout: default_timeout(),
            retry: RetryConfig::default(),
        }
    }

    /// Set the per-attempt timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Override the target's per-attempt timeout
    pub timeout: Option<Duration>,
    /// Request id; generated when absent
    pub request_id: Option<String>,
    /// Correlation id; generated when absent
    pub correlation_id: Option<String>,
    /// Caller-driven cancellation
    pub abort: AbortSignal,
    /// Bypass the circuit breaker (health probes)
    pub skip_circuit_breaker: bool,
}

impl CallOptions {
    /// Set the timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the request id
    #[must_use]
    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Set the correlation id
    #[must_use]
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the abort signal
    #[must_use]
    pub fn abort(mut self, signal: AbortSignal) -> Self {
        self.abort = signal;
        self
    }

    /// Bypass the circuit breaker
    #[must_use]
    pub fn skip_circuit_breaker(mut self) -> Self {
        self.skip_circuit_breaker = true;
        self
    }
}

/// Successful upstream response
#[derive(Debug, Clone)]
pub struct UpstreamResponse<T> {
    /// Decoded payload
    pub data: T,
    /// HTTP status
    pub status: u16,
    /// Wall time across all attempts
    pub latency: Duration,
    /// Served from a cache rather than the upstream
    pub from_cache: bool,
    /// Attempts made, including the successful one
    pub attempts: u32,
}

impl<T> UpstreamResponse<T> {
    /// Wrap a cached value
    #[must_use]
    pub fn cached(data: T) -> Self {
        Self {
            data,
            status: 200,
            latency: Duration::ZERO,
            from_cache: true,
            attempts: 0,
        }
    }
}

/// Coarse liveness verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthVerdict {
    /// Reachable, reports healthy, answered promptly
    Healthy,
    /// Reachable but slow or self-reporting degraded
    Degraded,
    /// Unreachable or non-2xx
    Unhealthy,
}

/// Result of [`ResilientClient::health_check`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Target name
    pub target: String,
    /// Verdict
    pub verdict: HealthVerdict,
    /// Probe latency in milliseconds
    pub latency_ms: u64,
    /// Breaker state at probe time
    pub circuit_state: CircuitState,
    /// Version reported by the upstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Failure detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

/// Client for one upstream target
#[derive(Clone)]
pub struct ResilientClient {
    config: Arc<TargetConfig>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("target", &self.config.name)
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}

impl ResilientClient {
    /// Create a client; the breaker comes from `registry`
    #[must_use]
    pub fn new(
        config: TargetConfig,
        registry: &CircuitBreakerRegistry,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let breaker = registry.get(&config.name);
        let retry = RetryPolicy::new(config.retry.clone());
        Self {
            config: Arc::new(config),
            breaker,
            retry,
            transport,
        }
    }

    /// Target name
    #[must_use]
    pub fn target(&self) -> &str {
        &self.config.name
    }

    /// Target configuration
    #[must_use]
    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    /// The target's circuit breaker
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// POST a JSON body and decode a JSON response
    ///
    /// # Errors
    /// Returns the final [`UpstreamError`] once retries are exhausted or a
    /// non-retryable failure occurs
    pub async fn post_json<B, T>(
        &self,
        path: &str,
        body: &B,
        options: CallOptions,
    ) -> UpstreamResult<UpstreamResponse<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned + Send,
    {
        let body = serde_json::to_value(body)
            .map_err(|e| UpstreamError::validation(&self.config.name, e.to_string()))?;
        self.call(Method::Post, path, Some(body), options).await
    }

    /// GET and decode a JSON response
    ///
    /// # Errors
    /// Returns the final [`UpstreamError`] once retries are exhausted or a
    /// non-retryable failure occurs
    pub async fn get_json<T>(
        &self,
        path: &str,
        options: CallOptions,
    ) -> UpstreamResult<UpstreamResponse<T>>
    where
        T: DeserializeOwned + Send,
    {
        self.call(Method::Get, path, None, options).await
    }

    #[instrument(
        skip(self, body, options),
        fields(
            upstream = %self.config.name,
            request_id = tracing::field::Empty,
            correlation_id = tracing::field::Empty
        )
    )]
    async fn call<T>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        options: CallOptions,
    ) -> UpstreamResult<UpstreamResponse<T>>
    where
        T: DeserializeOwned + Send,
    {
        let started = Instant::now();
        let url = self.url(path);
        let timeout = options.timeout.unwrap_or(self.config.timeout);
        let request_id = options
            .request_id
            .clone()
            .unwrap_or_else(|| RequestId::generate().to_string());
        let correlation_id = options
            .correlation_id
            .clone()
            .unwrap_or_else(|| RequestId::generate().to_string());

        let span = tracing::Span::current();
        span.record("request_id", request_id.as_str());
        span.record("correlation_id", correlation_id.as_str());

        let mut attempts = 0;
        let result = self
            .retry
            .execute_with_abort(&self.config.name, &options.abort, |attempt| {
                attempts = attempt;
                let mut request = match method {
                    Method::Get => TransportRequest::get(url.clone(), timeout),
                    Method::Post => TransportRequest::post(
                        url.clone(),
                        body.clone().unwrap_or(serde_json::Value::Null),
                        timeout,
                    ),
                };
                request = request
                    .header(REQUEST_ID_HEADER, request_id.as_str())
                    .header(CORRELATION_ID_HEADER, correlation_id.as_str());
                self.attempt::<T>(request, &options)
            })
            .await;

        let latency = started.elapsed();
        match result {
            Ok((data, status)) => {
                debug!(
                    attempts,
                    latency_ms = latency.as_millis() as u64,
                    status,
                    "Upstream call succeeded"
                );
                Ok(UpstreamResponse {
                    data,
                    status,
                    latency,
                    from_cache: false,
                    attempts,
                })
            }
            Err(error) => {
                warn!(
                    attempts,
                    latency_ms = latency.as_millis() as u64,
                    kind = error.kind_label(),
                    error = %error,
                    "Upstream call failed"
                );
                Err(error)
            }
        }
    }

    async fn attempt<T>(
        &self,
        request: TransportRequest,
        options: &CallOptions,
    ) -> UpstreamResult<(T, u16)>
    where
        T: DeserializeOwned,
    {
        // Dropping the permit unrecorded, as a cancelled attempt does, frees its probe slot
        let permit = if options.skip_circuit_breaker {
            None
        } else {
            match self.breaker.acquire() {
                Ok(permit) => Some(permit),
                Err(Admission::RejectedSaturated) => {
                    return Err(UpstreamError::HalfOpenSaturated {
                        target: self.config.name.clone(),
                    })
                }
                Err(_) => {
                    return Err(UpstreamError::CircuitOpen {
                        target: self.config.name.clone(),
                    })
                }
            }
        };

        let timeout = request.timeout;
        let send = self.transport.send(&self.config.name, request);
        let outcome = tokio::select! {
            sent = tokio::time::timeout(timeout, send) => {
                match sent {
                    Ok(response) => response,
                    Err(_) => Err(UpstreamError::Timeout {
                        target: self.config.name.clone(),
                        timeout,
                    }),
                }
            }
            () = options.abort.aborted() => Err(UpstreamError::aborted(&self.config.name)),
        };
        let outcome = outcome.and_then(|response| self.decode::<T>(&response));

        if let Some(permit) = permit {
            match &outcome {
                Ok(_) => permit.success(),
                Err(error) if error.counts_as_failure() => permit.failure(),
                Err(_) => drop(permit),
            }
        }
        outcome
    }

    fn decode<T: DeserializeOwned>(
        &self,
        response: &TransportResponse,
    ) -> UpstreamResult<(T, u16)> {
        if !response.is_success() {
            let body = serde_json::from_slice(&response.body).ok();
            return Err(UpstreamError::status(
                &self.config.name,
                response.status,
                body,
            ));
        }
        serde_json::from_slice(&response.body)
            .map(|data| (data, response.status))
            .map_err(|e| UpstreamError::malformed(&self.config.name, e.to_string()))
    }

    /// Probe `GET /health` once, bypassing the breaker.
    ///
    /// For liveness reporting only; never used for traffic decisions.
    pub async fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        let request = TransportRequest::get(self.url("/health"), HEALTH_TIMEOUT)
            .header(REQUEST_ID_HEADER, RequestId::generate().to_string());

        let sent = tokio::time::timeout(
            HEALTH_TIMEOUT,
            self.transport.send(&self.config.name, request),
        )
        .await
        .unwrap_or_else(|_| {
            Err(UpstreamError::Timeout {
                target: self.config.name.clone(),
                timeout: HEALTH_TIMEOUT,
            })
        });
        let latency = started.elapsed();
        let circuit_state = self.breaker.state();

        let (verdict, version, error) = match sent {
            Ok(response) if response.is_success() => {
                let body: Option<HealthBody> = serde_json::from_slice(&response.body).ok();
                let reported = body.as_ref().and_then(|b| b.status.as_deref());
                let healthy = reported.map_or(true, |s| {
                    matches!(s.to_ascii_lowercase().as_str(), "ok" | "healthy" | "up")
                });
                let verdict = if healthy && latency < SLOW_HEALTH_THRESHOLD {
                    HealthVerdict::Healthy
                } else {
                    HealthVerdict::Degraded
                };
                (verdict, body.and_then(|b| b.version), None)
            }
            Ok(response) => (
                HealthVerdict::Unhealthy,
                None,
                Some(format!("status {}", response.status)),
            ),
            Err(error) => (HealthVerdict::Unhealthy, None, Some(error.to_string())),
        };

        HealthReport {
            target: self.config.name.clone(),
            verdict,
            latency_ms: latency.as_millis() as u64,
            circuit_state,
            version,
            error,
        }
    }
}
