//! Retry policy with exponential backoff.
//!
//! Decides whether a failed attempt is worth repeating and how long to wait
//! before the next one. The sleep between attempts can be cut short by an
//! [`AbortSignal`], which surfaces as [`UpstreamError::Aborted`] and is
//! never retried.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::abort::AbortSignal;
use crate::error::{UpstreamError, UpstreamResult};

/// Jitter spread applied around the computed delay
const JITTER_RATIO: f64 = 0.25;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Upper bound for any single delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Spread delays by up to ±25%
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Defaults for queue-processed jobs (5s initial delay)
    #[must_use]
    pub fn for_queue() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            ..Self::default()
        }
    }
}

/// Decision taken after one failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt {
    /// 1-based attempt that just failed
    pub attempt: u32,
    /// Delay before the next attempt; zero when not retrying
    pub delay: Duration,
    /// Whether another attempt will be made
    pub retryable: bool,
}

/// Retry policy implementation
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a new retry policy with the given configuration
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Create a builder
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Whether a failed attempt (1-based) should be repeated.
    ///
    /// True only for retryable errors while `attempt < max_attempts`.
    #[must_use]
    pub fn should_retry(error: &UpstreamError, attempt: u32, max_attempts: u32) -> bool {
        error.is_retryable() && attempt < max_attempts
    }

    /// Unjittered delay before retry `retry_index` (0-based)
    #[must_use]
    pub fn base_delay(&self, retry_index: u32) -> Duration {
        let initial = self.config.initial_delay.as_millis() as f64;
        let cap = self.config.max_delay.as_millis() as f64;
        let exponent = i32::try_from(retry_index).unwrap_or(i32::MAX);
        let delay = (initial * self.config.multiplier.powi(exponent)).min(cap);
        Duration::from_millis(delay.max(0.0) as u64)
    }

    /// Delay before retry `retry_index` (0-based), jittered when enabled
    #[must_use]
    pub fn compute_delay(&self, retry_index: u32) -> Duration {
        let base = self.base_delay(retry_index).as_millis() as f64;
        if !self.config.jitter || base == 0.0 {
            return Duration::from_millis(base as u64);
        }

        let spread = base * JITTER_RATIO;
        let jitter = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis((base + jitter).max(0.0).floor() as u64)
    }

    /// Classify a failed attempt (1-based) and compute the wait before the next
    #[must_use]
    pub fn plan(&self, error: &UpstreamError, attempt: u32) -> RetryAttempt {
        let retryable = Self::should_retry(error, attempt, self.config.max_attempts);
        let delay = if retryable {
            self.compute_delay(attempt.saturating_sub(1))
        } else {
            Duration::ZERO
        };
        RetryAttempt {
            attempt,
            delay,
            retryable,
        }
    }

    /// Execute an operation with retry logic.
    ///
    /// The operation receives the 1-based attempt number.
    ///
    /// # Errors
    /// Returns the last error once it is non-retryable or attempts are exhausted
    pub async fn execute<F, Fut, T>(&self, target: &str, operation: F) -> UpstreamResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = UpstreamResult<T>>,
    {
        self.execute_with_abort(target, &AbortSignal::never(), operation)
            .await
    }

    /// Execute with retry logic, cancelling pending sleeps on abort.
    ///
    /// # Errors
    /// Returns [`UpstreamError::Aborted`] when the signal fires between
    /// attempts, otherwise the last error once it is non-retryable or
    /// attempts are exhausted
    pub async fn execute_with_abort<F, Fut, T>(
        &self,
        target: &str,
        abort: &AbortSignal,
        mut operation: F,
    ) -> UpstreamResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = UpstreamResult<T>>,
    {
        let mut attempt = 1;
        loop {
            if abort.is_aborted() {
                return Err(UpstreamError::aborted(target));
            }

            let error = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(upstream = %target, attempt, "Retry succeeded");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let decision = self.plan(&error, attempt);
            if !decision.retryable {
                return Err(error);
            }

            warn!(
                upstream = %target,
                attempt,
                max_attempts = self.config.max_attempts,
                delay_ms = decision.delay.as_millis() as u64,
                error = %error,
                "Retrying after error"
            );

            tokio::select! {
                () = tokio::time::sleep(decision.delay) => {}
                () = abort.aborted() => {
                    debug!(upstream = %target, attempt, "Retry sleep aborted");
                    return Err(UpstreamError::aborted(target));
                }
            }
            attempt += 1;
        }
    }
}

/// Builder for retry policy
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    config: RetryConfig,
}

impl RetryPolicyBuilder {
    /// Create a new builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set total attempts
    #[must_use]
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n.max(1);
        self
    }

    /// Set initial delay
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.config.initial_delay = delay;
        self
    }

    /// Set max delay
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    /// Set backoff multiplier
    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.config.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter
    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.config.jitter = enabled;
        self
    }

    /// Build the policy
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy::new(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::AbortController;
    use crate::error::TransportFailure;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn retryable_errors() -> Vec<UpstreamError> {
        vec![
            UpstreamError::transport("t", TransportFailure::ConnectionRefused, "refused"),
            UpstreamError::transport("t", TransportFailure::ConnectionReset, "reset"),
            UpstreamError::transport("t", TransportFailure::TimedOut, "timed out"),
            UpstreamError::transport("t", TransportFailure::UnresolvedHost, "no such host"),
            UpstreamError::Timeout {
                target: "t".into(),
                timeout: Duration::from_secs(30),
            },
            UpstreamError::status("t", 502, None),
            UpstreamError::status("t", 429, None),
        ]
    }

    #[test]
    fn test_should_retry_until_final_attempt() {
        for error in retryable_errors() {
            assert!(RetryPolicy::should_retry(&error, 1, 3), "{error}");
            assert!(RetryPolicy::should_retry(&error, 2, 3), "{error}");
            assert!(!RetryPolicy::should_retry(&error, 3, 3), "{error}");
        }
    }

    #[test]
    fn test_non_retryable_rejected_on_first_attempt() {
        for error in [
            UpstreamError::status("t", 400, None),
            UpstreamError::status("t", 404, None),
            UpstreamError::malformed("t", "unexpected eof"),
            UpstreamError::validation("t", "missing field"),
        ] {
            assert!(!RetryPolicy::should_retry(&error, 1, 3), "{error}");
        }
    }

    #[test]
    fn test_delay_calculation() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(100))
            .multiplier(2.0)
            .max_delay(Duration::from_millis(300))
            .jitter(false)
            .build();

        assert_eq!(policy.compute_delay(0), Duration::from_millis(100));
        assert_eq!(policy.compute_delay(1), Duration::from_millis(200));
        assert_eq!(policy.compute_delay(2), Duration::from_millis(300)); // Capped
        assert_eq!(policy.compute_delay(3), Duration::from_millis(300));
    }

    #[test]
    fn test_default_delays_non_decreasing() {
        let policy = RetryPolicy::new(RetryConfig {
            jitter: false,
            ..Default::default()
        });
        let delays: Vec<_> = (0..8).map(|n| policy.compute_delay(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_within_bounds() {
        let policy = RetryPolicy::with_defaults();
        for n in 0..5 {
            let base = policy.base_delay(n).as_millis() as f64;
            for _ in 0..50 {
                let jittered = policy.compute_delay(n).as_millis() as f64;
                assert!(jittered >= (base * 0.75).floor(), "{jittered} < {base}");
                assert!(jittered <= base * 1.25, "{jittered} > {base}");
            }
        }
    }

    #[test]
    fn test_queue_defaults() {
        let config = RetryConfig::for_queue();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.initial_delay, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_success_after_failures() {
        let policy = RetryPolicy::with_defaults();
        let counter = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&counter);

        let result = policy
            .execute("recommendation-service", |attempt| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(UpstreamError::status("recommendation-service", 503, None))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_returns_last_error() {
        let policy = RetryPolicy::with_defaults();
        let counter = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&counter);

        let result: UpstreamResult<()> = policy
            .execute("t", |_| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Err(UpstreamError::status("t", 500, None))
                }
            })
            .await;

        assert_eq!(result.unwrap_err().status_code(), Some(500));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_not_repeated() {
        let policy = RetryPolicy::with_defaults();
        let counter = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&counter);

        let result: UpstreamResult<()> = policy
            .execute("t", |_| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Err(UpstreamError::status("t", 400, None))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abort_cancels_retry_sleep() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_secs(60))
            .jitter(false)
            .build();
        let controller = AbortController::new();
        let signal = controller.signal();

        let handle = tokio::spawn(async move {
            policy
                .execute_with_abort("t", &signal, |_| async {
                    Err::<(), _>(UpstreamError::status("t", 503, None))
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.abort();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("abort should end the retry loop")
            .unwrap();
        assert!(result.unwrap_err().is_aborted());
    }
}
