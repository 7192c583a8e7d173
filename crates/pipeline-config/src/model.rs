//! Configuration model.
//!
//! Every section is defaulted, so an empty file (or no file at all) yields
//! a runnable configuration pointing at local upstreams.

use pipeline_resilience::{CircuitBreakerConfig, RetryConfig, TargetConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// HTTP server settings
    pub server: ServerConfig,
    /// Resilience defaults shared by all targets
    pub defaults: DefaultsConfig,
    /// Upstream targets
    pub targets: TargetsConfig,
    /// Content cache and idempotency store settings
    pub cache: CacheConfig,
    /// Access auditing
    pub audit: AuditConfig,
    /// Roles allowed to run the pipeline
    pub authorization: AuthorizationConfig,
    /// Background job processing
    pub queue: QueueConfig,
    /// Logging and tracing
    pub telemetry: TelemetryConfig,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Whole-request timeout applied by the HTTP layer
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Time allowed for in-flight requests on shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Resilience defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Retry policy
    pub retry: RetryConfig,
    /// Circuit breaker
    pub circuit_breaker: CircuitBreakerConfig,
    /// Per-attempt timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// One upstream target as written in the file
///
/// `retry`, `circuit_breaker` and `timeout` replace the matching block from
/// [`DefaultsConfig`] wholesale when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSettings {
    /// Target name used for breakers, metrics and degradation markers
    pub name: String,
    /// Base URL
    pub base_url: String,
    /// Path of the stage endpoint
    pub path: String,
    /// Retry override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    /// Circuit breaker override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Timeout override
    #[serde(
        default,
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

impl TargetSettings {
    fn local(name: &str, port: u16, path: &str) -> Self {
        Self {
            name: name.to_string(),
            base_url: format!("http://localhost:{port}"),
            path: path.to_string(),
            retry: None,
            circuit_breaker: None,
            timeout: None,
        }
    }

    /// Merge with the defaults
    #[must_use]
    pub fn resolve(&self, defaults: &DefaultsConfig) -> ResolvedTarget {
        ResolvedTarget {
            name: self.name.clone(),
            base_url: self.base_url.clone(),
            path: self.path.clone(),
            timeout: self.timeout.unwrap_or(defaults.timeout),
            retry: self.retry.clone().unwrap_or_else(|| defaults.retry.clone()),
            circuit_breaker: self
                .circuit_breaker
                .clone()
                .unwrap_or_else(|| defaults.circuit_breaker.clone()),
        }
    }
}

/// Target with every setting filled in
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTarget {
    /// Target name
    pub name: String,
    /// Base URL
    pub base_url: String,
    /// Stage endpoint path
    pub path: String,
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Retry policy
    pub retry: RetryConfig,
    /// Circuit breaker
    pub circuit_breaker: CircuitBreakerConfig,
}

impl ResolvedTarget {
    /// Client-facing target configuration
    #[must_use]
    pub fn client_config(&self) -> TargetConfig {
        TargetConfig::new(&self.name, &self.base_url)
            .with_timeout(self.timeout)
            .with_retry(self.retry.clone())
    }
}

/// Upstream targets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetsConfig {
    /// Clinical entity extraction
    pub extraction: TargetSettings,
    /// Template recommendation
    pub recommendation: TargetSettings,
    /// Embedding enrichment
    pub embedding: TargetSettings,
}

impl Default for TargetsConfig {
    fn default() -> Self {
        Self {
            extraction: TargetSettings::local("extraction-service", 8001, "/extract"),
            recommendation: TargetSettings::local("recommendation-service", 8002, "/recommend"),
            embedding: TargetSettings::local("embedding-service", 8003, "/embed"),
        }
    }
}

impl TargetsConfig {
    /// All targets in stage order
    pub fn iter(&self) -> impl Iterator<Item = &TargetSettings> {
        [&self.extraction, &self.recommendation, &self.embedding].into_iter()
    }
}

/// Cache and idempotency settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Extraction output retention
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Full result retention under an idempotency key
    #[serde(with = "humantime_serde")]
    pub idempotency_ttl: Duration,
    /// Lifetime of an execution claim. The owner renews it while running, so
    /// it lapses only once the owner stops without releasing it
    #[serde(with = "humantime_serde")]
    pub claim_ttl: Duration,
    /// Poll interval while waiting on another caller's claim
    #[serde(with = "humantime_serde")]
    pub claim_poll_interval: Duration,
    /// Entry cap of the in-memory store
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            idempotency_ttl: Duration::from_secs(24 * 3600),
            claim_ttl: Duration::from_secs(60),
            claim_poll_interval: Duration::from_millis(100),
            max_entries: 10_000,
        }
    }
}

/// Access audit settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Fail requests whose audit entry cannot be written
    pub mandatory: bool,
    /// Events kept in memory for inspection
    pub buffer_size: usize,
    /// Emit events on the `audit` log target
    pub log_to_stdout: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            mandatory: true,
            buffer_size: 1000,
            log_to_stdout: true,
        }
    }
}

/// Role-based access settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationConfig {
    /// Roles allowed to run the pipeline
    pub allowed_roles: Vec<String>,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            allowed_roles: ["physician", "nurse", "clinician", "admin"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Job worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Redelivery policy for failed jobs
    pub retry: RetryConfig,
    /// Jobs processed concurrently
    pub concurrency: usize,
    /// How long finished and failed jobs stay visible
    #[serde(with = "humantime_serde")]
    pub status_retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::for_queue(),
            concurrency: 4,
            status_retention: Duration::from_secs(3600),
        }
    }
}

/// Logging and tracing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Level used when `RUST_LOG` is unset
    pub log_level: String,
    /// JSON log lines
    pub json: bool,
    /// Deployment environment
    pub environment: String,
    /// Enables OpenTelemetry when set
    pub otlp_endpoint: Option<String>,
    /// Trace sampling ratio
    pub sampling_rate: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
            environment: "development".to_string(),
            otlp_endpoint: None,
            sampling_rate: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.cache.ttl, Duration::from_secs(3600));
        assert_eq!(config.defaults.timeout, Duration::from_secs(30));
        assert_eq!(config.queue.retry.initial_delay, Duration::from_secs(5));
        assert_eq!(config.targets.iter().count(), 3);
        assert!(config.audit.mandatory);
    }

    #[test]
    fn test_target_override_replaces_block() {
        let defaults = DefaultsConfig::default();
        let mut target = TargetsConfig::default().recommendation;
        target.circuit_breaker = Some(CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        });
        target.timeout = Some(Duration::from_secs(5));

        let resolved = target.resolve(&defaults);
        assert_eq!(resolved.circuit_breaker.failure_threshold, 2);
        assert_eq!(resolved.timeout, Duration::from_secs(5));
        assert_eq!(resolved.retry, defaults.retry);

        let client = resolved.client_config();
        assert_eq!(client.name, "recommendation-service");
        assert_eq!(client.timeout, Duration::from_secs(5));
    }
}
