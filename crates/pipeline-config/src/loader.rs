//! Configuration loading.
//!
//! Order of precedence, lowest first: built-in defaults, the config file
//! (YAML, TOML or JSON, chosen by extension), `PIPELINE_*` environment
//! variables. The merged result is validated before it is returned.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};
use crate::model::PipelineConfig;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "PIPELINE_CONFIG";

const DEFAULT_ENV_PREFIX: &str = "PIPELINE";

/// Supported file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// `.yaml` / `.yml`
    Yaml,
    /// `.toml`
    Toml,
    /// `.json`
    Json,
}

impl ConfigFormat {
    /// Detect the format from a file extension
    pub fn from_path(path: &Path) -> ConfigResult<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "yaml" | "yml" => Ok(Self::Yaml),
            "toml" => Ok(Self::Toml),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Yaml => "yaml",
            Self::Toml => "toml",
            Self::Json => "json",
        }
    }
}

/// Parse configuration text
pub fn parse(content: &str, format: ConfigFormat) -> ConfigResult<PipelineConfig> {
    let parsed = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(content).map_err(|e| e.to_string()),
        ConfigFormat::Toml => toml::from_str(content).map_err(|e| e.to_string()),
        ConfigFormat::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
    };
    parsed.map_err(|message| ConfigError::Parse {
        format: format.name(),
        message,
    })
}

/// Configuration loader
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env_prefix: String,
    use_env: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Loader with no file and environment overrides enabled
    #[must_use]
    pub fn new() -> Self {
        Self {
            file: None,
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
            use_env: true,
        }
    }

    /// Read this file
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Use a different environment prefix
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Ignore the process environment
    #[must_use]
    pub fn without_env(mut self) -> Self {
        self.use_env = false;
        self
    }

    /// Load, override and validate
    pub async fn load(&self) -> ConfigResult<PipelineConfig> {
        if self.use_env {
            self.load_with(|key| std::env::var(key).ok()).await
        } else {
            self.load_with(|_| None).await
        }
    }

    /// Load using `lookup` in place of the process environment
    pub async fn load_with<F>(&self, lookup: F) -> ConfigResult<PipelineConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match &self.file {
            Some(path) => {
                let format = ConfigFormat::from_path(path)?;
                let content =
                    tokio::fs::read_to_string(path)
                        .await
                        .map_err(|source| ConfigError::Io {
                            path: path.clone(),
                            source,
                        })?;
                let config = parse(&content, format)?;
                info!(path = %path.display(), format = format.name(), "Configuration file loaded");
                config
            }
            None => {
                debug!("No configuration file, using defaults");
                PipelineConfig::default()
            }
        };

        apply_env_overrides(&mut config, &self.env_prefix, lookup)?;
        validate(&config)?;
        Ok(config)
    }
}

/// Load using `PIPELINE_CONFIG` (if set) and the process environment
pub async fn load_config() -> ConfigResult<PipelineConfig> {
    let mut loader = ConfigLoader::new();
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        loader = loader.with_file(path);
    }
    loader.load().await
}

fn parse_value<T>(key: &str, raw: &str) -> ConfigResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Env {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn parse_duration(key: &str, raw: &str) -> ConfigResult<Duration> {
    humantime_serde::re::humantime::parse_duration(raw.trim()).map_err(|e| ConfigError::Env {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Apply `<prefix>_*` overrides
pub fn apply_env_overrides<F>(
    config: &mut PipelineConfig,
    prefix: &str,
    lookup: F,
) -> ConfigResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |name: &str| {
        let key = format!("{prefix}_{name}");
        lookup(&key).map(|value| (key, value))
    };

    if let Some((_, v)) = var("HOST") {
        config.server.host = v;
    }
    if let Some((k, v)) = var("PORT") {
        config.server.port = parse_value(&k, &v)?;
    }
    if let Some((_, v)) = var("EXTRACTION_URL") {
        config.targets.extraction.base_url = v;
    }
    if let Some((_, v)) = var("RECOMMENDATION_URL") {
        config.targets.recommendation.base_url = v;
    }
    if let Some((_, v)) = var("EMBEDDING_URL") {
        config.targets.embedding.base_url = v;
    }
    if let Some((k, v)) = var("TIMEOUT") {
        config.defaults.timeout = parse_duration(&k, &v)?;
    }
    if let Some((k, v)) = var("RETRY_MAX_ATTEMPTS") {
        config.defaults.retry.max_attempts = parse_value(&k, &v)?;
    }
    if let Some((k, v)) = var("CACHE_TTL") {
        config.cache.ttl = parse_duration(&k, &v)?;
    }
    if let Some((k, v)) = var("IDEMPOTENCY_TTL") {
        config.cache.idempotency_ttl = parse_duration(&k, &v)?;
    }
    if let Some((k, v)) = var("CLAIM_TTL") {
        config.cache.claim_ttl = parse_duration(&k, &v)?;
    }
    if let Some((k, v)) = var("AUDIT_MANDATORY") {
        config.audit.mandatory = parse_value(&k, &v)?;
    }
    if let Some((_, v)) = var("LOG_LEVEL") {
        config.telemetry.log_level = v;
    }
    if let Some((k, v)) = var("LOG_JSON") {
        config.telemetry.json = parse_value(&k, &v)?;
    }
    if let Some((_, v)) = var("ENVIRONMENT") {
        config.telemetry.environment = v;
    }
    if let Some((_, v)) = var("OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = Some(v).filter(|s| !s.trim().is_empty());
    }
    if let Some((k, v)) = var("SAMPLING_RATE") {
        config.telemetry.sampling_rate = parse_value(&k, &v)?;
    }
    Ok(())
}

/// Check semantic constraints, reporting every violation
pub fn validate(config: &PipelineConfig) -> ConfigResult<()> {
    let mut errors = Vec::new();

    if config.server.port == 0 {
        errors.push("server.port cannot be 0".to_string());
    }

    let targets = [
        ("extraction", &config.targets.extraction),
        ("recommendation", &config.targets.recommendation),
        ("embedding", &config.targets.embedding),
    ];
    for (key, target) in targets {
        if target.name.trim().is_empty() {
            errors.push(format!("targets.{key}.name cannot be empty"));
        }
        if target.base_url.trim().is_empty() {
            errors.push(format!("targets.{key}.base_url cannot be empty"));
        } else if let Err(e) = url::Url::parse(&target.base_url) {
            errors.push(format!("targets.{key}.base_url is not a valid URL: {e}"));
        }
        if !target.path.starts_with('/') {
            errors.push(format!("targets.{key}.path must start with '/'"));
        }

        let resolved = target.resolve(&config.defaults);
        let prefix = format!("targets.{key}");
        if resolved.circuit_breaker.failure_threshold == 0 {
            errors.push(format!("{prefix}.circuit_breaker.failure_threshold must be > 0"));
        }
        if resolved.circuit_breaker.half_open_requests == 0 {
            errors.push(format!("{prefix}.circuit_breaker.half_open_requests must be > 0"));
        }
        if resolved.circuit_breaker.failure_window.is_zero() {
            errors.push(format!("{prefix}.circuit_breaker.failure_window must be > 0"));
        }
        validate_retry(&prefix, &resolved.retry, &mut errors);
        if resolved.timeout.is_zero() {
            errors.push(format!("{prefix}.timeout must be > 0"));
        }
    }

    let mut names: Vec<_> = config.targets.iter().map(|t| t.name.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    if names.len() != 3 {
        errors.push("target names must be distinct".to_string());
    }

    validate_retry("queue", &config.queue.retry, &mut errors);
    if config.queue.concurrency == 0 {
        errors.push("queue.concurrency must be > 0".to_string());
    }
    if config.queue.status_retention.is_zero() {
        errors.push("queue.status_retention must be > 0".to_string());
    }

    if config.cache.claim_ttl.is_zero() {
        errors.push("cache.claim_ttl must be > 0".to_string());
    }
    if config.cache.claim_poll_interval.is_zero() {
        errors.push("cache.claim_poll_interval must be > 0".to_string());
    }
    if config.cache.max_entries == 0 {
        errors.push("cache.max_entries must be > 0".to_string());
    }

    if !(0.0..=1.0).contains(&config.telemetry.sampling_rate) {
        errors.push("telemetry.sampling_rate must be within [0, 1]".to_string());
    }
    if config.authorization.allowed_roles.is_empty() {
        errors.push("authorization.allowed_roles cannot be empty".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(errors))
    }
}

fn validate_retry(
    prefix: &str,
    retry: &pipeline_resilience::RetryConfig,
    errors: &mut Vec<String>,
) {
    if retry.max_attempts == 0 {
        errors.push(format!("{prefix}.retry.max_attempts must be > 0"));
    }
    if retry.multiplier < 1.0 {
        errors.push(format!("{prefix}.retry.multiplier must be >= 1"));
    }
    if retry.initial_delay > retry.max_delay {
        errors.push(format!("{prefix}.retry.initial_delay exceeds max_delay"));
    }
}
