//! # Pipeline Config
//!
//! Configuration for the clinical pipeline.
//!
//! Settings are read from an optional YAML, TOML or JSON file, overridden by
//! `PIPELINE_*` environment variables and validated as a whole. Durations use
//! humantime notation (`"30s"`, `"2m"`).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod loader;
pub mod model;

pub use error::{ConfigError, ConfigResult};
pub use loader::{
    apply_env_overrides, load_config, parse, validate, ConfigFormat, ConfigLoader, CONFIG_PATH_ENV,
};
pub use model::{
    AuditConfig, AuthorizationConfig, CacheConfig, DefaultsConfig, PipelineConfig, QueueConfig,
    ResolvedTarget, ServerConfig, TargetSettings, TargetsConfig, TelemetryConfig,
};
