//! # Clinical Pipeline
//!
//! Orchestrates clinical artifact generation (entity extraction, template
//! recommendation and embedding enrichment) across unreliable upstream
//! services, with circuit breaking, retries, caching and idempotency.
//!
//! ## Usage
//!
//! ```bash
//! # Start with default configuration
//! clinical-pipeline
//!
//! # Start with a config file
//! PIPELINE_CONFIG=/etc/pipeline/config.yaml clinical-pipeline
//!
//! # Override individual settings
//! PIPELINE_PORT=9000 PIPELINE_EXTRACTION_URL=http://nlp:8001 clinical-pipeline
//! ```

use anyhow::Context;
use pipeline_config::{load_config, PipelineConfig};
use pipeline_orchestrator::{
    InMemoryJobQueue, PipelineJobProcessor, PipelineOrchestrator, StageClients,
};
use pipeline_resilience::{CircuitBreakerRegistry, HttpTransport, MemoryStore, TracingListener};
use pipeline_server::{AppState, Server, ServerConfig};
use pipeline_telemetry::{
    init_tracing, shutdown_tracing, AuditLogConfig, AuditLogger, PipelineMetrics, TracingConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Application entry point
#[tokio::main]
async fn main() {
    // Logging depends on the configuration, so load it first
    let config = match load_config().await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let provider = match init_tracing(&tracing_config(&config)) {
        Ok(provider) => provider,
        Err(e) => {
            eprintln!("Failed to initialize tracing: {e}");
            None
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting clinical pipeline"
    );

    let outcome = run(config).await;
    if let Err(e) = &outcome {
        error!(error = %format!("{e:#}"), "Application failed");
    }
    shutdown_tracing(provider);
    if outcome.is_err() {
        std::process::exit(1);
    }
}

fn tracing_config(config: &PipelineConfig) -> TracingConfig {
    let telemetry = &config.telemetry;
    let mut tracing = TracingConfig::new("clinical-pipeline")
        .with_environment(&telemetry.environment)
        .with_log_level(&telemetry.log_level)
        .with_json(telemetry.json)
        .with_sampling_rate(telemetry.sampling_rate);
    if telemetry.otlp_endpoint.is_some() {
        tracing = tracing.with_opentelemetry(telemetry.otlp_endpoint.clone());
    }
    tracing
}

/// Main application logic
async fn run(config: PipelineConfig) -> anyhow::Result<()> {
    info!(
        host = %config.server.host,
        port = config.server.port,
        extraction = %config.targets.extraction.base_url,
        recommendation = %config.targets.recommendation.base_url,
        embedding = %config.targets.embedding.base_url,
        "Configuration loaded"
    );

    let metrics = PipelineMetrics::new().context("failed to create metrics registry")?;

    let breakers = Arc::new(create_breaker_registry(&config, &metrics));
    let transport =
        Arc::new(HttpTransport::new(CONNECT_TIMEOUT).context("failed to create HTTP client")?);
    let stages = StageClients::from_config(&config, &breakers, transport);

    let audit = AuditLogger::new(AuditLogConfig {
        enabled: true,
        log_to_stdout: config.audit.log_to_stdout,
        buffer_size: config.audit.buffer_size,
    });

    let orchestrator = PipelineOrchestrator::builder(stages)
        .config(&config)
        .store(Arc::new(MemoryStore::new(config.cache.max_entries)))
        .audit(Arc::new(audit))
        .metrics(metrics.clone())
        .build();

    let jobs = InMemoryJobQueue::start_with_retention(
        Arc::new(PipelineJobProcessor::new(orchestrator.clone())),
        config.queue.retry.clone(),
        config.queue.concurrency,
        config.queue.status_retention,
    );
    info!(concurrency = config.queue.concurrency, "Job queue started");

    let state = AppState::builder(orchestrator)
        .breakers(Arc::clone(&breakers))
        .metrics(metrics)
        .jobs(Arc::new(jobs))
        .request_timeout(config.server.request_timeout)
        .build()
        .context("failed to build application state")?;

    let server = Server::new(ServerConfig::from(&config.server), state);
    server.run().await.context("server failed")?;

    Ok(())
}

/// Breakers for every target, with per-target overrides and event listeners
fn create_breaker_registry(
    config: &PipelineConfig,
    metrics: &PipelineMetrics,
) -> CircuitBreakerRegistry {
    let mut registry = CircuitBreakerRegistry::new(config.defaults.circuit_breaker.clone())
        .with_listener(Arc::new(TracingListener))
        .with_listener(metrics.listener());

    for target in config.targets.iter() {
        if let Some(breaker) = &target.circuit_breaker {
            registry = registry.with_target_config(&target.name, breaker.clone());
        }
    }
    registry
}
