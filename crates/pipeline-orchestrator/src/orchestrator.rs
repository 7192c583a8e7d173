//! Pipeline orchestrator.
//!
//! One invocation moves through authorization, idempotency resolution,
//! stage execution, merge and persistence:
//!
//! ```text
//! RECEIVED -> AUTHORIZED -> (idempotency key?) -> replay stored result
//!                        -> EXECUTING -> MERGING -> PERSISTING -> DONE
//! ```
//!
//! Extraction and embedding start together; recommendation starts once
//! extraction has settled, successfully or not. Upstream failures degrade
//! the affected stage and never fail the request. Only authorization, store
//! and audit faults, or a caller abort, leave this module as errors.

use chrono::{DateTime, Utc};
use pipeline_config::PipelineConfig;
use pipeline_core::{
    EmbeddingOutput, ExtractionOutput, PipelineError, PipelineInput, PipelineRequest,
    PipelineResult, Recommendation, Result, StageName, StageOutcome, StageTiming,
};
use pipeline_resilience::{AbortSignal, CallOptions, KeyValueStore, MemoryStore, UpstreamResult};
use pipeline_telemetry::{
    AuditActor, AuditEvent, AuditEventBuilder, AuditEventType, AuditLogger, AuditOutcome,
    AuditResource, AuditSink, PipelineMetrics,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::authz::{AccessDecision, AccessPolicy, RoleBasedPolicy};
use crate::cache::ExtractionCache;
use crate::idempotency::{ClaimOutcome, IdempotencyConfig, IdempotencyStore};
use crate::stages::{EmbeddingRequest, ExtractionRequest, RecommendationRequest, StageClients};

/// Output and timing of one executed stage
#[derive(Debug)]
struct StageRun<T> {
    output: Option<T>,
    timing: StageTiming,
    degraded: Option<String>,
}

/// Extraction run plus whether its output came from the upstream
#[derive(Debug)]
struct ExtractionRun {
    run: StageRun<ExtractionOutput>,
    fresh: bool,
}

#[derive(Debug)]
struct StagesOutcome {
    extraction: Option<ExtractionRun>,
    recommendation: StageRun<Vec<Recommendation>>,
    embedding: Option<StageRun<EmbeddingOutput>>,
}

struct StageClock {
    stage: StageName,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl StageClock {
    fn start(stage: StageName) -> Self {
        Self {
            stage,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    fn finish(self, outcome: StageOutcome, cached: bool) -> (StageTiming, Duration) {
        let elapsed = self.started.elapsed();
        let timing = StageTiming {
            stage: self.stage,
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms: millis(elapsed),
            cached,
            outcome,
        };
        (timing, elapsed)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Orchestrates one clinical pipeline invocation across the upstream stages
#[derive(Clone)]
pub struct PipelineOrchestrator {
    stages: StageClients,
    policy: Arc<dyn AccessPolicy>,
    cache: ExtractionCache,
    idempotency: IdempotencyStore,
    audit: Arc<dyn AuditSink>,
    audit_mandatory: bool,
    metrics: Option<PipelineMetrics>,
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("stages", &self.stages)
            .field("cache", &self.cache)
            .field("idempotency", &self.idempotency)
            .field("audit_mandatory", &self.audit_mandatory)
            .finish_non_exhaustive()
    }
}

impl PipelineOrchestrator {
    /// Start building an orchestrator over `stages`
    #[must_use]
    pub fn builder(stages: StageClients) -> PipelineOrchestratorBuilder {
        PipelineOrchestratorBuilder::new(stages)
    }

    /// Stage clients
    #[must_use]
    pub fn stages(&self) -> &StageClients {
        &self.stages
    }

    /// Run the pipeline
    pub async fn run(&self, request: PipelineRequest) -> Result<PipelineResult> {
        self.run_with_abort(request, &AbortSignal::never()).await
    }

    /// Run the pipeline, cancelling in-flight work when `abort` fires
    ///
    /// Cancellation is strict: an aborted run returns
    /// [`PipelineError::Aborted`], writes nothing to the cache or the
    /// idempotency store, and releases its idempotency claim.
    #[instrument(
        name = "pipeline.run",
        skip_all,
        fields(
            request_id = %request.request_id,
            correlation_id = %request.correlation_id,
            user_id = %request.user.user_id
        )
    )]
    pub async fn run_with_abort(
        &self,
        request: PipelineRequest,
        abort: &AbortSignal,
    ) -> Result<PipelineResult> {
        let started = Instant::now();
        let outcome = self.execute(&request, abort, started).await;

        let label = match &outcome {
            Ok((_, true)) => "replayed",
            Ok((result, false)) if result.is_degraded() => "degraded",
            Ok(_) => "success",
            Err(e) => e.error_type(),
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_request(label);
        }

        match outcome {
            Ok((result, replayed)) => {
                info!(
                    outcome = label,
                    replayed,
                    cache_hit = result.cache_hit,
                    degraded = ?result.degraded_services,
                    total_ms = millis(started.elapsed()),
                    "Pipeline completed"
                );
                Ok(result)
            }
            Err(e) => {
                warn!(outcome = label, error = %e, "Pipeline failed");
                Err(e)
            }
        }
    }

    /// Returns the result and whether it was replayed from the idempotency store
    async fn execute(
        &self,
        request: &PipelineRequest,
        abort: &AbortSignal,
        started: Instant,
    ) -> Result<(PipelineResult, bool)> {
        self.authorize(request).await?;
        if abort.is_aborted() {
            return Err(PipelineError::Aborted);
        }

        let Some(key) = request.idempotency_key.as_deref() else {
            return self
                .produce(request, abort, started)
                .await
                .map(|result| (result, false));
        };

        match self
            .idempotency
            .resolve(key, &request.request_id, abort)
            .await?
        {
            ClaimOutcome::Completed(stored) => {
                self.audit_disclosure(request, &stored, AuditEventType::ResultReplay)
                    .await?;
                return Ok((*stored, true));
            }
            ClaimOutcome::Acquired => {}
        }

        let owner = &request.request_id;
        let produced = tokio::select! {
            produced = self.produce(request, abort, started) => produced,
            never = self.idempotency.keep_alive(key, owner) => match never {},
        };
        let stored = match produced {
            Ok(result) => self.idempotency.complete(key, owner, &result).await,
            Err(e) => Err(e),
        };
        match stored {
            // Another caller's result won the write
            Ok(stored) => {
                let replayed = stored.request_id != *owner;
                Ok((stored, replayed))
            }
            Err(e) => {
                self.idempotency.release(key, owner).await;
                Err(e)
            }
        }
    }

    async fn authorize(&self, request: &PipelineRequest) -> Result<()> {
        let decision = self
            .policy
            .check(&request.user, &request.input)
            .await
            .map_err(|fault| PipelineError::infrastructure("authorization", fault.to_string()))?;

        match decision {
            AccessDecision::Allow => Ok(()),
            AccessDecision::Deny(reason) => {
                warn!(role = %request.user.role, reason = %reason, "Access denied");
                let event = self
                    .audit_event(request, AuditEventType::AccessDenied)
                    .action("run_pipeline")
                    .outcome(AuditOutcome::Denied)
                    .metadata("reason", &reason)
                    .build();
                // A denial is reported as such even if it cannot be audited
                if let Err(e) = self.audit.log_access(event).await {
                    warn!(error = %e, "Failed to audit access denial");
                }
                Err(PipelineError::unauthorized(reason))
            }
        }
    }

    /// Execute, merge and persist
    async fn produce(
        &self,
        request: &PipelineRequest,
        abort: &AbortSignal,
        started: Instant,
    ) -> Result<PipelineResult> {
        let transcript = request.input.transcript();
        if transcript.is_some() {
            let event = self
                .audit_event(request, AuditEventType::TranscriptAccess)
                .action("extract")
                .field("transcriptText")
                .build();
            self.write_audit(event).await?;
        }

        // Stage calls watch `abort` themselves and settle their breaker admissions
        let outcome = self.run_stages(request, abort).await?;
        if abort.is_aborted() {
            return Err(PipelineError::Aborted);
        }

        let fresh_extraction = outcome
            .extraction
            .as_ref()
            .filter(|e| e.fresh)
            .and_then(|e| e.run.output.clone());
        let result = Self::merge(request, outcome, started);

        self.audit_disclosure(request, &result, AuditEventType::EntityDisclosure)
            .await?;

        if let (Some(text), Some(output)) = (transcript, fresh_extraction) {
            self.cache.put(text, &output).await?;
        }
        Ok(result)
    }

    async fn run_stages(
        &self,
        request: &PipelineRequest,
        abort: &AbortSignal,
    ) -> Result<StagesOutcome> {
        let options = || {
            CallOptions::default()
                .request_id(request.request_id.as_str())
                .correlation_id(request.correlation_id.as_str())
                .abort(abort.clone())
        };
        let input = &request.input;

        let extraction_then_recommendation = async {
            let extraction = match ExtractionRequest::from_input(input) {
                Some(body) => Some(self.extraction_stage(&body, options()).await?),
                None => None,
            };
            let extracted = extraction.as_ref().and_then(|e| e.run.output.as_ref());
            let recommendation = self
                .recommendation_stage(input, extracted, options())
                .await;
            Ok::<_, PipelineError>((extraction, recommendation))
        };

        let embedding = async {
            if input.condition_codes.is_empty() {
                None
            } else {
                Some(self.embedding_stage(input, options()).await)
            }
        };

        let (chain, embedding) = tokio::join!(extraction_then_recommendation, embedding);
        let (extraction, recommendation) = chain?;
        Ok(StagesOutcome {
            extraction,
            recommendation,
            embedding,
        })
    }

    async fn extraction_stage(
        &self,
        body: &ExtractionRequest<'_>,
        options: CallOptions,
    ) -> Result<ExtractionRun> {
        let clock = StageClock::start(StageName::Extraction);

        if let Some(cached) = self.cache.get(body.transcript_text).await? {
            let (timing, elapsed) = clock.finish(StageOutcome::Succeeded, true);
            self.observe(&timing, elapsed);
            return Ok(ExtractionRun {
                run: StageRun {
                    output: Some(cached),
                    timing,
                    degraded: None,
                },
                fresh: false,
            });
        }

        let result = self.stages.extract(body, options).await;
        let run = self.settle(clock, self.stages.extraction.target(), result);
        Ok(ExtractionRun {
            fresh: run.output.is_some(),
            run,
        })
    }

    async fn recommendation_stage(
        &self,
        input: &PipelineInput,
        extraction: Option<&ExtractionOutput>,
        options: CallOptions,
    ) -> StageRun<Vec<Recommendation>> {
        let clock = StageClock::start(StageName::Recommendation);
        let body = RecommendationRequest::new(input, extraction);
        let result = self.stages.recommend(&body, options).await;
        self.settle(clock, self.stages.recommendation.target(), result)
    }

    async fn embedding_stage(
        &self,
        input: &PipelineInput,
        options: CallOptions,
    ) -> StageRun<EmbeddingOutput> {
        let clock = StageClock::start(StageName::Embedding);
        let body = EmbeddingRequest {
            condition_codes: &input.condition_codes,
        };
        let result = self.stages.embed(&body, options).await;
        self.settle(clock, self.stages.embedding.target(), result)
    }

    /// Turn an upstream result into a stage run, degrading on failure
    fn settle<T>(
        &self,
        clock: StageClock,
        target: &str,
        result: UpstreamResult<T>,
    ) -> StageRun<T> {
        let stage = clock.stage;
        match result {
            Ok(output) => {
                let (timing, elapsed) = clock.finish(StageOutcome::Succeeded, false);
                self.observe(&timing, elapsed);
                StageRun {
                    output: Some(output),
                    timing,
                    degraded: None,
                }
            }
            Err(err) => {
                warn!(
                    stage = %stage,
                    upstream = %target,
                    kind = err.kind_label(),
                    error = %err,
                    "Stage degraded"
                );
                let (timing, elapsed) = clock.finish(StageOutcome::Degraded, false);
                self.observe(&timing, elapsed);
                if let Some(metrics) = &self.metrics {
                    metrics.record_degraded(target);
                }
                StageRun {
                    output: None,
                    timing,
                    degraded: Some(target.to_string()),
                }
            }
        }
    }

    fn observe(&self, timing: &StageTiming, elapsed: Duration) {
        if let Some(metrics) = &self.metrics {
            let outcome = match (timing.outcome, timing.cached) {
                (StageOutcome::Succeeded, true) => "cached",
                (StageOutcome::Succeeded, false) => "succeeded",
                (StageOutcome::Degraded, _) => "degraded",
            };
            metrics.observe_stage(timing.stage.as_str(), outcome, elapsed);
        }
    }

    fn merge(
        request: &PipelineRequest,
        outcome: StagesOutcome,
        started: Instant,
    ) -> PipelineResult {
        let mut timings = Vec::with_capacity(3);
        let mut degraded_services = Vec::new();

        let mut extracted_entities = None;
        let mut red_flags = Vec::new();
        if let Some(ExtractionRun { run, .. }) = outcome.extraction {
            timings.push(run.timing);
            degraded_services.extend(run.degraded);
            if let Some(output) = run.output {
                extracted_entities = Some(output.entities);
                red_flags = output.red_flags;
            }
        }

        let recommendation = outcome.recommendation;
        timings.push(recommendation.timing);
        degraded_services.extend(recommendation.degraded);
        let recommendations = recommendation.output.unwrap_or_default();

        let mut embeddings = None;
        if let Some(run) = outcome.embedding {
            timings.push(run.timing);
            degraded_services.extend(run.degraded);
            embeddings = run.output;
        }

        timings.sort_by_key(|t| t.finished_at);
        let stages_executed = timings.iter().map(|t| t.stage).collect();
        let cache_hit = timings.iter().any(|t| t.cached);

        PipelineResult {
            request_id: request.request_id.clone(),
            correlation_id: request.correlation_id.clone(),
            extracted_entities,
            red_flags,
            recommendations,
            embeddings,
            degraded_services,
            stages_executed,
            timings,
            total_duration_ms: millis(started.elapsed()),
            cache_hit,
            created_at: Utc::now(),
        }
    }

    fn audit_event(
        &self,
        request: &PipelineRequest,
        event_type: AuditEventType,
    ) -> AuditEventBuilder {
        let resource = match &request.input.visit_id {
            Some(visit) => AuditResource::new("visit", visit),
            None => AuditResource::new("patient", &request.input.patient_id),
        };
        AuditEventBuilder::new(
            event_type,
            AuditActor::from(&request.user),
            resource,
            request.correlation_id.as_str(),
        )
        .request_id(request.request_id.as_str())
        .metadata("patient_id", &request.input.patient_id)
    }

    /// Audit the clinical fields a result discloses, if any
    async fn audit_disclosure(
        &self,
        request: &PipelineRequest,
        result: &PipelineResult,
        event_type: AuditEventType,
    ) -> Result<()> {
        let mut builder = self.audit_event(request, event_type).action(match event_type {
            AuditEventType::ResultReplay => "replay",
            _ => "disclose",
        });
        let mut disclosed = false;
        if result.extracted_entities.is_some() {
            builder = builder.field("extractedEntities");
            disclosed = true;
        }
        if !result.red_flags.is_empty() {
            builder = builder.field("redFlags");
            disclosed = true;
        }
        if !result.recommendations.is_empty() {
            builder = builder.field("recommendations");
            disclosed = true;
        }
        if !disclosed {
            return Ok(());
        }
        if event_type == AuditEventType::ResultReplay {
            builder = builder.metadata("original_request_id", result.request_id.as_str());
        }
        self.write_audit(builder.build()).await
    }

    async fn write_audit(&self, event: AuditEvent) -> Result<()> {
        match self.audit.log_access(event).await {
            Ok(()) => Ok(()),
            Err(e) if self.audit_mandatory => {
                Err(PipelineError::infrastructure("audit", e.to_string()))
            }
            Err(e) => {
                warn!(error = %e, "Audit entry not written");
                Ok(())
            }
        }
    }
}

/// Builder for [`PipelineOrchestrator`]
pub struct PipelineOrchestratorBuilder {
    stages: StageClients,
    policy: Option<Arc<dyn AccessPolicy>>,
    store: Option<Arc<dyn KeyValueStore>>,
    cache_ttl: Duration,
    idempotency: IdempotencyConfig,
    audit: Option<Arc<dyn AuditSink>>,
    audit_mandatory: bool,
    metrics: Option<PipelineMetrics>,
}

impl PipelineOrchestratorBuilder {
    /// Builder with default settings
    #[must_use]
    pub fn new(stages: StageClients) -> Self {
        Self {
            stages,
            policy: None,
            store: None,
            cache_ttl: Duration::from_secs(3600),
            idempotency: IdempotencyConfig::default(),
            audit: None,
            audit_mandatory: true,
            metrics: None,
        }
    }

    /// Apply cache, idempotency, audit and authorization settings
    #[must_use]
    pub fn config(mut self, config: &PipelineConfig) -> Self {
        self.cache_ttl = config.cache.ttl;
        self.idempotency = IdempotencyConfig {
            result_ttl: config.cache.idempotency_ttl,
            claim_ttl: config.cache.claim_ttl,
            poll_interval: config.cache.claim_poll_interval,
        };
        self.audit_mandatory = config.audit.mandatory;
        self.policy = Some(Arc::new(RoleBasedPolicy::new(
            &config.authorization.allowed_roles,
        )));
        self
    }

    /// Set the access policy
    #[must_use]
    pub fn policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Set the store backing the cache and idempotency keys
    #[must_use]
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the extraction cache TTL
    #[must_use]
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Set idempotency settings
    #[must_use]
    pub fn idempotency(mut self, config: IdempotencyConfig) -> Self {
        self.idempotency = config;
        self
    }

    /// Set the audit sink
    #[must_use]
    pub fn audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Whether audit failures fail the request
    #[must_use]
    pub fn audit_mandatory(mut self, mandatory: bool) -> Self {
        self.audit_mandatory = mandatory;
        self
    }

    /// Record metrics
    #[must_use]
    pub fn metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the orchestrator
    #[must_use]
    pub fn build(self) -> PipelineOrchestrator {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::default()));
        let policy = self.policy.unwrap_or_else(|| {
            Arc::new(RoleBasedPolicy::new(
                pipeline_config::AuthorizationConfig::default().allowed_roles,
            ))
        });
        let audit = self
            .audit
            .unwrap_or_else(|| Arc::new(AuditLogger::with_defaults()));

        PipelineOrchestrator {
            stages: self.stages,
            policy,
            cache: ExtractionCache::new(Arc::clone(&store), self.cache_ttl),
            idempotency: IdempotencyStore::new(store, self.idempotency),
            audit,
            audit_mandatory: self.audit_mandatory,
            metrics: self.metrics,
        }
    }
}
