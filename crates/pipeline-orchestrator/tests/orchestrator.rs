//! End-to-end orchestrator tests against mock upstreams.

use async_trait::async_trait;
use pipeline_config::PipelineConfig;
use pipeline_core::{
    PipelineError, PipelineInput, PipelineRequest, RedFlag, StageName, UserContext,
};
use pipeline_orchestrator::{PipelineOrchestrator, StageClients};
use pipeline_resilience::{
    AbortController, CircuitBreakerRegistry, HttpTransport, KeyValueStore, MemoryStore,
    RetryConfig, StoreError, StoreResult,
};
use pipeline_telemetry::{
    AuditError, AuditEvent, AuditEventType, AuditLogConfig, AuditLogger, AuditSink,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    server: MockServer,
    orchestrator: PipelineOrchestrator,
    audit: AuditLogger,
}

fn config(uri: &str) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.defaults.retry = RetryConfig {
        max_attempts: 2,
        initial_delay: Duration::from_millis(5),
        multiplier: 2.0,
        max_delay: Duration::from_millis(20),
        jitter: false,
    };
    config.defaults.timeout = Duration::from_secs(2);
    config.cache.claim_poll_interval = Duration::from_millis(10);
    config.targets.extraction.base_url = uri.to_string();
    config.targets.recommendation.base_url = uri.to_string();
    config.targets.embedding.base_url = uri.to_string();
    config
}

async fn harness_with(tune: impl FnOnce(&mut PipelineConfig)) -> Harness {
    let server = MockServer::start().await;
    let mut config = config(&server.uri());
    tune(&mut config);

    let registry = CircuitBreakerRegistry::default();
    let transport = Arc::new(HttpTransport::new(Duration::from_secs(1)).unwrap());
    let stages = StageClients::from_config(&config, &registry, transport);
    let audit = AuditLogger::new(AuditLogConfig {
        log_to_stdout: false,
        ..Default::default()
    });

    let orchestrator = PipelineOrchestrator::builder(stages)
        .config(&config)
        .store(Arc::new(MemoryStore::default()))
        .audit(Arc::new(audit.clone()))
        .build();

    Harness {
        server,
        orchestrator,
        audit,
    }
}

async fn harness() -> Harness {
    harness_with(|_| {}).await
}

fn physician() -> UserContext {
    UserContext::new("dr-house", "physician").with_institution("ppth")
}

fn request(input: PipelineInput) -> PipelineRequest {
    PipelineRequest::builder(input, physician()).build()
}

fn chest_pain() -> PipelineInput {
    PipelineInput::new("patient-1")
        .with_visit("visit-1")
        .with_transcript("Patient reports chest pain")
}

async fn mount_extraction(server: &MockServer, expected: u64) {
    Mock::given(method("POST"))
        .and(path("/extract"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entities": {"symptoms": ["chest pain"], "diagnoses": [], "medications": []},
            "redFlags": [{"type": "CRITICAL", "description": "Chest pain"}]
        })))
        .expect(expected)
        .mount(server)
        .await;
}

async fn mount_recommendation(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/recommend"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "recommendations": [
                {
                    "templateId": "acs-workup",
                    "title": "Acute coronary syndrome work-up",
                    "score": 0.93
                }
            ]
        })))
        .mount(server)
        .await;
}

async fn requests_to(server: &MockServer, endpoint: &str) -> Vec<wiremock::Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == endpoint)
        .collect()
}

#[tokio::test]
async fn test_chest_pain_red_flag_and_recommendations() {
    let h = harness().await;
    mount_extraction(&h.server, 1).await;
    mount_recommendation(&h.server).await;

    let result = h.orchestrator.run(request(chest_pain())).await.unwrap();

    assert_eq!(result.red_flags, vec![RedFlag::new("CRITICAL", "Chest pain")]);
    assert!(result.red_flags[0].is_critical());
    assert_eq!(result.recommendations[0].template_id, "acs-workup");
    assert_eq!(
        result.extracted_entities.as_ref().unwrap().symptoms,
        vec!["chest pain".to_string()]
    );
    assert!(result.degraded_services.is_empty());
    assert!(!result.cache_hit);
    assert_eq!(
        result.stages_executed,
        vec![StageName::Extraction, StageName::Recommendation]
    );

    // Recommendation only starts after extraction settled
    let extraction = result.timing(StageName::Extraction).unwrap();
    let recommendation = result.timing(StageName::Recommendation).unwrap();
    assert!(recommendation.started_at >= extraction.finished_at);
}

#[tokio::test]
async fn test_recommendation_body_never_carries_transcript() {
    let h = harness().await;
    mount_extraction(&h.server, 1).await;
    mount_recommendation(&h.server).await;

    h.orchestrator.run(request(chest_pain())).await.unwrap();

    let sent = requests_to(&h.server, "/recommend").await;
    assert_eq!(sent.len(), 1);
    let body = String::from_utf8(sent[0].body.clone()).unwrap();
    assert!(!body.contains("transcriptText"));
    assert!(!body.contains("Patient reports"));
    assert!(body.contains("CRITICAL"));
}

#[tokio::test]
async fn test_extraction_failure_degrades() {
    let h = harness().await;
    Mock::given(method("POST"))
        .and(path("/extract"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&h.server)
        .await;
    mount_recommendation(&h.server).await;

    let result = h.orchestrator.run(request(chest_pain())).await.unwrap();

    assert_eq!(result.degraded_services, vec!["extraction-service".to_string()]);
    assert!(result.extracted_entities.is_none());
    assert!(!result.recommendations.is_empty());
    assert!(result.executed(StageName::Extraction));
    // Two attempts with the configured retry policy
    assert_eq!(requests_to(&h.server, "/extract").await.len(), 2);
}

#[tokio::test]
async fn test_no_transcript_skips_extraction() {
    let h = harness().await;
    mount_extraction(&h.server, 0).await;
    mount_recommendation(&h.server).await;
    Mock::given(method("POST"))
        .and(path("/embed"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"model": "clinical-embed-v1", "vectors": [[0.1, 0.2]]})),
        )
        .mount(&h.server)
        .await;

    let input = PipelineInput::new("patient-1").with_condition_codes(["I10"]);
    let result = h.orchestrator.run(request(input)).await.unwrap();

    assert!(!result.executed(StageName::Extraction));
    assert!(result.executed(StageName::Recommendation));
    assert!(result.executed(StageName::Embedding));
    assert_eq!(result.embeddings.unwrap().model, "clinical-embed-v1");
    assert!(result.red_flags.is_empty());
    assert!(h
        .audit
        .events_by_type(AuditEventType::TranscriptAccess)
        .await
        .is_empty());
}

#[tokio::test]
async fn test_embedding_failure_degrades_only_embedding() {
    let h = harness().await;
    mount_recommendation(&h.server).await;
    Mock::given(method("POST"))
        .and(path("/embed"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&h.server)
        .await;

    let input = PipelineInput::new("patient-1").with_condition_codes(["I10"]);
    let result = h.orchestrator.run(request(input)).await.unwrap();

    assert_eq!(result.degraded_services, vec!["embedding-service".to_string()]);
    assert!(result.embeddings.is_none());
    assert!(!result.recommendations.is_empty());
}

#[tokio::test]
async fn test_recommendation_failure_returns_empty_list() {
    let h = harness().await;
    mount_extraction(&h.server, 1).await;
    Mock::given(method("POST"))
        .and(path("/recommend"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&h.server)
        .await;

    let result = h.orchestrator.run(request(chest_pain())).await.unwrap();
    assert!(result.recommendations.is_empty());
    assert_eq!(
        result.degraded_services,
        vec!["recommendation-service".to_string()]
    );
    // Extraction output survives the recommendation failure
    assert_eq!(result.red_flags.len(), 1);
}

#[tokio::test]
async fn test_content_cache_hit_and_expiry() {
    let h = harness_with(|c| c.cache.ttl = Duration::from_millis(300)).await;
    mount_extraction(&h.server, 2).await;
    mount_recommendation(&h.server).await;

    let first = h.orchestrator.run(request(chest_pain())).await.unwrap();
    assert!(!first.cache_hit);

    let second = h.orchestrator.run(request(chest_pain())).await.unwrap();
    assert!(second.cache_hit);
    assert_eq!(second.red_flags, first.red_flags);
    let timing = second.timing(StageName::Extraction).unwrap();
    assert!(timing.cached);
    assert!(timing.duration_ms < 50);
    assert_eq!(requests_to(&h.server, "/extract").await.len(), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let third = h.orchestrator.run(request(chest_pain())).await.unwrap();
    assert!(!third.cache_hit);
    assert_eq!(requests_to(&h.server, "/extract").await.len(), 2);
}

#[tokio::test]
async fn test_concurrent_idempotent_requests_execute_once() {
    let h = harness().await;
    mount_extraction(&h.server, 1).await;
    Mock::given(method("POST"))
        .and(path("/recommend"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"recommendations": [{"templateId": "t1", "title": "T1"}]}))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&h.server)
        .await;

    let build = || {
        PipelineRequest::builder(chest_pain(), physician())
            .idempotency_key("visit-1-note")
            .build()
    };
    let (a, b) = tokio::join!(
        h.orchestrator.run(build()),
        h.orchestrator.run(build())
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.request_id, b.request_id);
    assert_eq!(a, b);

    // A later call replays without touching the upstreams
    let c = h.orchestrator.run(build()).await.unwrap();
    assert_eq!(c, a);
    assert_eq!(
        h.audit
            .events_by_type(AuditEventType::ResultReplay)
            .await
            .len(),
        2
    );
}

#[tokio::test]
async fn test_unauthorized_role_makes_no_calls() {
    let h = harness().await;
    mount_extraction(&h.server, 0).await;

    let req = PipelineRequest::builder(chest_pain(), UserContext::new("u-9", "billing")).build();
    let err = h.orchestrator.run(req).await.unwrap_err();

    assert!(matches!(err, PipelineError::Unauthorized { .. }));
    assert_eq!(err.status_code(), 403);
    assert!(h.server.received_requests().await.unwrap_or_default().is_empty());

    let denied = h.audit.events_by_type(AuditEventType::AccessDenied).await;
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].actor.role, "billing");
}

struct BrokenAudit;

#[async_trait]
impl AuditSink for BrokenAudit {
    async fn log_access(&self, _event: AuditEvent) -> Result<(), AuditError> {
        Err(AuditError::Unavailable("audit database down".to_string()))
    }
}

#[tokio::test]
async fn test_mandatory_audit_failure_is_infrastructure_error() {
    let server = MockServer::start().await;
    mount_extraction(&server, 0).await;
    let config = config(&server.uri());
    let stages = StageClients::from_config(
        &config,
        &CircuitBreakerRegistry::default(),
        Arc::new(HttpTransport::new(Duration::from_secs(1)).unwrap()),
    );
    let orchestrator = PipelineOrchestrator::builder(stages)
        .config(&config)
        .audit(Arc::new(BrokenAudit))
        .build();

    let err = orchestrator.run(request(chest_pain())).await.unwrap_err();
    assert!(
        matches!(err, PipelineError::Infrastructure { ref component, .. } if component == "audit")
    );
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_transcript_access_audited_once_across_retries() {
    let h = harness().await;
    Mock::given(method("POST"))
        .and(path("/extract"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&h.server)
        .await;
    mount_extraction(&h.server, 1).await;
    mount_recommendation(&h.server).await;

    let req = request(chest_pain());
    let correlation = req.correlation_id.clone();
    h.orchestrator.run(req).await.unwrap();

    let accesses = h
        .audit
        .events_by_type(AuditEventType::TranscriptAccess)
        .await;
    assert_eq!(accesses.len(), 1);
    assert_eq!(accesses[0].correlation_id, correlation.as_str());
    assert_eq!(accesses[0].resource.id, "visit-1");
    assert_eq!(accesses[0].fields, vec!["transcriptText".to_string()]);

    let disclosures = h
        .audit
        .events_by_type(AuditEventType::EntityDisclosure)
        .await;
    assert_eq!(disclosures.len(), 1);
}

#[tokio::test]
async fn test_abort_releases_claim_and_stores_nothing() {
    let h = harness().await;
    mount_extraction(&h.server, 2).await;
    Mock::given(method("POST"))
        .and(path("/recommend"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"recommendations": [{"templateId": "t1", "title": "T1"}]}))
                .set_delay(Duration::from_secs(5)),
        )
        .up_to_n_times(1)
        .mount(&h.server)
        .await;
    mount_recommendation(&h.server).await;

    let build = || {
        PipelineRequest::builder(chest_pain(), physician())
            .idempotency_key("abort-me")
            .build()
    };

    let controller = AbortController::new();
    let run = tokio::spawn({
        let orchestrator = h.orchestrator.clone();
        let signal = controller.signal();
        let req = build();
        async move { orchestrator.run_with_abort(req, &signal).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.abort();

    let err = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("abort should end the run")
        .unwrap()
        .unwrap_err();
    assert_eq!(err, PipelineError::Aborted);

    // The claim was released and nothing was cached: a retry runs fresh
    let result = h.orchestrator.run(build()).await.unwrap();
    assert!(!result.cache_hit);
    assert_eq!(result.recommendations[0].template_id, "acs-workup");
}

#[tokio::test]
async fn test_claim_outlives_its_ttl_during_a_slow_run() {
    let h = harness_with(|c| c.cache.claim_ttl = Duration::from_millis(200)).await;
    Mock::given(method("POST"))
        .and(path("/extract"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "entities": {"symptoms": ["chest pain"], "diagnoses": [], "medications": []},
                    "redFlags": []
                }))
                .set_delay(Duration::from_millis(800)),
        )
        .expect(1)
        .mount(&h.server)
        .await;
    mount_recommendation(&h.server).await;

    let build = || {
        PipelineRequest::builder(chest_pain(), physician())
            .idempotency_key("slow-note")
            .build()
    };
    let first = tokio::spawn({
        let orchestrator = h.orchestrator.clone();
        let req = build();
        async move { orchestrator.run(req).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = h.orchestrator.run(build()).await.unwrap();
    let first = first.await.unwrap().unwrap();

    assert_eq!(first.request_id, second.request_id);
    assert_eq!(requests_to(&h.server, "/extract").await.len(), 1);
    assert_eq!(requests_to(&h.server, "/recommend").await.len(), 1);
}

#[tokio::test]
async fn test_stage_timeout_degrades_without_blocking_embedding() {
    let h = harness_with(|c| c.targets.extraction.timeout = Some(Duration::from_millis(100))).await;
    Mock::given(method("POST"))
        .and(path("/extract"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&h.server)
        .await;
    mount_recommendation(&h.server).await;
    Mock::given(method("POST"))
        .and(path("/embed"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"model": "clinical-embed-v1", "vectors": [[0.1, 0.2]]})),
        )
        .expect(1)
        .mount(&h.server)
        .await;

    let input = chest_pain().with_condition_codes(["I10"]);
    let result = h.orchestrator.run(request(input)).await.unwrap();

    assert_eq!(result.degraded_services, vec!["extraction-service".to_string()]);
    assert!(result.extracted_entities.is_none());
    assert_eq!(result.embeddings.as_ref().unwrap().model, "clinical-embed-v1");
    assert!(!result.recommendations.is_empty());
    // Embedding settled while extraction was still timing out
    let extraction = result.timing(StageName::Extraction).unwrap();
    let embedding = result.timing(StageName::Embedding).unwrap();
    assert!(embedding.finished_at <= extraction.finished_at);
}

#[tokio::test]
async fn test_open_breaker_degrades_stage() {
    let server = MockServer::start().await;
    mount_extraction(&server, 1).await;
    mount_recommendation(&server).await;
    let config = config(&server.uri());
    let registry = CircuitBreakerRegistry::default();
    registry.get("recommendation-service").force_open();
    let stages = StageClients::from_config(
        &config,
        &registry,
        Arc::new(HttpTransport::new(Duration::from_secs(1)).unwrap()),
    );
    let orchestrator = PipelineOrchestrator::builder(stages).config(&config).build();

    let result = orchestrator.run(request(chest_pain())).await.unwrap();

    assert_eq!(
        result.degraded_services,
        vec!["recommendation-service".to_string()]
    );
    assert!(result.recommendations.is_empty());
    assert_eq!(result.red_flags.len(), 1);
    assert!(requests_to(&server, "/recommend").await.is_empty());
}

struct UnreachableStore;

#[async_trait]
impl KeyValueStore for UnreachableStore {
    async fn get(&self, _key: &str) -> StoreResult<Option<Vec<u8>>> {
        Err(StoreError::Connection("connection refused".to_string()))
    }

    async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Option<Duration>) -> StoreResult<()> {
        Err(StoreError::Connection("connection refused".to_string()))
    }

    async fn set_if_absent(
        &self,
        _key: &str,
        _value: Vec<u8>,
        _ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        Err(StoreError::Connection("connection refused".to_string()))
    }

    async fn delete(&self, _key: &str) -> StoreResult<()> {
        Err(StoreError::Connection("connection refused".to_string()))
    }

    async fn delete_if_equals(&self, _key: &str, _expected: &[u8]) -> StoreResult<bool> {
        Err(StoreError::Connection("connection refused".to_string()))
    }

    async fn renew_if_equals(
        &self,
        _key: &str,
        _expected: &[u8],
        _ttl: Duration,
    ) -> StoreResult<bool> {
        Err(StoreError::Connection("connection refused".to_string()))
    }

    async fn health_check(&self) -> StoreResult<()> {
        Err(StoreError::Connection("connection refused".to_string()))
    }

    fn name(&self) -> &'static str {
        "unreachable"
    }
}

async fn unreachable_store_orchestrator(server: &MockServer) -> PipelineOrchestrator {
    let config = config(&server.uri());
    let stages = StageClients::from_config(
        &config,
        &CircuitBreakerRegistry::default(),
        Arc::new(HttpTransport::new(Duration::from_secs(1)).unwrap()),
    );
    PipelineOrchestrator::builder(stages)
        .config(&config)
        .store(Arc::new(UnreachableStore))
        .build()
}

#[tokio::test]
async fn test_unreachable_cache_is_infrastructure_error() {
    let server = MockServer::start().await;
    mount_extraction(&server, 0).await;
    mount_recommendation(&server).await;
    let orchestrator = unreachable_store_orchestrator(&server).await;

    let err = orchestrator.run(request(chest_pain())).await.unwrap_err();
    assert!(
        matches!(err, PipelineError::Infrastructure { ref component, .. } if component == "cache")
    );
    assert_eq!(err.status_code(), 503);
}

#[tokio::test]
async fn test_unreachable_idempotency_store_is_infrastructure_error() {
    let server = MockServer::start().await;
    let orchestrator = unreachable_store_orchestrator(&server).await;

    let req = PipelineRequest::builder(chest_pain(), physician())
        .idempotency_key("visit-1-note")
        .build();
    let err = orchestrator.run(req).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Infrastructure { ref component, .. } if component == "idempotency_store"
    ));
    assert!(err.is_retryable());
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}
