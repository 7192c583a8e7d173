//! `ResilientClient` integration tests against mock upstreams.

use pipeline_resilience::{
    AbortController, CallOptions, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
    HealthVerdict, HttpTransport, ResilientClient, RetryConfig, TargetConfig, UpstreamError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Serialize)]
struct Query {
    codes: Vec<String>,
}

#[derive(Debug, Deserialize, PartialEq)]
struct Answer {
    ok: bool,
}

fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay: Duration::from_millis(5),
        multiplier: 2.0,
        max_delay: Duration::from_millis(20),
        jitter: false,
    }
}

fn client_for(
    server: &MockServer,
    registry: &CircuitBreakerRegistry,
    attempts: u32,
) -> ResilientClient {
    let transport = Arc::new(HttpTransport::new(Duration::from_secs(1)).unwrap());
    ResilientClient::new(
        TargetConfig::new("recommendation-service", server.uri())
            .with_timeout(Duration::from_secs(2))
            .with_retry(fast_retry(attempts)),
        registry,
        transport,
    )
}

fn query() -> Query {
    Query {
        codes: vec!["I10".to_string()],
    }
}

#[tokio::test]
async fn test_success_propagates_ids() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/recommend"))
        .and(header("x-request-id", "req-42"))
        .and(header("x-correlation-id", "corr-7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let registry = CircuitBreakerRegistry::default();
    let client = client_for(&server, &registry, 3);

    let response = client
        .post_json::<_, Answer>(
            "/recommend",
            &query(),
            CallOptions::default()
                .request_id("req-42")
                .correlation_id("corr-7"),
        )
        .await
        .unwrap();

    assert_eq!(response.data, Answer { ok: true });
    assert_eq!(response.status, 200);
    assert_eq!(response.attempts, 1);
    assert!(!response.from_cache);
}

#[tokio::test]
async fn test_ids_generated_when_absent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header_exists("x-request-id"))
        .and(header_exists("x-correlation-id"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let registry = CircuitBreakerRegistry::default();
    let client = client_for(&server, &registry, 1);
    client
        .post_json::<_, Answer>("/recommend", &query(), CallOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_retries_server_errors_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let registry = CircuitBreakerRegistry::default();
    let client = client_for(&server, &registry, 3);

    let response = client
        .post_json::<_, Answer>("/recommend", &query(), CallOptions::default())
        .await
        .unwrap();

    assert_eq!(response.attempts, 3);
    let snapshot = client.breaker().snapshot();
    assert_eq!(snapshot.total_requests, 3);
    assert_eq!(snapshot.failure_count, 2);
}

#[tokio::test]
async fn test_client_error_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({"error": "bad codes"})))
        .expect(1)
        .mount(&server)
        .await;

    let registry = CircuitBreakerRegistry::default();
    let client = client_for(&server, &registry, 3);

    let err = client
        .post_json::<_, Answer>("/recommend", &query(), CallOptions::default())
        .await
        .unwrap_err();

    match err {
        UpstreamError::Status { status, body, .. } => {
            assert_eq!(status, 422);
            assert_eq!(body.unwrap()["error"], "bad codes");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_body_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .expect(1)
        .mount(&server)
        .await;

    let registry = CircuitBreakerRegistry::default();
    let client = client_for(&server, &registry, 3);

    let err = client
        .post_json::<_, Answer>("/recommend", &query(), CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, UpstreamError::MalformedResponse { .. }));
}

#[tokio::test]
async fn test_attempt_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"ok": true}))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let registry = CircuitBreakerRegistry::default();
    let client = client_for(&server, &registry, 1);

    let err = client
        .post_json::<_, Answer>(
            "/recommend",
            &query(),
            CallOptions::default().timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, UpstreamError::Timeout { .. }), "{err:?}");
}

#[tokio::test]
async fn test_open_circuit_fails_fast() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: 2,
        ..Default::default()
    });
    let client = client_for(&server, &registry, 1);

    for _ in 0..2 {
        let err = client
            .post_json::<_, Answer>("/recommend", &query(), CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(500));
    }
    assert_eq!(client.breaker().state(), CircuitState::Open);

    let err = client
        .post_json::<_, Answer>("/recommend", &query(), CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, UpstreamError::CircuitOpen { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_circuit_opening_mid_retry_stops_loop() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: 2,
        ..Default::default()
    });
    let client = client_for(&server, &registry, 5);

    let err = client
        .post_json::<_, Answer>("/recommend", &query(), CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, UpstreamError::CircuitOpen { .. }), "{err:?}");
}

#[tokio::test]
async fn test_skip_circuit_breaker() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let registry = CircuitBreakerRegistry::default();
    let client = client_for(&server, &registry, 1);
    client.breaker().force_open();

    let response = client
        .post_json::<_, Answer>(
            "/recommend",
            &query(),
            CallOptions::default().skip_circuit_breaker(),
        )
        .await
        .unwrap();
    assert!(response.data.ok);
    // Bypassed calls are not recorded
    assert_eq!(client.breaker().snapshot().total_requests, 0);
}

#[tokio::test]
async fn test_abort_in_flight() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"ok": true}))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let registry = CircuitBreakerRegistry::default();
    let client = client_for(&server, &registry, 3);
    let controller = AbortController::new();
    let options = CallOptions::default().abort(controller.signal());

    let call = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .post_json::<_, Answer>("/recommend", &query(), options)
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    controller.abort();

    let err = tokio::time::timeout(Duration::from_secs(1), call)
        .await
        .expect("abort should end the call")
        .unwrap()
        .unwrap_err();
    assert!(err.is_aborted());
    assert_eq!(client.breaker().snapshot().failure_count, 0);
}

async fn half_open_client(
    server: &MockServer,
    registry: &CircuitBreakerRegistry,
) -> ResilientClient {
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"ok": true}))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(server)
        .await;

    let client = client_for(server, registry, 1);
    client.breaker().force_open();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(client.breaker().state(), CircuitState::HalfOpen);
    client
}

fn single_slot_registry() -> CircuitBreakerRegistry {
    CircuitBreakerRegistry::new(CircuitBreakerConfig {
        reset_timeout: Duration::from_millis(50),
        half_open_requests: 1,
        ..Default::default()
    })
}

#[tokio::test]
async fn test_dropped_half_open_call_frees_slot() {
    let server = MockServer::start().await;
    let registry = single_slot_registry();
    let client = half_open_client(&server, &registry).await;

    let body = query();
    let call = client.post_json::<_, Answer>("/recommend", &body, CallOptions::default());
    assert!(tokio::time::timeout(Duration::from_millis(100), call)
        .await
        .is_err());

    let snapshot = client.breaker().snapshot();
    assert_eq!(snapshot.state, CircuitState::HalfOpen);
    assert_eq!(snapshot.half_open_probes, 0);
}

#[tokio::test]
async fn test_aborted_half_open_call_frees_slot() {
    let server = MockServer::start().await;
    let registry = single_slot_registry();
    let client = half_open_client(&server, &registry).await;

    let controller = AbortController::new();
    let call = tokio::spawn({
        let client = client.clone();
        let options = CallOptions::default().abort(controller.signal());
        async move {
            client
                .post_json::<_, Answer>("/recommend", &query(), options)
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.abort();

    let err = call.await.unwrap().unwrap_err();
    assert!(err.is_aborted());
    assert_eq!(client.breaker().snapshot().half_open_probes, 0);
    assert!(client.breaker().try_acquire().is_admitted());
}

#[tokio::test]
async fn test_health_check_reports_version() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"status": "ok", "version": "1.4.2"})),
        )
        .mount(&server)
        .await;

    let registry = CircuitBreakerRegistry::default();
    let client = client_for(&server, &registry, 1);
    client.breaker().force_open();

    let report = client.health_check().await;
    assert_eq!(report.verdict, HealthVerdict::Healthy);
    assert_eq!(report.version.as_deref(), Some("1.4.2"));
    assert_eq!(report.circuit_state, CircuitState::Open);
}

#[tokio::test]
async fn test_health_check_degraded_and_unhealthy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "degraded"})))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let registry = CircuitBreakerRegistry::default();
    let client = client_for(&server, &registry, 1);

    assert_eq!(client.health_check().await.verdict, HealthVerdict::Degraded);
    let report = client.health_check().await;
    assert_eq!(report.verdict, HealthVerdict::Unhealthy);
    assert!(report.error.is_some());
}
