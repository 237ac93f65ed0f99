use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use dbpulse::annotator::AnnotatorGateway;
use dbpulse::app::AppContext;
use dbpulse::config::AppConfig;
use dbpulse::http::create_router;
use dbpulse::metrics::AppMetrics;
use dbpulse::model::{ProbeKind, Row, Scalar};
use dbpulse::pipeline;
use dbpulse::rules::{RuleSet, RuleStore};
use dbpulse::sink::MemorySink;
use dbpulse::source::SampleSource;
use dbpulse::{Pipeline, PipelineParts, SharedState};

const RULES: &str = r#"
rules:
  - name: blocking
    applies_to: query_activity
    probe: blocking
    field: wait_time_ms
    op: ">"
    value: 30000
    severity: high
  - name: high_cpu
    applies_to: resource_counter
    field: cpu_percent
    op: ">"
    value: 90
    severity: low
"#;

fn rows() -> HashMap<ProbeKind, Vec<Row>> {
    let blocking: Row = [
        ("blocked_session_id".to_string(), Scalar::Int(5)),
        ("blocking_session_id".to_string(), Scalar::Int(7)),
        ("wait_time_ms".to_string(), Scalar::Int(45_000)),
    ]
    .into_iter()
    .collect();
    let cpu: Row = [("cpu_percent".to_string(), Scalar::Int(97))]
        .into_iter()
        .collect();

    let mut rows = HashMap::new();
    rows.insert(ProbeKind::Blocking, vec![blocking]);
    rows.insert(ProbeKind::CpuMemory, vec![cpu]);
    rows
}

struct TestApp {
    router: Router,
    cancel: CancellationToken,
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn test_app() -> TestApp {
    let config = AppConfig::default();
    let metrics = AppMetrics::new().expect("metrics");
    let state = SharedState::new();
    let sink = Arc::new(MemorySink::new());

    let pipeline = Pipeline::new(
        &config,
        PipelineParts {
            source: Arc::new(SampleSource::new(rows())),
            rules: RuleStore::from_set(RuleSet::from_yaml(RULES).expect("rules")),
            annotator: AnnotatorGateway::disabled(),
            sink: sink.clone(),
        },
        metrics.clone(),
        state.clone(),
    );

    let cancel = CancellationToken::new();
    let (handle, _driver) = pipeline::spawn(pipeline, None, cancel.clone());
    let ctx = AppContext::new(config, metrics, state, sink, handle);

    TestApp {
        router: create_router(ctx),
        cancel,
    }
}

async fn send(router: &Router, method: Method, uri: &str) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("request");
    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, body.to_vec())
}

async fn send_json(router: &Router, method: Method, uri: &str) -> (StatusCode, Value) {
    let (status, body) = send(router, method, uri).await;
    let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn healthz_is_unavailable_until_a_cycle_succeeds() {
    let app = test_app();

    let (status, _) = send(&app.router, Method::GET, "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, _) = send(&app.router, Method::POST, "/api/v1/cycles").await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app.router, Method::GET, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn triggered_cycle_returns_its_summary() {
    let app = test_app();

    let (status, summary) = send_json(&app.router, Method::POST, "/api/v1/cycles").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["cycle"], 1);
    assert_eq!(summary["records"], 2);
    assert_eq!(summary["emitted"].as_array().map(Vec::len), Some(2));
    assert!(summary["failure"].is_null());
    assert_eq!(summary["write_report"]["accepted"], 4);
}

#[tokio::test]
async fn active_alerts_and_summary_reflect_the_last_cycle() {
    let app = test_app();
    send(&app.router, Method::POST, "/api/v1/cycles").await;

    let (status, active) = send_json(&app.router, Method::GET, "/api/v1/alerts/active").await;
    assert_eq!(status, StatusCode::OK);
    let mut rules: Vec<&str> = active
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|alert| alert["rule_name"].as_str())
        .collect();
    rules.sort_unstable();
    assert_eq!(rules, vec!["blocking", "high_cpu"]);

    let (status, summary) = send_json(&app.router, Method::GET, "/api/v1/summary").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["alerts"]["active"], 2);
    assert_eq!(summary["last_cycle"]["cycle"], 1);
    assert_eq!(summary["loops"][0]["name"], "cycle");
}

#[tokio::test]
async fn alert_history_filters_by_minimum_severity() {
    let app = test_app();
    send(&app.router, Method::POST, "/api/v1/cycles").await;

    let (status, all) = send_json(&app.router, Method::GET, "/api/v1/alerts?window=1h").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(all.as_array().map(Vec::len), Some(2));

    let (status, high) =
        send_json(&app.router, Method::GET, "/api/v1/alerts?window=1h&severity=high").await;
    assert_eq!(status, StatusCode::OK);
    let high = high.as_array().expect("array");
    assert_eq!(high.len(), 1);
    assert_eq!(high[0]["rule_name"], "blocking");
}

#[tokio::test]
async fn metric_history_filters_by_kind() {
    let app = test_app();
    send(&app.router, Method::POST, "/api/v1/cycles").await;

    let (status, docs) = send_json(
        &app.router,
        Method::GET,
        "/api/v1/metrics?window=30m&kind=resource_counter",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let docs = docs.as_array().expect("array");
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["kind"], "resource_counter");
}

#[tokio::test]
async fn prometheus_endpoint_exposes_cycle_metrics() {
    let app = test_app();
    send(&app.router, Method::POST, "/api/v1/cycles").await;

    let (status, body) = send(&app.router, Method::GET, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    let body = String::from_utf8(body).expect("utf8");
    assert!(body.contains("dbpulse_cycle_duration_seconds"));
    assert!(body.contains("dbpulse_last_cycle_success"));
    assert!(body.contains("dbpulse_alerts_emitted_total"));
}
