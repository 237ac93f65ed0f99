use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use dbpulse::annotator::{Annotator, AnnotatorGateway};
use dbpulse::config::AppConfig;
use dbpulse::error::{AnnotationFailure, CycleError, SinkError, SourceError};
use dbpulse::metrics::AppMetrics;
use dbpulse::model::{
    Alert, AlertState, Annotation, AnnotationSource, ProbeKind, Row, Scalar, Severity,
};
use dbpulse::rules::{RuleSet, RuleStore};
use dbpulse::sink::{BulkOutcome, Document, MemorySink, Sink, SinkQuery};
use dbpulse::source::MetricSource;
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
    message: "Session {entity_id} waited {wait_time_ms} ms on {blocking_session_id}"
"#;

/// Source whose rows and failures are swapped between cycles.
#[derive(Default)]
struct ScriptedSource {
    rows: Mutex<HashMap<ProbeKind, Vec<Row>>>,
    failing: Mutex<HashSet<ProbeKind>>,
}

impl ScriptedSource {
    fn set(&self, probe: ProbeKind, rows: Vec<Row>) {
        self.rows.lock().expect("rows").insert(probe, rows);
    }

    fn clear(&self, probe: ProbeKind) {
        self.rows.lock().expect("rows").remove(&probe);
    }

    fn fail(&self, probe: ProbeKind) {
        self.failing.lock().expect("failing").insert(probe);
    }
}

#[async_trait]
impl MetricSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch(&self, probe: ProbeKind) -> Result<Vec<Row>, SourceError> {
        if self.failing.lock().expect("failing").contains(&probe) {
            return Err(SourceError::Query(format!("{probe} exploded")));
        }
        Ok(self
            .rows
            .lock()
            .expect("rows")
            .get(&probe)
            .cloned()
            .unwrap_or_default())
    }
}

struct DownSink;

#[async_trait]
impl Sink for DownSink {
    fn name(&self) -> &str {
        "down"
    }

    async fn bulk(&self, _docs: &[Document]) -> Result<BulkOutcome, SinkError> {
        Err(SinkError::Unreachable("connection refused".into()))
    }

    async fn query(&self, _query: &SinkQuery) -> Result<Vec<serde_json::Value>, SinkError> {
        Err(SinkError::Unreachable("connection refused".into()))
    }
}

/// Memory sink that can be switched off at transport level.
struct SwitchableSink {
    inner: MemorySink,
    down: AtomicBool,
}

impl SwitchableSink {
    fn down() -> Self {
        Self {
            inner: MemorySink::new(),
            down: AtomicBool::new(true),
        }
    }

    fn restore(&self) {
        self.down.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Sink for SwitchableSink {
    fn name(&self) -> &str {
        "switchable"
    }

    async fn bulk(&self, docs: &[Document]) -> Result<BulkOutcome, SinkError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(SinkError::Unreachable("connection refused".into()));
        }
        self.inner.bulk(docs).await
    }

    async fn query(&self, query: &SinkQuery) -> Result<Vec<serde_json::Value>, SinkError> {
        self.inner.query(query).await
    }
}

struct StalledAnnotator;

#[async_trait]
impl Annotator for StalledAnnotator {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn annotate(&self, _alert: &Alert) -> Result<Annotation, AnnotationFailure> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(AnnotationFailure::Provider("unreachable".into()))
    }
}

fn row(fields: &[(&str, Scalar)]) -> Row {
    fields
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

fn blocking_row() -> Row {
    row(&[
        ("session", Scalar::Int(5)),
        ("wait_ms", Scalar::Int(35_000)),
        ("blocking_session", Scalar::Int(7)),
    ])
}

fn pipeline_with(
    source: Arc<ScriptedSource>,
    sink: Arc<dyn Sink>,
    annotator: AnnotatorGateway,
) -> Pipeline {
    let config = AppConfig::default();
    let rules = RuleSet::from_yaml(RULES).expect("rules");
    Pipeline::new(
        &config,
        PipelineParts {
            source,
            rules: RuleStore::from_set(rules),
            annotator,
            sink,
        },
        AppMetrics::new().expect("metrics"),
        SharedState::new(),
    )
}

#[tokio::test]
async fn blocking_row_raises_high_alert_then_resolves_once() {
    let source = Arc::new(ScriptedSource::default());
    let sink = Arc::new(MemorySink::new());
    let mut pipeline = pipeline_with(source.clone(), sink.clone(), AnnotatorGateway::disabled());
    let cancel = CancellationToken::new();

    source.set(ProbeKind::Blocking, vec![blocking_row()]);
    let first = pipeline.run_cycle(&cancel).await;
    assert!(first.is_success(), "{:?}", first.failure);
    assert_eq!(first.emitted.len(), 1);
    let alert = &first.emitted[0];
    assert_eq!(alert.rule_name, "blocking");
    assert_eq!(alert.entity_id, "5");
    assert_eq!(alert.severity, Severity::High);
    assert_eq!(alert.state, AlertState::New);
    assert_eq!(alert.message, "Session 5 waited 35000 ms on 7");

    source.clear(ProbeKind::Blocking);
    let second = pipeline.run_cycle(&cancel).await;
    assert_eq!(second.emitted.len(), 1);
    assert_eq!(second.emitted[0].state, AlertState::Resolved);
    assert_eq!(second.active_alerts, 0);

    let third = pipeline.run_cycle(&cancel).await;
    assert!(third.emitted.is_empty());

    let alert_docs = sink.documents("dbpulse-alerts").await;
    assert_eq!(alert_docs.len(), 2);
}

#[tokio::test]
async fn identical_cycles_emit_a_single_new_alert() {
    let source = Arc::new(ScriptedSource::default());
    let sink = Arc::new(MemorySink::new());
    let mut pipeline = pipeline_with(source.clone(), sink.clone(), AnnotatorGateway::disabled());
    let cancel = CancellationToken::new();
    source.set(ProbeKind::Blocking, vec![blocking_row()]);

    let mut emitted = Vec::new();
    for _ in 0..5 {
        let summary = pipeline.run_cycle(&cancel).await;
        assert!(summary.is_success());
        emitted.push(summary.emitted.len());
    }
    assert_eq!(emitted, vec![1, 0, 0, 0, 0]);
    assert_eq!(sink.len("dbpulse-alerts").await, 1);
}

#[tokio::test]
async fn metric_without_matching_rule_produces_no_candidate() {
    let source = Arc::new(ScriptedSource::default());
    let sink = Arc::new(MemorySink::new());
    let mut pipeline = pipeline_with(source.clone(), sink, AnnotatorGateway::disabled());
    source.set(
        ProbeKind::CpuMemory,
        vec![row(&[("cpu_percent", Scalar::Int(99))])],
    );

    let summary = pipeline.run_cycle(&CancellationToken::new()).await;
    assert_eq!(summary.records, 1);
    assert_eq!(summary.candidates, 0);
    assert!(summary.emitted.is_empty());
}

#[tokio::test]
async fn one_failing_probe_does_not_stop_the_rest() {
    let source = Arc::new(ScriptedSource::default());
    let sink = Arc::new(MemorySink::new());
    let mut pipeline = pipeline_with(source.clone(), sink.clone(), AnnotatorGateway::disabled());

    source.set(ProbeKind::Blocking, vec![blocking_row()]);
    source.set(
        ProbeKind::OpenTransactions,
        vec![row(&[("transaction_id", Scalar::Int(42)), ("duration_seconds", Scalar::Int(10))])],
    );
    source.set(
        ProbeKind::MissingIndexes,
        vec![row(&[
            ("database", Scalar::from("Sales")),
            ("table", Scalar::from("dbo.Orders")),
            ("avg_user_impact", Scalar::Int(50)),
        ])],
    );
    source.set(
        ProbeKind::SlowQueries,
        vec![row(&[("session_id", Scalar::Int(9)), ("elapsed_time_ms", Scalar::Int(900))])],
    );
    source.set(ProbeKind::CpuMemory, vec![row(&[("cpu_percent", Scalar::Int(20))])]);
    source.set(
        ProbeKind::TempdbHealth,
        vec![row(&[("free_space_kb", Scalar::Int(40_000))])],
    );
    source.fail(ProbeKind::Deadlocks);

    let summary = pipeline.run_cycle(&CancellationToken::new()).await;
    assert!(summary.is_success());
    assert_eq!(summary.probe_errors.len(), 1);
    assert_eq!(summary.probe_errors[0].probe, ProbeKind::Deadlocks);
    assert_eq!(summary.probes_succeeded, 6);
    assert_eq!(sink.len("dbpulse-metrics").await, 6);
    assert_eq!(summary.emitted.len(), 1);
}

#[tokio::test]
async fn failed_probe_holds_its_active_alerts() {
    let source = Arc::new(ScriptedSource::default());
    let sink = Arc::new(MemorySink::new());
    let mut pipeline = pipeline_with(source.clone(), sink, AnnotatorGateway::disabled());
    let cancel = CancellationToken::new();

    source.set(ProbeKind::Blocking, vec![blocking_row()]);
    pipeline.run_cycle(&cancel).await;

    source.fail(ProbeKind::Blocking);
    let held = pipeline.run_cycle(&cancel).await;
    assert!(held.emitted.is_empty());
    assert_eq!(held.active_alerts, 1);
}

#[tokio::test]
async fn all_probes_failing_fails_the_cycle() {
    let source = Arc::new(ScriptedSource::default());
    for probe in ProbeKind::ALL {
        source.fail(probe);
    }
    let sink = Arc::new(MemorySink::new());
    let mut pipeline = pipeline_with(source, sink.clone(), AnnotatorGateway::disabled());

    let summary = pipeline.run_cycle(&CancellationToken::new()).await;
    assert_eq!(summary.failure, Some(CycleError::AllProbesFailed(7)));
    assert_eq!(summary.probe_errors.len(), 7);
    assert!(summary.write_report.is_none());
    assert_eq!(sink.len("dbpulse-metrics").await, 0);
}

#[tokio::test]
async fn unreachable_sink_is_a_total_failure() {
    let source = Arc::new(ScriptedSource::default());
    source.set(ProbeKind::Blocking, vec![blocking_row()]);
    let mut pipeline = pipeline_with(source, Arc::new(DownSink), AnnotatorGateway::disabled());

    let summary = pipeline.run_cycle(&CancellationToken::new()).await;
    assert!(matches!(
        summary.failure,
        Some(CycleError::Sink(SinkError::TotalFailure { batches: 1, .. }))
    ));
    // Lifecycle state still advanced; the next cycle collects fresh data.
    assert_eq!(summary.active_alerts, 1);
}

#[tokio::test]
async fn alert_raised_while_sink_is_down_lands_after_recovery() {
    let source = Arc::new(ScriptedSource::default());
    source.set(ProbeKind::Blocking, vec![blocking_row()]);
    let sink = Arc::new(SwitchableSink::down());
    let mut pipeline = pipeline_with(source, sink.clone(), AnnotatorGateway::disabled());
    let cancel = CancellationToken::new();

    let outage = pipeline.run_cycle(&cancel).await;
    assert!(!outage.is_success());
    assert_eq!(outage.emitted.len(), 1);
    assert_eq!(outage.emitted[0].state, AlertState::New);

    sink.restore();
    for _ in 0..3 {
        let summary = pipeline.run_cycle(&cancel).await;
        assert!(summary.is_success(), "{:?}", summary.failure);
        assert!(summary.emitted.is_empty());
    }

    let alert_docs = sink.inner.documents("dbpulse-alerts").await;
    assert_eq!(alert_docs.len(), 1);
    assert_eq!(alert_docs[0].body["state"], "new");
    assert_eq!(sink.inner.len("dbpulse-metrics").await, 3);
}

#[tokio::test]
async fn rule_error_does_not_clear_a_sustained_condition() {
    let source = Arc::new(ScriptedSource::default());
    let sink = Arc::new(MemorySink::new());
    let mut pipeline = pipeline_with(source.clone(), sink.clone(), AnnotatorGateway::disabled());
    let cancel = CancellationToken::new();

    let unreadable = row(&[
        ("session", Scalar::Int(5)),
        ("wait_ms", Scalar::from("n/a")),
        ("blocking_session", Scalar::Int(7)),
    ]);

    let mut trail = Vec::new();
    for rows in [vec![blocking_row()], vec![unreadable], vec![blocking_row()]] {
        source.set(ProbeKind::Blocking, rows);
        let summary = pipeline.run_cycle(&cancel).await;
        let states: Vec<AlertState> = summary.emitted.iter().map(|alert| alert.state).collect();
        trail.push((summary.rule_errors.len(), states, summary.active_alerts));
    }

    assert_eq!(
        trail,
        vec![
            (0, vec![AlertState::New], 1),
            (1, vec![], 1),
            (0, vec![], 1),
        ]
    );
    assert_eq!(sink.len("dbpulse-alerts").await, 1);
}

#[tokio::test]
async fn shipped_rules_fire_on_live_postgres_counters() {
    let source = Arc::new(ScriptedSource::default());
    let rules_path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("alerting/rules.yaml");
    let mut pipeline = Pipeline::new(
        &AppConfig::default(),
        PipelineParts {
            source: source.clone(),
            rules: RuleStore::load(rules_path).expect("shipped rules"),
            annotator: AnnotatorGateway::disabled(),
            sink: Arc::new(MemorySink::new()),
        },
        AppMetrics::new().expect("metrics"),
        SharedState::new(),
    );
    let cancel = CancellationToken::new();

    let counters = |deadlocks: i64, temp_bytes: i64| {
        source.set(
            ProbeKind::CpuMemory,
            vec![row(&[
                ("connections", Scalar::Int(90)),
                ("max_connections", Scalar::Int(100)),
                ("connection_usage_percent", Scalar::Float(90.0)),
                ("cache_hit_percent", Scalar::Float(99.5)),
            ])],
        );
        source.set(
            ProbeKind::Deadlocks,
            vec![row(&[
                ("database_name", Scalar::from("orders")),
                ("deadlock_count", Scalar::Int(deadlocks)),
            ])],
        );
        source.set(
            ProbeKind::TempdbHealth,
            vec![row(&[
                ("temp_files", Scalar::Int(4)),
                ("temp_bytes", Scalar::Int(temp_bytes)),
            ])],
        );
    };

    counters(3, 1_000);
    let first = pipeline.run_cycle(&cancel).await;
    assert!(first.rule_errors.is_empty(), "{:?}", first.rule_errors);
    let raised: Vec<(&str, &str)> = first
        .emitted
        .iter()
        .map(|alert| (alert.rule_name.as_str(), alert.entity_id.as_str()))
        .collect();
    // Counters only have a baseline on the first sighting.
    assert_eq!(raised, vec![("connection_saturation", "server")]);

    counters(5, 3_000_000_000);
    let second = pipeline.run_cycle(&cancel).await;
    let mut raised: Vec<(&str, &str)> = second
        .emitted
        .iter()
        .map(|alert| (alert.rule_name.as_str(), alert.entity_id.as_str()))
        .collect();
    raised.sort_unstable();
    assert_eq!(
        raised,
        vec![("deadlocks_detected", "orders"), ("temp_spill", "tempdb")]
    );

    // An unchanged counter clears the deadlock alert instead of holding it forever.
    counters(5, 3_000_000_000);
    let third = pipeline.run_cycle(&cancel).await;
    let resolved: Vec<&str> = third
        .emitted
        .iter()
        .filter(|alert| alert.state == AlertState::Resolved)
        .map(|alert| alert.rule_name.as_str())
        .collect();
    assert_eq!(resolved, vec!["deadlocks_detected", "temp_spill"]);
}

#[tokio::test]
async fn stalled_annotator_falls_back_within_deadline() {
    let source = Arc::new(ScriptedSource::default());
    source.set(ProbeKind::Blocking, vec![blocking_row()]);
    let annotator = AnnotatorGateway::new(
        Some(Arc::new(StalledAnnotator)),
        Duration::from_millis(100),
        Duration::from_millis(300),
        2,
    );
    let mut pipeline = pipeline_with(source, Arc::new(MemorySink::new()), annotator);

    let started = Instant::now();
    let summary = pipeline.run_cycle(&CancellationToken::new()).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(summary.emitted.len(), 1);
    let annotation = summary.emitted[0].annotation.as_ref().expect("annotation");
    assert_eq!(annotation.source, AnnotationSource::Fallback);
    assert_eq!(summary.annotation_fallbacks.len(), 1);
}
