//! One collection cycle end to end, and the single task that drives cycles.
//!
//! The [`Pipeline`] owns all cross-cycle state (correlation entries and the
//! alert table), so several targets can run side by side without sharing
//! anything. A driver task owns the pipeline and runs cycles one at a time,
//! either on its interval or when a [`PipelineHandle`] asks for one.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::annotator::{AnnotationFallback, AnnotatorGateway};
use crate::collector::SnapshotCollector;
use crate::config::AppConfig;
use crate::correlation::CorrelationState;
use crate::dedup::{Deduplicator, Held};
use crate::error::{CycleError, NormalizationGap, ProbeError, RuleEvaluationError, RuleRejection};
use crate::metrics::AppMetrics;
use crate::model::{Alert, AlertKey, ProbeKind};
use crate::normalizer;
use crate::rules::{RuleEngine, RuleStore};
use crate::sink::{Sink, SinkWriter, WriteReport, alert_doc_id};
use crate::source::MetricSource;
use crate::state::SharedState;

pub const CYCLE_LOOP: &str = "cycle";

/// Alert transitions kept for redelivery while the sink is failing.
const MAX_UNDELIVERED_ALERTS: usize = 10_000;

/// Everything one cycle produced or failed at.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub cycle: u64,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub probes_succeeded: usize,
    pub records: usize,
    pub candidates: usize,
    pub emitted: Vec<Alert>,
    pub active_alerts: usize,
    pub correlation_entries: usize,
    pub probe_errors: Vec<ProbeError>,
    pub normalization_gaps: Vec<NormalizationGap>,
    pub rule_errors: Vec<RuleEvaluationError>,
    pub rule_rejections: Vec<RuleRejection>,
    pub annotation_fallbacks: Vec<AnnotationFallback>,
    pub write_report: Option<WriteReport>,
    pub failure: Option<CycleError>,
}

impl CycleSummary {
    fn started(cycle: u64, target: &str) -> Self {
        let now = Utc::now();
        Self {
            cycle,
            target: target.to_string(),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            probes_succeeded: 0,
            records: 0,
            candidates: 0,
            emitted: Vec::new(),
            active_alerts: 0,
            correlation_entries: 0,
            probe_errors: Vec::new(),
            normalization_gaps: Vec::new(),
            rule_errors: Vec::new(),
            rule_rejections: Vec::new(),
            annotation_fallbacks: Vec::new(),
            write_report: None,
            failure: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Collaborators a pipeline is assembled from.
pub struct PipelineParts {
    pub source: Arc<dyn MetricSource>,
    pub rules: RuleStore,
    pub annotator: AnnotatorGateway,
    pub sink: Arc<dyn Sink>,
}

pub struct Pipeline {
    target: String,
    collector: SnapshotCollector,
    correlation: CorrelationState,
    rules: RuleStore,
    dedup: Deduplicator,
    annotator: AnnotatorGateway,
    writer: SinkWriter,
    metrics: AppMetrics,
    state: SharedState,
    cycles: u64,
    /// Transitions the sink has not accepted yet, re-sent with the next flush.
    undelivered: Vec<Alert>,
}

impl Pipeline {
    pub fn new(
        config: &AppConfig,
        parts: PipelineParts,
        metrics: AppMetrics,
        state: SharedState,
    ) -> Self {
        Self {
            target: config.target.clone(),
            collector: SnapshotCollector::new(
                parts.source,
                config.source.probes.clone(),
                config.schedule.probe_timeout,
            ),
            correlation: CorrelationState::new(config.correlation.stale_grace_cycles),
            rules: parts.rules,
            dedup: Deduplicator::new(
                config.alerts.reannounce_interval,
                config.alerts.resolved_retention_cycles,
            ),
            annotator: parts.annotator,
            writer: SinkWriter::new(parts.sink, config.target.clone(), &config.sink),
            metrics,
            state,
            cycles: 0,
            undelivered: Vec::new(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Run one cycle. Never panics and never returns early without a summary;
    /// a failed or cancelled cycle carries its reason in `failure`.
    #[instrument(skip_all, fields(target_name = %self.target, cycle = self.cycles + 1))]
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> CycleSummary {
        self.cycles += 1;
        let start = Instant::now();
        let mut summary = CycleSummary::started(self.cycles, &self.target);

        let result = self.execute(cancel, &mut summary).await;
        summary.finished_at = Utc::now();
        summary.duration_ms = start.elapsed().as_millis() as u64;
        if let Err(err) = result {
            summary.failure = Some(err);
        }

        self.publish(&summary, start.elapsed()).await;
        summary
    }

    async fn execute(
        &mut self,
        cancel: &CancellationToken,
        summary: &mut CycleSummary,
    ) -> Result<(), CycleError> {
        if self.rules.reload_if_changed() {
            info!("rule set reloaded");
        }
        let rules = self.rules.current();
        summary.rule_rejections = rules.rejections.clone();

        let snapshot = self.collector.collect(cancel).await?;
        summary.probes_succeeded = snapshot.results.len();
        summary.probe_errors = snapshot.errors.clone();
        if snapshot.results.is_empty() && !snapshot.errors.is_empty() {
            return Err(CycleError::AllProbesFailed(snapshot.errors.len()));
        }

        let mut records = Vec::new();
        for result in &snapshot.results {
            let normalized = normalizer::normalize(result);
            records.extend(normalized.records);
            summary.normalization_gaps.extend(normalized.gaps);
        }

        // Last point where a cancelled cycle leaves no trace.
        if cancel.is_cancelled() {
            return Err(CycleError::Cancelled);
        }

        let now = Utc::now();
        let failed: Vec<ProbeKind> = snapshot.failed_probes().collect();
        let enriched = self.correlation.update(now, records, &failed);
        let view = self.correlation.view();
        summary.records = enriched.len();
        summary.correlation_entries = view.len();

        let evaluation = RuleEngine::new(rules).evaluate(&enriched, &view);
        summary.candidates = evaluation.candidates.len();
        let skipped: HashSet<AlertKey> = evaluation
            .errors
            .iter()
            .map(|err| AlertKey {
                rule_name: err.rule.clone(),
                entity_id: err.entity_id.clone(),
            })
            .collect();
        summary.rule_errors = evaluation.errors;

        let held = Held::new(failed, skipped);
        let outcome = self.dedup.process(now, evaluation.candidates, &held);
        let annotated = self.annotator.annotate_all(outcome.emitted).await;
        self.dedup.record_annotations(&annotated.alerts);
        summary.annotation_fallbacks = annotated.fallbacks;
        summary.active_alerts = self.dedup.active_count();

        self.state.update_correlation(view.entries().to_vec()).await;
        self.state.update_alert_table(self.dedup.table()).await;
        summary.emitted = annotated.alerts;

        let mut outgoing = std::mem::take(&mut self.undelivered);
        outgoing.extend(summary.emitted.iter().cloned());
        match self.writer.flush(&enriched, &outgoing).await {
            Ok(report) => {
                let retry: HashSet<&str> = report
                    .rejected
                    .iter()
                    .filter(|doc| doc.retryable)
                    .map(|doc| doc.id.as_str())
                    .collect();
                outgoing.retain(|alert| retry.contains(alert_doc_id(alert).as_str()));
                self.keep_undelivered(outgoing);
                summary.write_report = Some(report);
                Ok(())
            }
            Err(err) => {
                self.keep_undelivered(outgoing);
                Err(err.into())
            }
        }
    }

    fn keep_undelivered(&mut self, mut alerts: Vec<Alert>) {
        if alerts.len() > MAX_UNDELIVERED_ALERTS {
            let dropped = alerts.len() - MAX_UNDELIVERED_ALERTS;
            warn!(dropped, "undelivered alert backlog full; dropping oldest transitions");
            alerts.drain(..dropped);
        }
        if !alerts.is_empty() {
            info!(pending = alerts.len(), "alert transitions queued for redelivery");
        }
        self.undelivered = alerts;
    }

    /// Push the cycle's outcome to metrics and shared state.
    async fn publish(&self, summary: &CycleSummary, elapsed: Duration) {
        let target = self.target.as_str();
        self.metrics.observe_cycle(target, elapsed);
        for err in &summary.probe_errors {
            self.metrics.inc_probe_error(target, err.probe.as_str());
        }
        self.metrics
            .add_normalization_gaps(target, summary.normalization_gaps.len());
        self.metrics.add_rule_errors(target, summary.rule_errors.len());
        self.metrics
            .add_annotation_fallbacks(target, summary.annotation_fallbacks.len());
        for alert in &summary.emitted {
            self.metrics.inc_alert(target, alert);
        }
        self.metrics
            .set_active_alerts(target, self.dedup.active_count());
        self.metrics
            .set_correlation_entries(target, self.correlation.len());
        if let Some(report) = &summary.write_report {
            self.metrics
                .add_sink_documents(target, "accepted", report.accepted);
            self.metrics
                .add_sink_documents(target, "rejected", report.rejected.len());
        }

        match &summary.failure {
            None => {
                self.metrics.record_success(target, true);
                self.state.record_loop_success(CYCLE_LOOP).await;
                info!(
                    elapsed = ?elapsed,
                    records = summary.records,
                    emitted = summary.emitted.len(),
                    active = summary.active_alerts,
                    probe_errors = summary.probe_errors.len(),
                    "cycle completed"
                );
            }
            Some(CycleError::Cancelled) => {
                info!("cycle cancelled; results discarded");
            }
            Some(err) => {
                self.metrics.record_success(target, false);
                self.metrics.inc_cycle_error(target);
                self.state
                    .record_loop_failure(CYCLE_LOOP, err.to_string())
                    .await;
                warn!(error = %err, "cycle failed");
            }
        }

        if !matches!(summary.failure, Some(CycleError::Cancelled)) {
            self.state.record_summary(summary.clone()).await;
        }
    }
}

type Waiter = oneshot::Sender<CycleSummary>;

/// Requests cycles from the driver task.
#[derive(Clone)]
pub struct PipelineHandle {
    requests: mpsc::Sender<Waiter>,
}

impl PipelineHandle {
    /// Run a cycle now, or join the one already running, and wait for its summary.
    pub async fn trigger(&self) -> anyhow::Result<CycleSummary> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(tx)
            .await
            .map_err(|_| anyhow::anyhow!("pipeline driver has stopped"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("pipeline driver dropped the request"))
    }
}

/// Spawn the driver task owning `pipeline`. With `interval` set, a cycle also
/// runs on every tick (the first tick fires immediately).
pub fn spawn(
    mut pipeline: Pipeline,
    interval: Option<Duration>,
    cancel: CancellationToken,
) -> (PipelineHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Waiter>(32);
    let handle = tokio::spawn(async move {
        info!(target_name = %pipeline.target(), interval = ?interval, "starting pipeline driver");

        let mut ticker = interval.map(|period| {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            let mut waiters = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick(&mut ticker) => Vec::new(),
                request = rx.recv() => match request {
                    Some(waiter) => vec![waiter],
                    None if ticker.is_some() => {
                        drive_interval_only(&mut pipeline, &mut ticker, &cancel).await;
                        break;
                    }
                    None => break,
                },
            };

            let summary = pipeline.run_cycle(&cancel).await;

            // Requests that queued up while the cycle ran share its summary.
            while let Ok(waiter) = rx.try_recv() {
                waiters.push(waiter);
            }
            for waiter in waiters {
                let _ = waiter.send(summary.clone());
            }
        }
        info!(target_name = %pipeline.target(), "pipeline driver stopped");
    });
    (PipelineHandle { requests: tx }, handle)
}

async fn tick(ticker: &mut Option<time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Every handle is gone; keep the schedule running until cancelled.
async fn drive_interval_only(
    pipeline: &mut Pipeline,
    ticker: &mut Option<time::Interval>,
    cancel: &CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tick(ticker) => {}
        }
        let summary = pipeline.run_cycle(cancel).await;
        if let Some(err) = &summary.failure {
            error!(error = %err, "scheduled cycle failed");
        }
    }
}

/// Assemble a pipeline from configuration.
pub async fn build(
    config: &AppConfig,
    sink: Arc<dyn Sink>,
    metrics: AppMetrics,
    state: SharedState,
) -> anyhow::Result<Pipeline> {
    let source = crate::source::from_config(config).await?;
    let rules = RuleStore::load(config.alerts.rules_path.clone())?;
    let annotator = AnnotatorGateway::from_config(&config.annotator)?;
    Ok(Pipeline::new(
        config,
        PipelineParts {
            source,
            rules,
            annotator,
            sink,
        },
        metrics,
        state,
    ))
}
