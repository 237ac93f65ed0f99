use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::model::Alert;

/// Metrics registry for the pipeline scraped by Prometheus.
#[derive(Clone)]
pub struct AppMetrics {
    registry: Arc<Registry>,
    cycles: CycleMetrics,
    stages: StageMetrics,
    alerts: AlertMetrics,
}

impl AppMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new_custom(Some("dbpulse".into()), None)?);

        let cycles = CycleMetrics::register(&registry)?;
        let stages = StageMetrics::register(&registry)?;
        let alerts = AlertMetrics::register(&registry)?;

        Ok(Self {
            registry,
            cycles,
            stages,
            alerts,
        })
    }

    /// Observe the wall-clock duration of one cycle.
    pub fn observe_cycle(&self, target: &str, duration: Duration) {
        self.cycles
            .duration
            .with_label_values(&[target])
            .observe(duration.as_secs_f64());
    }

    /// Record a success flag for the last cycle (1=success, 0=failed).
    pub fn record_success(&self, target: &str, success: bool) {
        self.cycles
            .last_success
            .with_label_values(&[target])
            .set(if success { 1 } else { 0 });
    }

    pub fn inc_cycle_error(&self, target: &str) {
        self.cycles.errors_total.with_label_values(&[target]).inc();
    }

    pub fn inc_probe_error(&self, target: &str, probe: &str) {
        self.stages
            .probe_errors
            .with_label_values(&[target, probe])
            .inc();
    }

    pub fn add_normalization_gaps(&self, target: &str, count: usize) {
        add(&self.stages.normalization_gaps, &[target], count);
    }

    pub fn add_rule_errors(&self, target: &str, count: usize) {
        add(&self.stages.rule_errors, &[target], count);
    }

    pub fn add_annotation_fallbacks(&self, target: &str, count: usize) {
        add(&self.stages.annotation_fallbacks, &[target], count);
    }

    /// `outcome` is `accepted` or `rejected`.
    pub fn add_sink_documents(&self, target: &str, outcome: &str, count: usize) {
        add(&self.stages.sink_documents, &[target, outcome], count);
    }

    pub fn set_correlation_entries(&self, target: &str, entries: usize) {
        self.stages
            .correlation_entries
            .with_label_values(&[target])
            .set(entries as i64);
    }

    pub fn inc_alert(&self, target: &str, alert: &Alert) {
        self.alerts
            .emitted_total
            .with_label_values(&[
                target,
                alert.rule_name.as_str(),
                alert.severity.as_str(),
                alert.state.as_str(),
            ])
            .inc();
    }

    pub fn set_active_alerts(&self, target: &str, active: usize) {
        self.alerts
            .active
            .with_label_values(&[target])
            .set(active as i64);
    }

    /// Encode metrics into Prometheus exposition format.
    pub fn encode(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

fn add(counter: &IntCounterVec, labels: &[&str], count: usize) {
    if count > 0 {
        counter.with_label_values(labels).inc_by(count as u64);
    }
}

#[derive(Clone)]
struct CycleMetrics {
    duration: HistogramVec,
    last_success: IntGaugeVec,
    errors_total: IntCounterVec,
}

impl CycleMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let duration = HistogramVec::new(
            HistogramOpts::new("cycle_duration_seconds", "Collection cycle duration"),
            &["target"],
        )?;
        registry.register(Box::new(duration.clone()))?;

        let last_success = IntGaugeVec::new(
            Opts::new(
                "last_cycle_success",
                "Cycle success flag (1=success, 0=failure)",
            ),
            &["target"],
        )?;
        registry.register(Box::new(last_success.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("cycle_errors_total", "Total failed cycles"),
            &["target"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            duration,
            last_success,
            errors_total,
        })
    }
}

#[derive(Clone)]
struct StageMetrics {
    probe_errors: IntCounterVec,
    normalization_gaps: IntCounterVec,
    rule_errors: IntCounterVec,
    annotation_fallbacks: IntCounterVec,
    sink_documents: IntCounterVec,
    correlation_entries: IntGaugeVec,
}

impl StageMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let probe_errors = IntCounterVec::new(
            Opts::new("probe_errors_total", "Failed or timed out probes"),
            &["target", "probe"],
        )?;
        registry.register(Box::new(probe_errors.clone()))?;

        let normalization_gaps = IntCounterVec::new(
            Opts::new(
                "normalization_gaps_total",
                "Expected fields missing from probe rows",
            ),
            &["target"],
        )?;
        registry.register(Box::new(normalization_gaps.clone()))?;

        let rule_errors = IntCounterVec::new(
            Opts::new("rule_errors_total", "Rule evaluations skipped on error"),
            &["target"],
        )?;
        registry.register(Box::new(rule_errors.clone()))?;

        let annotation_fallbacks = IntCounterVec::new(
            Opts::new(
                "annotation_fallbacks_total",
                "Alerts annotated with the static fallback after a provider failure",
            ),
            &["target"],
        )?;
        registry.register(Box::new(annotation_fallbacks.clone()))?;

        let sink_documents = IntCounterVec::new(
            Opts::new("sink_documents_total", "Documents written to the sink"),
            &["target", "outcome"],
        )?;
        registry.register(Box::new(sink_documents.clone()))?;

        let correlation_entries = IntGaugeVec::new(
            Opts::new("correlation_entries", "Tracked cross-cycle conditions"),
            &["target"],
        )?;
        registry.register(Box::new(correlation_entries.clone()))?;

        Ok(Self {
            probe_errors,
            normalization_gaps,
            rule_errors,
            annotation_fallbacks,
            sink_documents,
            correlation_entries,
        })
    }
}

#[derive(Clone)]
struct AlertMetrics {
    emitted_total: IntCounterVec,
    active: IntGaugeVec,
}

impl AlertMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let emitted_total = IntCounterVec::new(
            Opts::new(
                "alerts_emitted_total",
                "Alert transitions emitted grouped by rule, severity and state",
            ),
            &["target", "rule", "severity", "state"],
        )?;
        registry.register(Box::new(emitted_total.clone()))?;

        let active = IntGaugeVec::new(
            Opts::new("active_alerts", "Alerts currently not resolved"),
            &["target"],
        )?;
        registry.register(Box::new(active.clone()))?;

        Ok(Self {
            emitted_total,
            active,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::model::{AlertState, MetricKind, ProbeKind, Severity};

    fn alert(state: AlertState, severity: Severity) -> Alert {
        let now = Utc::now();
        Alert {
            rule_name: "blocking".into(),
            entity_id: "5".into(),
            kind: MetricKind::QueryActivity,
            probe: ProbeKind::Blocking,
            severity,
            state,
            message: "blocked".into(),
            recommendations: Vec::new(),
            first_triggered_at: now,
            last_seen_at: now,
            transitioned_at: now,
            annotation: None,
        }
    }

    #[test]
    fn alert_counter_records_rule_severity_and_state() {
        let metrics = AppMetrics::new().expect("metrics");
        metrics.inc_alert("orders", &alert(AlertState::New, Severity::High));
        metrics.inc_alert("orders", &alert(AlertState::Resolved, Severity::High));
        metrics.inc_alert("orders", &alert(AlertState::Resolved, Severity::High));

        let output = metrics.encode().expect("encode");
        let resolved = output.lines().find(|line| {
            line.starts_with("dbpulse_alerts_emitted_total")
                && line.contains("rule=\"blocking\"")
                && line.contains("severity=\"high\"")
                && line.contains("state=\"resolved\"")
                && line.trim_end().ends_with(" 2")
        });
        assert!(resolved.is_some(), "resolved counter missing: {output}");
    }

    #[test]
    fn cycle_and_stage_metrics_are_exported() {
        let metrics = AppMetrics::new().expect("metrics");
        metrics.observe_cycle("orders", Duration::from_millis(250));
        metrics.record_success("orders", true);
        metrics.inc_probe_error("orders", "deadlocks");
        metrics.add_sink_documents("orders", "accepted", 42);
        metrics.add_rule_errors("orders", 0);
        metrics.set_active_alerts("orders", 3);

        let output = metrics.encode().expect("encode");
        assert!(output.contains("dbpulse_cycle_duration_seconds_count{target=\"orders\"} 1"));
        assert!(output.contains("dbpulse_last_cycle_success{target=\"orders\"} 1"));
        assert!(output.contains("dbpulse_probe_errors_total{probe=\"deadlocks\",target=\"orders\"} 1"));
        assert!(output.contains("dbpulse_sink_documents_total{outcome=\"accepted\",target=\"orders\"} 42"));
        assert!(output.contains("dbpulse_active_alerts{target=\"orders\"} 3"));
        assert!(
            !output.contains("dbpulse_rule_errors_total{"),
            "zero increments should not create a series: {output}"
        );
    }
}
