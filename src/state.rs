use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::correlation::CorrelationEntry;
use crate::model::{Alert, Severity};
use crate::pipeline::CycleSummary;

#[derive(Debug, Clone, Serialize)]
pub struct LoopHealth {
    pub name: String,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl LoopHealth {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            last_success_at: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// Headline view of the alert table for the summary endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertOverview {
    pub active: usize,
    pub resolved: usize,
    pub by_severity: HashMap<Severity, usize>,
}

#[derive(Default)]
struct SharedStateInner {
    last_summary: RwLock<Option<CycleSummary>>,
    alert_table: RwLock<Vec<Alert>>,
    correlation: RwLock<Vec<CorrelationEntry>>,
    loop_health: RwLock<HashMap<String, LoopHealth>>,
}

/// Copies of pipeline output for the HTTP layer. The pipeline owns the
/// originals; readers never hold a lock across an await point.
#[derive(Clone, Default)]
pub struct SharedState {
    inner: Arc<SharedStateInner>,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SharedStateInner::default()),
        }
    }

    pub async fn record_summary(&self, summary: CycleSummary) {
        *self.inner.last_summary.write().await = Some(summary);
    }

    pub async fn last_summary(&self) -> Option<CycleSummary> {
        self.inner.last_summary.read().await.clone()
    }

    pub async fn update_alert_table(&self, table: Vec<Alert>) {
        *self.inner.alert_table.write().await = table;
    }

    /// Alerts that are not resolved.
    pub async fn active_alerts(&self) -> Vec<Alert> {
        self.inner
            .alert_table
            .read()
            .await
            .iter()
            .filter(|alert| alert.state.is_active())
            .cloned()
            .collect()
    }

    pub async fn alert_overview(&self) -> AlertOverview {
        let table = self.inner.alert_table.read().await;
        let mut overview = AlertOverview::default();
        for alert in table.iter() {
            if alert.state.is_active() {
                overview.active += 1;
                *overview.by_severity.entry(alert.severity).or_default() += 1;
            } else {
                overview.resolved += 1;
            }
        }
        overview
    }

    pub async fn update_correlation(&self, entries: Vec<CorrelationEntry>) {
        *self.inner.correlation.write().await = entries;
    }

    pub async fn correlation(&self) -> Vec<CorrelationEntry> {
        self.inner.correlation.read().await.clone()
    }

    pub async fn record_loop_success(&self, loop_name: &str) {
        let mut guard = self.inner.loop_health.write().await;
        let entry = guard
            .entry(loop_name.to_string())
            .or_insert_with(|| LoopHealth::new(loop_name));
        entry.last_success_at = Some(Utc::now());
        entry.consecutive_failures = 0;
        entry.last_error = None;
    }

    pub async fn record_loop_failure(&self, loop_name: &str, error: String) {
        let mut guard = self.inner.loop_health.write().await;
        let entry = guard
            .entry(loop_name.to_string())
            .or_insert_with(|| LoopHealth::new(loop_name));
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.last_error = Some(error);
    }

    pub async fn loop_health(&self) -> Vec<LoopHealth> {
        self.inner
            .loop_health
            .read()
            .await
            .values()
            .cloned()
            .collect()
    }

    pub async fn is_ready(&self, loop_names: &[&str], max_staleness: Duration) -> bool {
        let health = self.inner.loop_health.read().await;
        let now = Utc::now();
        let staleness = chrono::Duration::from_std(max_staleness)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));

        loop_names.iter().all(|name| {
            if let Some(entry) = health.get(*name) {
                if entry.consecutive_failures > 0 {
                    return false;
                }
                if let Some(last) = entry.last_success_at {
                    return now.signed_duration_since(last) <= staleness;
                }
                false
            } else {
                false
            }
        })
    }
}
