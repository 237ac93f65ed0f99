use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::error::SinkError;
use crate::metrics::AppMetrics;
use crate::model::{MetricKind, Severity};
use crate::pipeline::PipelineHandle;
use crate::sink::{Sink, SinkQuery};
use crate::state::SharedState;

/// Shared application context passed to HTTP handlers.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub metrics: AppMetrics,
    pub state: SharedState,
    pub sink: Arc<dyn Sink>,
    pub pipeline: PipelineHandle,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        metrics: AppMetrics,
        state: SharedState,
        sink: Arc<dyn Sink>,
        pipeline: PipelineHandle,
    ) -> Self {
        Self {
            config: Arc::new(config),
            metrics,
            state,
            sink,
            pipeline,
        }
    }

    pub fn target_name(&self) -> &str {
        &self.config.target
    }

    /// Alert documents written during the last `window`, newest first.
    pub async fn read_alerts(
        &self,
        window: Duration,
        severity: Option<Severity>,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, SinkError> {
        let query = SinkQuery::window(self.config.sink.alerts_index.clone(), window, limit)
            .with_severity(severity);
        self.sink.query(&query).await
    }

    /// Metric documents written during the last `window`, newest first.
    pub async fn read_metrics(
        &self,
        window: Duration,
        kind: Option<MetricKind>,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, SinkError> {
        let query = SinkQuery::window(self.config.sink.metrics_index.clone(), window, limit)
            .with_kind(kind);
        self.sink.query(&query).await
    }
}
