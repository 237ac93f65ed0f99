use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use super::{Document, RejectedDocument, Sink};
use crate::config::SinkConfig;
use crate::error::SinkError;
use crate::model::{Alert, MetricRecord};

/// Outcome of one flush.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WriteReport {
    pub accepted: usize,
    pub rejected: Vec<RejectedDocument>,
    pub batches: usize,
    pub failed_batches: usize,
}

/// Turns metrics and alerts into documents and ships them in fixed-size batches.
#[derive(Clone)]
pub struct SinkWriter {
    sink: Arc<dyn Sink>,
    target: String,
    metrics_index: String,
    alerts_index: String,
    batch_size: usize,
}

impl SinkWriter {
    pub fn new(sink: Arc<dyn Sink>, target: impl Into<String>, config: &SinkConfig) -> Self {
        Self {
            sink,
            target: target.into(),
            metrics_index: config.metrics_index.clone(),
            alerts_index: config.alerts_index.clone(),
            batch_size: config.batch_size.max(1),
        }
    }

    pub fn sink(&self) -> &Arc<dyn Sink> {
        &self.sink
    }

    pub fn metrics_index(&self) -> &str {
        &self.metrics_index
    }

    pub fn alerts_index(&self) -> &str {
        &self.alerts_index
    }

    #[instrument(skip_all, fields(sink = %self.sink.name()))]
    pub async fn flush(
        &self,
        metrics: &[MetricRecord],
        alerts: &[Alert],
    ) -> Result<WriteReport, SinkError> {
        let docs = self.documents(metrics, alerts);
        let mut report = WriteReport::default();
        let mut last_error = None;

        for batch in docs.chunks(self.batch_size) {
            report.batches += 1;
            match self.sink.bulk(batch).await {
                Ok(outcome) => {
                    if !outcome.rejected.is_empty() {
                        warn!(
                            rejected = outcome.rejected.len(),
                            first_reason = %outcome.rejected[0].reason,
                            "sink rejected documents"
                        );
                    }
                    report.accepted += outcome.accepted;
                    report.rejected.extend(outcome.rejected);
                }
                Err(err) => {
                    warn!(error = %err, size = batch.len(), "sink batch failed");
                    report.failed_batches += 1;
                    report
                        .rejected
                        .extend(batch.iter().map(|doc| RejectedDocument {
                            id: doc.id.clone(),
                            index: doc.index.clone(),
                            reason: err.to_string(),
                            retryable: true,
                        }));
                    last_error = Some(err);
                }
            }
        }

        if report.batches > 0 && report.failed_batches == report.batches {
            let last = last_error.map(|err| err.to_string()).unwrap_or_default();
            return Err(SinkError::TotalFailure {
                batches: report.batches,
                last,
            });
        }

        info!(
            accepted = report.accepted,
            rejected = report.rejected.len(),
            batches = report.batches,
            "flushed documents"
        );
        Ok(report)
    }

    fn documents(&self, metrics: &[MetricRecord], alerts: &[Alert]) -> Vec<Document> {
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut docs = Vec::with_capacity(metrics.len() + alerts.len());

        for record in metrics {
            let base = metric_doc_id(record);
            let occurrence = seen.entry(base.clone()).or_insert(0);
            let id = if *occurrence == 0 {
                base
            } else {
                format!("{base}#{occurrence}")
            };
            *occurrence += 1;

            docs.push(Document {
                id,
                index: self.metrics_index.clone(),
                timestamp: record.timestamp,
                body: json!({
                    "@timestamp": record.timestamp.to_rfc3339(),
                    "target": self.target,
                    "kind": record.kind,
                    "probe": record.probe,
                    "entity_id": record.entity_id,
                    "attributes": record.attributes,
                }),
            });
        }

        for alert in alerts {
            let timestamp = alert.transitioned_at.max(alert.last_seen_at);
            let mut body = serde_json::to_value(alert).unwrap_or_else(|_| json!({}));
            if let Some(object) = body.as_object_mut() {
                object.insert("@timestamp".into(), json!(timestamp.to_rfc3339()));
                object.insert("target".into(), json!(self.target));
            }
            docs.push(Document {
                id: alert_doc_id(alert),
                index: self.alerts_index.clone(),
                timestamp,
                body,
            });
        }

        docs
    }
}

pub fn metric_doc_id(record: &MetricRecord) -> String {
    format!(
        "metric:{}:{}:{}:{}",
        record.kind,
        record.probe,
        record.entity_id,
        record.timestamp.timestamp_micros()
    )
}

pub fn alert_doc_id(alert: &Alert) -> String {
    format!(
        "alert:{}:{}:{}:{}",
        alert.rule_name,
        alert.entity_id,
        alert.state,
        alert.transitioned_at.timestamp_millis()
    )
}
