//! Time-series store abstraction and the batching writer in front of it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::config::{SinkConfig, SinkMode};
use crate::error::SinkError;
use crate::model::{MetricKind, Severity};

mod elastic;
mod memory;
mod writer;

pub use elastic::ElasticSink;
pub use memory::MemorySink;
pub use writer::{SinkWriter, WriteReport, alert_doc_id, metric_doc_id};

/// One document addressed by a stable id, so retries overwrite instead of duplicating.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: String,
    pub index: String,
    pub timestamp: DateTime<Utc>,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedDocument {
    pub id: String,
    pub index: String,
    pub reason: String,
    /// Transport failures and throttling; a later flush may succeed.
    pub retryable: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkOutcome {
    pub accepted: usize,
    pub rejected: Vec<RejectedDocument>,
}

/// Range query over one index. `severity` is a lower bound.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkQuery {
    pub index: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub kind: Option<MetricKind>,
    pub severity: Option<Severity>,
    pub limit: usize,
}

impl SinkQuery {
    /// Documents from the last `window`, newest first.
    pub fn window(index: impl Into<String>, window: Duration, limit: usize) -> Self {
        let to = Utc::now();
        let from = chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| to.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self {
            index: index.into(),
            from,
            to,
            kind: None,
            severity: None,
            limit,
        }
    }

    pub fn with_kind(mut self, kind: Option<MetricKind>) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_severity(mut self, severity: Option<Severity>) -> Self {
        self.severity = severity;
        self
    }
}

#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    /// Index a batch. Transport-level failure is an `Err`; per-document
    /// rejections are reported in the outcome.
    async fn bulk(&self, docs: &[Document]) -> Result<BulkOutcome, SinkError>;

    /// Matching document bodies, newest first.
    async fn query(&self, query: &SinkQuery) -> Result<Vec<serde_json::Value>, SinkError>;
}

/// Build the sink selected by `sink.mode`.
pub fn from_config(config: &SinkConfig) -> Result<Arc<dyn Sink>> {
    match config.mode {
        SinkMode::Memory => {
            info!("using in-memory sink; documents are lost on restart");
            Ok(Arc::new(MemorySink::new()))
        }
        SinkMode::Elastic => {
            info!(url = %config.url, "using elasticsearch sink");
            Ok(Arc::new(ElasticSink::from_config(config)?))
        }
    }
}

/// Severities at or above `minimum`, as stored in document bodies.
pub(crate) fn severities_from(minimum: Severity) -> Vec<&'static str> {
    [
        Severity::Info,
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ]
    .into_iter()
    .filter(|severity| *severity >= minimum)
    .map(Severity::as_str)
    .collect()
}
