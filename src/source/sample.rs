use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use super::MetricSource;
use crate::error::SourceError;
use crate::model::{ProbeKind, Row, Scalar};

/// One line of a captured sample file: `{"event_type": "...", "payload": {...}}`.
#[derive(Debug, Deserialize)]
struct SampleLine {
    event_type: String,
    #[serde(default)]
    payload: serde_json::Map<String, serde_json::Value>,
}

/// Replays captured probe rows; every cycle sees the same snapshot.
#[derive(Debug, Clone, Default)]
pub struct SampleSource {
    rows: HashMap<ProbeKind, Vec<Row>>,
}

impl SampleSource {
    pub fn new(rows: HashMap<ProbeKind, Vec<Row>>) -> Self {
        Self { rows }
    }

    pub async fn from_jsonl(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read sample file {}", path.display()))?;
        Self::parse_jsonl(&raw)
            .with_context(|| format!("failed to parse sample file {}", path.display()))
    }

    pub fn parse_jsonl(raw: &str) -> Result<Self> {
        let mut rows: HashMap<ProbeKind, Vec<Row>> = HashMap::new();
        for (line_no, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let sample: SampleLine = serde_json::from_str(line)
                .with_context(|| format!("invalid JSON on line {}", line_no + 1))?;
            let Ok(probe) = sample.event_type.parse::<ProbeKind>() else {
                warn!(
                    line = line_no + 1,
                    event_type = %sample.event_type,
                    "skipping sample line with unknown event type"
                );
                continue;
            };
            let row: Row = sample
                .payload
                .iter()
                .map(|(key, value)| (key.clone(), Scalar::from(value)))
                .collect();
            rows.entry(probe).or_default().push(row);
        }
        Ok(Self { rows })
    }

    pub fn row_count(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl MetricSource for SampleSource {
    fn name(&self) -> &str {
        "sample"
    }

    async fn fetch(&self, probe: ProbeKind) -> Result<Vec<Row>, SourceError> {
        Ok(self.rows.get(&probe).cloned().unwrap_or_default())
    }
}
